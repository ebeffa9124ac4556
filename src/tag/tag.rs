//! Passive targets operated in reader/writer mode.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::adapter::Tech;
use crate::util::{HandlerId, Slot};
use crate::SyncMutex;

/// A tag detected on the radio surface.
///
/// Tags are short-lived children of an adapter: the adapter assigns the
/// `tag<n>` name, watches the `gone` event and drops the tag from its
/// collection when the target leaves the field.
#[derive(Debug)]
pub struct Tag {
    tech: Tech,
    name: OnceLock<String>,
    present: SyncMutex<bool>,
    gone: Slot<Arc<Tag>>,
}

impl Tag {
    /// Creates a present tag for a freshly detected target.
    pub fn new(tech: Tech) -> Arc<Self> {
        Arc::new(Self {
            tech,
            name: OnceLock::new(),
            present: SyncMutex::new(true),
            gone: Slot::default(),
        })
    }

    /// Name assigned by the owning adapter, empty until then.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.get().map_or("", String::as_str)
    }

    #[inline]
    #[must_use]
    pub const fn tech(&self) -> Tech {
        self.tech
    }

    #[must_use]
    pub fn present(&self) -> bool {
        *self.present.lock()
    }

    /// Marks the target as gone. The event fires once.
    pub fn gone_notify(self: &Arc<Self>) {
        {
            let mut present = self.present.lock();
            if !*present {
                return;
            }
            *present = false;
        }
        debug!("{} is gone", self.name());
        self.gone.emit(self);
    }

    pub fn add_gone_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.gone.add(f)
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.gone.remove(id);
    }

    pub(crate) fn set_name(&self, name: &str) {
        let _ = self.name.set(name.into());
    }
}
