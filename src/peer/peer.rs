//! Peer-to-peer LLCP endpoints and their service registry.

use std::sync::{Arc, OnceLock};

use tracing::debug;

pub use services::{
    PeerService, PeerServiceFlags, PeerServiceHandler, PeerServices, NAME_LINK_MGMT, NAME_SNEP,
    SAP_LINK_MGMT, SAP_MAX, SAP_NAMED_MIN, SAP_SNEP, SAP_UNNAMED_MIN,
};

use crate::adapter::Tech;
use crate::util::{HandlerId, Slot};
use crate::SyncMutex;

#[path = "services.rs"]
mod services;

#[cfg(test)]
mod tests;

/// Local role in the NFC-DEP exchange that produced the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum PeerRole {
    /// We drive the exchange.
    Initiator,
    /// The remote side drives the exchange.
    Target,
}

/// A peer-to-peer endpoint detected on the radio surface.
///
/// Like tags, peers are owned by their adapter, which assigns the
/// `peer<n>` name and reacts to the `gone` event. Arrival and departure
/// are additionally fanned out to the registered [`PeerService`]s.
#[derive(Debug)]
pub struct Peer {
    tech: Tech,
    role: PeerRole,
    name: OnceLock<String>,
    present: SyncMutex<bool>,
    gone: Slot<Arc<Peer>>,
}

impl Peer {
    /// Creates a present peer for a freshly established link.
    pub fn new(tech: Tech, role: PeerRole) -> Arc<Self> {
        Arc::new(Self {
            tech,
            role,
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

    #[inline]
    #[must_use]
    pub const fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn present(&self) -> bool {
        *self.present.lock()
    }

    /// Marks the link as lost. The event fires once.
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
