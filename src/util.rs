use std::fmt::Write;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{enabled, trace, Level};

use crate::SyncMutex;

/// Listener registration id. Zero is never issued; removing id zero is a
/// no-op, so callers may keep "not registered" as `0`.
pub type HandlerId = u64;

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Broadcast slot for one named event.
///
/// Handlers run in registration order. Emission iterates over a snapshot
/// of the table, so a handler may add or remove listeners (including
/// itself) without invalidating the broadcast in progress.
pub(crate) struct Slot<A> {
    inner: SyncMutex<Inner<A>>,
}

struct Inner<A> {
    handlers: Vec<(HandlerId, Handler<A>)>,
}

// Ids are unique across all slots, so an object with several events can
// offer a single remove-by-id entry point.
static NEXT_HANDLER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl<A> Slot<A> {
    pub fn add(&self, f: impl Fn(&A) + Send + Sync + 'static) -> HandlerId {
        let id = NEXT_HANDLER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner.lock().handlers.push((id, Arc::new(f)));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        if id == 0 {
            return false;
        }
        let mut inner = self.inner.lock();
        match inner.handlers.iter().position(|&(hid, _)| hid == id) {
            Some(i) => {
                inner.handlers.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn emit(&self, arg: &A) {
        // Snapshot keeps the lock out of handler scope
        let snapshot: SmallVec<[Handler<A>; 4]> =
            (self.inner.lock().handlers.iter()).map(|(_, f)| Arc::clone(f)).collect();
        for f in &snapshot {
            f(arg);
        }
    }
}

impl<A> Default for Slot<A> {
    #[inline]
    fn default() -> Self {
        Self {
            inner: SyncMutex::new(Inner {
                handlers: Vec::new(),
            }),
        }
    }
}

impl<A> std::fmt::Debug for Slot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("handlers", &self.inner.lock().handlers.len())
            .finish()
    }
}

/// Logs a wire buffer at TRACE level, 16 bytes per line.
pub(crate) fn hexdump(data: &[u8]) {
    if !enabled!(Level::TRACE) {
        return;
    }
    for (off, chunk) in data.chunks(16).enumerate() {
        let mut line = String::with_capacity(3 * chunk.len());
        for b in chunk {
            let _ = write!(line, " {b:02x}");
        }
        trace!("  {:04x}:{line}", off * 16);
    }
}

#[cfg(test)]
pub(crate) fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn slot_order_and_removal() {
        let slot = Slot::<u32>::default();
        let log = Arc::new(SyncMutex::new(Vec::new()));

        let l1 = Arc::clone(&log);
        let id1 = slot.add(move |v| l1.lock().push((1, *v)));
        let l2 = Arc::clone(&log);
        let id2 = slot.add(move |v| l2.lock().push((2, *v)));
        assert_ne!(id1, 0);
        assert_ne!(id2, id1);

        slot.emit(&7);
        assert_eq!(*log.lock(), [(1, 7), (2, 7)]);

        assert!(slot.remove(id1));
        assert!(!slot.remove(id1));
        assert!(!slot.remove(0));
        slot.emit(&8);
        assert_eq!(*log.lock(), [(1, 7), (2, 7), (2, 8)]);
    }

    #[test]
    fn slot_mutation_during_emit() {
        let slot = Arc::new(Slot::<()>::default());
        let count = Arc::new(AtomicU32::new(0));

        // The handler unregisters itself mid-broadcast
        let id = Arc::new(SyncMutex::new(0));
        let (s, c, i) = (Arc::clone(&slot), Arc::clone(&count), Arc::clone(&id));
        *id.lock() = slot.add(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            s.remove(*i.lock());
        });

        slot.emit(&());
        slot.emit(&());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
