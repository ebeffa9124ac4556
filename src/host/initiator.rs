//! Remote reader handle used by card-emulation sessions.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::util::{hexdump, HandlerId, Slot};
use crate::SyncMutex;

/// Single-use wire-delivery confirmation callback.
pub type SentFn = Box<dyn FnOnce(bool) + Send>;

/// Driver side of an [`Initiator`].
#[allow(unused_variables)]
pub trait InitiatorIo: Send + Sync {
    /// Hands a response to the wire. Returning `false` refuses it
    /// outright; otherwise delivery completion must arrive through
    /// [`Initiator::response_sent`].
    fn respond(&self, initiator: &Arc<Initiator>, data: &[u8]) -> bool;

    /// Asks the driver to drop the RF link. The link is gone once the
    /// driver calls [`Initiator::gone_notify`].
    fn deactivate(&self, initiator: &Arc<Initiator>) {}
}

type CmdHandler = Arc<dyn Fn(&Arc<Initiator>, Vec<u8>) + Send + Sync>;

struct Inner {
    present: bool,
    handler: Option<CmdHandler>,
    queue: VecDeque<Vec<u8>>,
    /// A command has been handed out and its response is not confirmed.
    busy: bool,
    sent: Option<SentFn>,
    pumping: bool,
}

/// The remote reader actively polling us while in card-emulation mode.
///
/// Inbound commands are queued and handed to the session one at a time:
/// the next command is not delivered until the response to the previous
/// one is confirmed on the wire.
pub struct Initiator {
    io: Box<dyn InitiatorIo>,
    inner: SyncMutex<Inner>,
    gone: Slot<()>,
    reactivated: Slot<()>,
}

impl Initiator {
    /// Creates a present initiator around its driver IO.
    pub fn new<T: InitiatorIo + 'static>(io: T) -> Arc<Self> {
        Arc::new(Self {
            io: Box::new(io),
            inner: SyncMutex::new(Inner {
                present: true,
                handler: None,
                queue: VecDeque::new(),
                busy: false,
                sent: None,
                pumping: false,
            }),
            gone: Slot::default(),
            reactivated: Slot::default(),
        })
    }

    #[must_use]
    pub fn present(&self) -> bool {
        self.inner.lock().present
    }

    /// Asks the driver to end the encounter.
    pub fn deactivate(self: &Arc<Self>) {
        self.io.deactivate(self);
    }

    //
    // Driver notifications
    //

    /// Feeds one inbound command APDU.
    pub fn received(self: &Arc<Self>, data: &[u8]) {
        {
            let mut i = self.inner.lock();
            if !i.present {
                return;
            }
            i.queue.push_back(data.to_vec());
        }
        self.pump();
    }

    /// Confirms (or fails) delivery of the outstanding response.
    pub fn response_sent(self: &Arc<Self>, ok: bool) {
        let sent = {
            let mut i = self.inner.lock();
            if !i.busy {
                return;
            }
            i.busy = false;
            i.sent.take()
        };
        if let Some(cb) = sent {
            cb(ok);
        }
        self.pump();
    }

    /// Marks the link as lost. A pending send confirmation is failed,
    /// queued commands are dropped, and the event fires once.
    pub fn gone_notify(self: &Arc<Self>) {
        let sent = {
            let mut i = self.inner.lock();
            if !i.present {
                return;
            }
            i.present = false;
            i.queue.clear();
            i.sent.take()
        };
        if let Some(cb) = sent {
            cb(false);
        }
        debug!("Initiator is gone");
        self.gone.emit(&());
    }

    /// Reports that the RF link went down and up again without the
    /// target leaving the field. Any in-flight exchange is abandoned.
    pub fn reactivated_notify(self: &Arc<Self>) {
        let sent = {
            let mut i = self.inner.lock();
            if !i.present {
                return;
            }
            i.queue.clear();
            i.busy = false;
            i.sent.take()
        };
        if let Some(cb) = sent {
            cb(false);
        }
        debug!("Initiator reactivated");
        self.reactivated.emit(&());
        self.pump();
    }

    //
    // Session interface
    //

    pub(crate) fn add_gone_handler(
        &self,
        f: impl Fn(&()) + Send + Sync + 'static,
    ) -> HandlerId {
        self.gone.add(f)
    }

    pub(crate) fn add_reactivated_handler(
        &self,
        f: impl Fn(&()) + Send + Sync + 'static,
    ) -> HandlerId {
        self.reactivated.add(f)
    }

    pub(crate) fn remove_handler(&self, id: HandlerId) {
        let _ = self.gone.remove(id) || self.reactivated.remove(id);
    }

    /// Installs the command consumer and flushes anything queued.
    pub(crate) fn set_cmd_handler(
        self: &Arc<Self>,
        f: impl Fn(&Arc<Self>, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.inner.lock().handler = Some(Arc::new(f));
        self.pump();
    }

    /// Sends the response for the most recently delivered command.
    pub(crate) fn respond(self: &Arc<Self>, data: Vec<u8>, sent: Option<SentFn>) -> bool {
        {
            let mut i = self.inner.lock();
            if !i.present || !i.busy {
                drop(i);
                if let Some(cb) = sent {
                    cb(false);
                }
                return false;
            }
            i.sent = sent;
        }
        trace!("Response:");
        hexdump(&data);
        if self.io.respond(self, &data) {
            true
        } else {
            let sent = {
                let mut i = self.inner.lock();
                i.busy = false;
                i.sent.take()
            };
            if let Some(cb) = sent {
                cb(false);
            }
            self.pump();
            false
        }
    }

    /// Hands queued commands to the consumer, one confirmed exchange at
    /// a time. Re-entrant calls fold into the active loop.
    fn pump(self: &Arc<Self>) {
        {
            let mut i = self.inner.lock();
            if i.pumping {
                return;
            }
            i.pumping = true;
        }
        loop {
            let (handler, cmd) = {
                let mut i = self.inner.lock();
                let handler = match i.handler {
                    Some(ref h) if i.present && !i.busy && !i.queue.is_empty() => Arc::clone(h),
                    _ => {
                        i.pumping = false;
                        break;
                    }
                };
                i.busy = true;
                let cmd = i.queue.pop_front().unwrap_or_default();
                (handler, cmd)
            };
            trace!("Command:");
            hexdump(&cmd);
            handler(self, cmd);
        }
    }
}

impl std::fmt::Debug for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let i = self.inner.lock();
        f.debug_struct("Initiator")
            .field("present", &i.present)
            .field("busy", &i.busy)
            .field("queued", &i.queue.len())
            .finish_non_exhaustive()
    }
}
