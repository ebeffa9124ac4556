//! Host services: catch-all card-emulation traffic processors.

use std::sync::Arc;

use crate::apdu::Apdu;

use super::{Completion, Host, OpId, Response};

/// A background service attached to every card-emulation session.
///
/// Services see all traffic that is not claimed by the currently
/// selected application, in registration order. Every call that may
/// suspend takes a [`Completion`] and returns an [`OpId`]:
/// [`OpId::SYNC`] if the completion was resolved before returning,
/// [`OpId::FAIL`] if the call refused to start, or a real id that may
/// later be passed to [`cancel`](Self::cancel).
#[allow(unused_variables)]
pub trait HostService: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the service for a new session. Completing with `false`
    /// removes the service from the session.
    fn start(&self, host: &Arc<Host>, done: Completion<bool>) -> OpId {
        done.resolve(true);
        OpId::SYNC
    }

    /// Starts the service again after the initiator was reactivated.
    /// Only called when the initial [`start`](Self::start) succeeded.
    fn restart(&self, host: &Arc<Host>, done: Completion<bool>) -> OpId {
        self.start(host, done)
    }

    /// Processes one command APDU. Completing with [`None`] passes the
    /// command on to the next handler.
    fn process(&self, host: &Arc<Host>, apdu: &Apdu, done: Completion<Option<Response>>) -> OpId {
        done.resolve(None);
        OpId::SYNC
    }

    /// Cancels an operation returned by one of the calls above. Must
    /// tolerate the sentinel ids.
    fn cancel(&self, id: OpId) {}
}
