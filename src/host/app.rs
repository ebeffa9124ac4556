//! Host applications: AID-addressed card-emulation endpoints.

use std::sync::Arc;

use bitflags::bitflags;

use crate::apdu::Apdu;
use crate::Result;

use super::{Completion, Host, OpId, Response};

bitflags! {
    /// Static properties of a host application.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HostAppFlags: u32 {
        /// The application may become current without a `SELECT`
        /// command, when it is offered the session at start.
        const ALLOW_IMPLICIT_SELECTION = 1 << 0;
    }
}

/// An application addressed by its AID through `SELECT` commands.
///
/// The same completion and op-id conventions as [`HostService`] apply.
/// Selection calls complete with `Ok` to accept, `Err(NotHandled)` to
/// pass the `SELECT` on to the services, and any other error to refuse.
///
/// [`HostService`]: super::HostService
#[allow(unused_variables)]
pub trait HostApp: Send + Sync {
    fn name(&self) -> &str;

    /// The application identifier, up to 16 bytes.
    fn aid(&self) -> &[u8];

    fn flags(&self) -> HostAppFlags {
        HostAppFlags::empty()
    }

    /// Starts the application for a new session. Completing with
    /// `false` removes the application from the session.
    fn start(&self, host: &Arc<Host>, done: Completion<bool>) -> OpId {
        done.resolve(true);
        OpId::SYNC
    }

    /// Offers the application the session before any APDU has arrived.
    /// Only called when [`HostAppFlags::ALLOW_IMPLICIT_SELECTION`] is
    /// set.
    fn implicit_select(&self, host: &Arc<Host>, done: Completion<Result<()>>) -> OpId {
        done.resolve(Ok(()));
        OpId::SYNC
    }

    /// Makes the application current in response to a `SELECT`.
    fn select(&self, host: &Arc<Host>, done: Completion<Result<()>>) -> OpId {
        done.resolve(Ok(()));
        OpId::SYNC
    }

    /// Tells the application it is no longer current. Synchronous.
    fn deselect(&self, host: &Arc<Host>) {}

    /// Processes one command APDU addressed to the application.
    /// Completing with [`None`] passes the command on to the services.
    fn process(&self, host: &Arc<Host>, apdu: &Apdu, done: Completion<Option<Response>>) -> OpId {
        done.resolve(None);
        OpId::SYNC
    }

    /// Cancels an operation returned by one of the calls above. Must
    /// tolerate the sentinel ids.
    fn cancel(&self, id: OpId) {}
}
