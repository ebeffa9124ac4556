//! User-mode NFC daemon core.
//!
//! The adapter state machine and the ISO/IEC 7816-4 card-emulation host
//! engine of an NFC daemon: radio controllers are represented by
//! [`adapter::Adapter`] handles driven through the [`adapter::Driver`]
//! trait, card-emulation sessions by [`host::Host`], and the whole set is
//! owned by a [`manager::Manager`] that aggregates client requests.
//!
//! The core is single-threaded cooperative: driver notifications and
//! plugin completions re-enter the engines on the caller's stack, and no
//! async runtime is assumed.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[path = "adapter/adapter.rs"]
pub mod adapter;
#[path = "apdu/apdu.rs"]
pub mod apdu;
#[path = "host/host.rs"]
pub mod host;
#[path = "manager/manager.rs"]
pub mod manager;
#[path = "peer/peer.rs"]
pub mod peer;
#[path = "tag/tag.rs"]
pub mod tag;
mod util;

pub use util::HandlerId;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// Errors produced by the daemon core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed APDU, unknown parameter id, duplicate service, or an
    /// argument outside its declared range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The hardware or the driver does not implement the request.
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    /// A request was superseded before it completed. Never surfaced to
    /// clients.
    #[error("superseded by a newer request")]
    Busy,
    /// No handler produced a response. Internal routing signal.
    #[error("not handled")]
    NotHandled,
    /// The driver refused a submission or reported a failed completion.
    #[error("driver failure")]
    DriverFailure,
    /// The boundary rejected the caller.
    #[error("access denied")]
    AccessDenied,
    /// The component's lifecycle has ended.
    #[error("stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
