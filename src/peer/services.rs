//! LLCP service registry: SAP allocation and peer fan-out.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use super::Peer;
use crate::SyncMutex;

/// Link management SAP, never allocatable.
pub const SAP_LINK_MGMT: u8 = 1;
/// Well-known SNEP SAP, fixed for [`NAME_SNEP`].
pub const SAP_SNEP: u8 = 4;
/// First SAP of the named allocation range.
pub const SAP_NAMED_MIN: u8 = 0x10;
/// First SAP of the unnamed allocation range.
pub const SAP_UNNAMED_MIN: u8 = 0x20;
/// Largest valid SAP.
pub const SAP_MAX: u8 = 0x3F;

/// Reserved link management service name.
pub const NAME_LINK_MGMT: &str = "urn:nfc:sn:llc";
/// Well-known SNEP service name.
pub const NAME_SNEP: &str = "urn:nfc:sn:snep";

bitflags! {
    /// Connection capabilities of a peer service.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct PeerServiceFlags: u8 {
        /// Accepts inbound LLCP connections.
        const CAN_ACCEPT = 1 << 0;
        /// Originates outbound LLCP connections.
        const CAN_CONNECT = 1 << 1;
    }
}

/// Callbacks a peer service receives as peers come and go.
#[allow(unused_variables)]
pub trait PeerServiceHandler: Send + Sync {
    fn peer_arrived(&self, service: &Arc<PeerService>, peer: &Arc<Peer>) {}
    fn peer_left(&self, service: &Arc<PeerService>, peer: &Arc<Peer>) {}
}

/// A named LLCP endpoint registered with the manager.
pub struct PeerService {
    name: Option<String>,
    flags: PeerServiceFlags,
    sap: SyncMutex<u8>,
    handler: Box<dyn PeerServiceHandler>,
}

impl PeerService {
    /// Creates a service. A nameless service allocates its SAP from the
    /// unnamed range on registration.
    pub fn new<H: PeerServiceHandler + 'static>(
        name: Option<&str>,
        flags: PeerServiceFlags,
        handler: H,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.filter(|n| !n.is_empty()).map(Into::into),
            flags,
            sap: SyncMutex::new(0),
            handler: Box::new(handler),
        })
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PeerServiceFlags {
        self.flags
    }

    /// SAP assigned on registration, zero before that.
    #[must_use]
    pub fn sap(&self) -> u8 {
        *self.sap.lock()
    }
}

impl std::fmt::Debug for PeerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerService")
            .field("name", &self.name)
            .field("sap", &self.sap())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

const fn sap_bit(sap: u8) -> u64 {
    1 << sap
}

#[derive(Debug)]
struct Inner {
    /// Sorted by SAP.
    list: Vec<Arc<PeerService>>,
    sap_mask: u64,
}

/// The set of active peer services of one manager.
#[derive(Debug)]
pub struct PeerServices {
    inner: SyncMutex<Inner>,
}

impl PeerServices {
    pub(crate) fn new() -> Self {
        Self {
            inner: SyncMutex::new(Inner {
                list: Vec::new(),
                sap_mask: sap_bit(SAP_LINK_MGMT),
            }),
        }
    }

    /// Registered services, sorted by SAP.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<PeerService>> {
        self.inner.lock().list.clone()
    }

    /// Finds a service by its assigned SAP.
    #[must_use]
    pub fn find_sap(&self, sap: u8) -> Option<Arc<PeerService>> {
        if sap <= SAP_LINK_MGMT {
            return None;
        }
        let inner = self.inner.lock();
        for ps in &inner.list {
            match ps.sap() {
                s if s == sap => return Some(Arc::clone(ps)),
                // The list is sorted
                s if s > sap => break,
                _ => {}
            }
        }
        None
    }

    /// Finds a service by name.
    #[must_use]
    pub fn find_name(&self, name: &str) -> Option<Arc<PeerService>> {
        if name.is_empty() {
            return None;
        }
        (self.inner.lock().list.iter())
            .find(|ps| ps.name() == Some(name))
            .map(Arc::clone)
    }

    /// Registers a service, assigning its SAP. Fails on a duplicate
    /// service or name, on a reserved name, and when the relevant SAP
    /// range is exhausted.
    pub fn add(&self, ps: &Arc<PeerService>) -> bool {
        let mut inner = self.inner.lock();
        let name = ps.name();
        if (inner.list.iter()).any(|e| Arc::ptr_eq(e, ps) || (name.is_some() && e.name() == name)) {
            return false;
        }

        // Pick the SAP from the right range
        let (sap_min, sap_max) = match name {
            Some(NAME_LINK_MGMT) => return false,
            Some(NAME_SNEP) => (SAP_SNEP, SAP_SNEP),
            Some(_) => (SAP_NAMED_MIN, SAP_UNNAMED_MIN - 1),
            None => (SAP_UNNAMED_MIN, SAP_MAX),
        };
        let Some(sap) = (sap_min..=sap_max).find(|&sap| inner.sap_mask & sap_bit(sap) == 0) else {
            debug!("No free SAP for {name:?}");
            return false;
        };

        *ps.sap.lock() = sap;
        inner.sap_mask |= sap_bit(sap);
        inner.list.push(Arc::clone(ps));
        inner.list.sort_by_key(|e| e.sap());
        true
    }

    /// Unregisters a service, releasing its SAP.
    pub fn remove(&self, ps: &Arc<PeerService>) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.list.iter().position(|e| Arc::ptr_eq(e, ps)) else {
            return false;
        };
        inner.list.remove(pos);
        inner.sap_mask &= !sap_bit(ps.sap());
        *ps.sap.lock() = 0;
        true
    }

    /// Announces a new peer to every registered service.
    pub fn peer_arrived(&self, peer: &Arc<Peer>) {
        self.notify(peer, |ps, peer| ps.handler.peer_arrived(ps, peer));
    }

    /// Announces a departed peer to every registered service.
    pub fn peer_left(&self, peer: &Arc<Peer>) {
        self.notify(peer, |ps, peer| ps.handler.peer_left(ps, peer));
    }

    fn notify(&self, peer: &Arc<Peer>, f: impl Fn(&Arc<PeerService>, &Arc<Peer>)) {
        // Callbacks may mutate the registry, so iterate over a copy and
        // re-check membership before each call
        let snapshot = self.list();
        for ps in &snapshot {
            let still_there = (self.inner.lock().list.iter()).any(|e| Arc::ptr_eq(e, ps));
            if still_there {
                f(ps, peer);
            }
        }
    }
}
