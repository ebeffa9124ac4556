//! Adapter engine: the state machine mediating one radio controller.
//!
//! An [`Adapter`] reconciles three concurrent concerns that must stay
//! consistent: administrative enablement, radio power, and the polling
//! mode. Client intent (`enabled`, `power_requested`, `mode_requested`)
//! is pushed toward the hardware through the [`Driver`] hooks; the
//! hardware answers through the `*_notify` methods. The base engine
//! guarantees that at most one power and one mode request are
//! outstanding at any time.
//!
//! The adapter also owns the short-lived entities detected on the radio
//! surface: [`Tag`]s, [`Peer`]s and card-emulation [`Host`] sessions,
//! keyed by monotonically assigned names.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub use params::{merge_param_ids, Param, ParamId, ParamValue};

use crate::host::{Host, Initiator};
use crate::manager::Manager;
use crate::peer::Peer;
use crate::tag::Tag;
use crate::util::{HandlerId, Slot};
use crate::{Error, Result, SyncMutex};

#[path = "params.rs"]
mod params;

#[cfg(test)]
mod tests;

bitflags! {
    /// Radio operating modes.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct Mode: u8 {
        const READER_WRITER = 1 << 0;
        const P2P_INITIATOR = 1 << 1;
        const P2P_TARGET = 1 << 2;
        const CARD_EMULATION = 1 << 3;
        const P2P = Self::P2P_INITIATOR.bits | Self::P2P_TARGET.bits;
    }
}

bitflags! {
    /// Radio technologies.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct Tech: u8 {
        const A = 1 << 0;
        const B = 1 << 1;
        const F = 1 << 2;
    }
}

/// Driver backend for one radio controller.
///
/// Requests are asynchronous but the engine makes sure that multiple
/// requests don't get submitted in parallel. A `submit_*` hook returning
/// `false` means the request failed immediately; otherwise completion
/// must arrive through [`Adapter::power_notify`] or
/// [`Adapter::mode_notify`]. The defaults refuse every request, so a
/// hook the driver does not implement behaves as a failed hook.
#[allow(unused_variables)]
pub trait Driver: Send + Sync {
    /// Modes the hardware can operate in.
    fn supported_modes(&self) -> Mode {
        Mode::empty()
    }

    fn submit_power_request(&self, adapter: &Arc<Adapter>, on: bool) -> bool {
        false
    }

    fn cancel_power_request(&self, adapter: &Arc<Adapter>) {}

    fn submit_mode_request(&self, adapter: &Arc<Adapter>, mode: Mode) -> bool {
        false
    }

    fn cancel_mode_request(&self, adapter: &Arc<Adapter>) {}

    fn get_supported_techs(&self, adapter: &Arc<Adapter>) -> Tech {
        Tech::A | Tech::B
    }

    fn set_allowed_techs(&self, adapter: &Arc<Adapter>, techs: Tech) {}

    /// Parameters the driver supports, in addition to the builtin ones.
    fn list_params(&self, adapter: &Arc<Adapter>) -> Vec<ParamId> {
        Vec::new()
    }

    fn get_param(&self, adapter: &Arc<Adapter>, id: ParamId) -> Option<ParamValue> {
        None
    }

    /// Applies the effective parameter assignment in one shot. `reset`
    /// asks the driver to return every parameter that is not in
    /// `params` to its default. The driver reports actual changes
    /// through [`Adapter::param_change_notify`].
    fn set_params(&self, adapter: &Arc<Adapter>, params: &[Param], reset: bool) {}
}

// Queued change signals, flushed in bit order by emit_pending().
const SIG_ENABLED: u32 = 1 << 0;
const SIG_POWERED: u32 = 1 << 1;
const SIG_POWER_REQUESTED: u32 = 1 << 2;
const SIG_MODE: u32 = 1 << 3;
const SIG_MODE_REQUESTED: u32 = 1 << 4;
const SIG_TARGET_PRESENCE: u32 = 1 << 5;

struct Entry<T: ?Sized> {
    obj: Arc<T>,
    gone_id: HandlerId,
}

struct State {
    name: String,
    manager: Weak<Manager>,
    enabled: bool,
    power_requested: bool,
    powered: bool,
    power_submitted: bool,
    power_pending: bool,
    mode_requested: Mode,
    mode: Mode,
    mode_submitted: Mode,
    mode_pending: bool,
    target_present: bool,
    pending_signals: u32,
    tags: BTreeMap<String, Entry<Tag>>,
    peers: BTreeMap<String, Entry<Peer>>,
    hosts: BTreeMap<String, Entry<Host>>,
    next_tag: u32,
    next_peer: u32,
    next_host: u32,
    t4_ndef: bool,
    param_requests: Vec<(u64, params::ParamReq)>,
    next_param_token: u64,
    supported_params: Option<Vec<ParamId>>,
}

#[derive(Default)]
struct Events {
    enabled_changed: Slot<Arc<Adapter>>,
    powered: Slot<Arc<Adapter>>,
    power_requested: Slot<Arc<Adapter>>,
    mode_changed: Slot<Arc<Adapter>>,
    mode_requested: Slot<Arc<Adapter>>,
    target_presence: Slot<Arc<Adapter>>,
    tag_added: Slot<Arc<Tag>>,
    tag_removed: Slot<Arc<Tag>>,
    peer_added: Slot<Arc<Peer>>,
    peer_removed: Slot<Arc<Peer>>,
    host_added: Slot<Arc<Host>>,
    host_removed: Slot<Arc<Host>>,
    param_changed: Slot<ParamId>,
}

/// Handle for one radio controller.
pub struct Adapter {
    driver: Box<dyn Driver>,
    supported_modes: Mode,
    state: SyncMutex<State>,
    events: Events,
}

impl Adapter {
    /// Creates an adapter around a driver backend.
    pub fn new<D: Driver + 'static>(driver: D) -> Arc<Self> {
        let supported_modes = driver.supported_modes();
        Arc::new(Self {
            driver: Box::new(driver),
            supported_modes,
            state: SyncMutex::new(State {
                name: String::new(),
                manager: Weak::new(),
                enabled: false,
                power_requested: false,
                powered: false,
                power_submitted: false,
                power_pending: false,
                mode_requested: Mode::empty(),
                mode: Mode::empty(),
                mode_submitted: Mode::empty(),
                mode_pending: false,
                target_present: false,
                pending_signals: 0,
                tags: BTreeMap::new(),
                peers: BTreeMap::new(),
                hosts: BTreeMap::new(),
                next_tag: 0,
                next_peer: 0,
                next_host: 0,
                t4_ndef: true,
                param_requests: Vec::new(),
                next_param_token: 1,
                supported_params: None,
            }),
            events: Events::default(),
        })
    }

    /// Returns the name assigned on registration, `nfcX` pattern.
    #[must_use]
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn powered(&self) -> bool {
        self.state.lock().powered
    }

    #[must_use]
    pub fn power_requested(&self) -> bool {
        self.state.lock().power_requested
    }

    /// Returns the current polling mode. Empty while not powered.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    #[must_use]
    pub fn mode_requested(&self) -> Mode {
        self.state.lock().mode_requested
    }

    /// Modes the hardware supports.
    #[inline]
    #[must_use]
    pub const fn supported_modes(&self) -> Mode {
        self.supported_modes
    }

    /// Returns whether any tag, peer or host is currently present.
    #[must_use]
    pub fn target_present(&self) -> bool {
        self.state.lock().target_present
    }

    #[must_use]
    pub fn supported_techs(self: &Arc<Self>) -> Tech {
        self.driver.get_supported_techs(self)
    }

    pub fn set_allowed_techs(self: &Arc<Self>, techs: Tech) {
        self.driver.set_allowed_techs(self, techs);
    }

    /// Administratively permits or forbids powering the radio. Disabling
    /// powers the radio down first.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        {
            let mut s = self.state.lock();
            if s.enabled == enabled {
                return;
            }
            s.enabled = enabled;
            s.pending_signals |= SIG_ENABLED;
        }
        self.update_power();
        self.emit_pending();
    }

    /// Records client intent to power the radio up or down.
    pub fn request_power(self: &Arc<Self>, on: bool) {
        {
            let mut s = self.state.lock();
            if s.power_requested == on {
                return;
            }
            s.power_requested = on;
            s.pending_signals |= SIG_POWER_REQUESTED;
        }
        self.update_power();
        self.emit_pending();
    }

    /// Requests a polling mode. Unsupported bits are silently dropped;
    /// an all-unsupported nonzero request fails without changing
    /// anything. Requesting no modes is honored.
    pub fn request_mode(self: &Arc<Self>, mode: Mode) -> Result<()> {
        if !mode.is_empty() && (mode & self.supported_modes).is_empty() {
            debug!(
                "Mode {:#04x} is not supported by {}",
                mode.bits(),
                self.state.lock().name
            );
            return Err(Error::Unsupported("mode"));
        }
        {
            let mut s = self.state.lock();
            let mode = mode & self.supported_modes;
            if s.mode_requested == mode {
                return Ok(());
            }
            s.mode_requested = mode;
            s.pending_signals |= SIG_MODE_REQUESTED;
        }
        self.update_mode();
        self.emit_pending();
        Ok(())
    }

    //
    // Driver notifications
    //

    /// Reports the actual power state. `requested` distinguishes request
    /// completion from a spontaneous change, which updates the state
    /// without clearing the pending request.
    pub fn power_notify(self: &Arc<Self>, on: bool, requested: bool) {
        let request_was_pending;
        {
            let mut s = self.state.lock();
            request_was_pending = s.power_pending;
            if requested {
                s.power_pending = false;
            }
            if s.powered != on {
                s.powered = on;
                s.pending_signals |= SIG_POWERED;
            }
        }
        self.update_mode();
        if request_was_pending && requested {
            let mut s = self.state.lock();
            if s.power_requested != on {
                s.power_requested = on;
                s.pending_signals |= SIG_POWER_REQUESTED;
            }
        }
        self.emit_pending();
    }

    /// Reports the actual polling mode, mirroring [`Self::power_notify`].
    pub fn mode_notify(self: &Arc<Self>, mode: Mode, requested: bool) {
        let request_was_pending;
        {
            let mut s = self.state.lock();
            request_was_pending = s.mode_pending;
            if requested {
                s.mode_pending = false;
            }
            if s.mode != mode {
                s.mode = mode;
                s.pending_signals |= SIG_MODE;
            }
            if request_was_pending && requested && s.mode_requested != mode {
                s.mode_requested = mode;
                s.pending_signals |= SIG_MODE_REQUESTED;
            }
        }
        self.emit_pending();
    }

    /// Recomputes target presence from the current entity collections.
    pub fn target_notify(self: &Arc<Self>) {
        self.update_presence();
        self.emit_pending();
    }

    /// Broadcasts a parameter change to id-filtered and catch-all
    /// listeners.
    pub fn param_change_notify(self: &Arc<Self>, id: ParamId) {
        self.events.param_changed.emit(&id);
    }

    //
    // Entity collections
    //

    /// Tags present on the radio surface, sorted by name.
    #[must_use]
    pub fn tags(&self) -> Vec<Arc<Tag>> {
        (self.state.lock().tags.values()).map(|e| Arc::clone(&e.obj)).collect()
    }

    /// Peers present on the radio surface, sorted by name.
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        (self.state.lock().peers.values()).map(|e| Arc::clone(&e.obj)).collect()
    }

    /// Card-emulation sessions, sorted by name.
    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        (self.state.lock().hosts.values()).map(|e| Arc::clone(&e.obj)).collect()
    }

    /// Adds a detected tag, assigning it a unique `tag<n>` name. A tag
    /// that is already gone is dropped silently.
    pub fn add_tag(self: &Arc<Self>, tag: Arc<Tag>) -> Option<Arc<Tag>> {
        if !tag.present() {
            return None;
        }
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            let name = make_name(&s.tags, "tag", &mut s.next_tag);
            tag.set_name(&name);
            let weak = Arc::downgrade(self);
            let gone_id = tag.add_gone_handler(move |t| {
                if let Some(adapter) = weak.upgrade() {
                    adapter.remove_tag(t.name());
                }
            });
            s.tags.insert(
                name,
                Entry {
                    obj: Arc::clone(&tag),
                    gone_id,
                },
            );
        }
        self.update_presence();
        self.emit_pending();
        self.events.tag_added.emit(&tag);
        Some(tag)
    }

    /// Removes a tag by name and emits the removal notification.
    pub fn remove_tag(self: &Arc<Self>, name: &str) {
        let Some(entry) = self.state.lock().tags.remove(name) else {
            return;
        };
        entry.obj.remove_handler(entry.gone_id);
        self.update_presence();
        self.events.tag_removed.emit(&entry.obj);
        self.emit_pending();
    }

    /// Adds a detected peer, assigning it a unique `peer<n>` name, and
    /// announces it to the registered peer services. A peer that is
    /// already gone is dropped silently.
    pub fn add_peer(self: &Arc<Self>, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        if !peer.present() {
            return None;
        }
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            let name = make_name(&s.peers, "peer", &mut s.next_peer);
            peer.set_name(&name);
            let weak = Arc::downgrade(self);
            let gone_id = peer.add_gone_handler(move |p| {
                if let Some(adapter) = weak.upgrade() {
                    adapter.remove_peer(p.name());
                }
            });
            s.peers.insert(
                name,
                Entry {
                    obj: Arc::clone(&peer),
                    gone_id,
                },
            );
        }
        self.update_presence();
        self.emit_pending();
        self.events.peer_added.emit(&peer);
        if let Some(manager) = self.manager() {
            manager.peer_services().peer_arrived(&peer);
        }
        Some(peer)
    }

    /// Removes a peer by name and emits the removal notification.
    pub fn remove_peer(self: &Arc<Self>, name: &str) {
        let Some(entry) = self.state.lock().peers.remove(name) else {
            return;
        };
        entry.obj.remove_handler(entry.gone_id);
        self.update_presence();
        self.events.peer_removed.emit(&entry.obj);
        self.emit_pending();
        if let Some(manager) = self.manager() {
            manager.peer_services().peer_left(&entry.obj);
        }
    }

    /// Creates and starts a card-emulation session for a remote reader.
    /// Requires a present initiator.
    pub fn add_host(self: &Arc<Self>, initiator: &Arc<Initiator>) -> Option<Arc<Host>> {
        if !initiator.present() {
            return None;
        }
        let manager = self.manager();
        let (services, apps) = manager.as_ref().map_or_else(
            || (Vec::new(), Vec::new()),
            |m| (m.host_services(), m.host_apps()),
        );
        let host;
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            let name = make_name(&s.hosts, "host", &mut s.next_host);
            host = Host::new(&name, initiator, services, apps);
            let weak = Arc::downgrade(self);
            let gone_id = host.add_gone_handler(move |h| {
                if let Some(adapter) = weak.upgrade() {
                    adapter.remove_host(h.name());
                }
            });
            s.hosts.insert(
                name,
                Entry {
                    obj: Arc::clone(&host),
                    gone_id,
                },
            );
        }
        self.update_presence();
        self.emit_pending();
        self.events.host_added.emit(&host);
        host.start();
        Some(host)
    }

    /// Removes a host session by name and emits the removal
    /// notification.
    pub fn remove_host(self: &Arc<Self>, name: &str) {
        let Some(entry) = self.state.lock().hosts.remove(name) else {
            return;
        };
        entry.obj.remove_handler(entry.gone_id);
        self.update_presence();
        self.events.host_removed.emit(&entry.obj);
        self.emit_pending();
    }

    //
    // Parameters
    //

    /// Parameter ids this adapter supports: the builtin set merged with
    /// whatever the driver lists.
    #[must_use]
    pub fn param_list(self: &Arc<Self>) -> Vec<ParamId> {
        if let Some(ref ids) = self.state.lock().supported_params {
            return ids.clone();
        }
        let merged = merge_param_ids(&[&[ParamId::T4Ndef], &self.driver.list_params(self)]);
        let mut s = self.state.lock();
        s.supported_params = Some(merged.clone());
        merged
    }

    /// Reads the current effective value of one parameter.
    #[must_use]
    pub fn param_get(self: &Arc<Self>, id: ParamId) -> Option<ParamValue> {
        if let Some(v) = self.driver.get_param(self, id) {
            return Some(v);
        }
        match id {
            ParamId::T4Ndef => Some(ParamValue::Bool(self.state.lock().t4_ndef)),
            _ => None,
        }
    }

    /// Registers a parameter override request. Always succeeds; the
    /// outcome of the negotiation is observed by reading the resulting
    /// values. The overlay is re-applied when the token is dropped.
    pub fn param_request(self: &Arc<Self>, params: Vec<Param>, reset: bool) -> ParamRequest {
        let token = {
            let mut s = self.state.lock();
            let token = s.next_param_token;
            s.next_param_token += 1;
            s.param_requests.push((token, params::ParamReq { params, reset }));
            token
        };
        self.update_params();
        ParamRequest {
            adapter: Arc::clone(self),
            token,
        }
    }

    fn release_param_request(self: &Arc<Self>, token: u64) {
        {
            let mut s = self.state.lock();
            let Some(i) = s.param_requests.iter().position(|&(t, _)| t == token) else {
                return;
            };
            s.param_requests.remove(i);
        }
        self.update_params();
    }

    /// Pushes the composition of all outstanding requests to the driver
    /// and keeps the builtin parameters in sync.
    fn update_params(self: &Arc<Self>) {
        let composed = {
            let s = self.state.lock();
            params::compose(s.param_requests.iter().map(|(_, r)| r))
        };
        let t4_changed = {
            let mut s = self.state.lock();
            let prev = s.t4_ndef;
            // Reset composition semantics: anything not explicitly set
            // returns to its default
            s.t4_ndef = (composed.iter())
                .find(|p| p.id == ParamId::T4Ndef)
                .map_or(true, |p| p.value.as_bool());
            s.t4_ndef != prev
        };
        self.driver.set_params(self, &composed, true);
        if t4_changed {
            self.param_change_notify(ParamId::T4Ndef);
        }
    }

    //
    // Listener registration
    //

    pub fn add_enabled_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.enabled_changed.add(f)
    }

    pub fn add_powered_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.powered.add(f)
    }

    pub fn add_power_requested_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.power_requested.add(f)
    }

    pub fn add_mode_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.mode_changed.add(f)
    }

    pub fn add_mode_requested_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.mode_requested.add(f)
    }

    pub fn add_target_presence_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.target_presence.add(f)
    }

    pub fn add_tag_added_handler(
        &self,
        f: impl Fn(&Arc<Tag>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.tag_added.add(f)
    }

    pub fn add_tag_removed_handler(
        &self,
        f: impl Fn(&Arc<Tag>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.tag_removed.add(f)
    }

    pub fn add_peer_added_handler(
        &self,
        f: impl Fn(&Arc<Peer>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.peer_added.add(f)
    }

    pub fn add_peer_removed_handler(
        &self,
        f: impl Fn(&Arc<Peer>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.peer_removed.add(f)
    }

    pub fn add_host_added_handler(
        &self,
        f: impl Fn(&Arc<Host>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.host_added.add(f)
    }

    pub fn add_host_removed_handler(
        &self,
        f: impl Fn(&Arc<Host>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.host_removed.add(f)
    }

    /// Subscribes to parameter changes: one id, or all of them.
    pub fn add_param_changed_handler(
        &self,
        id: Option<ParamId>,
        f: impl Fn(&ParamId) + Send + Sync + 'static,
    ) -> HandlerId {
        match id {
            None => self.events.param_changed.add(f),
            Some(want) => self.events.param_changed.add(move |id| {
                if *id == want {
                    f(id);
                }
            }),
        }
    }

    /// Unregisters one listener. Id zero is ignored.
    pub fn remove_handler(&self, id: HandlerId) {
        let e = &self.events;
        let _ = e.enabled_changed.remove(id)
            || e.powered.remove(id)
            || e.power_requested.remove(id)
            || e.mode_changed.remove(id)
            || e.mode_requested.remove(id)
            || e.target_presence.remove(id)
            || e.tag_added.remove(id)
            || e.tag_removed.remove(id)
            || e.peer_added.remove(id)
            || e.peer_removed.remove(id)
            || e.host_added.remove(id)
            || e.host_removed.remove(id)
            || e.param_changed.remove(id);
    }

    pub fn remove_handlers(&self, ids: &[HandlerId]) {
        for &id in ids {
            self.remove_handler(id);
        }
    }

    //
    // Internal interface
    //

    pub(crate) fn set_name(&self, name: &str) {
        self.state.lock().name = name.into();
    }

    pub(crate) fn set_manager(&self, manager: &Weak<Manager>) {
        self.state.lock().manager = Weak::clone(manager);
    }

    fn manager(&self) -> Option<Arc<Manager>> {
        self.state.lock().manager.upgrade()
    }

    /// Reconciles the power request machinery against the target state
    /// `enabled && power_requested`. A pending request with a stale
    /// target is cancelled and resubmitted.
    fn update_power(self: &Arc<Self>) {
        let mut cancel_mode = false;
        let mut cancel_power = false;
        let mut submit = None;
        {
            let mut s = self.state.lock();
            let on = s.enabled && s.power_requested;
            // Cancel the mode change if the whole thing powers off
            if !on && s.mode_pending {
                s.mode_pending = false;
                cancel_mode = true;
            }
            if s.power_pending {
                if s.power_submitted != on {
                    cancel_power = true;
                    s.power_submitted = on;
                    submit = Some(on);
                }
            } else if s.powered != on {
                s.power_pending = true;
                s.power_submitted = on;
                submit = Some(on);
            }
        }
        if cancel_mode {
            self.driver.cancel_mode_request(self);
        }
        if cancel_power {
            self.driver.cancel_power_request(self);
        }
        if let Some(on) = submit {
            if !self.driver.submit_power_request(self, on) {
                self.state.lock().power_pending = false;
            }
        }
    }

    /// Reconciles the mode request machinery. The target is
    /// `mode_requested`, or no mode at all while powered down.
    fn update_mode(self: &Arc<Self>) {
        let mut cancel = false;
        let mut submit = None;
        {
            let mut s = self.state.lock();
            if !s.powered {
                // Assume no polling when power is off
                if s.mode_pending {
                    s.mode_pending = false;
                    cancel = true;
                }
                if !s.mode.is_empty() {
                    s.mode = Mode::empty();
                    s.pending_signals |= SIG_MODE;
                }
            } else if s.mode_pending {
                if s.mode_submitted != s.mode_requested {
                    cancel = true;
                    s.mode_submitted = s.mode_requested;
                    submit = Some(s.mode_requested);
                }
            } else if s.mode != s.mode_requested {
                s.mode_pending = true;
                s.mode_submitted = s.mode_requested;
                submit = Some(s.mode_requested);
            }
        }
        if cancel {
            self.driver.cancel_mode_request(self);
        }
        if let Some(mode) = submit {
            if !self.driver.submit_mode_request(self, mode) {
                self.state.lock().mode_pending = false;
            }
        }
    }

    fn update_presence(self: &Arc<Self>) {
        let mut s = self.state.lock();
        let present = s.tags.values().any(|e| e.obj.present())
            || s.peers.values().any(|e| e.obj.present())
            || s.hosts.values().any(|e| e.obj.initiator().present());
        if s.target_present != present {
            s.target_present = present;
            debug!("Target {}", if present { "detected" } else { "disappeared" });
            s.pending_signals |= SIG_TARGET_PRESENCE;
        }
    }

    /// Flushes queued change signals in bit order. The self reference
    /// held by the caller keeps the adapter alive even if a handler
    /// drops its last external reference.
    fn emit_pending(self: &Arc<Self>) {
        loop {
            let sig = {
                let mut s = self.state.lock();
                if s.pending_signals == 0 {
                    break;
                }
                let bit = 1 << s.pending_signals.trailing_zeros();
                s.pending_signals &= !bit;
                bit
            };
            let e = &self.events;
            match sig {
                SIG_ENABLED => e.enabled_changed.emit(self),
                SIG_POWERED => e.powered.emit(self),
                SIG_POWER_REQUESTED => e.power_requested.emit(self),
                SIG_MODE => e.mode_changed.emit(self),
                SIG_MODE_REQUESTED => e.mode_requested.emit(self),
                SIG_TARGET_PRESENCE => e.target_presence.emit(self),
                _ => unreachable!(),
            }
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        let s = self.state.get_mut();
        if s.mode_pending || s.power_pending {
            warn!("{} dropped with a request in flight", s.name);
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("Adapter")
            .field("name", &s.name)
            .field("enabled", &s.enabled)
            .field("powered", &s.powered)
            .field("mode", &s.mode)
            .finish_non_exhaustive()
    }
}

/// Owned token for one parameter override request. Dropping it removes
/// the request and re-applies the remainder of the overlay.
#[derive(Debug)]
#[must_use]
pub struct ParamRequest {
    adapter: Arc<Adapter>,
    token: u64,
}

impl Drop for ParamRequest {
    fn drop(&mut self) {
        self.adapter.release_param_request(self.token);
    }
}

/// Assigns the next free name with the given prefix. Collisions are
/// rather unlikely, but the counter wraps eventually.
fn make_name<T>(table: &BTreeMap<String, T>, prefix: &str, next: &mut u32) -> String {
    loop {
        let name = format!("{prefix}{next}");
        *next = next.wrapping_add(1);
        if !table.contains_key(&name) {
            return name;
        }
    }
}
