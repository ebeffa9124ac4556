//! Top-level container: the set of adapters, the published services,
//! and the aggregation of client enable/power/mode requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::{Adapter, Mode};
use crate::host::{HostApp, HostService};
use crate::peer::{PeerService, PeerServices};
use crate::util::{HandlerId, Slot};
use crate::SyncMutex;

#[cfg(test)]
mod tests;

/// LLCP version the daemon negotiates, 1.3.
pub const LLCP_VERSION: u8 = 0x13;

/// A loadable component started and stopped with the manager. Discovery
/// and loading of plugins is the embedder's business.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the plugin. Returning `false` drops it from the manager.
    fn start(&self, manager: &Arc<Manager>) -> bool {
        true
    }

    fn stop(&self) {}
}

struct ModeReq {
    token: u64,
    enable: Mode,
    disable: Mode,
}

struct Inner {
    adapters: BTreeMap<String, Arc<Adapter>>,
    next_adapter: u32,
    enabled: bool,
    power_requested: bool,
    mode_base: Mode,
    mode: Mode,
    mode_requests: Vec<ModeReq>,
    next_token: u64,
    host_services: Vec<Arc<dyn HostService>>,
    host_apps: Vec<Arc<dyn HostApp>>,
    plugins: Vec<Arc<dyn Plugin>>,
    started: bool,
    stopped: bool,
    error: i32,
}

#[derive(Default)]
struct Events {
    adapter_added: Slot<Arc<Adapter>>,
    adapter_removed: Slot<Arc<Adapter>>,
    enabled_changed: Slot<Arc<Manager>>,
    mode_changed: Slot<Arc<Manager>>,
    stopped: Slot<Arc<Manager>>,
    service_registered: Slot<Arc<PeerService>>,
    service_unregistered: Slot<Arc<PeerService>>,
}

/// The daemon core. Owns the adapters; each adapter holds a weak
/// back-reference and must tolerate the manager being gone.
pub struct Manager {
    inner: SyncMutex<Inner>,
    peer_services: PeerServices,
    events: Events,
}

impl Manager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Arc<Self> {
        Arc::new(Self {
            inner: SyncMutex::new(Inner {
                adapters: BTreeMap::new(),
                next_adapter: 0,
                enabled: true,
                power_requested: false,
                mode_base: Mode::READER_WRITER,
                mode: Mode::READER_WRITER,
                mode_requests: Vec::new(),
                next_token: 1,
                host_services: Vec::new(),
                host_apps: Vec::new(),
                plugins,
                started: false,
                stopped: false,
                error: 0,
            }),
            peer_services: PeerServices::new(),
            events: Events::default(),
        })
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// The aggregate mode pushed to every adapter.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    /// First nonzero error code passed to [`stop`](Self::stop).
    #[must_use]
    pub fn error(&self) -> i32 {
        self.inner.lock().error
    }

    #[inline]
    #[must_use]
    pub const fn llcp_version(&self) -> u8 {
        LLCP_VERSION
    }

    #[inline]
    #[must_use]
    pub const fn peer_services(&self) -> &PeerServices {
        &self.peer_services
    }

    //
    // Lifecycle
    //

    /// Starts the plugins. Returns whether all of them started.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.started {
                return true;
            }
            inner.started = true;
        }
        let plugins = self.inner.lock().plugins.clone();
        let mut ok = true;
        for plugin in &plugins {
            if !plugin.start(self) {
                warn!("Plugin {} failed to start", plugin.name());
                let mut inner = self.inner.lock();
                (inner.plugins).retain(|p| !Arc::ptr_eq(p, plugin));
                ok = false;
            }
        }
        ok
    }

    /// Stops the daemon: records the first nonzero error code, stops
    /// the plugins, disables the adapters, and emits the stopped event
    /// exactly once.
    pub fn stop(self: &Arc<Self>, error: i32) {
        let (emit, plugins, adapters) = {
            let mut inner = self.inner.lock();
            if inner.error == 0 && error != 0 {
                inner.error = error;
            }
            let emit = !inner.stopped;
            inner.stopped = true;
            (emit, inner.plugins.clone(), snapshot(&inner))
        };
        if !emit {
            return;
        }
        debug!("Stopping");
        for plugin in &plugins {
            plugin.stop();
        }
        for adapter in &adapters {
            adapter.set_enabled(false);
        }
        self.events.stopped.emit(self);
    }

    //
    // Adapters
    //

    /// Registers an adapter, assigning it a unique `nfc<n>` name.
    /// Registering the same adapter again returns its existing name.
    pub fn add_adapter(self: &Arc<Self>, adapter: &Arc<Adapter>) -> String {
        let (name, enabled, power, mode) = {
            let mut inner = self.inner.lock();
            if let Some((name, _)) =
                (inner.adapters.iter()).find(|(_, a)| Arc::ptr_eq(a, adapter))
            {
                return name.clone();
            }
            let inner = &mut *inner;
            let name = loop {
                let name = format!("nfc{}", inner.next_adapter);
                inner.next_adapter = inner.next_adapter.wrapping_add(1);
                if !inner.adapters.contains_key(&name) {
                    break name;
                }
            };
            inner.adapters.insert(name.clone(), Arc::clone(adapter));
            (name, inner.enabled, inner.power_requested, inner.mode)
        };
        adapter.set_name(&name);
        adapter.set_manager(&Arc::downgrade(self));
        // Late adapters pick up the current aggregate state
        adapter.set_enabled(enabled);
        adapter.request_power(power);
        let _ = adapter.request_mode(mode);
        debug!("Added adapter {name}");
        self.events.adapter_added.emit(adapter);
        name
    }

    /// Unregisters an adapter by name. Unknown names are ignored.
    pub fn remove_adapter(self: &Arc<Self>, name: &str) {
        let Some(adapter) = self.inner.lock().adapters.remove(name) else {
            return;
        };
        debug!("Removed adapter {name}");
        self.events.adapter_removed.emit(&adapter);
    }

    #[must_use]
    pub fn get_adapter(&self, name: &str) -> Option<Arc<Adapter>> {
        self.inner.lock().adapters.get(name).map(Arc::clone)
    }

    /// Registered adapters, sorted by name.
    #[must_use]
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        snapshot(&self.inner.lock())
    }

    //
    // Enable / power / mode aggregation
    //

    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let adapters = {
            let mut inner = self.inner.lock();
            if inner.enabled == enabled {
                return;
            }
            inner.enabled = enabled;
            snapshot(&inner)
        };
        for adapter in &adapters {
            adapter.set_enabled(enabled);
        }
        self.events.enabled_changed.emit(self);
    }

    pub fn request_power(self: &Arc<Self>, on: bool) {
        let adapters = {
            let mut inner = self.inner.lock();
            inner.power_requested = on;
            snapshot(&inner)
        };
        for adapter in &adapters {
            adapter.request_power(on);
        }
    }

    /// Sets the base mode underneath the request stack.
    pub fn request_mode(self: &Arc<Self>, mode: Mode) {
        {
            let mut inner = self.inner.lock();
            if inner.mode_base == mode {
                return;
            }
            inner.mode_base = mode;
        }
        self.update_mode();
    }

    /// Creates a mode override token. Refused when both masks are
    /// empty. The effective mode is recomputed on every token add and
    /// release; unsupported bits are left for each adapter to mask.
    pub fn mode_request_new(self: &Arc<Self>, enable: Mode, disable: Mode) -> Option<ModeRequest> {
        if enable.is_empty() && disable.is_empty() {
            return None;
        }
        let token = {
            let mut inner = self.inner.lock();
            let token = inner.next_token;
            inner.next_token += 1;
            inner.mode_requests.push(ModeReq {
                token,
                enable,
                disable,
            });
            token
        };
        self.update_mode();
        Some(ModeRequest {
            manager: Arc::clone(self),
            token,
        })
    }

    fn release_mode_request(self: &Arc<Self>, token: u64) {
        {
            let mut inner = self.inner.lock();
            let Some(i) = (inner.mode_requests.iter()).position(|r| r.token == token) else {
                return;
            };
            inner.mode_requests.remove(i);
        }
        self.update_mode();
    }

    /// Folds the base mode through the request stack, in registration
    /// order. An earlier token dominates later ones; within one token
    /// the enable mask dominates its own disable mask.
    fn update_mode(self: &Arc<Self>) {
        let (changed, mode, adapters) = {
            let mut inner = self.inner.lock();
            let mut enable = Mode::empty();
            let mut disable = Mode::empty();
            for req in &inner.mode_requests {
                enable |= req.enable & !disable;
                disable |= req.disable & !req.enable & !enable;
            }
            let mode = (inner.mode_base | enable) & !disable;
            let changed = inner.mode != mode;
            inner.mode = mode;
            (changed, mode, snapshot(&inner))
        };
        for adapter in &adapters {
            let _ = adapter.request_mode(mode);
        }
        if changed {
            debug!("Mode {:#04x}", mode.bits());
            self.events.mode_changed.emit(self);
        }
    }

    //
    // Services
    //

    /// Registers a peer service, allocating its SAP. Fails on a
    /// duplicate name or an exhausted SAP range.
    pub fn register_service(self: &Arc<Self>, service: &Arc<PeerService>) -> bool {
        if !self.peer_services.add(service) {
            return false;
        }
        self.events.service_registered.emit(service);
        true
    }

    pub fn unregister_service(self: &Arc<Self>, service: &Arc<PeerService>) {
        if self.peer_services.remove(service) {
            self.events.service_unregistered.emit(service);
        }
    }

    /// Publishes a host service for future card-emulation sessions.
    pub fn register_host_service(&self, service: Arc<dyn HostService>) -> bool {
        let mut inner = self.inner.lock();
        if (inner.host_services.iter()).any(|s| Arc::ptr_eq(s, &service)) {
            return false;
        }
        inner.host_services.push(service);
        true
    }

    pub fn unregister_host_service(&self, service: &Arc<dyn HostService>) {
        (self.inner.lock().host_services).retain(|s| !Arc::ptr_eq(s, service));
    }

    /// Publishes a host application for future card-emulation sessions.
    pub fn register_host_app(&self, app: Arc<dyn HostApp>) -> bool {
        let mut inner = self.inner.lock();
        if (inner.host_apps.iter()).any(|a| Arc::ptr_eq(a, &app)) {
            return false;
        }
        inner.host_apps.push(app);
        true
    }

    pub fn unregister_host_app(&self, app: &Arc<dyn HostApp>) {
        (self.inner.lock().host_apps).retain(|a| !Arc::ptr_eq(a, app));
    }

    pub(crate) fn host_services(&self) -> Vec<Arc<dyn HostService>> {
        self.inner.lock().host_services.clone()
    }

    pub(crate) fn host_apps(&self) -> Vec<Arc<dyn HostApp>> {
        self.inner.lock().host_apps.clone()
    }

    //
    // Listener registration
    //

    pub fn add_adapter_added_handler(
        &self,
        f: impl Fn(&Arc<Adapter>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.adapter_added.add(f)
    }

    pub fn add_adapter_removed_handler(
        &self,
        f: impl Fn(&Arc<Adapter>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.adapter_removed.add(f)
    }

    pub fn add_enabled_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.enabled_changed.add(f)
    }

    pub fn add_mode_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.mode_changed.add(f)
    }

    pub fn add_stopped_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.stopped.add(f)
    }

    pub fn add_service_registered_handler(
        &self,
        f: impl Fn(&Arc<PeerService>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.service_registered.add(f)
    }

    pub fn add_service_unregistered_handler(
        &self,
        f: impl Fn(&Arc<PeerService>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.service_unregistered.add(f)
    }

    /// Unregisters one listener. Id zero is ignored.
    pub fn remove_handler(&self, id: HandlerId) {
        let e = &self.events;
        let _ = e.adapter_added.remove(id)
            || e.adapter_removed.remove(id)
            || e.enabled_changed.remove(id)
            || e.mode_changed.remove(id)
            || e.stopped.remove(id)
            || e.service_registered.remove(id)
            || e.service_unregistered.remove(id);
    }

    pub fn remove_handlers(&self, ids: &[HandlerId]) {
        for &id in ids {
            self.remove_handler(id);
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Manager")
            .field("adapters", &inner.adapters.len())
            .field("enabled", &inner.enabled)
            .field("mode", &inner.mode)
            .finish_non_exhaustive()
    }
}

fn snapshot(inner: &Inner) -> Vec<Arc<Adapter>> {
    inner.adapters.values().map(Arc::clone).collect()
}

/// Owned token for one mode override request. Dropping it removes the
/// request and recomputes the effective mode.
#[derive(Debug)]
#[must_use]
pub struct ModeRequest {
    manager: Arc<Manager>,
    token: u64,
}

impl Drop for ModeRequest {
    fn drop(&mut self) {
        self.manager.release_mode_request(self.token);
    }
}
