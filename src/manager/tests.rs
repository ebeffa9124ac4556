use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::*;
use crate::adapter::{Driver, Param, ParamId, ParamValue, Tech};
use crate::host::{Completion, Host, HostAppFlags, Initiator, InitiatorIo, OpId};
use crate::peer::{PeerRole, PeerService, PeerServiceFlags, PeerServiceHandler, SAP_SNEP};

#[derive(Default)]
struct DrvState {
    power_pending: bool,
    power_target: bool,
    mode_pending: bool,
}

#[derive(Clone)]
struct FakeDriver {
    modes: Mode,
    st: Arc<SyncMutex<DrvState>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            modes: Mode::READER_WRITER,
            st: Arc::default(),
        }
    }
}

impl FakeDriver {
    fn complete_power(&self, adapter: &Arc<Adapter>) {
        let on = {
            let mut st = self.st.lock();
            assert!(st.power_pending);
            st.power_pending = false;
            st.power_target
        };
        adapter.power_notify(on, true);
    }
}

impl Driver for FakeDriver {
    fn supported_modes(&self) -> Mode {
        self.modes
    }

    fn submit_power_request(&self, _adapter: &Arc<Adapter>, on: bool) -> bool {
        let mut st = self.st.lock();
        assert!(!st.power_pending);
        st.power_pending = true;
        st.power_target = on;
        true
    }

    fn cancel_power_request(&self, _adapter: &Arc<Adapter>) {
        self.st.lock().power_pending = false;
    }

    fn submit_mode_request(&self, _adapter: &Arc<Adapter>, _mode: Mode) -> bool {
        let mut st = self.st.lock();
        assert!(!st.mode_pending);
        st.mode_pending = true;
        true
    }

    fn cancel_mode_request(&self, _adapter: &Arc<Adapter>) {
        self.st.lock().mode_pending = false;
    }
}

fn counter(manager: &Arc<Manager>, which: &str) -> Arc<AtomicU32> {
    let n = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&n);
    let f = move |_: &Arc<Manager>| {
        c.fetch_add(1, Ordering::Relaxed);
    };
    match which {
        "enabled" => manager.add_enabled_changed_handler(f),
        "mode" => manager.add_mode_changed_handler(f),
        "stopped" => manager.add_stopped_handler(f),
        _ => unreachable!(),
    };
    n
}

struct TestPlugin {
    name: &'static str,
    ok: bool,
    started: Arc<AtomicU32>,
    stopped: Arc<AtomicU32>,
}

impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&self, _manager: &Arc<Manager>) -> bool {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.ok
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn lifecycle() {
    let started = Arc::new(AtomicU32::new(0));
    let stopped = Arc::new(AtomicU32::new(0));
    let plugin = Arc::new(TestPlugin {
        name: "test",
        ok: true,
        started: Arc::clone(&started),
        stopped: Arc::clone(&stopped),
    });
    let manager = Manager::new(vec![plugin]);
    let stop_events = counter(&manager, "stopped");

    assert!(manager.enabled());
    assert_eq!(manager.llcp_version(), LLCP_VERSION);
    assert!(manager.start());
    assert_eq!(started.load(Ordering::Relaxed), 1);

    manager.stop(0);
    assert_eq!(stop_events.load(Ordering::Relaxed), 1);
    assert_eq!(stopped.load(Ordering::Relaxed), 1);
    assert_eq!(manager.error(), 0);

    // The stopped event fires once; the first nonzero error sticks
    manager.stop(1);
    assert_eq!(stop_events.load(Ordering::Relaxed), 1);
    assert_eq!(manager.error(), 1);
    manager.stop(2);
    assert_eq!(manager.error(), 1);
}

#[test]
fn failed_plugin_is_dropped() {
    let started = Arc::new(AtomicU32::new(0));
    let stopped = Arc::new(AtomicU32::new(0));
    let plugin = Arc::new(TestPlugin {
        name: "bad",
        ok: false,
        started: Arc::clone(&started),
        stopped: Arc::clone(&stopped),
    });
    let manager = Manager::new(vec![plugin]);
    assert!(!manager.start());
    manager.stop(0);
    // The failed plugin is no longer around to be stopped
    assert_eq!(stopped.load(Ordering::Relaxed), 0);
}

#[test]
fn adapters() {
    let manager = Manager::new(Vec::new());
    let drv1 = FakeDriver::default();
    let drv2 = FakeDriver::default();
    let adapter1 = Adapter::new(drv1.clone());
    let adapter2 = Adapter::new(drv2.clone());
    let added = Arc::new(AtomicU32::new(0));
    let removed = Arc::new(AtomicU32::new(0));
    {
        let n = Arc::clone(&added);
        manager.add_adapter_added_handler(move |_| {
            n.fetch_add(1, Ordering::Relaxed);
        });
        let n = Arc::clone(&removed);
        manager.add_adapter_removed_handler(move |_| {
            n.fetch_add(1, Ordering::Relaxed);
        });
    }

    let name1 = manager.add_adapter(&adapter1);
    let name2 = manager.add_adapter(&adapter2);
    assert_eq!(name1, "nfc0");
    assert_eq!(name2, "nfc1");
    assert_eq!(adapter1.name(), "nfc0");
    // Re-adding returns the existing name
    assert_eq!(manager.add_adapter(&adapter1), name1);
    assert_eq!(added.load(Ordering::Relaxed), 2);
    assert!(manager.get_adapter("nfc0").is_some());
    assert!(manager.get_adapter("foo").is_none());

    // Adapters inherit the manager state on registration
    assert!(adapter1.enabled());
    assert_eq!(adapter1.mode_requested(), Mode::READER_WRITER);

    let enabled_events = counter(&manager, "enabled");
    manager.set_enabled(false);
    assert!(!manager.enabled());
    assert!(!adapter1.enabled());
    assert!(!adapter2.enabled());
    manager.set_enabled(false);
    assert_eq!(enabled_events.load(Ordering::Relaxed), 1);
    manager.set_enabled(true);
    assert_eq!(enabled_events.load(Ordering::Relaxed), 2);

    manager.request_power(true);
    assert!(adapter1.power_requested());
    assert!(adapter2.power_requested());
    drv1.complete_power(&adapter1);
    drv2.complete_power(&adapter2);
    assert!(adapter1.powered());
    assert!(adapter2.powered());

    manager.remove_adapter("nfc0");
    manager.remove_adapter("nfc0");
    assert_eq!(removed.load(Ordering::Relaxed), 1);
    assert!(manager.get_adapter("nfc0").is_none());
    assert_eq!(manager.adapters().len(), 1);

    // A late adapter picks up power and the current (non-default) mode
    let enable_ce = manager
        .mode_request_new(Mode::CARD_EMULATION, Mode::empty())
        .unwrap();
    assert_eq!(manager.mode(), Mode::READER_WRITER | Mode::CARD_EMULATION);
    let drv3 = FakeDriver {
        modes: Mode::READER_WRITER | Mode::CARD_EMULATION,
        ..FakeDriver::default()
    };
    let adapter3 = Adapter::new(drv3.clone());
    manager.add_adapter(&adapter3);
    assert!(adapter3.power_requested());
    assert_eq!(
        adapter3.mode_requested(),
        Mode::READER_WRITER | Mode::CARD_EMULATION
    );
    // And follows subsequent recomputations
    drop(enable_ce);
    assert_eq!(adapter3.mode_requested(), Mode::READER_WRITER);
}

#[test]
fn mode_stack() {
    let all = Mode::READER_WRITER | Mode::CARD_EMULATION | Mode::P2P;
    let manager = Manager::new(Vec::new());
    let changes = counter(&manager, "mode");
    assert_eq!(manager.mode(), Mode::READER_WRITER);

    // No empty requests
    assert!(manager.mode_request_new(Mode::empty(), Mode::empty()).is_none());

    // Enable P2P; its own disable bit is dominated by the enable mask
    let enable_p2p = manager.mode_request_new(Mode::P2P, Mode::P2P_INITIATOR).unwrap();
    assert_eq!(manager.mode(), Mode::READER_WRITER | Mode::P2P);
    assert_eq!(changes.load(Ordering::Relaxed), 1);

    // A later disable loses against the earlier enable
    let disable_p2p = manager.mode_request_new(Mode::empty(), Mode::P2P).unwrap();
    assert_eq!(manager.mode(), Mode::READER_WRITER | Mode::P2P);
    assert_eq!(changes.load(Ordering::Relaxed), 1);

    let enable_all = manager.mode_request_new(all, Mode::empty()).unwrap();
    assert_eq!(manager.mode(), all);
    assert_eq!(changes.load(Ordering::Relaxed), 2);

    // Same request again, nothing changes
    let enable_all2 = manager.mode_request_new(all, Mode::empty()).unwrap();
    assert_eq!(manager.mode(), all);
    assert_eq!(changes.load(Ordering::Relaxed), 2);

    // Releasing the P2P enable lets the disable through
    drop(enable_p2p);
    assert_eq!(manager.mode(), Mode::READER_WRITER | Mode::CARD_EMULATION);
    assert_eq!(changes.load(Ordering::Relaxed), 3);

    // And releasing the disable restores the enables
    drop(disable_p2p);
    assert_eq!(manager.mode(), all);
    assert_eq!(changes.load(Ordering::Relaxed), 4);

    drop(enable_all);
    assert_eq!(manager.mode(), all);
    assert_eq!(changes.load(Ordering::Relaxed), 4);

    // Base mode is all that remains
    drop(enable_all2);
    assert_eq!(manager.mode(), Mode::READER_WRITER);
    assert_eq!(changes.load(Ordering::Relaxed), 5);
}

#[test]
fn mode_pushed_to_adapters() {
    let manager = Manager::new(Vec::new());
    let drv = FakeDriver::default();
    let adapter = Adapter::new(drv.clone());
    manager.add_adapter(&adapter);

    manager.request_mode(Mode::empty());
    assert_eq!(adapter.mode_requested(), Mode::empty());
    manager.request_mode(Mode::READER_WRITER);
    assert_eq!(adapter.mode_requested(), Mode::READER_WRITER);

    // Unsupported bits are the adapter's business; the token works
    let req = manager
        .mode_request_new(Mode::CARD_EMULATION, Mode::empty())
        .unwrap();
    assert_eq!(manager.mode(), Mode::READER_WRITER | Mode::CARD_EMULATION);
    assert_eq!(adapter.mode_requested(), Mode::READER_WRITER);
    drop(req);
}

struct NullHandler;

impl PeerServiceHandler for NullHandler {}

#[test]
fn peer_service_registration() {
    let manager = Manager::new(Vec::new());
    let registered = Arc::new(AtomicU32::new(0));
    let unregistered = Arc::new(AtomicU32::new(0));
    {
        let n = Arc::clone(&registered);
        manager.add_service_registered_handler(move |_| {
            n.fetch_add(1, Ordering::Relaxed);
        });
        let n = Arc::clone(&unregistered);
        manager.add_service_unregistered_handler(move |_| {
            n.fetch_add(1, Ordering::Relaxed);
        });
    }

    let snep = PeerService::new(
        Some(crate::peer::NAME_SNEP),
        PeerServiceFlags::CAN_ACCEPT,
        NullHandler,
    );
    assert!(manager.register_service(&snep));
    assert_eq!(snep.sap(), SAP_SNEP);
    assert_eq!(registered.load(Ordering::Relaxed), 1);

    // Only once
    assert!(!manager.register_service(&snep));
    assert_eq!(registered.load(Ordering::Relaxed), 1);

    manager.unregister_service(&snep);
    assert_eq!(unregistered.load(Ordering::Relaxed), 1);
    manager.unregister_service(&snep);
    assert_eq!(unregistered.load(Ordering::Relaxed), 1);
    assert!(manager.peer_services().list().is_empty());
}

struct ArrivalHandler {
    arrived: Arc<AtomicU32>,
    left: Arc<AtomicU32>,
}

impl PeerServiceHandler for ArrivalHandler {
    fn peer_arrived(&self, _service: &Arc<PeerService>, _peer: &Arc<crate::peer::Peer>) {
        self.arrived.fetch_add(1, Ordering::Relaxed);
    }

    fn peer_left(&self, _service: &Arc<PeerService>, _peer: &Arc<crate::peer::Peer>) {
        self.left.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn peers_fan_out_to_services() {
    let manager = Manager::new(Vec::new());
    let drv = FakeDriver::default();
    let adapter = Adapter::new(drv.clone());
    manager.add_adapter(&adapter);

    let arrived = Arc::new(AtomicU32::new(0));
    let left = Arc::new(AtomicU32::new(0));
    let service = PeerService::new(
        Some("urn:nfc:sn:watcher"),
        PeerServiceFlags::CAN_ACCEPT,
        ArrivalHandler {
            arrived: Arc::clone(&arrived),
            left: Arc::clone(&left),
        },
    );
    assert!(manager.register_service(&service));

    let peer = adapter
        .add_peer(crate::peer::Peer::new(Tech::F, PeerRole::Initiator))
        .unwrap();
    assert_eq!(arrived.load(Ordering::Relaxed), 1);
    peer.gone_notify();
    assert_eq!(left.load(Ordering::Relaxed), 1);
    assert!(adapter.peers().is_empty());
}

#[test]
fn stop_disables_adapters() {
    let manager = Manager::new(Vec::new());
    let drv = FakeDriver::default();
    let adapter = Adapter::new(drv.clone());
    manager.add_adapter(&adapter);
    assert!(adapter.enabled());

    manager.start();
    manager.stop(0);
    assert!(!adapter.enabled());
}

struct NullIo;

impl InitiatorIo for NullIo {
    fn respond(&self, _initiator: &Arc<Initiator>, _data: &[u8]) -> bool {
        false
    }

    fn deactivate(&self, initiator: &Arc<Initiator>) {
        initiator.gone_notify();
    }
}

struct TestHostService {
    started: AtomicU32,
}

impl HostService for TestHostService {
    fn name(&self) -> &str {
        "svc"
    }

    fn start(&self, _host: &Arc<Host>, done: Completion<bool>) -> OpId {
        self.started.fetch_add(1, Ordering::Relaxed);
        done.resolve(true);
        OpId::SYNC
    }
}

struct TestHostApp {
    started: AtomicU32,
}

impl HostApp for TestHostApp {
    fn name(&self) -> &str {
        "app"
    }

    fn aid(&self) -> &[u8] {
        &[0xA0, 0x00, 0x00, 0x01]
    }

    fn flags(&self) -> HostAppFlags {
        HostAppFlags::ALLOW_IMPLICIT_SELECTION
    }

    fn start(&self, _host: &Arc<Host>, done: Completion<bool>) -> OpId {
        self.started.fetch_add(1, Ordering::Relaxed);
        done.resolve(true);
        OpId::SYNC
    }
}

#[test]
fn published_host_plugins_reach_sessions() {
    let manager = Manager::new(Vec::new());
    let svc = Arc::new(TestHostService {
        started: AtomicU32::new(0),
    });
    let app = Arc::new(TestHostApp {
        started: AtomicU32::new(0),
    });
    assert!(manager.register_host_service(svc.clone()));
    assert!(manager.register_host_app(app.clone()));
    // Only once
    assert!(!manager.register_host_service(svc.clone()));
    assert!(!manager.register_host_app(app.clone()));

    let drv = FakeDriver::default();
    let adapter = Adapter::new(drv);
    manager.add_adapter(&adapter);

    // A new session starts the published plugins and implicitly
    // selects the application
    let initiator = Initiator::new(NullIo);
    let host = adapter.add_host(&initiator).unwrap();
    assert_eq!(svc.started.load(Ordering::Relaxed), 1);
    assert_eq!(app.started.load(Ordering::Relaxed), 1);
    assert_eq!(host.current_app().unwrap().name(), "app");
    initiator.gone_notify();

    // Unregistered plugins are absent from subsequent sessions
    let svc_dyn: Arc<dyn HostService> = svc.clone();
    let app_dyn: Arc<dyn HostApp> = app.clone();
    manager.unregister_host_service(&svc_dyn);
    manager.unregister_host_app(&app_dyn);
    let initiator = Initiator::new(NullIo);
    let host = adapter.add_host(&initiator).unwrap();
    assert_eq!(svc.started.load(Ordering::Relaxed), 1);
    assert_eq!(app.started.load(Ordering::Relaxed), 1);
    assert!(host.current_app().is_none());
}

#[test]
fn param_requests_compose_through_adapter() {
    // End-to-end S6: two overlapping requests against a managed adapter
    let manager = Manager::new(Vec::new());
    let drv = FakeDriver::default();
    let adapter = Adapter::new(drv.clone());
    manager.add_adapter(&adapter);

    let req1 = adapter.param_request(
        vec![Param::new(ParamId::T4Ndef, ParamValue::Bool(false))],
        false,
    );
    let req2 = adapter.param_request(
        vec![Param::new(
            ParamId::LaNfcid1,
            ParamValue::Bytes(vec![0x11, 0x22]),
        )],
        true,
    );
    assert_eq!(
        adapter.param_get(ParamId::T4Ndef),
        Some(ParamValue::Bool(true))
    );
    drop(req2);
    assert_eq!(
        adapter.param_get(ParamId::T4Ndef),
        Some(ParamValue::Bool(false))
    );
    drop(req1);
    assert_eq!(
        adapter.param_get(ParamId::T4Ndef),
        Some(ParamValue::Bool(true))
    );
}
