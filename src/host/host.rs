//! Card-emulation host engine.
//!
//! A [`Host`] session exists for the lifetime of one card-emulation
//! encounter. It starts the published services and applications, runs
//! implicit selection, and then routes command APDUs through a
//! `SELECT`-by-AID state machine with well-defined fall-through to the
//! services. APDUs are processed strictly in arrival order; no command
//! begins routing while the previous response is unconfirmed.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

pub use app::{HostApp, HostAppFlags};
pub use initiator::{Initiator, InitiatorIo, SentFn};
pub use service::HostService;

use crate::apdu::{self, Apdu, SW_CLA_NOT_SUPPORTED, SW_ERR_GENERAL, SW_FILE_NOT_FOUND, SW_OK};
use crate::util::{HandlerId, Slot};
use crate::{Error, Result, SyncMutex};

#[path = "app.rs"]
mod app;
#[path = "initiator.rs"]
mod initiator;
#[path = "service.rs"]
mod service;

#[cfg(test)]
mod tests;

/// Identifies one asynchronous service or application operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[must_use]
pub struct OpId(u64);

impl OpId {
    /// The call refused to start; no completion will arrive.
    pub const FAIL: Self = Self(0);
    /// The call resolved its completion before returning.
    pub const SYNC: Self = Self(u64::MAX);

    /// Creates a real operation id. The sentinel values are rejected.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Option<Self> {
        match id {
            0 | u64::MAX => None,
            id => Some(Self(id)),
        }
    }

    /// Returns whether this is one of the sentinel ids, which
    /// cancellation ignores.
    #[inline]
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        matches!(self, Self::FAIL | Self::SYNC)
    }

    /// Raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Single-use completion token for an asynchronous plugin call.
///
/// Resolving is always safe: stale completions (cancelled, superseded,
/// or arriving after session termination) are ignored by the engine.
pub struct Completion<T> {
    f: Box<dyn FnOnce(T) + Send>,
}

impl<T> Completion<T> {
    fn new(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Reports the result of the call.
    pub fn resolve(self, value: T) {
        (self.f)(value);
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

/// Response to a command APDU.
#[must_use]
pub struct Response {
    sw: u16,
    data: Vec<u8>,
    sent: Option<SentFn>,
}

impl Response {
    /// Creates a response with a status word and no payload.
    #[inline]
    pub fn new(sw: u16) -> Self {
        Self {
            sw,
            data: Vec::new(),
            sent: None,
        }
    }

    /// Creates a response with a payload.
    #[inline]
    pub fn with_data(sw: u16, data: Vec<u8>) -> Self {
        Self {
            sw,
            data,
            sent: None,
        }
    }

    /// Attaches a single-use callback invoked once the wire confirms
    /// (or fails, including by cancellation) delivery.
    pub fn on_sent(mut self, f: impl FnOnce(bool) + Send + 'static) -> Self {
        self.sent = Some(Box::new(f));
        self
    }

    #[inline]
    #[must_use]
    pub const fn sw(&self) -> u16 {
        self.sw
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("sw", &format_args!("{:#06x}", self.sw))
            .field("data", &self.data.len())
            .field("sent", &self.sent.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PlugState {
    New,
    Starting,
    Up,
    Failed,
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    seq: u64,
    id: Option<OpId>,
}

struct SvcRec {
    svc: Arc<dyn HostService>,
    state: PlugState,
    pending: Option<Pending>,
}

struct AppRec {
    app: Arc<dyn HostApp>,
    aid: SmallVec<[u8; 16]>,
    state: PlugState,
    pending: Option<Pending>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Plug {
    Svc(usize),
    App(usize),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    StartingServices,
    StartingApps,
    ImplicitSelect { next: usize },
    Ready,
    Terminal,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Step {
    New,
    SelectIssue { app: usize },
    SelectWait { app: usize },
    AppProcessWait,
    SvcNext { next: usize, select: bool },
    SvcWait { idx: usize, select: bool },
}

struct CmdState {
    raw: Vec<u8>,
    step: Step,
}

enum Act {
    SvcStart { idx: usize, seq: u64, restart: bool },
    AppStart { idx: usize, seq: u64 },
    ImplicitSelect { idx: usize, seq: u64 },
    Deselect { idx: usize },
    AppChanged,
    Select { idx: usize, seq: u64 },
    AppProcess { idx: usize, seq: u64 },
    SvcProcess { idx: usize, seq: u64 },
    Respond(Response),
    Gone,
}

struct Inner {
    phase: Phase,
    restarting: bool,
    services: Vec<SvcRec>,
    apps: Vec<AppRec>,
    current: Option<usize>,
    cmd: Option<CmdState>,
    queued: VecDeque<Act>,
    next_seq: u64,
    pumping: bool,
}

/// One card-emulation session with a remote reader.
pub struct Host {
    name: String,
    initiator: Arc<Initiator>,
    inner: SyncMutex<Inner>,
    app_changed: Slot<Arc<Host>>,
    gone: Slot<Arc<Host>>,
}

impl Host {
    /// Creates a session over `initiator` with the published services
    /// and applications. The session does nothing until
    /// [`start`](Self::start) is called.
    pub fn new(
        name: &str,
        initiator: &Arc<Initiator>,
        services: Vec<Arc<dyn HostService>>,
        apps: Vec<Arc<dyn HostApp>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            initiator: Arc::clone(initiator),
            inner: SyncMutex::new(Inner {
                phase: Phase::Idle,
                restarting: false,
                services: (services.into_iter())
                    .map(|svc| SvcRec {
                        svc,
                        state: PlugState::New,
                        pending: None,
                    })
                    .collect(),
                apps: (apps.into_iter())
                    .map(|app| AppRec {
                        aid: app.aid().into(),
                        app,
                        state: PlugState::New,
                        pending: None,
                    })
                    .collect(),
                current: None,
                cmd: None,
                queued: VecDeque::new(),
                next_seq: 1,
                pumping: false,
            }),
            app_changed: Slot::default(),
            gone: Slot::default(),
        })
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn initiator(&self) -> &Arc<Initiator> {
        &self.initiator
    }

    /// The currently selected application, if any.
    #[must_use]
    pub fn current_app(&self) -> Option<Arc<dyn HostApp>> {
        let inner = self.inner.lock();
        inner.current.map(|i| Arc::clone(&inner.apps[i].app))
    }

    /// Starts the session: services first, then applications, then
    /// implicit selection. Subsequent calls do nothing.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Idle {
                return;
            }
            inner.phase = Phase::StartingServices;
        }
        debug!("{} starting", self.name);
        let weak = Arc::downgrade(self);
        self.initiator.add_gone_handler(move |_| {
            if let Some(host) = weak.upgrade() {
                host.on_initiator_gone();
            }
        });
        let weak = Arc::downgrade(self);
        self.initiator.add_reactivated_handler(move |_| {
            if let Some(host) = weak.upgrade() {
                host.on_initiator_reactivated();
            }
        });
        let weak = Arc::downgrade(self);
        self.initiator.set_cmd_handler(move |_, raw| {
            if let Some(host) = weak.upgrade() {
                host.on_command(raw);
            }
        });
        self.advance();
    }

    /// Ends the encounter from our side by deactivating the RF link.
    pub fn deactivate(self: &Arc<Self>) {
        self.initiator.deactivate();
    }

    pub fn add_app_changed_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.app_changed.add(f)
    }

    pub fn add_gone_handler(
        &self,
        f: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.gone.add(f)
    }

    pub fn remove_handler(&self, id: HandlerId) {
        let _ = self.app_changed.remove(id) || self.gone.remove(id);
    }

    pub fn remove_handlers(&self, ids: &[HandlerId]) {
        for &id in ids {
            self.remove_handler(id);
        }
    }

    //
    // Initiator callbacks
    //

    fn on_command(self: &Arc<Self>, raw: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Terminal {
                return;
            }
            // The initiator delivers one command per confirmed exchange
            debug_assert!(inner.cmd.is_none());
            inner.cmd = Some(CmdState {
                raw,
                step: Step::New,
            });
        }
        self.advance();
    }

    fn on_initiator_gone(self: &Arc<Self>) {
        let (deselect, cancels) = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Terminal {
                return;
            }
            inner.phase = Phase::Terminal;
            inner.cmd = None;
            inner.queued.clear();
            inner.queued.push_back(Act::Gone);
            let deselect = (inner.current.take()).map(|i| Arc::clone(&inner.apps[i].app));
            (deselect, take_cancels(&mut inner))
        };
        debug!("{} is gone", self.name);
        if let Some(app) = deselect {
            app.deselect(self);
        }
        self.run_cancels(cancels);
        self.advance();
    }

    fn on_initiator_reactivated(self: &Arc<Self>) {
        let cancels = {
            let mut inner = self.inner.lock();
            if !matches!(inner.phase, Phase::Ready | Phase::ImplicitSelect { .. }) {
                return;
            }
            inner.cmd = None;
            let cancels = take_cancels(&mut inner);
            for rec in &mut inner.services {
                if rec.state == PlugState::Up {
                    rec.state = PlugState::New;
                }
            }
            inner.restarting = true;
            inner.phase = Phase::StartingServices;
            cancels
        };
        debug!("{} restarting", self.name);
        self.run_cancels(cancels);
        self.advance();
    }

    fn run_cancels(self: &Arc<Self>, cancels: Vec<(Plug, OpId)>) {
        for (plug, id) in cancels {
            debug_assert!(!id.is_sentinel());
            match plug {
                Plug::Svc(i) => {
                    let svc = Arc::clone(&self.inner.lock().services[i].svc);
                    svc.cancel(id);
                }
                Plug::App(i) => {
                    let app = Arc::clone(&self.inner.lock().apps[i].app);
                    app.cancel(id);
                }
            }
        }
    }

    //
    // The engine pump
    //

    /// Drives the session forward until nothing can be done without an
    /// outstanding completion. Re-entrant calls fold into the active
    /// loop.
    fn advance(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.pumping {
                return;
            }
            inner.pumping = true;
        }
        loop {
            let act = {
                let mut inner = self.inner.lock();
                let act = next_action(&mut inner);
                if act.is_none() {
                    inner.pumping = false;
                }
                act
            };
            let Some(act) = act else { break };
            self.perform(act);
        }
    }

    fn perform(self: &Arc<Self>, act: Act) {
        match act {
            Act::SvcStart { idx, seq, restart } => {
                let svc = Arc::clone(&self.inner.lock().services[idx].svc);
                let done = self.bool_completion(Plug::Svc(idx), seq);
                let id = if restart {
                    svc.restart(self, done)
                } else {
                    svc.start(self, done)
                };
                self.op_issued(Plug::Svc(idx), seq, id, FailureAs::StartFailed);
            }
            Act::AppStart { idx, seq } => {
                let app = Arc::clone(&self.inner.lock().apps[idx].app);
                let done = self.bool_completion(Plug::App(idx), seq);
                let id = app.start(self, done);
                self.op_issued(Plug::App(idx), seq, id, FailureAs::StartFailed);
            }
            Act::ImplicitSelect { idx, seq } => {
                let app = Arc::clone(&self.inner.lock().apps[idx].app);
                let done = self.select_completion(Plug::App(idx), seq, true);
                let id = app.implicit_select(self, done);
                self.op_issued(Plug::App(idx), seq, id, FailureAs::ImplicitRefused);
            }
            Act::Select { idx, seq } => {
                let app = Arc::clone(&self.inner.lock().apps[idx].app);
                let done = self.select_completion(Plug::App(idx), seq, false);
                let id = app.select(self, done);
                self.op_issued(Plug::App(idx), seq, id, FailureAs::SelectRefused);
            }
            Act::Deselect { idx } => {
                let app = Arc::clone(&self.inner.lock().apps[idx].app);
                app.deselect(self);
            }
            Act::AppChanged => self.app_changed.emit(self),
            Act::AppProcess { idx, seq } => {
                let (app, raw) = {
                    let inner = self.inner.lock();
                    let Some(ref cmd) = inner.cmd else { return };
                    (Arc::clone(&inner.apps[idx].app), cmd.raw.clone())
                };
                let done = self.process_completion(Plug::App(idx), seq);
                // Commands are classified after decoding, so this cannot fail
                match Apdu::decode(&raw) {
                    Ok(ref cmd) => {
                        let id = app.process(self, cmd, done);
                        self.op_issued(Plug::App(idx), seq, id, FailureAs::NotHandled);
                    }
                    Err(_) => done.resolve(None),
                }
            }
            Act::SvcProcess { idx, seq } => {
                let (svc, raw) = {
                    let inner = self.inner.lock();
                    let Some(ref cmd) = inner.cmd else { return };
                    (Arc::clone(&inner.services[idx].svc), cmd.raw.clone())
                };
                let done = self.process_completion(Plug::Svc(idx), seq);
                match Apdu::decode(&raw) {
                    Ok(ref cmd) => {
                        let id = svc.process(self, cmd, done);
                        self.op_issued(Plug::Svc(idx), seq, id, FailureAs::NotHandled);
                    }
                    Err(_) => done.resolve(None),
                }
            }
            Act::Respond(r) => {
                let Response { sw, data, sent } = r;
                self.initiator.respond(apdu::rsp(sw, &data), sent);
            }
            Act::Gone => self.gone.emit(self),
        }
    }

    //
    // Completion plumbing
    //

    fn bool_completion(self: &Arc<Self>, plug: Plug, seq: u64) -> Completion<bool> {
        let weak = Arc::downgrade(self);
        Completion::new(move |ok| {
            if let Some(host) = weak.upgrade() {
                if host.clear_pending(plug, seq) {
                    host.apply_start(plug, ok);
                    host.advance();
                }
            }
        })
    }

    fn select_completion(
        self: &Arc<Self>,
        plug: Plug,
        seq: u64,
        implicit: bool,
    ) -> Completion<Result<()>> {
        let weak = Arc::downgrade(self);
        Completion::new(move |result: Result<()>| {
            if let Some(host) = weak.upgrade() {
                if host.clear_pending(plug, seq) {
                    let Plug::App(idx) = plug else { return };
                    if implicit {
                        host.apply_implicit(idx, result.is_ok());
                    } else {
                        host.apply_select(idx, result);
                    }
                    host.advance();
                }
            }
        })
    }

    fn process_completion(self: &Arc<Self>, plug: Plug, seq: u64) -> Completion<Option<Response>> {
        let weak = Arc::downgrade(self);
        Completion::new(move |rsp| {
            if let Some(host) = weak.upgrade() {
                if host.clear_pending(plug, seq) {
                    host.apply_process(plug, rsp);
                    host.advance();
                }
            }
        })
    }

    /// Validates and clears the outstanding op. A stale sequence means
    /// the op was cancelled or superseded; its completion is ignored.
    fn clear_pending(&self, plug: Plug, seq: u64) -> bool {
        let mut inner = self.inner.lock();
        let pending = match plug {
            Plug::Svc(i) => &mut inner.services[i].pending,
            Plug::App(i) => &mut inner.apps[i].pending,
        };
        match *pending {
            Some(Pending { seq: s, .. }) if s == seq => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    /// Post-call bookkeeping: records a real op id for cancellation, or
    /// turns an [`OpId::FAIL`] return into the corresponding failure.
    fn op_issued(self: &Arc<Self>, plug: Plug, seq: u64, id: OpId, failure: FailureAs) {
        let failed = {
            let mut inner = self.inner.lock();
            let pending = match plug {
                Plug::Svc(i) => &mut inner.services[i].pending,
                Plug::App(i) => &mut inner.apps[i].pending,
            };
            match *pending {
                Some(Pending { seq: s, .. }) if s == seq => {
                    if id == OpId::FAIL {
                        *pending = None;
                        true
                    } else {
                        if id != OpId::SYNC {
                            *pending = Some(Pending { seq, id: Some(id) });
                        }
                        false
                    }
                }
                // Completed synchronously
                _ => false,
            }
        };
        if failed {
            match failure {
                FailureAs::StartFailed => self.apply_start(plug, false),
                FailureAs::ImplicitRefused => {
                    if let Plug::App(idx) = plug {
                        self.apply_implicit(idx, false);
                    }
                }
                FailureAs::SelectRefused => {
                    if let Plug::App(idx) = plug {
                        self.apply_select(idx, Err(Error::DriverFailure));
                    }
                }
                FailureAs::NotHandled => self.apply_process(plug, None),
            }
            self.advance();
        }
    }

    //
    // Result application
    //

    fn apply_start(&self, plug: Plug, ok: bool) {
        let mut inner = self.inner.lock();
        let (state, name) = match plug {
            Plug::Svc(i) => {
                let rec = &mut inner.services[i];
                (&mut rec.state, rec.svc.name().to_owned())
            }
            Plug::App(i) => {
                let rec = &mut inner.apps[i];
                (&mut rec.state, rec.app.name().to_owned())
            }
        };
        if *state != PlugState::Starting {
            return;
        }
        if ok {
            *state = PlugState::Up;
        } else {
            *state = PlugState::Failed;
            warn!("{name} failed to start");
        }
    }

    fn apply_implicit(&self, idx: usize, ok: bool) {
        let mut inner = self.inner.lock();
        if inner.phase != (Phase::ImplicitSelect { next: idx }) {
            return;
        }
        if ok {
            inner.current = Some(idx);
            inner.queued.push_back(Act::AppChanged);
            inner.phase = Phase::Ready;
        } else {
            inner.phase = Phase::ImplicitSelect { next: idx + 1 };
        }
    }

    fn apply_select(&self, idx: usize, result: Result<()>) {
        let mut inner = self.inner.lock();
        let valid = matches!(
            inner.cmd,
            Some(CmdState {
                step: Step::SelectWait { app },
                ..
            }) if app == idx
        );
        if !valid {
            return;
        }
        match result {
            Ok(()) => {
                inner.current = Some(idx);
                inner.queued.push_back(Act::AppChanged);
                inner.cmd = None;
                inner.queued.push_back(Act::Respond(Response::new(SW_OK)));
            }
            Err(Error::NotHandled) => {
                if let Some(ref mut cmd) = inner.cmd {
                    cmd.step = Step::SvcNext {
                        next: 0,
                        select: true,
                    };
                }
            }
            Err(_) => {
                inner.cmd = None;
                inner
                    .queued
                    .push_back(Act::Respond(Response::new(SW_FILE_NOT_FOUND)));
            }
        }
    }

    fn apply_process(&self, plug: Plug, rsp: Option<Response>) {
        let mut inner = self.inner.lock();
        let current = inner.current;
        let step = match inner.cmd {
            Some(ref c) => c.step,
            None => return,
        };
        match (plug, step) {
            (Plug::App(i), Step::AppProcessWait) if current == Some(i) => match rsp {
                Some(r) => {
                    inner.cmd = None;
                    inner.queued.push_back(Act::Respond(r));
                }
                None => set_step(
                    &mut inner,
                    Step::SvcNext {
                        next: 0,
                        select: false,
                    },
                ),
            },
            (Plug::Svc(i), Step::SvcWait { idx, select }) if idx == i => match rsp {
                Some(r) => {
                    inner.cmd = None;
                    inner.queued.push_back(Act::Respond(r));
                }
                None => set_step(
                    &mut inner,
                    Step::SvcNext {
                        next: idx + 1,
                        select,
                    },
                ),
            },
            _ => {}
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FailureAs {
    StartFailed,
    ImplicitRefused,
    SelectRefused,
    NotHandled,
}

fn take_cancels(inner: &mut Inner) -> Vec<(Plug, OpId)> {
    let mut cancels = Vec::new();
    for (i, rec) in inner.services.iter_mut().enumerate() {
        if let Some(Pending { id: Some(id), .. }) = rec.pending.take() {
            cancels.push((Plug::Svc(i), id));
        }
    }
    for (i, rec) in inner.apps.iter_mut().enumerate() {
        if let Some(Pending { id: Some(id), .. }) = rec.pending.take() {
            cancels.push((Plug::App(i), id));
        }
    }
    cancels
}

/// Picks the next thing to do, transitioning state as needed. Returns
/// [`None`] when the session is waiting for a completion (or has
/// nothing to do at all).
fn next_action(inner: &mut Inner) -> Option<Act> {
    loop {
        if let Some(act) = inner.queued.pop_front() {
            return Some(act);
        }
        match inner.phase {
            Phase::Idle | Phase::Terminal => return None,
            Phase::StartingServices => {
                if let Some(i) = (inner.services.iter()).position(|r| r.state == PlugState::New) {
                    let seq = bump_seq(inner);
                    let rec = &mut inner.services[i];
                    rec.state = PlugState::Starting;
                    rec.pending = Some(Pending { seq, id: None });
                    return Some(Act::SvcStart {
                        idx: i,
                        seq,
                        restart: inner.restarting,
                    });
                }
                if (inner.services.iter()).any(|r| r.state == PlugState::Starting) {
                    return None;
                }
                if inner.restarting {
                    inner.restarting = false;
                    inner.phase = Phase::Ready;
                } else {
                    inner.phase = Phase::StartingApps;
                }
            }
            Phase::StartingApps => {
                if let Some(i) = (inner.apps.iter()).position(|r| r.state == PlugState::New) {
                    let seq = bump_seq(inner);
                    let rec = &mut inner.apps[i];
                    rec.state = PlugState::Starting;
                    rec.pending = Some(Pending { seq, id: None });
                    return Some(Act::AppStart { idx: i, seq });
                }
                if (inner.apps.iter()).any(|r| r.state == PlugState::Starting) {
                    return None;
                }
                inner.phase = Phase::ImplicitSelect { next: 0 };
            }
            Phase::ImplicitSelect { next } => {
                if inner.apps.get(next).is_some_and(|r| r.pending.is_some()) {
                    return None;
                }
                let candidate = (next..inner.apps.len()).find(|&i| {
                    let r = &inner.apps[i];
                    r.state == PlugState::Up
                        && (r.app.flags()).contains(HostAppFlags::ALLOW_IMPLICIT_SELECTION)
                });
                match candidate {
                    Some(i) => {
                        let seq = bump_seq(inner);
                        inner.apps[i].pending = Some(Pending { seq, id: None });
                        inner.phase = Phase::ImplicitSelect { next: i };
                        return Some(Act::ImplicitSelect { idx: i, seq });
                    }
                    None => inner.phase = Phase::Ready,
                }
            }
            Phase::Ready => {
                let current = inner.current;
                let step = match inner.cmd {
                    Some(ref c) => c.step,
                    None => return None,
                };
                match step {
                    Step::New => {
                        let class = match inner.cmd {
                            Some(ref c) => classify(&c.raw, &inner.apps),
                            None => return None,
                        };
                        match class {
                            Classify::Malformed => {
                                inner.cmd = None;
                                return Some(Act::Respond(Response::new(SW_ERR_GENERAL)));
                            }
                            Classify::SelectApp(i) if current == Some(i) => {
                                inner.cmd = None;
                                return Some(Act::Respond(Response::new(SW_OK)));
                            }
                            Classify::SelectApp(i) => {
                                set_step(&mut *inner, Step::SelectIssue { app: i });
                                if let Some(cur) = inner.current.take() {
                                    inner.queued.push_back(Act::Deselect { idx: cur });
                                    inner.queued.push_back(Act::AppChanged);
                                }
                            }
                            Classify::SelectUnknown => set_step(
                                &mut *inner,
                                Step::SvcNext {
                                    next: 0,
                                    select: true,
                                },
                            ),
                            Classify::Other => match current {
                                Some(cur) => {
                                    let seq = bump_seq(inner);
                                    set_step(&mut *inner, Step::AppProcessWait);
                                    inner.apps[cur].pending = Some(Pending { seq, id: None });
                                    return Some(Act::AppProcess { idx: cur, seq });
                                }
                                None => set_step(
                                    &mut *inner,
                                    Step::SvcNext {
                                        next: 0,
                                        select: false,
                                    },
                                ),
                            },
                        }
                    }
                    Step::SelectIssue { app } => {
                        let seq = bump_seq(inner);
                        set_step(&mut *inner, Step::SelectWait { app });
                        inner.apps[app].pending = Some(Pending { seq, id: None });
                        return Some(Act::Select { idx: app, seq });
                    }
                    Step::SvcNext { next, select } => {
                        let found = (next..inner.services.len())
                            .find(|&i| inner.services[i].state == PlugState::Up);
                        match found {
                            Some(i) => {
                                let seq = bump_seq(inner);
                                set_step(&mut *inner, Step::SvcWait { idx: i, select });
                                inner.services[i].pending = Some(Pending { seq, id: None });
                                return Some(Act::SvcProcess { idx: i, seq });
                            }
                            None => {
                                // Nobody claimed the command
                                let sw = if select {
                                    SW_FILE_NOT_FOUND
                                } else {
                                    let proprietary = match inner.cmd {
                                        Some(ref c) => Apdu::decode(&c.raw)
                                            .map_or(false, |a| a.is_proprietary_class()),
                                        None => false,
                                    };
                                    if proprietary {
                                        SW_CLA_NOT_SUPPORTED
                                    } else {
                                        SW_ERR_GENERAL
                                    }
                                };
                                inner.cmd = None;
                                return Some(Act::Respond(Response::new(sw)));
                            }
                        }
                    }
                    Step::SelectWait { .. } | Step::AppProcessWait | Step::SvcWait { .. } => {
                        return None;
                    }
                }
            }
        }
    }
}

fn bump_seq(inner: &mut Inner) -> u64 {
    let seq = inner.next_seq;
    inner.next_seq += 1;
    seq
}

fn set_step(inner: &mut Inner, step: Step) {
    if let Some(c) = inner.cmd.as_mut() {
        c.step = step;
    }
}

enum Classify {
    Malformed,
    SelectApp(usize),
    SelectUnknown,
    Other,
}

fn classify(raw: &[u8], apps: &[AppRec]) -> Classify {
    let Ok(apdu) = Apdu::decode(raw) else {
        return Classify::Malformed;
    };
    if apdu.is_select_by_name() && !apdu.data.is_empty() && apdu.data.len() <= 16 {
        match (apps.iter()).position(|r| r.state == PlugState::Up && r.aid[..] == *apdu.data) {
            Some(i) => Classify::SelectApp(i),
            None => Classify::SelectUnknown,
        }
    } else {
        Classify::Other
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("phase", &inner.phase)
            .field("current", &inner.current)
            .finish_non_exhaustive()
    }
}
