//! Service lifecycle manager.
//!
//! Owns every long-lived subsystem, brings them up phase by phase and tears
//! them down in reverse.
//!
//! ```text
//!  start_all():
//!    for phase in PLATFORM ..= UI
//!       candidates = REGISTERED | STOPPED services of phase (registration order)
//!       topo-sort by in-phase dependencies (cycle members → ERROR)
//!       for s in order:
//!           deps RUNNING?  no → ERROR
//!           STARTING → init() → start() → RUNNING | ERROR
//!       PHASE_COMPLETE
//!    ALL_STARTED
//!
//!  stop_all():  exact reverse of the order services reached RUNNING,
//!               RUNNING → STOPPING → stop() (bounded wait) → STOPPED
//! ```
//!
//! Hooks always run with the registry lock released.  Every transition
//! posts `STATE_CHANGED` with `{name, old, new, error_code}`.

pub mod descriptor;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde_json::{Value, json};

pub use descriptor::{
    Capabilities, HookFn, MAX_DEPENDENCIES, MAX_SERVICE_NAME_LEN, Phase, ServiceDescriptor,
    ServiceInfo, ServiceState,
};

use crate::app::ports::Clock;
use crate::error::{Error, Result, ResultCode, relock};
use crate::events::{EventBase, EventBus, Priority};

/// Event ids on [`EventBase::Service`].
pub mod event_id {
    pub const STATE_CHANGED: u16 = 0;
    pub const STARTED: u16 = 1;
    pub const STOPPED: u16 = 2;
    pub const PHASE_COMPLETE: u16 = 3;
    pub const ALL_STARTED: u16 = 4;
}

/// Default bound on a `stop` hook before the slot is reclaimed anyway.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceHandle(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub startup_time_ms: u64,
    pub phase_times_ms: [u64; Phase::COUNT],
}

impl ServiceStats {
    pub fn to_json(&self) -> Value {
        json!({
            "total": self.total,
            "running": self.running,
            "stopped": self.stopped,
            "error": self.error,
            "startup_time_ms": self.startup_time_ms,
            "phase_times_ms": self.phase_times_ms,
        })
    }
}

// ── Internal records ─────────────────────────────────────────

struct ServiceRecord {
    desc: ServiceDescriptor,
    state: ServiceState,
    start_time_ms: u64,
    start_duration_ms: u64,
    last_health_check_ms: u64,
    healthy: bool,
    last_error: Option<String>,
}

impl ServiceRecord {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.desc.name.clone(),
            phase: self.desc.phase,
            state: self.state,
            capabilities: self.desc.capabilities,
            dependencies: self.desc.dependencies.clone(),
            start_time_ms: self.start_time_ms,
            start_duration_ms: self.start_duration_ms,
            last_health_check_ms: self.last_health_check_ms,
            healthy: self.healthy,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Slots never move, so a handle stays valid until unregistered.
    slots: Vec<Option<ServiceRecord>>,
    /// Services in the order they reached `RUNNING`; teardown walks it backwards.
    started: Vec<ServiceHandle>,
    /// `true` between a completed `start_all` and the next `stop_all`.
    bring_up_done: bool,
    phase_started: [bool; Phase::COUNT],
    phase_times_ms: [u64; Phase::COUNT],
    startup_time_ms: u64,
}

impl Registry {
    fn get(&self, h: ServiceHandle) -> Result<&ServiceRecord> {
        self.slots.get(h.0).and_then(Option::as_ref).ok_or(Error::NotFound)
    }

    fn get_mut(&mut self, h: ServiceHandle) -> Result<&mut ServiceRecord> {
        self.slots
            .get_mut(h.0)
            .and_then(Option::as_mut)
            .ok_or(Error::NotFound)
    }

    fn find(&self, name: &str) -> Option<ServiceHandle> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.desc.name == name))
            .map(ServiceHandle)
    }

    fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.find(name).and_then(|h| self.get(h).ok()).map(|r| r.state)
    }
}

struct Transition {
    name: String,
    old: ServiceState,
    new: ServiceState,
    code: ResultCode,
}

// ── Manager ──────────────────────────────────────────────────

pub struct ServiceManager {
    registry: Mutex<Registry>,
    changed: Condvar,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<EventBus>>,
    stop_grace: Duration,
}

impl ServiceManager {
    pub fn new(clock: Arc<dyn Clock>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
            clock,
            bus,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        relock(self.registry.lock())
    }

    // ── Registration ─────────────────────────────────────────

    pub fn register(&self, desc: ServiceDescriptor) -> Result<ServiceHandle> {
        if desc.name.is_empty() || desc.name.len() >= MAX_SERVICE_NAME_LEN {
            return Err(Error::InvalidArg);
        }
        if desc.dependencies.len() > MAX_DEPENDENCIES {
            return Err(Error::NoMem);
        }
        if desc.dependencies.iter().any(|d| *d == desc.name) {
            return Err(Error::InvalidArg);
        }

        let mut reg = self.lock();
        if reg.bring_up_done {
            warn!("ServiceManager: '{}' registered after bring-up", desc.name);
            return Err(Error::InvalidState);
        }
        if reg.find(&desc.name).is_some() {
            return Err(Error::InvalidState);
        }

        info!(
            "ServiceManager: registered '{}' (phase {})",
            desc.name,
            desc.phase.as_str()
        );
        let name = desc.name.clone();
        reg.slots.push(Some(ServiceRecord {
            desc,
            state: ServiceState::Registered,
            start_time_ms: 0,
            start_duration_ms: 0,
            last_health_check_ms: 0,
            healthy: false,
            last_error: None,
        }));
        let handle = ServiceHandle(reg.slots.len() - 1);
        drop(reg);

        self.changed.notify_all();
        self.publish(&Transition {
            name,
            old: ServiceState::Unregistered,
            new: ServiceState::Registered,
            code: ResultCode::Ok,
        });
        Ok(handle)
    }

    /// Remove a service, stopping it first if it is running.
    pub fn unregister(&self, h: ServiceHandle) -> Result<()> {
        let state = self.lock().get(h)?.state;
        match state {
            ServiceState::Running => self.stop_one(h)?,
            ServiceState::Starting | ServiceState::Stopping => return Err(Error::Busy),
            _ => {}
        }

        let mut reg = self.lock();
        let rec = reg.slots.get_mut(h.0).and_then(Option::take).ok_or(Error::NotFound)?;
        drop(reg);

        info!("ServiceManager: unregistered '{}'", rec.desc.name);
        self.changed.notify_all();
        self.publish(&Transition {
            name: rec.desc.name,
            old: rec.state,
            new: ServiceState::Unregistered,
            code: ResultCode::Ok,
        });
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<ServiceHandle> {
        self.lock().find(name)
    }

    // ── Bring-up ─────────────────────────────────────────────

    /// Bring every phase up in ascending order.  Individual failures are
    /// logged and skipped; the call reports `Internal` afterwards if any
    /// service ended in `ERROR`.
    pub fn start_all(&self) -> Result<()> {
        {
            let mut reg = self.lock();
            if reg.bring_up_done {
                return Err(Error::InvalidState);
            }
            reg.phase_started = [false; Phase::COUNT];
            reg.phase_times_ms = [0; Phase::COUNT];
        }

        info!("ServiceManager: bring-up started");
        let t0 = Instant::now();
        let mut failures = 0usize;
        for phase in Phase::ALL {
            failures += self.run_phase(phase)?;
        }
        let total_ms = t0.elapsed().as_millis() as u64;

        {
            let mut reg = self.lock();
            reg.bring_up_done = true;
            reg.startup_time_ms = total_ms;
        }
        self.post(
            event_id::ALL_STARTED,
            json!({"startup_time_ms": total_ms, "failed": failures}),
        );
        info!(
            "ServiceManager: bring-up complete in {} ms ({} failed)",
            total_ms, failures
        );
        if failures > 0 {
            return Err(Error::Internal);
        }
        Ok(())
    }

    /// Bring up a single phase.  Each phase may be started once per bring-up.
    pub fn start_phase(&self, phase: Phase) -> Result<()> {
        match self.run_phase(phase)? {
            0 => Ok(()),
            _ => Err(Error::Internal),
        }
    }

    fn run_phase(&self, phase: Phase) -> Result<usize> {
        let candidates = {
            let mut reg = self.lock();
            if reg.phase_started[phase as usize] {
                return Err(Error::InvalidState);
            }
            reg.phase_started[phase as usize] = true;
            reg.slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
                .filter(|(_, r)| {
                    r.desc.phase == phase
                        && matches!(r.state, ServiceState::Registered | ServiceState::Stopped)
                })
                .map(|(i, r)| (ServiceHandle(i), r.desc.name.clone(), r.desc.dependencies.clone()))
                .collect::<Vec<_>>()
        };

        let t0 = Instant::now();
        let (order, cyclic) = topo_order(&candidates);
        let mut failures = 0usize;

        for h in cyclic {
            let name = self.lock().get(h).map(|r| r.desc.name.clone()).unwrap_or_default();
            error!("ServiceManager: '{}' is part of a dependency cycle", name);
            self.fail(h, "dependency cycle");
            failures += 1;
        }

        for h in order {
            if self.start_one(h).is_err() {
                failures += 1;
            }
        }

        let elapsed = t0.elapsed().as_millis() as u64;
        self.lock().phase_times_ms[phase as usize] = elapsed;
        if !candidates.is_empty() {
            info!(
                "ServiceManager: phase {} done ({} services, {} ms)",
                phase.as_str(),
                candidates.len(),
                elapsed
            );
        }
        self.post(
            event_id::PHASE_COMPLETE,
            json!({"phase": phase.as_str(), "elapsed_ms": elapsed}),
        );
        Ok(failures)
    }

    /// Run `init` and `start` for one service whose dependencies are up.
    fn start_one(&self, h: ServiceHandle) -> Result<()> {
        let (name, hooks, missing) = {
            let reg = self.lock();
            let rec = reg.get(h)?;
            let missing = rec
                .desc
                .dependencies
                .iter()
                .find(|d| reg.state_of(d) != Some(ServiceState::Running))
                .cloned();
            (rec.desc.name.clone(), rec.desc.hooks.clone(), missing)
        };

        if let Some(dep) = missing {
            warn!("ServiceManager: '{}' waits on '{}', not started", name, dep);
            self.fail(h, &format!("dependency '{dep}' not running"));
            return Err(Error::InvalidState);
        }

        self.transition(h, ServiceState::Starting, ResultCode::Ok)?;
        let started_at = self.clock.now_ms();
        let t0 = Instant::now();

        if let Some(init) = &hooks.init {
            if let Err(e) = init() {
                error!("ServiceManager: '{}' init failed: {}", name, e);
                self.fail_with(h, e, "init failed");
                return Err(e);
            }
        }
        if let Err(e) = (hooks.start)() {
            error!("ServiceManager: '{}' start failed: {}", name, e);
            self.fail_with(h, e, "start failed");
            return Err(e);
        }

        {
            let mut reg = self.lock();
            let rec = reg.get_mut(h)?;
            rec.start_time_ms = started_at;
            rec.start_duration_ms = t0.elapsed().as_millis() as u64;
            rec.healthy = true;
            rec.last_error = None;
            reg.started.retain(|&s| s != h);
            reg.started.push(h);
        }
        self.transition(h, ServiceState::Running, ResultCode::Ok)?;
        info!("ServiceManager: '{}' running", name);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────

    /// Stop every running service, last started first.
    pub fn stop_all(&self) -> Result<()> {
        let order: Vec<ServiceHandle> = self.lock().started.iter().rev().copied().collect();

        info!("ServiceManager: stopping all services");
        for h in order {
            let running = self.lock().get(h).is_ok_and(|r| r.state == ServiceState::Running);
            if running {
                self.stop_one(h)?;
            }
        }

        let mut reg = self.lock();
        reg.bring_up_done = false;
        reg.phase_started = [false; Phase::COUNT];
        Ok(())
    }

    fn stop_one(&self, h: ServiceHandle) -> Result<()> {
        let (name, stop) = {
            let reg = self.lock();
            let rec = reg.get(h)?;
            (rec.desc.name.clone(), rec.desc.hooks.stop.clone())
        };
        self.transition(h, ServiceState::Stopping, ResultCode::Ok)?;

        let mut code = ResultCode::Ok;
        if let Some(stop) = stop {
            match self.run_bounded(stop) {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!("ServiceManager: '{}' stop failed ({}), forcing STOPPED", name, e);
                    code = e.code();
                }
                None => {
                    warn!(
                        "ServiceManager: '{}' stop exceeded {:?}, forcing STOPPED",
                        name, self.stop_grace
                    );
                    code = ResultCode::Timeout;
                }
            }
        }

        {
            let mut reg = self.lock();
            reg.started.retain(|&s| s != h);
            if let Ok(rec) = reg.get_mut(h) {
                rec.healthy = false;
            }
        }
        self.transition(h, ServiceState::Stopped, code)?;
        info!("ServiceManager: '{}' stopped", name);
        Ok(())
    }

    /// Run a stop hook on a helper thread and wait at most `stop_grace`.
    /// `None` means the hook did not finish in time.
    fn run_bounded(&self, hook: HookFn) -> Option<Result<()>> {
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("svc-stop".into())
            .spawn(move || {
                let _ = tx.send(hook());
            });
        match spawned {
            Ok(_) => rx.recv_timeout(self.stop_grace).ok(),
            Err(_) => None,
        }
    }

    // ── Individual control ───────────────────────────────────

    pub fn start(&self, h: ServiceHandle) -> Result<()> {
        let state = self.lock().get(h)?.state;
        if !state.can_transition(ServiceState::Starting) {
            return Err(Error::InvalidState);
        }
        self.start_one(h)
    }

    pub fn stop(&self, h: ServiceHandle) -> Result<()> {
        let (state, caps) = {
            let reg = self.lock();
            let r = reg.get(h)?;
            (r.state, r.desc.capabilities)
        };
        if !caps.contains(Capabilities::STOPPABLE) && !caps.contains(Capabilities::RESTARTABLE) {
            return Err(Error::NotSupported);
        }
        if state != ServiceState::Running {
            return Err(Error::InvalidState);
        }
        self.stop_one(h)
    }

    pub fn restart(&self, h: ServiceHandle) -> Result<()> {
        let (state, caps) = {
            let reg = self.lock();
            let r = reg.get(h)?;
            (r.state, r.desc.capabilities)
        };
        if !caps.contains(Capabilities::RESTARTABLE) {
            return Err(Error::NotSupported);
        }
        if state == ServiceState::Running {
            self.stop_one(h)?;
        }
        self.start_one(h)
    }

    /// Block until the service reaches `target` or `timeout_ms` elapses.
    pub fn wait_state(&self, h: ServiceHandle, target: ServiceState, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut reg = self.lock();
        loop {
            if reg.get(h)?.state == target {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            reg = relock(self.changed.wait_timeout(reg, deadline - now)).0;
        }
    }

    /// Invoke the health hook of a running service and record the result.
    pub fn health_check(&self, h: ServiceHandle) -> Result<bool> {
        let (state, health) = {
            let reg = self.lock();
            let r = reg.get(h)?;
            (r.state, r.desc.hooks.health.clone())
        };
        if state != ServiceState::Running {
            return Ok(false);
        }
        let Some(health) = health else {
            return Ok(true);
        };
        let ok = health();
        let now = self.clock.now_ms();
        if let Ok(rec) = self.lock().get_mut(h) {
            rec.last_health_check_ms = now;
            rec.healthy = ok;
        }
        if !ok {
            warn!("ServiceManager: health check failed for {:?}", h);
        }
        Ok(ok)
    }

    /// Health-check every running service; returns the unhealthy names.
    pub fn health_check_all(&self) -> Vec<String> {
        let handles: Vec<(ServiceHandle, String)> = {
            let reg = self.lock();
            reg.slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|r| (ServiceHandle(i), r)))
                .filter(|(_, r)| r.state == ServiceState::Running)
                .map(|(h, r)| (h, r.desc.name.clone()))
                .collect()
        };
        handles
            .into_iter()
            .filter(|(h, _)| !self.health_check(*h).unwrap_or(false))
            .map(|(_, n)| n)
            .collect()
    }

    // ── Introspection ────────────────────────────────────────

    pub fn state(&self, h: ServiceHandle) -> Result<ServiceState> {
        Ok(self.lock().get(h)?.state)
    }

    pub fn get_info(&self, h: ServiceHandle) -> Result<ServiceInfo> {
        Ok(self.lock().get(h)?.info())
    }

    pub fn get_api(&self, h: ServiceHandle) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        Ok(self.lock().get(h)?.desc.api.clone())
    }

    pub fn set_api(&self, h: ServiceHandle, api: Arc<dyn Any + Send + Sync>) -> Result<()> {
        self.lock().get_mut(h)?.desc.api = Some(api);
        Ok(())
    }

    /// Snapshot of every registered service in registration order.
    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.lock().slots.iter().flatten().map(ServiceRecord::info).collect()
    }

    /// Visit a snapshot; the callback runs without the registry lock.
    pub fn enumerate(&self, mut f: impl FnMut(&ServiceInfo)) {
        for info in self.snapshot() {
            f(&info);
        }
    }

    pub fn enumerate_phase(&self, phase: Phase, mut f: impl FnMut(&ServiceInfo)) {
        for info in self.snapshot().iter().filter(|i| i.phase == phase) {
            f(info);
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let reg = self.lock();
        let mut s = ServiceStats {
            total: 0,
            running: 0,
            stopped: 0,
            error: 0,
            startup_time_ms: reg.startup_time_ms,
            phase_times_ms: reg.phase_times_ms,
        };
        for r in reg.slots.iter().flatten() {
            s.total += 1;
            match r.state {
                ServiceState::Running => s.running += 1,
                ServiceState::Stopped => s.stopped += 1,
                ServiceState::Error => s.error += 1,
                _ => {}
            }
        }
        s
    }

    // ── Internal ─────────────────────────────────────────────

    fn transition(&self, h: ServiceHandle, new: ServiceState, code: ResultCode) -> Result<()> {
        let t = {
            let mut reg = self.lock();
            let rec = reg.get_mut(h)?;
            if !rec.state.can_transition(new) {
                return Err(Error::InvalidState);
            }
            let old = rec.state;
            rec.state = new;
            Transition {
                name: rec.desc.name.clone(),
                old,
                new,
                code,
            }
        };
        self.changed.notify_all();
        self.publish(&t);
        Ok(())
    }

    fn fail(&self, h: ServiceHandle, msg: &str) {
        self.fail_code(h, ResultCode::Internal, msg);
    }

    fn fail_with(&self, h: ServiceHandle, err: Error, msg: &str) {
        self.fail_code(h, err.code(), msg);
    }

    fn fail_code(&self, h: ServiceHandle, code: ResultCode, msg: &str) {
        if let Ok(rec) = self.lock().get_mut(h) {
            rec.last_error = Some(msg.to_owned());
            rec.healthy = false;
        }
        if self.transition(h, ServiceState::Error, code).is_err() {
            warn!("ServiceManager: could not mark {:?} as ERROR", h);
        }
    }

    fn publish(&self, t: &Transition) {
        let payload = json!({
            "name": t.name,
            "old": t.old.as_str(),
            "new": t.new.as_str(),
            "error_code": t.code.as_str(),
        });
        match t.new {
            ServiceState::Running => self.post(event_id::STARTED, payload.clone()),
            ServiceState::Stopped => self.post(event_id::STOPPED, payload.clone()),
            _ => {}
        }
        self.post(event_id::STATE_CHANGED, payload);
    }

    fn post(&self, id: u16, data: Value) {
        if let Some(bus) = &self.bus {
            if bus.post_json(EventBase::Service, id, data, Priority::Normal).is_err() {
                warn!("ServiceManager: event {} dropped", id);
            }
        }
    }
}

/// Kahn's algorithm over in-phase dependency edges, stable in registration
/// order.  Returns the start order and the services left on a cycle.
fn topo_order(
    candidates: &[(ServiceHandle, String, Vec<String>)],
) -> (Vec<ServiceHandle>, Vec<ServiceHandle>) {
    let index: BTreeMap<&str, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, (_, n, _))| (n.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; candidates.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); candidates.len()];
    for (i, (_, _, deps)) in candidates.iter().enumerate() {
        for d in deps {
            if let Some(&j) = index.get(d.as_str()) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut order = Vec::with_capacity(candidates.len());
    let mut done = vec![false; candidates.len()];
    loop {
        // Lowest registration index first keeps ties in registration order.
        let Some(next) = (0..candidates.len()).find(|&i| !done[i] && indegree[i] == 0) else {
            break;
        };
        done[next] = true;
        order.push(candidates[next].0);
        for &k in &dependents[next] {
            indegree[k] -= 1;
        }
    }

    let cyclic = (0..candidates.len())
        .filter(|&i| !done[i])
        .map(|i| candidates[i].0)
        .collect();
    (order, cyclic)
}
