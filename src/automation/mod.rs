//! Automation engine: variables, sources, rules, actions, history.
//!
//! ```text
//!   every poll_interval_ms, while RUNNING:
//!
//!   ┌─ lock ─────────────┐   ┌─ unlocked ──────────┐   ┌─ lock ───────────────────────┐
//!   │ pick due sources   │──▶│ registry.call(op)   │──▶│ map results → variables      │
//!   └────────────────────┘   └─────────────────────┘   │ evaluate rules (edge+cooldown)│
//!                                                      │ expand action templates      │
//!                                                      └──────────────┬───────────────┘
//!                                                                     ▼
//!                                          unlocked: dispatch actions, then lock → history
//! ```
//!
//! Operations are never invoked while the engine lock is held, so an
//! action may itself read or write automation state.

pub mod actions;
pub mod config;
pub mod history;
pub mod rules;
pub mod sources;
pub mod value;
pub mod variables;

use core::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde_json::{Value, json};

pub use actions::{ExecStatus, TriggerSource};
pub use config::AutomationConfig;
pub use history::{ExecutionRecord, HISTORY_CAPACITY};
pub use value::{CompareOp, VarType, VarValue};
pub use variables::Variable;

use crate::api::{ApiResult, OperationRegistry};
use crate::app::ports::Clock;
use crate::config::{ConfigModule, ConfigStore};
use crate::error::{Error, Result, relock};
use crate::events::{EventBase, EventBus, Priority};
use history::History;
use rules::Rule;
use sources::{Source, SourceConfig, SourceKind, extract_path};
use variables::{VariableStore, Writer};

/// Event ids on [`EventBase::Automation`].
pub mod event_id {
    pub const RULE_FIRED: u16 = 0;
    pub const STATE_CHANGED: u16 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Stopped,
    Running,
    Paused,
}

impl EngineState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_evaluations: u32,
    pub total_triggers: u32,
    pub total_actions: u32,
    pub failed_actions: u32,
    pub last_evaluation_ms: u64,
}

impl EngineStats {
    pub fn to_json(&self) -> Value {
        json!({
            "total_evaluations": self.total_evaluations,
            "total_triggers": self.total_triggers,
            "total_actions": self.total_actions,
            "failed_actions": self.failed_actions,
            "last_evaluation_ms": self.last_evaluation_ms,
        })
    }
}

/// Counters readable without the engine lock.
#[derive(Default)]
struct Counters {
    total_evaluations: AtomicU32,
    total_triggers: AtomicU32,
    total_actions: AtomicU32,
    failed_actions: AtomicU32,
    last_evaluation_ms: AtomicU64,
}

struct Inner {
    state: EngineState,
    config: AutomationConfig,
    vars: VariableStore,
    sources: Vec<Source>,
    rules: Vec<Rule>,
    history: History,
}

/// A rule firing prepared under the lock and dispatched outside it.
struct Firing {
    rule_id: String,
    source: TriggerSource,
    actions: Vec<(String, Option<Value>)>,
}

pub struct AutomationEngine {
    inner: Mutex<Inner>,
    counters: Counters,
    registry: Arc<OperationRegistry>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<ConfigStore>>,
    bus: Option<Arc<EventBus>>,
    shutdown: AtomicBool,
}

impl AutomationEngine {
    pub fn new(registry: Arc<OperationRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: EngineState::Uninitialized,
                config: AutomationConfig::default(),
                vars: VariableStore::new(),
                sources: Vec::new(),
                rules: Vec::new(),
                history: History::new(),
            }),
            counters: Counters::default(),
            registry,
            clock,
            store: None,
            bus: None,
            shutdown: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        relock(self.inner.lock())
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Load the persisted document (or an empty one) and build the tables.
    pub fn init(&self) -> Result<()> {
        let cfg = match &self.store {
            Some(store) => {
                let loaded = store.load(ConfigModule::Automation, &json!({}));
                AutomationConfig::from_json(&loaded.value).unwrap_or_else(|e| {
                    warn!("Automation: stored config rejected ({}), starting empty", e);
                    AutomationConfig::default()
                })
            }
            None => AutomationConfig::default(),
        };
        self.init_with(cfg)
    }

    pub fn init_with(&self, cfg: AutomationConfig) -> Result<()> {
        cfg.validate()?;
        let mut g = self.lock();
        if g.state != EngineState::Uninitialized {
            return Err(Error::InvalidState);
        }
        let (vars, sources, rules) = build(&cfg, self.clock.now_ms(), None)?;
        info!(
            "Automation: init ({} variables, {} sources, {} rules)",
            vars.len(),
            sources.len(),
            rules.len()
        );
        g.vars = vars;
        g.sources = sources;
        g.rules = rules;
        g.config = cfg;
        g.history.clear();
        g.state = EngineState::Stopped;
        self.shutdown.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let now = self.clock.now_ms();
        self.transition(&[EngineState::Stopped], EngineState::Running, |inner| {
            for r in &mut inner.rules {
                r.startup_pending = r.cfg.run_on_startup;
                r.last_timer_ms = Some(now);
            }
        })
    }

    pub fn stop(&self) -> Result<()> {
        self.transition(
            &[EngineState::Running, EngineState::Paused],
            EngineState::Stopped,
            |_| {},
        )
    }

    pub fn pause(&self) -> Result<()> {
        self.transition(&[EngineState::Running], EngineState::Paused, |_| {})
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(&[EngineState::Paused], EngineState::Running, |_| {})
    }

    /// Drop every table and return to `Uninitialized`.
    pub fn deinit(&self) {
        let mut g = self.lock();
        g.vars.clear();
        g.sources.clear();
        g.rules.clear();
        g.history.clear();
        g.config = AutomationConfig::default();
        g.state = EngineState::Uninitialized;
        drop(g);
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Automation: deinit");
    }

    fn transition(
        &self,
        from: &[EngineState],
        to: EngineState,
        on_enter: impl FnOnce(&mut Inner),
    ) -> Result<()> {
        let old = {
            let mut g = self.lock();
            if !from.contains(&g.state) {
                return Err(Error::InvalidState);
            }
            let old = g.state;
            g.state = to;
            on_enter(&mut g);
            old
        };
        info!("Automation: {} → {}", old.as_str(), to.as_str());
        self.post(
            event_id::STATE_CHANGED,
            json!({"old": old.as_str(), "new": to.as_str()}),
        );
        Ok(())
    }

    /// Re-read the persisted document.  `NotSupported` without a store.
    pub fn reload(&self) -> Result<()> {
        let store = self.store.as_ref().ok_or(Error::NotSupported)?;
        let loaded = store.load(ConfigModule::Automation, &json!({}));
        self.reload_from(&loaded.value)
    }

    /// Replace the configuration.  On a parse or validation error the
    /// running configuration is kept and the error returned.  Variables
    /// that survive with the same type keep their current values.
    pub fn reload_from(&self, doc: &Value) -> Result<()> {
        let cfg = AutomationConfig::from_json(doc).inspect_err(|e| {
            warn!("Automation: reload rejected ({}), keeping current config", e);
        })?;

        let mut g = self.lock();
        if g.state == EngineState::Uninitialized {
            return Err(Error::InvalidState);
        }
        let resume_to = g.state;
        if resume_to == EngineState::Running {
            g.state = EngineState::Paused;
        }
        let (vars, sources, mut rules) = match build(&cfg, self.clock.now_ms(), Some(&g.vars)) {
            Ok(t) => t,
            Err(e) => {
                g.state = resume_to;
                return Err(e);
            }
        };
        let now = self.clock.now_ms();
        for r in &mut rules {
            r.last_timer_ms = Some(now);
        }
        g.vars = vars;
        g.sources = sources;
        g.rules = rules;
        g.config = cfg;
        g.state = resume_to;
        info!(
            "Automation: reloaded ({} rules, {} sources)",
            g.rules.len(),
            g.sources.len()
        );
        Ok(())
    }

    /// Ask [`run`](Self::run) to return after its current iteration.  The
    /// loop consumes the request, so a later `run` starts normally.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Cooperative main loop.  Keeps ticking while paused so timestamps and
    /// health checks stay live; evaluation itself is skipped.
    pub async fn run(&self) {
        info!("Automation: loop started");
        while !self.shutdown.swap(false, Ordering::SeqCst) {
            self.tick();
            let wait = self.poll_interval_ms();
            async_io_mini::Timer::after(Duration::from_millis(wait)).await;
        }
        info!("Automation: loop exited");
    }

    // ── Main loop step ───────────────────────────────────────

    /// One iteration: poll due sources, evaluate rules, dispatch firings.
    /// Returns the number of rules that fired.
    pub fn tick(&self) -> usize {
        let now = self.clock.now_ms();

        let polls: Vec<(String, String, Option<Value>)> = {
            let mut g = self.lock();
            if g.state != EngineState::Running {
                return 0;
            }
            g.sources
                .iter_mut()
                .filter(|s| s.is_due(now))
                .filter_map(|s| {
                    s.last_sample_ms = Some(now);
                    match &s.cfg.kind {
                        SourceKind::Operation { operation, params } => {
                            Some((s.cfg.id.clone(), operation.clone(), params.clone()))
                        }
                        SourceKind::Push => None,
                    }
                })
                .collect()
        };

        let results: Vec<(String, ApiResult)> = polls
            .into_iter()
            .map(|(id, op, params)| (id, self.registry.call(&op, params.as_ref())))
            .collect();

        let firings = {
            let mut g = self.lock();
            if g.state != EngineState::Running {
                return 0;
            }
            let inner = &mut *g;
            for (id, result) in results {
                if let Some(src) = inner.sources.iter_mut().find(|s| s.cfg.id == id) {
                    apply_poll(src, &mut inner.vars, &result, now);
                }
            }
            self.evaluate(inner, now)
        };

        let fired = firings.len();
        for f in firings {
            self.dispatch(f);
        }
        fired
    }

    fn evaluate(&self, inner: &mut Inner, now: u64) -> Vec<Firing> {
        let mut firings = Vec::new();
        let mut evaluated = 0u32;
        let Inner { rules, vars, .. } = inner;

        for rule in rules.iter_mut().filter(|r| r.cfg.enabled) {
            let holds = rule.evaluate(vars);
            evaluated += 1;
            let edge = rule.observe(holds);

            let source = if rule.startup_pending {
                rule.startup_pending = false;
                Some(TriggerSource::Startup)
            } else if edge {
                Some(TriggerSource::Condition)
            } else if rule.timer_due(now, holds) {
                Some(TriggerSource::Timer)
            } else {
                None
            };

            let Some(source) = source else { continue };
            if !rule.cooldown_elapsed(now) {
                debug!("Automation: '{}' suppressed by cooldown", rule.id());
                continue;
            }
            rule.mark_fired(now);
            if rule.cfg.interval_ms.is_some() {
                rule.last_timer_ms = Some(now);
            }
            firings.push(prepare(rule, vars, source));
        }

        self.counters
            .total_evaluations
            .fetch_add(evaluated, Ordering::Relaxed);
        self.counters.last_evaluation_ms.store(now, Ordering::Relaxed);
        firings
    }

    fn dispatch(&self, f: Firing) -> ExecutionRecord {
        let total = f.actions.len();
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;

        for (op, params) in &f.actions {
            let r = self.registry.call(op, params.as_ref());
            if !r.is_ok() {
                failed += 1;
                if first_error.is_none() {
                    let why = r.message.as_deref().unwrap_or(r.code.as_str());
                    first_error = Some(format!("{op}: {why}"));
                }
            }
        }

        self.counters.total_triggers.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_actions
            .fetch_add(total as u32, Ordering::Relaxed);
        self.counters
            .failed_actions
            .fetch_add(failed as u32, Ordering::Relaxed);

        let status = ExecStatus::from_counts(total, failed);
        let message = match status {
            ExecStatus::Skipped => "no actions".to_owned(),
            ExecStatus::Success => "ok".to_owned(),
            _ => first_error.unwrap_or_default(),
        };
        let rec = ExecutionRecord::new(
            &f.rule_id,
            status,
            f.source,
            total,
            failed,
            &message,
            self.clock.now_ms(),
        );
        self.lock().history.push(rec.clone());

        info!(
            "Automation: rule '{}' {} ({}) {}/{} actions ok",
            f.rule_id,
            status.as_str(),
            f.source.as_str(),
            total - failed,
            total
        );
        self.post(
            event_id::RULE_FIRED,
            json!({"rule_id": f.rule_id, "status": status.as_str(), "source": f.source.as_str()}),
        );
        rec
    }

    // ── Manual trigger ───────────────────────────────────────

    /// Fire `rule_id` now, ignoring its condition and cooldown.
    pub fn trigger(&self, rule_id: &str) -> Result<ExecutionRecord> {
        let firing = {
            let mut g = self.lock();
            if g.state == EngineState::Uninitialized {
                return Err(Error::InvalidState);
            }
            let now = self.clock.now_ms();
            let Inner { rules, vars, .. } = &mut *g;
            let rule = rules
                .iter_mut()
                .find(|r| r.id() == rule_id)
                .ok_or(Error::NotFound)?;
            rule.mark_fired(now);
            prepare(rule, vars, TriggerSource::Manual)
        };
        Ok(self.dispatch(firing))
    }

    // ── Variables ────────────────────────────────────────────

    pub fn register_variable(&self, id: &str, initial: VarValue, readonly: bool) -> Result<()> {
        let now = self.clock.now_ms();
        self.lock().vars.register(id, initial, readonly, None, now)
    }

    /// External write; read-only variables refuse it.
    pub fn set_variable(&self, id: &str, value: &Value) -> Result<bool> {
        let now = self.clock.now_ms();
        self.lock().vars.set(id, value, Writer::External, now)
    }

    pub fn get_variable(&self, id: &str) -> Option<Variable> {
        self.lock().vars.get(id).cloned()
    }

    pub fn list_variables(&self, prefix: Option<&str>) -> Vec<Variable> {
        self.lock().vars.list(prefix).into_iter().cloned().collect()
    }

    // ── Sources ──────────────────────────────────────────────

    /// Feed a push source.  Returns how many variables were written.
    pub fn push_sample(&self, source_id: &str, sample: &Value) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        if g.state == EngineState::Uninitialized {
            return Err(Error::InvalidState);
        }
        let Inner { sources, vars, .. } = &mut *g;
        let src = sources
            .iter_mut()
            .find(|s| s.cfg.id == source_id)
            .ok_or(Error::NotFound)?;
        if src.cfg.kind != SourceKind::Push {
            return Err(Error::InvalidArg);
        }
        if !src.cfg.enabled {
            return Err(Error::InvalidState);
        }
        src.last_sample_ms = Some(now);
        src.sample_count = src.sample_count.saturating_add(1);
        Ok(apply_mappings(src, vars, sample, now))
    }

    pub fn add_source(&self, cfg: SourceConfig) -> Result<()> {
        if !variables::valid_id(&cfg.id) {
            return Err(Error::InvalidArg);
        }
        let mut g = self.lock();
        if g.sources.iter().any(|s| s.cfg.id == cfg.id) {
            return Err(Error::InvalidState);
        }
        if cfg.mappings.iter().any(|m| g.vars.get(&m.variable).is_none()) {
            return Err(Error::InvalidArg);
        }
        info!("Automation: source '{}' added", cfg.id);
        g.sources.push(Source::new(cfg));
        Ok(())
    }

    /// Remove a source and every variable bound to it.
    pub fn remove_source(&self, id: &str) -> Result<usize> {
        let mut g = self.lock();
        let before = g.sources.len();
        g.sources.retain(|s| s.cfg.id != id);
        if g.sources.len() == before {
            return Err(Error::NotFound);
        }
        Ok(g.vars.unregister_by_source(id))
    }

    pub fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut g = self.lock();
        let src = g
            .sources
            .iter_mut()
            .find(|s| s.cfg.id == id)
            .ok_or(Error::NotFound)?;
        src.cfg.enabled = enabled;
        Ok(())
    }

    pub fn sources_json(&self) -> Vec<Value> {
        self.lock().sources.iter().map(Source::to_json).collect()
    }

    // ── Rules ────────────────────────────────────────────────

    pub fn rules_json(&self) -> Vec<Value> {
        self.lock().rules.iter().map(Rule::to_json).collect()
    }

    pub fn rule_json(&self, id: &str) -> Option<Value> {
        self.lock().rules.iter().find(|r| r.id() == id).map(Rule::to_json)
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut g = self.lock();
        let rule = g
            .rules
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or(Error::NotFound)?;
        rule.cfg.enabled = enabled;
        // A re-enabled rule needs a fresh false → true edge.
        rule.last_result = false;
        info!("Automation: rule '{}' {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.lock().config.poll_interval_ms
    }

    /// Up to `n` most recent records, newest first.
    pub fn history(&self, n: usize) -> Vec<ExecutionRecord> {
        self.lock().history.recent(n)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            total_evaluations: c.total_evaluations.load(Ordering::Relaxed),
            total_triggers: c.total_triggers.load(Ordering::Relaxed),
            total_actions: c.total_actions.load(Ordering::Relaxed),
            failed_actions: c.failed_actions.load(Ordering::Relaxed),
            last_evaluation_ms: c.last_evaluation_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        c.total_evaluations.store(0, Ordering::Relaxed);
        c.total_triggers.store(0, Ordering::Relaxed);
        c.total_actions.store(0, Ordering::Relaxed);
        c.failed_actions.store(0, Ordering::Relaxed);
        c.last_evaluation_ms.store(0, Ordering::Relaxed);
    }

    pub fn status_json(&self) -> Value {
        let stats = self.stats();
        let g = self.lock();
        json!({
            "state": g.state.as_str(),
            "poll_interval_ms": g.config.poll_interval_ms,
            "variables": g.vars.len(),
            "sources": g.sources.len(),
            "rules": g.rules.len(),
            "rules_enabled": g.rules.iter().filter(|r| r.cfg.enabled).count(),
            "history": g.history.len(),
            "stats": stats.to_json(),
        })
    }

    fn post(&self, id: u16, data: Value) {
        if let Some(bus) = &self.bus {
            if bus.post_json(EventBase::Automation, id, data, Priority::Normal).is_err() {
                debug!("Automation: event {} dropped", id);
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────

fn build(
    cfg: &AutomationConfig,
    now_ms: u64,
    previous: Option<&VariableStore>,
) -> Result<(VariableStore, Vec<Source>, Vec<Rule>)> {
    let mut vars = VariableStore::new();
    for vc in &cfg.variables {
        let owner = vc.source.clone().or_else(|| {
            cfg.sources
                .iter()
                .find(|s| s.mappings.iter().any(|m| m.variable == vc.id))
                .map(|s| s.id.clone())
        });
        let carried = previous
            .and_then(|p| p.value(&vc.id))
            .filter(|v| v.var_type() == vc.ty)
            .cloned();
        let initial = match (carried, &vc.initial) {
            (Some(v), _) => v,
            (None, Some(raw)) => VarValue::coerce(vc.ty, raw).ok_or(Error::InvalidArg)?,
            (None, None) => VarValue::default_for(vc.ty),
        };
        vars.register(&vc.id, initial, vc.readonly, owner.as_deref(), now_ms)?;
    }
    let sources = cfg.sources.iter().cloned().map(Source::new).collect();
    let rules = cfg.rules.iter().cloned().map(Rule::new).collect();
    Ok((vars, sources, rules))
}

fn prepare(rule: &Rule, vars: &VariableStore, source: TriggerSource) -> Firing {
    Firing {
        rule_id: rule.cfg.id.clone(),
        source,
        actions: rule
            .cfg
            .actions
            .iter()
            .map(|a| {
                (
                    a.operation.clone(),
                    a.params.as_ref().map(|p| actions::expand(p, vars)),
                )
            })
            .collect(),
    }
}

fn apply_poll(src: &mut Source, vars: &mut VariableStore, result: &ApiResult, now_ms: u64) {
    match (&result.data, result.is_ok()) {
        (Some(data), true) => {
            src.sample_count = src.sample_count.saturating_add(1);
            src.last_error = None;
            apply_mappings(src, vars, data, now_ms);
        }
        _ => {
            src.error_count = src.error_count.saturating_add(1);
            src.last_error = Some(
                result
                    .message
                    .clone()
                    .unwrap_or_else(|| result.code.as_str().to_owned()),
            );
            debug!("Automation: source '{}' poll failed", src.cfg.id);
        }
    }
}

fn apply_mappings(src: &Source, vars: &mut VariableStore, doc: &Value, now_ms: u64) -> usize {
    let mut written = 0;
    for m in &src.cfg.mappings {
        let Some(v) = extract_path(doc, &m.path) else {
            continue;
        };
        match vars.set(&m.variable, v, Writer::Source, now_ms) {
            Ok(_) => written += 1,
            Err(e) => debug!(
                "Automation: '{}' → '{}' rejected: {}",
                src.cfg.id, m.variable, e
            ),
        }
    }
    written
}
