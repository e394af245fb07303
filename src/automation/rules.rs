//! Condition → action rules with edge triggering and cooldown.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::value::{CompareOp, VarValue};
use super::variables::VariableStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(alias = "variable")]
    pub var: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    /// A missing variable makes the predicate false.
    pub fn holds(&self, vars: &VariableStore) -> bool {
        vars.value(&self.var)
            .is_some_and(|lhs| lhs.compare(self.op, &VarValue::from_json(&self.value)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionMode {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub operation: String,
    #[serde(default)]
    pub params: Option<Value>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_mode: ConditionMode,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    /// Fire on a timer as well, while the conditions (if any) hold.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub run_on_startup: bool,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub cfg: RuleConfig,
    /// Condition value at the previous evaluation.
    pub last_result: bool,
    pub trigger_count: u32,
    pub last_trigger_ms: Option<u64>,
    pub last_timer_ms: Option<u64>,
    pub startup_pending: bool,
}

impl Rule {
    pub fn new(cfg: RuleConfig) -> Self {
        Self {
            cfg,
            last_result: false,
            trigger_count: 0,
            last_trigger_ms: None,
            last_timer_ms: None,
            startup_pending: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// Empty condition lists never hold.
    pub fn evaluate(&self, vars: &VariableStore) -> bool {
        let conds = &self.cfg.conditions;
        if conds.is_empty() {
            return false;
        }
        match self.cfg.condition_mode {
            ConditionMode::And => conds.iter().all(|c| c.holds(vars)),
            ConditionMode::Or => conds.iter().any(|c| c.holds(vars)),
        }
    }

    pub fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        self.last_trigger_ms
            .is_none_or(|t| now_ms.saturating_sub(t) >= self.cfg.cooldown_ms)
    }

    /// Record the new condition value; `true` on a false → true edge.
    pub fn observe(&mut self, result: bool) -> bool {
        let edge = result && !self.last_result;
        self.last_result = result;
        edge
    }

    /// Timer rules fire each interval while their conditions hold.
    pub fn timer_due(&self, now_ms: u64, holds: bool) -> bool {
        let Some(interval) = self.cfg.interval_ms.filter(|i| *i > 0) else {
            return false;
        };
        let gated = self.cfg.conditions.is_empty() || holds;
        gated && self.last_timer_ms.is_none_or(|t| now_ms.saturating_sub(t) >= interval)
    }

    pub fn mark_fired(&mut self, now_ms: u64) {
        self.trigger_count = self.trigger_count.saturating_add(1);
        self.last_trigger_ms = Some(now_ms);
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.cfg.id,
            "name": self.cfg.name,
            "enabled": self.cfg.enabled,
            "condition_mode": self.cfg.condition_mode,
            "conditions": self.cfg.conditions,
            "cooldown_ms": self.cfg.cooldown_ms,
            "actions": self.cfg.actions,
            "interval_ms": self.cfg.interval_ms,
            "run_on_startup": self.cfg.run_on_startup,
            "trigger_count": self.trigger_count,
            "last_trigger_ms": self.last_trigger_ms,
            "last_result": self.last_result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::variables::Writer;

    fn vars(temp: f64) -> VariableStore {
        let mut v = VariableStore::new();
        v.register("temp", VarValue::Float(temp), false, None, 0).unwrap();
        v.register("mode", VarValue::Str("auto".into()), false, None, 0).unwrap();
        v
    }

    fn rule(json: Value) -> Rule {
        Rule::new(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn and_or_and_empty() {
        let v = vars(60.0);
        let and = rule(json!({"id": "a", "conditions": [
            {"var": "temp", "op": ">", "value": 50},
            {"var": "mode", "op": "==", "value": "manual"}
        ]}));
        assert!(!and.evaluate(&v));
        let mut or = and.clone();
        or.cfg.condition_mode = ConditionMode::Or;
        assert!(or.evaluate(&v));
        assert!(!rule(json!({"id": "e"})).evaluate(&v));
    }

    #[test]
    fn missing_variable_is_false() {
        let r = rule(json!({"id": "m", "conditions": [{"var": "ghost", "op": "!=", "value": 1}]}));
        assert!(!r.evaluate(&vars(0.0)));
    }

    #[test]
    fn only_rising_edges_count() {
        let mut r = rule(json!({"id": "r"}));
        assert!(r.observe(true));
        assert!(!r.observe(true));
        assert!(!r.observe(false));
        assert!(r.observe(true));
    }

    #[test]
    fn cooldown_window() {
        let mut r = rule(json!({"id": "c", "cooldown_ms": 1000}));
        assert!(r.cooldown_elapsed(0));
        r.mark_fired(100);
        assert!(!r.cooldown_elapsed(1099));
        assert!(r.cooldown_elapsed(1100));
        assert_eq!(r.trigger_count, 1);
    }

    #[test]
    fn timer_gating() {
        let mut r = rule(json!({"id": "t", "interval_ms": 500}));
        assert!(r.timer_due(0, false));
        r.last_timer_ms = Some(0);
        assert!(!r.timer_due(499, false));
        assert!(r.timer_due(500, false));

        let gated = rule(json!({"id": "g", "interval_ms": 500,
            "conditions": [{"var": "temp", "op": ">", "value": 1}]}));
        assert!(!gated.timer_due(0, false));
        assert!(gated.timer_due(0, true));
    }

    #[test]
    fn mode_parses_either_case() {
        let r = rule(json!({"id": "x", "condition_mode": "or"}));
        assert_eq!(r.cfg.condition_mode, ConditionMode::Or);
        let mut v = vars(10.0);
        v.set("temp", &json!(70), Writer::External, 1).unwrap();
        let hot = rule(json!({"id": "h", "conditions": [{"variable": "temp", "op": ">=", "value": 70}]}));
        assert!(hot.evaluate(&v));
    }
}
