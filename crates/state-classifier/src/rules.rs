use std::collections::HashSet;
use std::path::Path;

use advisory_core::{indicators, AdvisoryError, State, StateId};
use serde::{Deserialize, Serialize};

/// `[lower, upper)` range of one indicator that votes for one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub state_id: StateId,
    pub indicator: String,
    pub lower: f64,
    pub upper: f64,
}

impl ThresholdRule {
    pub fn matches(&self, value: f64) -> bool {
        self.lower <= value && value < self.upper
    }
}

/// Rule of a state definition, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub indicator: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Serializable description of a rule table, as found in a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetDefinition {
    /// Name of the state returned when nothing matches.
    pub fallback: String,
    pub states: Vec<StateDefinition>,
}

impl RuleSetDefinition {
    pub fn from_json(json: &str) -> Result<Self, AdvisoryError> {
        serde_json::from_str(json).map_err(|e| AdvisoryError::InvalidRules(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AdvisoryError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AdvisoryError::InvalidRules(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Default Hold / Buy / Strong Buy / Sell / Strong Sell table over RSI and %B.
    pub fn standard() -> Self {
        let state = |name: &str, description: &str, priority: i32, rules: &[(&str, f64, f64)]| {
            StateDefinition {
                name: name.to_string(),
                description: description.to_string(),
                priority,
                rules: rules
                    .iter()
                    .map(|(indicator, lower, upper)| RuleDefinition {
                        indicator: indicator.to_string(),
                        lower: *lower,
                        upper: *upper,
                    })
                    .collect(),
            }
        };

        Self {
            fallback: "Hold".to_string(),
            states: vec![
                state("Hold", "No clear signal, keep the current position", 100, &[]),
                state(
                    "Strong Buy",
                    "Strongly advised to buy",
                    10,
                    &[(indicators::RSI, 0.0, 30.0), (indicators::BBANDS_PERCENT, -1.0, 0.0)],
                ),
                state(
                    "Strong Sell",
                    "Strongly advised to sell",
                    10,
                    &[(indicators::RSI, 70.0, 300.0), (indicators::BBANDS_PERCENT, 1.0, 2.0)],
                ),
                state(
                    "Buy",
                    "Advised to buy",
                    20,
                    &[(indicators::RSI, 30.0, 40.0), (indicators::BBANDS_PERCENT, 0.0, 0.2)],
                ),
                state(
                    "Sell",
                    "Advised to sell",
                    20,
                    &[(indicators::RSI, 60.0, 70.0), (indicators::BBANDS_PERCENT, 0.8, 1.0)],
                ),
            ],
        }
    }
}

/// Validated snapshot of states and threshold rules.
///
/// States are kept in evaluation order: `priority` ascending, then id.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable {
    states: Vec<State>,
    fallback: State,
    rules: Vec<ThresholdRule>,
}

impl RuleTable {
    pub fn new(
        mut states: Vec<State>,
        fallback_id: StateId,
        rules: Vec<ThresholdRule>,
    ) -> Result<Self, AdvisoryError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for state in &states {
            if !ids.insert(state.id) {
                return Err(AdvisoryError::InvalidRules(format!("duplicate state id {}", state.id)));
            }
            if !names.insert(state.name.as_str()) {
                return Err(AdvisoryError::InvalidRules(format!(
                    "duplicate state name '{}'",
                    state.name
                )));
            }
        }

        let fallback = states
            .iter()
            .find(|s| s.id == fallback_id)
            .cloned()
            .ok_or_else(|| {
                AdvisoryError::InvalidRules(format!("fallback state {} is not defined", fallback_id))
            })?;

        let mut pairs = HashSet::new();
        for rule in &rules {
            if !ids.contains(&rule.state_id) {
                return Err(AdvisoryError::InvalidRules(format!(
                    "rule for {} references unknown state {}",
                    rule.indicator, rule.state_id
                )));
            }
            if !rule.lower.is_finite() || !rule.upper.is_finite() || rule.lower >= rule.upper {
                return Err(AdvisoryError::InvalidRules(format!(
                    "rule for {} on state {} has invalid range [{}, {})",
                    rule.indicator, rule.state_id, rule.lower, rule.upper
                )));
            }
            if !pairs.insert((rule.state_id, rule.indicator.as_str())) {
                return Err(AdvisoryError::InvalidRules(format!(
                    "duplicate rule for {} on state {}",
                    rule.indicator, rule.state_id
                )));
            }
        }

        states.sort_by_key(|s| (s.priority, s.id));

        Ok(Self {
            states,
            fallback,
            rules,
        })
    }

    /// Build a table from a definition, numbering states 1.. in definition order.
    pub fn from_definition(definition: &RuleSetDefinition) -> Result<Self, AdvisoryError> {
        let mut states = Vec::with_capacity(definition.states.len());
        let mut rules = Vec::new();

        for (i, def) in definition.states.iter().enumerate() {
            let id = i as StateId + 1;
            states.push(State::new(id, &def.name, &def.description, def.priority));
            rules.extend(def.rules.iter().map(|r| ThresholdRule {
                state_id: id,
                indicator: r.indicator.clone(),
                lower: r.lower,
                upper: r.upper,
            }));
        }

        let fallback_id = states
            .iter()
            .find(|s| s.name == definition.fallback)
            .map(|s| s.id)
            .ok_or_else(|| {
                AdvisoryError::InvalidRules(format!(
                    "fallback state '{}' is not defined",
                    definition.fallback
                ))
            })?;

        Self::new(states, fallback_id, rules)
    }

    pub fn standard() -> Self {
        Self::from_definition(&RuleSetDefinition::standard())
            .expect("standard rule table is valid")
    }

    /// States in evaluation order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn fallback(&self) -> &State {
        &self.fallback
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn state_by_name(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn rules_for(&self, state_id: StateId) -> impl Iterator<Item = &ThresholdRule> {
        self.rules.iter().filter(move |r| r.state_id == state_id)
    }
}
