use std::collections::BTreeMap;

use advisory_core::State;

use crate::RuleTable;

/// Map current indicator values to exactly one state.
///
/// A state matches when at least one of its rules contains the value of that
/// rule's indicator. Several matches resolve to the first in the table's
/// evaluation order; no match resolves to the fallback state.
pub fn classify<'a>(values: &BTreeMap<String, f64>, table: &'a RuleTable) -> &'a State {
    matching_states(values, table)
        .into_iter()
        .next()
        .unwrap_or_else(|| table.fallback())
}

/// Every matching state, in evaluation order.
pub fn matching_states<'a>(values: &BTreeMap<String, f64>, table: &'a RuleTable) -> Vec<&'a State> {
    table
        .states()
        .iter()
        .filter(|state| {
            table.rules_for(state.id).any(|rule| {
                values
                    .get(&rule.indicator)
                    .is_some_and(|&value| rule.matches(value))
            })
        })
        .collect()
}
