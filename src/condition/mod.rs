use std::collections::HashMap;

use serde::Deserialize;

use crate::dimension::HashableDimensionKey;
use crate::event::FieldValue;
use crate::matcher::{filter_values, translate_field_selector, FieldSelector, Matcher};

/// Tri-valued condition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    True,
    False,
    Unknown,
}

impl ConditionState {
    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }
}

impl From<bool> for ConditionState {
    fn from(met: bool) -> Self {
        if met {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// Per-condition lookup keys for a sliced condition query.
pub type ConditionKey = HashMap<i64, HashableDimensionKey>;

/// Shared evaluator resolving a (condition index, key) pair to a state.
pub trait ConditionWizard: Send + Sync {
    /// `partial_links` is set when the metric's links do not cover every
    /// dimension the condition tracker slices by.
    fn query(
        &self,
        condition_index: usize,
        keys: &ConditionKey,
        partial_links: bool,
    ) -> ConditionState;
}

/// Declarative link tying fields of the matched event to fields of a
/// sliced condition's dimensions.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConditionLink {
    pub condition_id: i64,
    pub fields_in_what: FieldSelector,
    pub fields_in_condition: FieldSelector,
}

/// A link compiled to matcher form.
#[derive(Debug, Clone)]
pub struct CompiledConditionLink {
    pub condition_id: i64,
    pub fields_in_what: Vec<Matcher>,
    pub fields_in_condition: Vec<Matcher>,
}

impl CompiledConditionLink {
    pub fn compile(link: &MetricConditionLink) -> Self {
        Self {
            condition_id: link.condition_id,
            fields_in_what: translate_field_selector(&link.fields_in_what),
            fields_in_condition: translate_field_selector(&link.fields_in_condition),
        }
    }
}

/// Builds the condition lookup key for one link: extracts the linked fields
/// from the event, then rewrites each extracted path to the condition side
/// so the wizard can match it against its own dimension keys. The rewrite
/// only applies when the extraction arity matches the link.
pub fn dimension_for_condition(
    event_values: &[FieldValue],
    link: &CompiledConditionLink,
) -> HashableDimensionKey {
    let mut extracted = filter_values(&link.fields_in_what, event_values).unwrap_or_default();
    if extracted.len() == link.fields_in_condition.len() {
        for (value, matcher) in extracted.iter_mut().zip(&link.fields_in_condition) {
            value.path.set_tag(matcher.path().tag());
            value.path.set_path_word(matcher.path().path_word());
        }
    }
    HashableDimensionKey::new(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, Value};
    use crate::matcher::Position;

    fn link() -> CompiledConditionLink {
        CompiledConditionLink::compile(&MetricConditionLink {
            condition_id: 77,
            fields_in_what: FieldSelector {
                field: 10,
                position: None,
                children: vec![FieldSelector {
                    field: 1,
                    position: Some(Position::Any),
                    children: vec![FieldSelector {
                        field: 1,
                        position: None,
                        children: Vec::new(),
                    }],
                }],
            },
            fields_in_condition: FieldSelector {
                field: 27,
                position: None,
                children: vec![FieldSelector {
                    field: 2,
                    position: Some(Position::Last),
                    children: vec![FieldSelector {
                        field: 2,
                        position: None,
                        children: Vec::new(),
                    }],
                }],
            },
        })
    }

    #[test]
    fn test_link_compilation_masks() {
        let compiled = link();
        assert_eq!(compiled.fields_in_what.len(), 1);
        assert_eq!(compiled.fields_in_what[0].path().path_word(), 0x0201_0001);
        assert_eq!(compiled.fields_in_what[0].mask() as u32, 0xff7f_007f);
        assert_eq!(
            compiled.fields_in_condition[0].path().path_word(),
            0x0202_8002
        );
        assert_eq!(compiled.fields_in_condition[0].mask() as u32, 0xff7f_807f);
    }

    #[test]
    fn test_dimension_for_condition_rewrites_to_condition_side() {
        let mut event = LogEvent::new(10, 0, 0, 12345);
        event.write_attribution_chain(&[(1111, "loc1")]);
        event.write_string("some value");

        let key = dimension_for_condition(event.values(), &link());
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].path.tag(), 27);
        assert_eq!(key.values()[0].path.path_word(), 0x0202_8002);
        assert_eq!(key.values()[0].value, Value::Int(1111));
    }

    #[test]
    fn test_dimension_for_condition_arity_mismatch_keeps_extraction() {
        let mut event = LogEvent::new(10, 0, 0, 12345);
        event.write_string("no chain");

        // Nothing matches the ANY link; the key stays empty instead of
        // being rewritten.
        let key = dimension_for_condition(event.values(), &link());
        assert!(key.values().is_empty());
    }

    #[test]
    fn test_condition_state_from_bool() {
        assert_eq!(ConditionState::from(true), ConditionState::True);
        assert_eq!(ConditionState::from(false), ConditionState::False);
        assert!(ConditionState::True.is_true());
        assert!(!ConditionState::Unknown.is_true());
    }
}
