//! Event bindings.
//!
//! The bind table cascades triggers: when a fired event matches an entry
//! (by name and optional argument constraint), the entry's targets fire on
//! channels offset from the source channel. Cascades recurse depth-first
//! in declaration order with a bounded depth so cyclic bindings terminate.

use crate::error::EngineError;
use crate::expr::{self, EnvState};
use crate::random::Random;
use crate::value::Value;

/// Maximum depth of a binding cascade.
pub const BIND_RECURSION_MAX: usize = 16;

#[derive(Debug, Clone)]
pub struct BindTarget {
    /// Offset added to the source channel, wrapped into the valid range.
    pub ch_offset: i64,
    pub event_name: String,
    /// Argument expression with `$` bound to the source argument.
    pub expr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BindEntry {
    pub source_event: String,
    /// Constraint expression over `$`; a non-`true` result suppresses the
    /// cascade.
    pub constraint: Option<String>,
    pub targets: Vec<BindTarget>,
}

impl BindEntry {
    /// Whether this entry fires for the given event and argument.
    pub fn matches(
        &self,
        event_name: &str,
        arg: &Value,
        env: &EnvState,
        rand: &mut Random,
    ) -> bool {
        if self.source_event != event_name {
            return false;
        }
        match &self.constraint {
            None => true,
            Some(constraint) => matches!(
                expr::evaluate(constraint, env, arg, rand),
                Ok(Value::Bool(true))
            ),
        }
    }
}

/// Parse `p_bind.json`:
/// `[[name, constraint | null, [[ch_offset, [event, expr?]], ...]], ...]`.
pub fn parse_bind(json: &serde_json::Value) -> Result<Vec<BindEntry>, EngineError> {
    let list = json
        .as_array()
        .ok_or_else(|| EngineError::format("Bind list is not an array"))?;

    let mut entries = Vec::with_capacity(list.len());
    for item in list {
        let parts = item
            .as_array()
            .filter(|p| p.len() == 3)
            .ok_or_else(|| EngineError::format("Bind entry is not a triple"))?;

        let source_event = parts[0]
            .as_str()
            .ok_or_else(|| EngineError::format("Bind source is not a string"))?
            .to_string();

        let constraint = match &parts[1] {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            _ => return Err(EngineError::format("Bind constraint is not a string")),
        };

        let target_list = parts[2]
            .as_array()
            .ok_or_else(|| EngineError::format("Bind targets are not an array"))?;
        let mut targets = Vec::with_capacity(target_list.len());
        for target in target_list {
            let pair = target
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| EngineError::format("Bind target is not a pair"))?;
            let ch_offset = pair[0]
                .as_i64()
                .ok_or_else(|| EngineError::format("Bind channel offset is not an integer"))?;
            let event = pair[1]
                .as_array()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| EngineError::format("Bind target event is not an array"))?;
            let event_name = event[0]
                .as_str()
                .ok_or_else(|| EngineError::format("Bind target name is not a string"))?
                .to_string();
            let expr = match event.get(1) {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(EngineError::format(
                        "Bind target argument is not an expression string",
                    ))
                }
            };
            targets.push(BindTarget {
                ch_offset,
                event_name,
                expr,
            });
        }

        entries.push(BindEntry {
            source_event,
            constraint,
            targets,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_with_constraints() {
        let json = serde_json::json!([
            ["n+", null, [[0, [".f", "$ - 600"]]]],
            ["n+", "$ < 0", [[1, ["n+", "$ + 1200"]]]],
        ]);
        let entries = parse_bind(&json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].targets[0].event_name, ".f");
        assert!(entries[1].constraint.is_some());
    }

    #[test]
    fn constraint_gates_matching() {
        let json = serde_json::json!([
            ["n+", "$ < 0", [[0, ["n-", null]]]],
        ]);
        let entries = parse_bind(&json).unwrap();
        let env = EnvState::new();
        let mut rand = Random::from_seed(0);

        assert!(entries[0].matches("n+", &Value::Float(-5.0), &env, &mut rand));
        assert!(!entries[0].matches("n+", &Value::Float(5.0), &env, &mut rand));
        assert!(!entries[0].matches("n-", &Value::Float(-5.0), &env, &mut rand));
    }
}
