//! Typed values passed through events, expressions and control variables.

use crate::limits::{PATTERNS_MAX, PAT_INSTANCES_MAX};
use crate::tstamp::Tstamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to one placement of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatInstRef {
    pub pat: i16,
    pub inst: i16,
}

impl PatInstRef {
    pub fn new(pat: i16, inst: i16) -> Self {
        Self { pat, inst }
    }

    pub fn is_valid(&self) -> bool {
        (0..PATTERNS_MAX as i16).contains(&self.pat)
            && (0..PAT_INSTANCES_MAX as i16).contains(&self.inst)
    }
}

/// The type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    None,
    Bool,
    Int,
    Float,
    Tstamp,
    String,
    PatInstRef,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::None => "none",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Tstamp => "timestamp",
            ValueType::String => "string",
            ValueType::PatInstRef => "pattern instance",
        };
        write!(f, "{}", name)
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Tstamp(Tstamp),
    String(String),
    PatInstRef(PatInstRef),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::None => ValueType::None,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Tstamp(_) => ValueType::Tstamp,
            Value::String(_) => ValueType::String,
            Value::PatInstRef(_) => ValueType::PatInstRef,
        }
    }

    /// Whether this value can take part in arithmetic.
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Tstamp(_))
    }

    /// Convert to the requested type, if a lossless-enough conversion exists.
    ///
    /// Supported conversions follow the arithmetic hierarchy
    /// `Int < Tstamp < Float` in both directions, plus identity.
    pub fn convert(&self, target: ValueType) -> Option<Value> {
        if self.value_type() == target {
            return Some(self.clone());
        }

        match (self, target) {
            (Value::Int(i), ValueType::Float) => Some(Value::Float(*i as f64)),
            (Value::Int(i), ValueType::Tstamp) => Some(Value::Tstamp(Tstamp::new(*i, 0))),
            (Value::Float(f), ValueType::Int) => Some(Value::Int(*f as i64)),
            (Value::Float(f), ValueType::Tstamp) => Some(Value::Tstamp(Tstamp::from_beats(*f))),
            (Value::Tstamp(ts), ValueType::Float) => Some(Value::Float(ts.to_beats())),
            (Value::Tstamp(ts), ValueType::Int) => Some(Value::Int(ts.beats())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_tstamp(&self) -> Option<Tstamp> {
        match self {
            Value::Tstamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Parse a JSON event argument into a value of the declared type.
    ///
    /// Ints promote to floats and timestamps where the declared type asks
    /// for them; all other mismatches fail.
    pub fn from_json(json: &serde_json::Value, declared: ValueType) -> Option<Value> {
        use serde_json::Value as J;
        let raw = match json {
            J::Null => Value::None,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64()?)
                }
            }
            J::String(s) => Value::String(s.clone()),
            J::Array(items) if items.len() == 2 => {
                let a = items[0].as_i64()?;
                let b = items[1].as_i64()?;
                match declared {
                    ValueType::PatInstRef => {
                        Value::PatInstRef(PatInstRef::new(a as i16, b as i16))
                    }
                    _ => Value::Tstamp(Tstamp::new(a, b)),
                }
            }
            _ => return None,
        };

        if declared == ValueType::None {
            return Some(Value::None);
        }
        if raw.value_type() == declared {
            return Some(raw);
        }
        raw.convert(declared)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Tstamp(ts) => write!(f, "[{}, {}]", ts.beats(), ts.rem()),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::PatInstRef(p) => write!(f, "[{}, {}]", p.pat, p.inst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_promotes_to_tstamp_and_float() {
        assert_eq!(
            Value::Int(3).convert(ValueType::Tstamp),
            Some(Value::Tstamp(Tstamp::new(3, 0)))
        );
        assert_eq!(
            Value::Int(3).convert(ValueType::Float),
            Some(Value::Float(3.0))
        );
    }

    #[test]
    fn string_does_not_convert_to_number() {
        assert_eq!(Value::String("x".into()).convert(ValueType::Int), None);
    }

    #[test]
    fn json_argument_respects_declared_type() {
        let arg = serde_json::json!(2);
        assert_eq!(
            Value::from_json(&arg, ValueType::Float),
            Some(Value::Float(2.0))
        );

        let pair = serde_json::json!([1, 0]);
        assert_eq!(
            Value::from_json(&pair, ValueType::Tstamp),
            Some(Value::Tstamp(Tstamp::new(1, 0)))
        );
        assert_eq!(
            Value::from_json(&pair, ValueType::PatInstRef),
            Some(Value::PatInstRef(PatInstRef::new(1, 0)))
        );

        assert_eq!(Value::from_json(&serde_json::json!("x"), ValueType::Int), None);
    }
}
