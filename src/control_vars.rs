//! Audio unit control variables.
//!
//! A control variable is a named knob on an audio unit. Each variable
//! carries an ordered list of bindings; a binding names a target device
//! inside the unit, a target variable name and a transform. Transforms are
//! either an expression over `$` (the source value) or, for sliding float
//! variables, a linear map from the declared range onto a target range.

use crate::error::EngineError;
use crate::expr::{self, EnvState};
use crate::random::Random;
use crate::value::{Value, ValueType};

/// Declared type of a control variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvType {
    Bool,
    Int,
    Float,
    FloatSlide,
    Tstamp,
}

impl CvType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(CvType::Bool),
            "int" => Some(CvType::Int),
            "float" => Some(CvType::Float),
            "float_slide" => Some(CvType::FloatSlide),
            "tstamp" => Some(CvType::Tstamp),
            _ => None,
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            CvType::Bool => ValueType::Bool,
            CvType::Int => ValueType::Int,
            CvType::Float | CvType::FloatSlide => ValueType::Float,
            CvType::Tstamp => ValueType::Tstamp,
        }
    }
}

/// The device a binding points at, relative to the owning audio unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvTargetDev {
    Au(usize),
    Proc(usize),
}

/// How a source value becomes a target value.
#[derive(Debug, Clone)]
pub enum CvTransform {
    /// Evaluate with `$` bound to the source value.
    Expr(String),
    /// Map the variable's `[min, max]` range linearly onto this range.
    FloatSlideMap { map_min_to: f64, map_max_to: f64 },
    /// Pass the source value through unchanged.
    Identity,
}

#[derive(Debug, Clone)]
pub struct CvBinding {
    pub target_dev: CvTargetDev,
    pub target_var: String,
    pub transform: CvTransform,
}

#[derive(Debug, Clone)]
pub struct CvEntry {
    pub name: String,
    pub cv_type: CvType,
    pub init_value: Value,
    pub min: f64,
    pub max: f64,
    pub bindings: Vec<CvBinding>,
}

impl CvEntry {
    /// Normalise a source value into the declared `[min, max]` range.
    pub fn range_norm(&self, value: f64) -> f64 {
        if self.max <= self.min {
            return 0.0;
        }
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }

    /// Compute the value a binding should apply for a source value.
    pub fn transform_value(
        &self,
        binding: &CvBinding,
        source: &Value,
        env: &EnvState,
        rand: &mut Random,
    ) -> Option<Value> {
        match &binding.transform {
            CvTransform::Identity => Some(source.clone()),
            CvTransform::Expr(expression) => expr::evaluate(expression, env, source, rand).ok(),
            CvTransform::FloatSlideMap {
                map_min_to,
                map_max_to,
            } => {
                let source = source.as_float()?;
                let norm = self.range_norm(source);
                Some(Value::Float(map_min_to + norm * (map_max_to - map_min_to)))
            }
        }
    }
}

/// The control variable table of one audio unit.
#[derive(Debug, Clone, Default)]
pub struct AuControlVars {
    entries: Vec<CvEntry>,
}

impl AuControlVars {
    /// Parse the JSON list form:
    ///
    /// ```json
    /// [ { "name": "cutoff", "type": "float_slide", "init": 0.0,
    ///     "range": [0.0, 100.0],
    ///     "bindings": [ { "target": "proc_00", "var": "cutoff",
    ///                     "map": [0.0, 100.0] } ] } ]
    /// ```
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EngineError> {
        let list = json
            .as_array()
            .ok_or_else(|| EngineError::format("Control variable list is not an array"))?;

        let mut entries = Vec::with_capacity(list.len());
        for item in list {
            let obj = item
                .as_object()
                .ok_or_else(|| EngineError::format("Control variable is not an object"))?;

            let name = obj
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| EngineError::format("Control variable has no name"))?
                .to_string();

            let type_name = obj
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| EngineError::format("Control variable has no type"))?;
            let cv_type = CvType::from_name(type_name).ok_or_else(|| {
                EngineError::format(format!("Unknown control variable type: {}", type_name))
            })?;

            let init_value = obj
                .get("init")
                .and_then(|v| Value::from_json(v, cv_type.value_type()))
                .ok_or_else(|| {
                    EngineError::format(format!("Control variable {} has a bad initial value", name))
                })?;

            let (min, max) = match obj.get("range").and_then(|r| r.as_array()) {
                Some(range) if range.len() == 2 => {
                    let min = range[0].as_f64().unwrap_or(0.0);
                    let max = range[1].as_f64().unwrap_or(1.0);
                    if !(min.is_finite() && max.is_finite() && min < max) {
                        return Err(EngineError::format(format!(
                            "Control variable {} has an invalid range",
                            name
                        )));
                    }
                    (min, max)
                }
                _ => (0.0, 1.0),
            };

            let mut bindings = Vec::new();
            if let Some(binding_list) = obj.get("bindings").and_then(|b| b.as_array()) {
                for binding in binding_list {
                    bindings.push(parse_binding(binding, cv_type)?);
                }
            }

            entries.push(CvEntry {
                name,
                cv_type,
                init_value,
                min,
                max,
                bindings,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CvEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&CvEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

fn parse_binding(json: &serde_json::Value, cv_type: CvType) -> Result<CvBinding, EngineError> {
    let obj = json
        .as_object()
        .ok_or_else(|| EngineError::format("Control variable binding is not an object"))?;

    let target = obj
        .get("target")
        .and_then(|t| t.as_str())
        .ok_or_else(|| EngineError::format("Binding has no target device"))?;

    let target_dev = if let Some(digits) = target.strip_prefix("proc_") {
        CvTargetDev::Proc(
            usize::from_str_radix(digits, 16)
                .map_err(|_| EngineError::format("Bad processor index in binding target"))?,
        )
    } else if let Some(digits) = target.strip_prefix("au_") {
        CvTargetDev::Au(
            usize::from_str_radix(digits, 16)
                .map_err(|_| EngineError::format("Bad audio unit index in binding target"))?,
        )
    } else {
        return Err(EngineError::format(format!(
            "Binding target is not a device: {}",
            target
        )));
    };

    let target_var = obj
        .get("var")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::format("Binding has no target variable"))?
        .to_string();

    let transform = if let Some(expression) = obj.get("expr").and_then(|e| e.as_str()) {
        CvTransform::Expr(expression.to_string())
    } else if let Some(map) = obj.get("map").and_then(|m| m.as_array()) {
        if cv_type != CvType::FloatSlide {
            return Err(EngineError::format(
                "Range maps are only valid for float_slide variables",
            ));
        }
        if map.len() != 2 {
            return Err(EngineError::format("Binding map is not a pair"));
        }
        CvTransform::FloatSlideMap {
            map_min_to: map[0].as_f64().unwrap_or(0.0),
            map_max_to: map[1].as_f64().unwrap_or(1.0),
        }
    } else {
        CvTransform::Identity
    };

    Ok(CvBinding {
        target_dev,
        target_var,
        transform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AuControlVars {
        AuControlVars::from_json(&serde_json::json!([
            {
                "name": "cutoff",
                "type": "float_slide",
                "init": 0.0,
                "range": [0.0, 100.0],
                "bindings": [
                    { "target": "proc_00", "var": "cutoff", "map": [20.0, 120.0] },
                    { "target": "proc_01", "var": "gain", "expr": "$ * 0.5" }
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn parses_entries_and_bindings() {
        let vars = table();
        let entry = vars.get("cutoff").unwrap();
        assert_eq!(entry.cv_type, CvType::FloatSlide);
        assert_eq!(entry.bindings.len(), 2);
        assert_eq!(entry.bindings[0].target_dev, CvTargetDev::Proc(0));
    }

    #[test]
    fn float_slide_map_interpolates_the_declared_range() {
        let vars = table();
        let entry = vars.get("cutoff").unwrap();
        let mut rand = Random::from_seed(0);
        let env = EnvState::new();
        let value = entry
            .transform_value(&entry.bindings[0], &Value::Float(50.0), &env, &mut rand)
            .unwrap();
        assert_eq!(value, Value::Float(70.0));
    }

    #[test]
    fn expression_transform_binds_source_to_dollar() {
        let vars = table();
        let entry = vars.get("cutoff").unwrap();
        let mut rand = Random::from_seed(0);
        let env = EnvState::new();
        let value = entry
            .transform_value(&entry.bindings[1], &Value::Float(8.0), &env, &mut rand)
            .unwrap();
        assert_eq!(value, Value::Float(4.0));
    }

    #[test]
    fn map_on_non_slide_type_is_rejected() {
        let result = AuControlVars::from_json(&serde_json::json!([
            {
                "name": "x", "type": "float", "init": 0.0,
                "bindings": [ { "target": "proc_00", "var": "y", "map": [0.0, 1.0] } ]
            }
        ]));
        assert!(result.is_err());
    }
}
