//! Audio units.
//!
//! An audio unit is the instrument/effect abstraction: a table of
//! processors, optional nested units, an internal connection graph and a
//! pair of interface devices that mirror the unit's external ports so the
//! subgraph can connect to the outside world by name. Parameter envelopes
//! and the control variable table also live here.

use crate::connections::{ConnLevel, Connections};
use crate::control_vars::{AuControlVars, CvTargetDev};
use crate::device::{DeviceId, ParamValue};
use crate::device_state::DeviceStates;
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::expr::EnvState;
use crate::limits::{AUDIO_UNITS_MAX, PROCESSORS_MAX};
use crate::processor::Processor;
use crate::random::Random;
use crate::tstamp::Tstamp;
use crate::value::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuType {
    #[default]
    Instrument,
    Effect,
}

/// A control-variable update operation.
#[derive(Debug, Clone)]
pub enum CvOp {
    Set(Value),
    SlideTarget(f64),
    SlideLength(Tstamp),
    OscSpeed(f64),
    OscDepth(f64),
    /// Apply initial values to every bound target.
    Init,
}

#[derive(Debug, Default)]
pub struct AudioUnit {
    pub existent: bool,
    pub au_type: AuType,
    pub procs: BTreeMap<usize, Processor>,
    pub sub_aus: BTreeMap<usize, AudioUnit>,
    pub connections: Option<Connections>,
    pub control_vars: Option<AuControlVars>,

    pub env_force_volume: Option<Envelope>,
    pub env_force_volume_enabled: bool,
    pub env_force_filter: Option<Envelope>,
    pub env_force_filter_enabled: bool,
    pub env_pitch_pan: Option<Envelope>,
    pub env_pitch_pan_enabled: bool,

    pub device_id: DeviceId,
    pub in_iface_id: DeviceId,
    pub out_iface_id: DeviceId,
}

impl AudioUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one key below this unit's directory.
    pub fn set_key(&mut self, subkey: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        if let Some(rest) = subkey.strip_prefix("au_") {
            return self.set_sub_au_key(rest, json);
        }
        if let Some(rest) = subkey.strip_prefix("proc_") {
            return self.set_proc_key(rest, json);
        }

        match subkey {
            "p_manifest.json" => {
                self.existent = !json.is_null();
                if let Some(type_name) = json.get("type").and_then(|t| t.as_str()) {
                    self.au_type = match type_name {
                        "effect" => AuType::Effect,
                        _ => AuType::Instrument,
                    };
                }
            }
            "p_connections.json" => {
                self.connections = Some(Connections::from_json(json, ConnLevel::Au)?);
            }
            "p_control_vars.json" => {
                self.control_vars = Some(AuControlVars::from_json(json)?);
            }
            "p_env_force_volume.json" => {
                self.env_force_volume = Some(Envelope::from_json(json)?);
            }
            "p_b_env_force_volume_enabled.json" => {
                self.env_force_volume_enabled = json.as_bool().unwrap_or(false);
            }
            "p_env_force_filter.json" => {
                self.env_force_filter = Some(Envelope::from_json(json)?);
            }
            "p_b_env_force_filter_enabled.json" => {
                self.env_force_filter_enabled = json.as_bool().unwrap_or(false);
            }
            "p_env_pitch_pan.json" => {
                self.env_pitch_pan = Some(Envelope::from_json(json)?);
            }
            "p_b_env_pitch_pan_enabled.json" => {
                self.env_pitch_pan_enabled = json.as_bool().unwrap_or(false);
            }
            _ => {}
        }
        Ok(())
    }

    fn set_sub_au_key(&mut self, rest: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        let (index, subkey) = split_indexed_key(rest, 2)?;
        if index >= AUDIO_UNITS_MAX {
            return Err(EngineError::format("Audio unit index out of range"));
        }
        self.sub_aus
            .entry(index)
            .or_insert_with(AudioUnit::new)
            .set_key(subkey, json)
    }

    fn set_proc_key(&mut self, rest: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        let (index, subkey) = split_indexed_key(rest, 2)?;
        if index >= PROCESSORS_MAX {
            return Err(EngineError::format("Processor index out of range"));
        }
        let proc_ = self.procs.entry(index).or_insert_with(Processor::new);

        match subkey {
            "p_manifest.json" => {
                proc_.existent = !json.is_null();
                Ok(())
            }
            "p_proc_type.json" => {
                let name = json
                    .as_str()
                    .ok_or_else(|| EngineError::format("Processor type is not a string"))?;
                proc_.set_proc_type(name)
            }
            _ => {
                // Parameters live under the c/ and i/ subdirectories
                let param_key = subkey
                    .strip_prefix("c/")
                    .or_else(|| subkey.strip_prefix("i/"))
                    .unwrap_or(subkey);
                let value = ParamValue::from_key_json(param_key, json)?;
                proc_.set_param(param_key, &value)
            }
        }
    }

    /// Processor indices that allocate voices, in the unit's internal
    /// processing order.
    pub fn voice_proc_order(&self) -> Vec<usize> {
        let mut order = Vec::new();
        if let Some(connections) = &self.connections {
            for &key in connections.topo_order() {
                let node = connections.node(key);
                if let Some(digits) = node.name.strip_prefix("proc_") {
                    if let Ok(index) = usize::from_str_radix(digits, 16) {
                        if self
                            .procs
                            .get(&index)
                            .map(|p| p.existent && p.supports_voices())
                            .unwrap_or(false)
                        {
                            order.push(index);
                        }
                    }
                }
            }
        }
        order
    }

    /// Apply a control variable operation through its bindings.
    pub fn update_control_var(
        &self,
        name: &str,
        op: &CvOp,
        dstates: &mut DeviceStates,
        env: &EnvState,
        rand: &mut Random,
    ) {
        let vars = match &self.control_vars {
            Some(vars) => vars,
            None => return,
        };
        let entry = match vars.get(name) {
            Some(entry) => entry,
            None => return,
        };

        for binding in &entry.bindings {
            match binding.target_dev {
                CvTargetDev::Proc(index) => {
                    let proc_ = match self.procs.get(&index) {
                        Some(p) if p.existent => p,
                        _ => continue,
                    };
                    let kernel = match &proc_.kernel {
                        Some(kernel) => kernel,
                        None => continue,
                    };
                    let state = match dstates.get_mut(proc_.device_id) {
                        Some(state) => state,
                        None => continue,
                    };
                    let proc_state = match state.proc_state_mut() {
                        Some(proc_state) => proc_state,
                        None => continue,
                    };

                    match op {
                        CvOp::Set(value) => {
                            if let Some(value) =
                                entry.transform_value(binding, value, env, rand)
                            {
                                if let Some(value) = value.as_float() {
                                    kernel.cv_set(
                                        &mut proc_state.ext,
                                        &binding.target_var,
                                        value,
                                    );
                                }
                            }
                        }
                        CvOp::SlideTarget(value) => {
                            if let Some(value) = entry
                                .transform_value(binding, &Value::Float(*value), env, rand)
                                .and_then(|v| v.as_float())
                            {
                                kernel.cv_slide_target(
                                    &mut proc_state.ext,
                                    &binding.target_var,
                                    value,
                                );
                            }
                        }
                        CvOp::SlideLength(length) => {
                            kernel.cv_slide_length(
                                &mut proc_state.ext,
                                &binding.target_var,
                                *length,
                            );
                        }
                        CvOp::OscSpeed(speed) => {
                            kernel.cv_osc_speed(&mut proc_state.ext, &binding.target_var, *speed);
                        }
                        CvOp::OscDepth(depth) => {
                            // Oscillation depth scales with the binding's
                            // target range for mapped variables
                            let scaled = match &binding.transform {
                                crate::control_vars::CvTransform::FloatSlideMap {
                                    map_min_to,
                                    map_max_to,
                                } => {
                                    let range = map_max_to - map_min_to;
                                    let span = entry.max - entry.min;
                                    if span > 0.0 {
                                        depth * range / span
                                    } else {
                                        *depth
                                    }
                                }
                                _ => *depth,
                            };
                            kernel.cv_osc_depth(&mut proc_state.ext, &binding.target_var, scaled);
                        }
                        CvOp::Init => {
                            if let Some(value) = entry
                                .transform_value(binding, &entry.init_value, env, rand)
                                .and_then(|v| v.as_float())
                            {
                                kernel.cv_set(&mut proc_state.ext, &binding.target_var, value);
                            }
                        }
                    }
                }
                CvTargetDev::Au(index) => {
                    // Forward into the nested unit under the same name
                    if let Some(sub_au) = self.sub_aus.get(&index) {
                        sub_au.update_control_var(&binding.target_var, op, dstates, env, rand);
                    }
                }
            }
        }
    }
}

/// Split `XXrest` into a two-hex-digit index and the key after the slash.
fn split_indexed_key(rest: &str, digits: usize) -> Result<(usize, &str), EngineError> {
    if rest.len() < digits + 1 {
        return Err(EngineError::format("Truncated key"));
    }
    let index = usize::from_str_radix(&rest[..digits], 16)
        .map_err(|_| EngineError::format("Bad index in key"))?;
    if &rest[digits..digits + 1] != "/" {
        return Err(EngineError::format("Missing '/' after index in key"));
    }
    Ok((index, &rest[digits + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_route_to_processors() {
        let mut au = AudioUnit::new();
        au.set_key("p_manifest.json", &serde_json::json!({"type": "instrument"}))
            .unwrap();
        au.set_key("proc_00/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        au.set_key("proc_00/p_proc_type.json", &serde_json::json!("add"))
            .unwrap();
        au.set_key(
            "proc_00/c/p_b_ramp_attack.json",
            &serde_json::json!(true),
        )
        .unwrap();

        assert!(au.existent);
        let proc_ = au.procs.get(&0).unwrap();
        assert!(proc_.existent);
        assert_eq!(proc_.proc_type(), Some("add"));
    }

    #[test]
    fn voice_procs_follow_connection_order() {
        let mut au = AudioUnit::new();
        au.set_key("p_manifest.json", &serde_json::json!({})).unwrap();
        for (i, ty) in [(0usize, "add"), (1, "force")] {
            au.set_key(&format!("proc_{:02x}/p_manifest.json", i), &serde_json::json!({}))
                .unwrap();
            au.set_key(
                &format!("proc_{:02x}/p_proc_type.json", i),
                &serde_json::json!(ty),
            )
            .unwrap();
        }
        // force feeds add, so it must come first in processing order
        au.set_key(
            "p_connections.json",
            &serde_json::json!([
                ["proc_01/C/out_00", "proc_00/C/in_01"],
                ["proc_00/C/out_00", "out_00"],
            ]),
        )
        .unwrap();

        assert_eq!(au.voice_proc_order(), vec![1, 0]);
    }

    #[test]
    fn unknown_au_keys_are_ignored() {
        let mut au = AudioUnit::new();
        au.set_key("p_unknown_widget.json", &serde_json::json!(42))
            .unwrap();
    }
}
