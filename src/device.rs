//! The device model: ports, parameter values and the kernel interface.
//!
//! A device is a node in the signal graph. Audio units are containers with
//! a subgraph of processors; processors are leaves driven by a compiled-in
//! kernel implementing [`ProcImpl`]. Ports are mono and directional; a
//! stereo path uses a pair of ports.

use crate::device_state::{MixedRenderCtx, ProcExt, VoiceRenderCtx};
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::sample::Sample;
use crate::tstamp::Tstamp;
use crate::voice_state::VoiceState;

/// Identifies one device instance within a validated project.
pub type DeviceId = u32;

/// Direction of a device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// The device reads from this port.
    Receive,
    /// The device writes to this port.
    Send,
}

/// A parsed parameter value, keyed by the trailing component of a project
/// key (for example `p_f_cutoff.json`).
#[derive(Debug, Clone)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Tstamp(Tstamp),
    String(String),
    Envelope(Envelope),
    Sample(Sample),
    /// Unrecognised structure kept for kernels with free-form parameters.
    Json(serde_json::Value),
}

impl ParamValue {
    /// Parse a JSON document according to the key name prefix convention:
    /// `p_b_*` bool, `p_i_*` int, `p_f_*` float, `p_t_*` timestamp,
    /// `p_e_*` envelope, `p_s_*` string. Anything else is kept raw.
    pub fn from_key_json(key: &str, json: &serde_json::Value) -> Result<Self, EngineError> {
        let name = key.rsplit('/').next().unwrap_or(key);
        if name.starts_with("p_b_") {
            json.as_bool()
                .map(ParamValue::Bool)
                .ok_or_else(|| EngineError::format(format!("{}: expected a boolean", key)))
        } else if name.starts_with("p_i_") {
            json.as_i64()
                .map(ParamValue::Int)
                .ok_or_else(|| EngineError::format(format!("{}: expected an integer", key)))
        } else if name.starts_with("p_f_") {
            json.as_f64()
                .filter(|f| f.is_finite())
                .map(ParamValue::Float)
                .ok_or_else(|| EngineError::format(format!("{}: expected a finite number", key)))
        } else if name.starts_with("p_t_") {
            let pair = json.as_array().filter(|a| a.len() == 2);
            match pair {
                Some(items) => {
                    let beats = items[0]
                        .as_i64()
                        .ok_or_else(|| EngineError::format(format!("{}: bad timestamp", key)))?;
                    let rem = items[1]
                        .as_i64()
                        .ok_or_else(|| EngineError::format(format!("{}: bad timestamp", key)))?;
                    Ok(ParamValue::Tstamp(Tstamp::new(beats, rem)))
                }
                None => Err(EngineError::format(format!("{}: expected a timestamp pair", key))),
            }
        } else if name.starts_with("p_e_") {
            Envelope::from_json(json).map(ParamValue::Envelope)
        } else if name.starts_with("p_s_") {
            json.as_str()
                .map(|s| ParamValue::String(s.to_string()))
                .ok_or_else(|| EngineError::format(format!("{}: expected a string", key)))
        } else {
            Ok(ParamValue::Json(json.clone()))
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            ParamValue::Envelope(env) => Some(env),
            _ => None,
        }
    }
}

/// Interface of a compiled-in DSP kernel.
///
/// One kernel instance holds the immutable configuration of a processor;
/// transient data lives in [`ProcExt`](crate::device_state::ProcExt) for
/// mixed rendering and in
/// [`VoiceExt`](crate::voice_state::VoiceExt) per voice.
pub trait ProcImpl: std::fmt::Debug + Send {
    /// The `p_proc_type.json` identifier of this kernel.
    fn proc_type(&self) -> &'static str;

    /// Apply a string-keyed parameter update.
    ///
    /// Unknown keys are ignored so projects can carry annotations without
    /// breaking older kernels.
    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError>;

    /// Whether note triggers allocate a voice on this processor.
    fn supports_voices(&self) -> bool {
        false
    }

    /// Whether this kernel renders on the mixed signal path.
    fn has_mixed_output(&self) -> bool {
        false
    }

    /// Create the kernel's transient mixed-path state.
    fn new_ext(&self, _audio_rate: u32, _buf_size: usize) -> ProcExt {
        ProcExt::None
    }

    /// Initialise per-voice state at note-on.
    fn init_vstate(&self, _vstate: &mut VoiceState) {}

    /// Render one voice for `[buf_start, buf_stop)`.
    ///
    /// Returns the keep-alive stop index: a value below `buf_stop` tells
    /// the pool the voice produced nothing past that frame. A kernel that
    /// is finished must clear `vstate.active`.
    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        ctx.buf_stop
    }

    /// Render the mixed signal path for `[buf_start, buf_stop)`.
    fn render_mixed(&self, _ctx: &mut MixedRenderCtx) {}

    /// Update a named control variable on the mixed-path state.
    fn cv_set(&self, _ext: &mut ProcExt, _name: &str, _value: f64) {}

    fn cv_slide_target(&self, _ext: &mut ProcExt, _name: &str, _value: f64) {}

    fn cv_slide_length(&self, _ext: &mut ProcExt, _name: &str, _length: Tstamp) {}

    fn cv_osc_speed(&self, _ext: &mut ProcExt, _name: &str, _speed: f64) {}

    fn cv_osc_depth(&self, _ext: &mut ProcExt, _name: &str, _depth: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefixes_select_value_types() {
        let v = ParamValue::from_key_json("p_f_cutoff.json", &serde_json::json!(60.0)).unwrap();
        assert_eq!(v.as_float(), Some(60.0));

        let v = ParamValue::from_key_json("p_b_ramp.json", &serde_json::json!(true)).unwrap();
        assert_eq!(v.as_bool(), Some(true));

        let v =
            ParamValue::from_key_json("p_t_delay.json", &serde_json::json!([1, 0])).unwrap();
        assert!(matches!(v, ParamValue::Tstamp(ts) if ts.beats() == 1));

        assert!(ParamValue::from_key_json("p_f_x.json", &serde_json::json!("nope")).is_err());
    }

    #[test]
    fn nested_keys_use_final_component() {
        let v = ParamValue::from_key_json(
            "au_00/proc_01/c/p_f_volume.json",
            &serde_json::json!(-6.0),
        )
        .unwrap();
        assert_eq!(v.as_float(), Some(-6.0));
    }
}
