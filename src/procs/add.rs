//! Additive synthesis kernel.
//!
//! Sums copies of a single-cycle base waveform at per-tone pitch and volume
//! factors. Voice receive ports: 0 pitch (Hz), 1 force scale, 2 and 3 phase
//! modulation for the left and right channel. Send ports 0 and 1 carry the
//! stereo output.

use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, VoiceRenderCtx};
use crate::error::EngineError;
use crate::procs::apply_ramp_attack;
use crate::sample::Sample;
use crate::voice_state::{VoiceExt, VoiceState};
use std::f64::consts::TAU;

pub const ADD_TONES_MAX: usize = 32;
const ADD_BASE_FUNC_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct AddTone {
    pub pitch_factor: f64,
    pub volume_factor: f64,
    pub panning: f64,
}

impl Default for AddTone {
    fn default() -> Self {
        Self {
            pitch_factor: 0.0,
            volume_factor: 0.0,
            panning: 0.0,
        }
    }
}

/// Per-voice phase memory.
#[derive(Debug, Clone)]
pub struct AddVoice {
    pub tone_limit: usize,
    pub phases: [[f64; 2]; ADD_TONES_MAX],
}

impl Default for AddVoice {
    fn default() -> Self {
        Self {
            tone_limit: 0,
            phases: [[0.0; 2]; ADD_TONES_MAX],
        }
    }
}

#[derive(Debug)]
pub struct AddProc {
    base: Sample,
    tones: [AddTone; ADD_TONES_MAX],
    is_ramp_attack_enabled: bool,
}

impl AddProc {
    pub fn new() -> Self {
        let mut tones = [AddTone::default(); ADD_TONES_MAX];
        tones[0] = AddTone {
            pitch_factor: 1.0,
            volume_factor: 1.0,
            panning: 0.0,
        };
        Self {
            base: Sample::from_base_func(ADD_BASE_FUNC_SIZE, |x| (x * TAU).sin()),
            tones,
            is_ramp_attack_enabled: false,
        }
    }

    fn set_base_func(&mut self, name: &str) -> Result<(), EngineError> {
        let f: fn(f64) -> f64 = match name {
            "sine" => |x| (x * TAU).sin(),
            "triangle" => |x| 1.0 - 4.0 * (x - 0.5).abs(),
            "square" => |x| if x < 0.5 { 1.0 } else { -1.0 },
            "saw" => |x| 2.0 * x - 1.0,
            _ => {
                return Err(EngineError::format(format!(
                    "Unknown base function: {}",
                    name
                )))
            }
        };
        self.base = Sample::from_base_func(ADD_BASE_FUNC_SIZE, f);
        Ok(())
    }

    /// Tone parameters arrive under `tone_XX/`.
    fn set_tone_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        let index = usize::from_str_radix(&key[5..7], 16)
            .map_err(|_| EngineError::format(format!("Bad tone index in {}", key)))?;
        if index >= ADD_TONES_MAX {
            return Err(EngineError::format(format!("Tone index out of range: {}", key)));
        }
        let field = &key[8..];
        let tone = &mut self.tones[index];
        match field {
            "p_f_pitch.json" => {
                tone.pitch_factor = value.as_float().unwrap_or(0.0);
            }
            "p_f_volume.json" => {
                let db = value.as_float().unwrap_or(0.0);
                tone.volume_factor = super::db_to_scale(db);
            }
            "p_f_pan.json" => {
                tone.panning = value.as_float().unwrap_or(0.0).clamp(-1.0, 1.0);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for AddProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for AddProc {
    fn proc_type(&self) -> &'static str {
        "add"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        match key {
            "p_b_ramp_attack.json" => {
                self.is_ramp_attack_enabled = value.as_bool().unwrap_or(false);
            }
            "p_s_base_func.json" => {
                if let ParamValue::String(name) = value {
                    self.set_base_func(name)?;
                }
            }
            _ if key.starts_with("tone_") && key.len() > 8 => {
                self.set_tone_param(key, value)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        let mut voice = AddVoice::default();
        for (i, tone) in self.tones.iter().enumerate() {
            if tone.pitch_factor <= 0.0 || tone.volume_factor <= 0.0 {
                continue;
            }
            voice.tone_limit = i + 1;
            voice.phases[i] = [0.0; 2];
        }
        vstate.ext = VoiceExt::Add(voice);
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let inv_audio_rate = 1.0 / ctx.audio_rate as f64;
        let force = ctx.vstate.force;

        let add_state = match &mut ctx.vstate.ext {
            VoiceExt::Add(state) => state,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        let base_len = ADD_BASE_FUNC_SIZE as f64;

        for h in 0..add_state.tone_limit {
            let tone = &self.tones[h];
            if tone.pitch_factor <= 0.0 || tone.volume_factor <= 0.0 {
                continue;
            }
            let pannings = [-tone.panning, tone.panning];
            let pitch_factor_inv_rate = tone.pitch_factor * inv_audio_rate;

            for ch in 0..2 {
                let out = match ctx.voice_out.get_mut(&(ch as u8)) {
                    Some(buf) => buf,
                    None => continue,
                };
                let panning_factor = 1.0 + pannings[ch];
                let mut phase = add_state.phases[h][ch];

                let pitches = port_contents(ctx.voice_in, 0);
                let vol_scales = port_contents(ctx.voice_in, 1);
                let mods = port_contents(ctx.voice_in, 2 + ch as u8);

                let out_frames = out.contents_mut();
                for i in buf_start..buf_stop {
                    let actual_pitch =
                        pitches.map(|p| p[i] as f64).unwrap_or(440.0);
                    let vol_scale = vol_scales.map(|v| v[i] as f64).unwrap_or(1.0);
                    let mod_val = mods.map(|m| m[i] as f64).unwrap_or(0.0);

                    let actual_phase = phase + mod_val;
                    let wrapped = actual_phase - actual_phase.floor();
                    let value = self.base.value_at(0, wrapped * base_len) as f64
                        * tone.volume_factor
                        * panning_factor;

                    out_frames[i] += (value * vol_scale * force) as f32;

                    phase += actual_pitch * pitch_factor_inv_rate;
                    while phase >= 1.0 {
                        phase -= 1.0;
                    }
                }

                add_state.phases[h][ch] = phase;
            }
        }

        if self.is_ramp_attack_enabled {
            apply_ramp_attack(ctx.vstate, ctx.voice_out, &[0, 1], buf_start, buf_stop);
        }

        buf_stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{WorkBuffer, WorkBuffers};
    use crate::device_state::ProcExt;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn render(proc_: &AddProc, vstate: &mut VoiceState, frames: usize, rate: u32) -> Vec<f32> {
        let voice_in = BTreeMap::new();
        let mut voice_out = BTreeMap::new();
        voice_out.insert(0u8, WorkBuffer::new(frames));
        voice_out.insert(1u8, WorkBuffer::new(frames));
        let mut ext = ProcExt::None;
        let mut wbs = WorkBuffers::new(frames);

        let mut ctx = VoiceRenderCtx {
            vstate,
            voice_in: &voice_in,
            voice_out: &mut voice_out,
            ext: &mut ext,
            au_sustain: 0.0,
            wbs: &mut wbs,
            audio_rate: rate,
            buf_start: 0,
            buf_stop: frames,
            tempo: 120.0,
        };
        let stop = proc_.render_voice(&mut ctx);
        assert_eq!(stop, frames);
        voice_out.get(&0).unwrap().contents().to_vec()
    }

    #[test]
    fn default_tone_renders_a_sine_at_440() {
        let proc_ = AddProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let out = render(&proc_, &mut vstate, 64, 48000);
        assert_eq!(out[0], 0.0);
        let expected = (TAU * 440.0 * 12.0 / 48000.0).sin();
        assert_relative_eq!(out[12] as f64, expected, epsilon = 1e-5);
    }

    #[test]
    fn phase_continues_across_blocks() {
        let proc_ = AddProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let first = render(&proc_, &mut vstate, 32, 48000);
        let second = render(&proc_, &mut vstate, 32, 48000);
        let expected = (TAU * 440.0 * 32.0 / 48000.0).sin();
        assert_relative_eq!(second[0] as f64, expected, epsilon = 1e-5);
        assert_ne!(first[1], second[0]);
    }

    #[test]
    fn tone_volume_is_given_in_decibels() {
        let mut proc_ = AddProc::new();
        proc_
            .set_param("tone_00/p_f_volume.json", &ParamValue::Float(-6.0))
            .unwrap();
        assert_relative_eq!(proc_.tones[0].volume_factor, 0.501187, max_relative = 1e-5);
    }
}
