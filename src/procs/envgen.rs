//! Envelope generator kernel.
//!
//! Renders a time envelope into send port 0, scaled by the pitch stream on
//! receive port 0 and shaped by the force scale stream on receive port 1.
//! In linear-force mode the output is produced in the linear domain and
//! converted to decibels with a global adjustment; otherwise the envelope
//! is mapped onto `[y_min, y_max]` and emitted additively.

use crate::buffer::WorkBufferId;
use crate::controls::TimeEnvState;
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, VoiceRenderCtx};
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::procs::scale_to_db;
use crate::voice_state::{VoiceExt, VoiceState};

#[derive(Debug, Clone, Default)]
pub struct EnvgenVoice {
    pub env_state: TimeEnvState,
}

#[derive(Debug)]
pub struct EnvgenProc {
    time_env: Option<Envelope>,
    time_env_enabled: bool,
    loop_enabled: bool,
    is_release_env: bool,
    scale_amount: f64,
    scale_center: f64,
    force_env: Option<Envelope>,
    force_env_enabled: bool,
    is_linear_force: bool,
    global_adjust: f64,
    y_min: f64,
    y_max: f64,
}

impl EnvgenProc {
    pub fn new() -> Self {
        Self {
            time_env: None,
            time_env_enabled: false,
            loop_enabled: false,
            is_release_env: false,
            scale_amount: 0.0,
            scale_center: 0.0,
            force_env: None,
            force_env_enabled: false,
            is_linear_force: false,
            global_adjust: 0.0,
            y_min: 0.0,
            y_max: 1.0,
        }
    }
}

impl Default for EnvgenProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for EnvgenProc {
    fn proc_type(&self) -> &'static str {
        "envgen"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        match key {
            "p_e_env.json" => self.time_env = value.as_envelope().cloned(),
            "p_b_env_enabled.json" => {
                self.time_env_enabled = value.as_bool().unwrap_or(false)
            }
            "p_b_env_loop_enabled.json" => {
                self.loop_enabled = value.as_bool().unwrap_or(false)
            }
            "p_b_release_env.json" => {
                self.is_release_env = value.as_bool().unwrap_or(false)
            }
            "p_f_env_scale_amount.json" => {
                self.scale_amount = value.as_float().unwrap_or(0.0)
            }
            "p_f_env_scale_center.json" => {
                self.scale_center = value.as_float().unwrap_or(0.0)
            }
            "p_e_force_env.json" => self.force_env = value.as_envelope().cloned(),
            "p_b_force_env_enabled.json" => {
                self.force_env_enabled = value.as_bool().unwrap_or(false)
            }
            "p_b_linear_force.json" => {
                self.is_linear_force = value.as_bool().unwrap_or(false)
            }
            "p_f_global_adjust.json" => {
                self.global_adjust = value.as_float().unwrap_or(0.0)
            }
            "p_f_y_min.json" => self.y_min = value.as_float().unwrap_or(0.0),
            "p_f_y_max.json" => self.y_max = value.as_float().unwrap_or(1.0),
            _ => {}
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        vstate.ext = VoiceExt::Envgen(EnvgenVoice::default());
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let audio_rate = ctx.audio_rate;
        let note_on = ctx.vstate.note_on;

        let evoice = match &mut ctx.vstate.ext {
            VoiceExt::Envgen(voice) => voice,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        if ctx.voice_out.get(&0).is_none() {
            ctx.vstate.active = false;
            return buf_start;
        }

        let range_width = self.y_max - self.y_min;
        let new_buf_stop = buf_stop;

        // Pitch input, defaulting to the reference pitch
        let freqs: Vec<f32> = match port_contents(ctx.voice_in, 0) {
            Some(p) => p[..buf_stop.min(p.len())].to_vec(),
            None => vec![440.0; buf_stop],
        };
        let force_scales: Option<Vec<f32>> =
            port_contents(ctx.voice_in, 1).map(|f| f[..buf_stop.min(f.len())].to_vec());

        let env_active = self.time_env_enabled
            && self.time_env.is_some()
            && (!self.is_release_env || !note_on);

        {
            let time_env_wb = ctx.wbs.get_mut(WorkBufferId::TimeEnv);
            let scratch = time_env_wb.contents_mut();

            if env_active {
                let env = self.time_env.as_ref().unwrap_or_else(|| unreachable!());
                let env_stop = evoice.env_state.process(
                    env,
                    self.loop_enabled,
                    self.scale_amount,
                    self.scale_center,
                    &freqs,
                    scratch,
                    buf_start,
                    new_buf_stop,
                    audio_rate,
                );
                if evoice.env_state.is_finished {
                    let (_, last_value) = env.last_node();
                    for frame in scratch[env_stop..new_buf_stop].iter_mut() {
                        *frame = last_value as f32;
                    }
                }
            } else {
                for frame in scratch[buf_start..new_buf_stop].iter_mut() {
                    *frame = 1.0;
                }
            }
        }

        // Shape and write the output
        let scratch = ctx.wbs.get(WorkBufferId::TimeEnv).contents();
        let out = match ctx.voice_out.get_mut(&0) {
            Some(buf) => buf,
            None => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };
        let out_frames = out.contents_mut();

        if self.is_linear_force {
            for i in buf_start..new_buf_stop {
                let mut value = scratch[i] as f64;
                if let Some(force_scales) = &force_scales {
                    let force = force_scales[i] as f64;
                    if self.force_env_enabled && self.force_env.is_some() {
                        let env = self.force_env.as_ref().unwrap_or_else(|| unreachable!());
                        value *= env.value_at(force.min(1.0));
                    } else {
                        value *= force;
                    }
                }
                out_frames[i] = (scale_to_db(value) + self.global_adjust) as f32;
            }
        } else {
            for i in buf_start..new_buf_stop {
                let env_value = self.y_min + scratch[i] as f64 * range_width;
                let mut value = env_value + self.global_adjust;
                if let Some(force_scales) = &force_scales {
                    value += scale_to_db(force_scales[i] as f64);
                }
                out_frames[i] = value as f32;
            }
        }

        new_buf_stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{WorkBuffer, WorkBuffers};
    use crate::device_state::ProcExt;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn render(proc_: &EnvgenProc, vstate: &mut VoiceState, frames: usize) -> Vec<f32> {
        let voice_in = BTreeMap::new();
        let mut voice_out = BTreeMap::new();
        voice_out.insert(0u8, WorkBuffer::new(frames));
        let mut ext = ProcExt::None;
        let mut wbs = WorkBuffers::new(frames);

        let mut ctx = VoiceRenderCtx {
            vstate,
            voice_in: &voice_in,
            voice_out: &mut voice_out,
            ext: &mut ext,
            au_sustain: 0.0,
            wbs: &mut wbs,
            audio_rate: 1000,
            buf_start: 0,
            buf_stop: frames,
            tempo: 120.0,
        };
        proc_.render_voice(&mut ctx);
        voice_out.get(&0).unwrap().contents().to_vec()
    }

    #[test]
    fn disabled_envelope_emits_range_maximum() {
        let proc_ = EnvgenProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let out = render(&proc_, &mut vstate, 8);
        // Neutral envelope value 1 mapped onto [0, 1]
        assert!(out.iter().all(|&f| (f - 1.0).abs() < 1e-6));
    }

    #[test]
    fn envelope_is_mapped_to_y_range() {
        let mut proc_ = EnvgenProc::new();
        let env = Envelope::new(vec![(0.0, 1.0), (1.0, 1.0)]);
        proc_.time_env = Some(env);
        proc_.time_env_enabled = true;
        proc_.y_min = 2.0;
        proc_.y_max = 6.0;

        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let out = render(&proc_, &mut vstate, 8);
        assert_relative_eq!(out[3] as f64, 6.0, max_relative = 1e-6);
    }

    #[test]
    fn finished_envelope_holds_last_value() {
        let mut proc_ = EnvgenProc::new();
        proc_.time_env = Some(Envelope::new(vec![(0.0, 0.5), (0.002, 0.25)]));
        proc_.time_env_enabled = true;

        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        // 2 ms envelope at 1 kHz ends after 2 frames
        let out = render(&proc_, &mut vstate, 8);
        assert_relative_eq!(out[7] as f64, 0.25, max_relative = 1e-6);
    }
}
