//! Force stream kernel.
//!
//! Emits a per-sample linear force factor on send port 0: the note force
//! with its slide and tremolo, shaped by an optional attack envelope and,
//! once the note is off, a release envelope or a short release ramp.
//! Receive port 0 carries the pitch stream for envelope time scaling.

use crate::controls::TimeEnvState;
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, VoiceRenderCtx};
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::note_controls::ForceControls;
use crate::procs::db_to_scale;
use crate::voice_state::{VoiceExt, VoiceState};

/// Frames of the release ramp used when no release envelope is set.
const RAMP_RELEASE_TIME: f64 = 200.0;

#[derive(Debug, Clone, Default)]
pub struct ForceVoice {
    pub controls: ForceControls,
    pub env_state: TimeEnvState,
    pub release_env_state: TimeEnvState,
    pub release_ramp_progress: f64,
}

#[derive(Debug)]
pub struct ForceProc {
    global_force_db: f64,
    force_variation_db: f64,
    env: Option<Envelope>,
    env_enabled: bool,
    env_loop_enabled: bool,
    env_scale_amount: f64,
    env_scale_center: f64,
    release_env: Option<Envelope>,
    release_env_enabled: bool,
    release_env_scale_amount: f64,
    release_env_scale_center: f64,
    release_ramp_enabled: bool,
    default_release_env: Envelope,
}

impl ForceProc {
    pub fn new() -> Self {
        Self {
            global_force_db: 0.0,
            force_variation_db: 0.0,
            env: None,
            env_enabled: false,
            env_loop_enabled: false,
            env_scale_amount: 0.0,
            env_scale_center: 0.0,
            release_env: None,
            release_env_enabled: false,
            release_env_scale_amount: 0.0,
            release_env_scale_center: 0.0,
            release_ramp_enabled: false,
            // A plain 1 -> 0 fade over 200 ms
            default_release_env: Envelope::new(vec![(0.0, 1.0), (0.2, 0.0)]),
        }
    }

}

impl Default for ForceProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for ForceProc {
    fn proc_type(&self) -> &'static str {
        "force"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        match key {
            "p_f_global_force.json" => {
                self.global_force_db = value.as_float().unwrap_or(0.0);
            }
            "p_f_force_variation.json" => {
                self.force_variation_db = value.as_float().unwrap_or(0.0).max(0.0);
            }
            "p_e_env.json" => {
                self.env = value.as_envelope().cloned();
            }
            "p_b_env_enabled.json" => {
                self.env_enabled = value.as_bool().unwrap_or(false);
            }
            "p_b_env_loop_enabled.json" => {
                self.env_loop_enabled = value.as_bool().unwrap_or(false);
            }
            "p_f_env_scale_amount.json" => {
                self.env_scale_amount = value.as_float().unwrap_or(0.0);
            }
            "p_f_env_scale_center.json" => {
                self.env_scale_center = value.as_float().unwrap_or(0.0);
            }
            "p_e_env_rel.json" => {
                self.release_env = value.as_envelope().cloned();
            }
            "p_b_env_rel_enabled.json" => {
                self.release_env_enabled = value.as_bool().unwrap_or(false);
            }
            "p_f_env_rel_scale_amount.json" => {
                self.release_env_scale_amount = value.as_float().unwrap_or(0.0);
            }
            "p_f_env_rel_scale_center.json" => {
                self.release_env_scale_center = value.as_float().unwrap_or(0.0);
            }
            "p_b_release_ramp.json" => {
                self.release_ramp_enabled = value.as_bool().unwrap_or(false);
            }
            _ => {}
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        // Note-on force variation, drawn from the parameter stream
        if self.force_variation_db > 0.0 {
            let variation = (vstate.rand_p.next_f64() - 0.5) * self.force_variation_db;
            vstate.force *= db_to_scale(variation);
        }
        vstate.ext = VoiceExt::Force(ForceVoice::default());
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let audio_rate = ctx.audio_rate;
        let tempo = ctx.tempo;
        let note_on = ctx.vstate.note_on;
        let base_force = ctx.vstate.force;

        let fvoice = match &mut ctx.vstate.ext {
            VoiceExt::Force(voice) => voice,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        let global_scale = db_to_scale(self.global_force_db);

        // Attack/sustain envelope values into scratch first
        let env_values: Option<Vec<f32>> = if self.env_enabled {
            self.env.as_ref().map(|env| {
                let mut values = vec![0.0_f32; buf_stop];
                let freqs = fixed_or_input(ctx.voice_in, buf_stop);
                let env_stop = fvoice.env_state.process(
                    env,
                    self.env_loop_enabled,
                    self.env_scale_amount,
                    self.env_scale_center,
                    &freqs,
                    &mut values,
                    buf_start,
                    buf_stop,
                    audio_rate,
                );
                if fvoice.env_state.is_finished {
                    // Hold the final envelope value for the rest of the note
                    let last = fvoice.env_state.last_value() as f32;
                    for value in values.iter_mut().take(buf_stop).skip(env_stop) {
                        *value = last;
                    }
                }
                values
            })
        } else {
            None
        };

        // Release shaping
        let mut release_values = vec![1.0_f32; buf_stop];
        let mut new_stop = buf_stop;
        let mut finished = false;
        let mut has_release = false;

        if !note_on {
            has_release = true;
            if self.release_env_enabled || self.release_env.is_some() || !self.release_ramp_enabled
            {
                let env = self
                    .release_env
                    .as_ref()
                    .filter(|_| self.release_env_enabled)
                    .unwrap_or(&self.default_release_env);
                let freqs = fixed_or_input(ctx.voice_in, buf_stop);
                let stop = fvoice.release_env_state.process(
                    env,
                    false,
                    self.release_env_scale_amount,
                    self.release_env_scale_center,
                    &freqs,
                    &mut release_values,
                    buf_start,
                    buf_stop,
                    audio_rate,
                );
                if fvoice.release_env_state.is_finished {
                    for value in release_values.iter_mut().take(buf_stop).skip(stop) {
                        *value = 0.0;
                    }
                    new_stop = stop;
                    finished = true;
                }
            } else {
                // Plain linear ramp to silence
                let step = 1.0 / RAMP_RELEASE_TIME;
                let mut progress = fvoice.release_ramp_progress;
                for (i, value) in release_values
                    .iter_mut()
                    .enumerate()
                    .take(buf_stop)
                    .skip(buf_start)
                {
                    if progress >= 1.0 {
                        *value = 0.0;
                        if !finished {
                            new_stop = i;
                            finished = true;
                        }
                    } else {
                        *value = (1.0 - progress) as f32;
                        progress += step;
                    }
                }
                fvoice.release_ramp_progress = progress;
            }
        }

        let fc = &mut fvoice.controls;
        fc.set_tempo(tempo);

        let mut wrote_output = false;
        if let Some(out) = ctx.voice_out.get_mut(&0) {
            wrote_output = true;
            for i in buf_start..buf_stop {
                if fc.slider.in_progress() {
                    fc.force_db = fc.slider.step();
                }
                let mut db = fc.force_db;
                if fc.tremolo.active() {
                    db += fc.tremolo.step();
                }
                let mut force = base_force * db_to_scale(db) * global_scale;
                if let Some(env_values) = &env_values {
                    force *= env_values[i] as f64;
                }
                force *= release_values[i] as f64;
                out.set(i as i32, force as f32);
            }
        }

        if !wrote_output {
            ctx.vstate.active = false;
            return buf_start;
        }
        if has_release {
            ctx.vstate.mark_release_data(new_stop);
        }
        if finished {
            ctx.vstate.set_finished();
        }

        new_stop
    }
}

fn fixed_or_input(
    voice_in: &std::collections::BTreeMap<u8, crate::buffer::WorkBuffer>,
    len: usize,
) -> Vec<f32> {
    match port_contents(voice_in, 0) {
        Some(freqs) => freqs[..len.min(freqs.len())].to_vec(),
        None => vec![440.0; len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{WorkBuffer, WorkBuffers};
    use crate::device_state::ProcExt;
    use std::collections::BTreeMap;

    fn render(proc_: &ForceProc, vstate: &mut VoiceState, frames: usize) -> (Vec<f32>, usize) {
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
        let stop = proc_.render_voice(&mut ctx);
        (voice_out.get(&0).unwrap().contents().to_vec(), stop)
    }

    #[test]
    fn held_note_emits_unity_force() {
        let proc_ = ForceProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let (out, stop) = render(&proc_, &mut vstate, 16);
        assert_eq!(stop, 16);
        assert!(out.iter().all(|&f| (f - 1.0).abs() < 1e-6));
    }

    #[test]
    fn release_fades_to_silence_and_finishes() {
        let proc_ = ForceProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);
        vstate.set_note_off();

        // Default release envelope: 200 ms at 1 kHz is 200 frames
        let (out, stop) = render(&proc_, &mut vstate, 256);
        assert!(stop < 256);
        assert!(vstate.has_finished);
        assert!(out[0] > 0.9);
        assert_eq!(out[255], 0.0);
        assert!(vstate.has_release_data);
    }

    #[test]
    fn global_force_scales_output() {
        let mut proc_ = ForceProc::new();
        proc_
            .set_param("p_f_global_force.json", &ParamValue::Float(-20.0))
            .unwrap();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);

        let (out, _) = render(&proc_, &mut vstate, 4);
        assert!((out[0] - 0.1).abs() < 1e-6);
    }
}
