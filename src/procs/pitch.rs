//! Pitch stream kernel.
//!
//! Emits the per-sample pitch of a voice in Hz on send port 0, combining
//! the note pitch, slide, vibrato and an optional arpeggio. Other kernels
//! receive this stream on their pitch input ports.

use crate::device::{ParamValue, ProcImpl};
use crate::device_state::VoiceRenderCtx;
use crate::error::EngineError;
use crate::limits::ARPEGGIO_TONES_MAX;
use crate::note_controls::PitchControls;
use crate::voice_state::{VoiceExt, VoiceState};

/// Per-voice pitch state.
#[derive(Debug, Clone)]
pub struct PitchVoice {
    pub controls: PitchControls,
    pub orig_cents: f64,
    pub is_arpeggio_enabled: bool,
    /// Reference pitch of the arpeggio in cents.
    pub arpeggio_ref_cents: f64,
    /// Tones per second at the reference tempo.
    pub arpeggio_speed: f64,
    pub arpeggio_tone_progress: f64,
    pub arpeggio_tone_index: usize,
    pub arpeggio_tones: Vec<f64>,
}

impl Default for PitchVoice {
    fn default() -> Self {
        Self {
            controls: PitchControls::default(),
            orig_cents: 0.0,
            is_arpeggio_enabled: false,
            arpeggio_ref_cents: 0.0,
            arpeggio_speed: 24.0,
            arpeggio_tone_progress: 0.0,
            arpeggio_tone_index: 0,
            arpeggio_tones: Vec::new(),
        }
    }
}

impl PitchVoice {
    pub fn set_arpeggio(&mut self, ref_cents: f64, tones: Vec<f64>) {
        let mut tones = tones;
        tones.truncate(ARPEGGIO_TONES_MAX);
        self.arpeggio_ref_cents = ref_cents;
        self.arpeggio_tones = tones;
        self.arpeggio_tone_index = 0;
        self.arpeggio_tone_progress = 0.0;
        self.is_arpeggio_enabled = !self.arpeggio_tones.is_empty();
    }

    pub fn disable_arpeggio(&mut self) {
        self.is_arpeggio_enabled = false;
    }

    /// Return to the first tone; the tone list itself stays in place.
    pub fn reset_arpeggio(&mut self) {
        self.arpeggio_tone_index = 0;
        self.arpeggio_tone_progress = 0.0;
    }
}

#[derive(Debug)]
pub struct PitchProc;

impl PitchProc {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PitchProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for PitchProc {
    fn proc_type(&self) -> &'static str {
        "pitch"
    }

    fn set_param(&mut self, _key: &str, _value: &ParamValue) -> Result<(), EngineError> {
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        let mut voice = PitchVoice {
            orig_cents: vstate.orig_pitch_param,
            ..PitchVoice::default()
        };
        voice.controls = PitchControls::new(vstate.orig_pitch_param);
        vstate.ext = VoiceExt::Pitch(voice);
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let audio_rate = ctx.audio_rate;
        let tempo = ctx.tempo;

        let pvoice = match &mut ctx.vstate.ext {
            VoiceExt::Pitch(voice) => voice,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        let out = match ctx.voice_out.get_mut(&0) {
            Some(buf) => buf,
            None => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        let pc = &mut pvoice.controls;
        pc.set_tempo(tempo);

        out.set(buf_start as i32 - 1, pc.pitch as f32);

        // Base pitch with slide
        if pc.slider.in_progress() {
            let mut new_pitch = pc.pitch;
            for i in buf_start..buf_stop {
                new_pitch = pc.slider.step();
                out.set(i as i32, new_pitch as f32);
            }
            pc.pitch = new_pitch;
        } else {
            let pitch = pc.pitch as f32;
            for frame in &mut out.contents_mut()[buf_start..buf_stop] {
                *frame = pitch;
            }
        }

        // Carried pitch adjustment
        if pc.freq_mul != 1.0 {
            let mul = pc.freq_mul as f32;
            for frame in &mut out.contents_mut()[buf_start..buf_stop] {
                *frame *= mul;
            }
        }

        // Vibrato
        if pc.vibrato.active() {
            for i in buf_start..buf_stop {
                let factor = pc.vibrato.step() as f32;
                let frame = out.get(i as i32);
                out.set(i as i32, frame * factor);
            }
        }

        // Arpeggio
        if pvoice.is_arpeggio_enabled && !pvoice.arpeggio_tones.is_empty() {
            let progress_update =
                (pvoice.arpeggio_speed / audio_rate as f64) * (tempo / 60.0);
            for i in buf_start..buf_stop {
                let tone = pvoice.arpeggio_tones[pvoice.arpeggio_tone_index];
                let diff = ((tone - pvoice.arpeggio_ref_cents) / 1200.0).exp2() as f32;
                let frame = out.get(i as i32);
                out.set(i as i32, frame * diff);

                pvoice.arpeggio_tone_progress += progress_update;
                while pvoice.arpeggio_tone_progress >= 1.0 {
                    pvoice.arpeggio_tone_progress -= 1.0;
                    pvoice.arpeggio_tone_index =
                        (pvoice.arpeggio_tone_index + 1) % pvoice.arpeggio_tones.len();
                }
            }
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

    fn render(vstate: &mut VoiceState, frames: usize) -> Vec<f32> {
        let proc_ = PitchProc::new();
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
            audio_rate: 48000,
            buf_start: 0,
            buf_stop: frames,
            tempo: 120.0,
        };
        proc_.render_voice(&mut ctx);
        voice_out.get(&0).unwrap().contents().to_vec()
    }

    #[test]
    fn emits_constant_pitch_without_modifiers() {
        let proc_ = PitchProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        vstate.orig_pitch_param = 0.0;
        proc_.init_vstate(&mut vstate);

        let out = render(&mut vstate, 16);
        for &frame in &out {
            assert_relative_eq!(frame as f64, 440.0, max_relative = 1e-9);
        }
    }

    #[test]
    fn arpeggio_cycles_through_tones() {
        let proc_ = PitchProc::new();
        let mut vstate = VoiceState::new();
        vstate.init(0);
        proc_.init_vstate(&mut vstate);
        if let VoiceExt::Pitch(pv) = &mut vstate.ext {
            pv.set_arpeggio(0.0, vec![0.0, 1200.0]);
            // Fast enough to change within a short block
            pv.arpeggio_speed = 24000.0;
        }

        let out = render(&mut vstate, 8);
        assert_relative_eq!(out[0] as f64, 440.0, max_relative = 1e-9);
        assert!(out.iter().any(|&f| (f as f64 - 880.0).abs() < 1e-6));
    }
}
