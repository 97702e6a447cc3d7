//! Stream kernel.
//!
//! Exposes a linear control as a signal: send port 0 carries the current
//! value with any slide and oscillation applied. The mixed-path state acts
//! as a unit-wide parameter source driven by control variables; the voice
//! state gives each note its own stream, optionally carried across notes
//! through the channel.

use crate::controls::LinearControls;
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{MixedRenderCtx, ProcExt, VoiceRenderCtx};
use crate::error::EngineError;
use crate::tstamp::Tstamp;
use crate::voice_state::{VoiceExt, VoiceState};

/// Mixed-path stream state.
#[derive(Debug)]
pub struct StreamPState {
    pub init_value: f64,
    pub controls: LinearControls,
}

impl StreamPState {
    pub fn new(init_value: f64, audio_rate: u32) -> Self {
        let mut controls = LinearControls::new();
        controls.set_audio_rate(audio_rate);
        controls.set_tempo(120.0);
        controls.set_value(init_value);
        Self {
            init_value,
            controls,
        }
    }

    pub fn reset(&mut self) {
        let value = self.init_value;
        self.controls.set_value(value);
    }
}

/// Per-voice stream state.
#[derive(Debug, Clone, Default)]
pub struct StreamVoice {
    pub controls: LinearControls,
}

#[derive(Debug)]
pub struct StreamProc {
    init_value: f64,
}

impl StreamProc {
    pub fn new() -> Self {
        Self { init_value: 0.0 }
    }

    pub fn init_value(&self) -> f64 {
        self.init_value
    }
}

impl Default for StreamProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for StreamProc {
    fn proc_type(&self) -> &'static str {
        "stream"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        if key == "p_f_init_value.json" {
            let v = value.as_float().unwrap_or(0.0);
            self.init_value = if v.is_finite() { v } else { 0.0 };
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn has_mixed_output(&self) -> bool {
        true
    }

    fn new_ext(&self, audio_rate: u32, _buf_size: usize) -> ProcExt {
        ProcExt::Stream(StreamPState::new(self.init_value, audio_rate))
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        let mut voice = StreamVoice::default();
        voice.controls.set_value(self.init_value);
        vstate.ext = VoiceExt::Stream(voice);
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let tempo = ctx.tempo;
        let audio_rate = ctx.audio_rate;

        let svoice = match &mut ctx.vstate.ext {
            VoiceExt::Stream(voice) => voice,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        svoice.controls.set_audio_rate(audio_rate);
        svoice.controls.set_tempo(tempo);

        match ctx.voice_out.get_mut(&0) {
            Some(out) => {
                svoice.controls.fill_work_buffer(out, buf_start, buf_stop);
            }
            None => {
                svoice.controls.skip(buf_stop - buf_start);
            }
        }

        buf_stop
    }

    fn render_mixed(&self, ctx: &mut MixedRenderCtx) {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);
        let tempo = ctx.tempo;

        let state = match ctx.ext {
            ProcExt::Stream(state) => state,
            _ => return,
        };

        state.controls.set_tempo(tempo);

        match ctx.out_bufs.get_mut(&0) {
            Some(out) => {
                state.controls.fill_work_buffer(out, buf_start, buf_stop);
            }
            None => {
                state.controls.skip(buf_stop - buf_start);
            }
        }
    }

    fn cv_set(&self, ext: &mut ProcExt, _name: &str, value: f64) {
        if let ProcExt::Stream(state) = ext {
            state.controls.set_value(value);
        }
    }

    fn cv_slide_target(&self, ext: &mut ProcExt, _name: &str, value: f64) {
        if let ProcExt::Stream(state) = ext {
            state.controls.slide_target(value);
        }
    }

    fn cv_slide_length(&self, ext: &mut ProcExt, _name: &str, length: Tstamp) {
        if let ProcExt::Stream(state) = ext {
            state.controls.slide_length(length);
        }
    }

    fn cv_osc_speed(&self, ext: &mut ProcExt, _name: &str, speed: f64) {
        if let ProcExt::Stream(state) = ext {
            state.controls.osc_speed(speed);
        }
    }

    fn cv_osc_depth(&self, ext: &mut ProcExt, _name: &str, depth: f64) {
        if let ProcExt::Stream(state) = ext {
            state.controls.osc_depth(depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{WorkBuffer, WorkBuffers};
    use std::collections::BTreeMap;

    #[test]
    fn mixed_stream_emits_value_and_slides() {
        let mut proc_ = StreamProc::new();
        proc_
            .set_param("p_f_init_value.json", &ParamValue::Float(3.0))
            .unwrap();
        let mut ext = proc_.new_ext(1000, 16);

        let in_bufs = BTreeMap::new();
        let mut out_bufs = BTreeMap::new();
        out_bufs.insert(0u8, WorkBuffer::new(16));
        let mut wbs = WorkBuffers::new(16);

        {
            let mut ctx = MixedRenderCtx {
                in_bufs: &in_bufs,
                out_bufs: &mut out_bufs,
                ext: &mut ext,
                wbs: &mut wbs,
                audio_rate: 1000,
                buf_start: 0,
                buf_stop: 16,
                tempo: 120.0,
            };
            proc_.render_mixed(&mut ctx);
        }
        assert!(out_bufs
            .get(&0)
            .unwrap()
            .contents()
            .iter()
            .all(|&x| x == 3.0));

        // A slide moves the emitted values towards the target
        proc_.cv_slide_length(&mut ext, "value", Tstamp::new(1, 0));
        proc_.cv_slide_target(&mut ext, "value", 5.0);
        {
            let mut ctx = MixedRenderCtx {
                in_bufs: &in_bufs,
                out_bufs: &mut out_bufs,
                ext: &mut ext,
                wbs: &mut wbs,
                audio_rate: 1000,
                buf_start: 0,
                buf_stop: 16,
                tempo: 120.0,
            };
            proc_.render_mixed(&mut ctx);
        }
        let out = out_bufs.get(&0).unwrap().contents().to_vec();
        assert!(out[15] > out[0]);
        assert!(out[15] > 3.0 && out[15] < 5.0);
    }
}
