//! Panning kernel.
//!
//! Scales the left channel by `1 - pan` and the right by `1 + pan`, with
//! the panning parameter streamed on receive port 0 and clamped per sample
//! to `[-1, 1]`. Audio arrives on receive ports 1 and 2 and leaves on send
//! ports 0 and 1. Works on both the voice and the mixed path.

use crate::buffer::WorkBuffer;
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, MixedRenderCtx, VoiceRenderCtx};
use crate::error::EngineError;
use crate::voice_state::{VoiceExt, VoiceState};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct PanningVoice {
    pub def_panning: f64,
}

#[derive(Debug)]
pub struct PanningProc {
    panning: f64,
}

impl PanningProc {
    pub fn new() -> Self {
        Self { panning: 0.0 }
    }
}

impl Default for PanningProc {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_panning(
    pan_values: Option<&[f32]>,
    def_pan: f64,
    in_bufs: &BTreeMap<u8, WorkBuffer>,
    out_bufs: &mut BTreeMap<u8, WorkBuffer>,
    buf_start: usize,
    buf_stop: usize,
) {
    for ch in 0..2u8 {
        let in_frames = match port_contents(in_bufs, 1 + ch) {
            Some(frames) => frames,
            None => continue,
        };
        let out = match out_bufs.get_mut(&ch) {
            Some(buf) => buf,
            None => continue,
        };
        let out_frames = out.contents_mut();
        let side = if ch == 0 { -1.0_f32 } else { 1.0_f32 };
        for i in buf_start..buf_stop {
            let pan = pan_values
                .map(|p| p[i])
                .unwrap_or(def_pan as f32)
                .clamp(-1.0, 1.0);
            out_frames[i] = in_frames[i] * (1.0 + side * pan);
        }
    }
}

impl ProcImpl for PanningProc {
    fn proc_type(&self) -> &'static str {
        "panning"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        if key == "p_f_panning.json" {
            self.panning = value.as_float().unwrap_or(0.0).clamp(-1.0, 1.0);
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn has_mixed_output(&self) -> bool {
        true
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        vstate.ext = VoiceExt::Panning(PanningVoice {
            def_panning: self.panning,
        });
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);

        let def_panning = match &ctx.vstate.ext {
            VoiceExt::Panning(voice) => voice.def_panning,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        if port_contents(ctx.voice_in, 1).is_none() && port_contents(ctx.voice_in, 2).is_none() {
            ctx.vstate.active = false;
            return buf_start;
        }

        let pan_values = port_contents(ctx.voice_in, 0);
        apply_panning(
            pan_values,
            def_panning,
            ctx.voice_in,
            ctx.voice_out,
            buf_start,
            buf_stop,
        );

        buf_stop
    }

    fn render_mixed(&self, ctx: &mut MixedRenderCtx) {
        let pan_values = port_contents(ctx.in_bufs, 0);
        apply_panning(
            pan_values,
            self.panning,
            ctx.in_bufs,
            ctx.out_bufs,
            ctx.buf_start,
            ctx.buf_stop,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WorkBuffers;
    use crate::device_state::ProcExt;

    #[test]
    fn hard_left_mutes_the_right_channel() {
        let proc_ = PanningProc::new();
        let mut in_bufs = BTreeMap::new();
        let mut pan = WorkBuffer::new(4);
        pan.contents_mut().fill(-1.0);
        in_bufs.insert(0u8, pan);
        let mut left = WorkBuffer::new(4);
        left.contents_mut().fill(0.5);
        in_bufs.insert(1u8, left);
        let mut right = WorkBuffer::new(4);
        right.contents_mut().fill(0.5);
        in_bufs.insert(2u8, right);

        let mut out_bufs = BTreeMap::new();
        out_bufs.insert(0u8, WorkBuffer::new(4));
        out_bufs.insert(1u8, WorkBuffer::new(4));

        let mut ext = ProcExt::None;
        let mut wbs = WorkBuffers::new(4);
        let mut ctx = MixedRenderCtx {
            in_bufs: &in_bufs,
            out_bufs: &mut out_bufs,
            ext: &mut ext,
            wbs: &mut wbs,
            audio_rate: 48000,
            buf_start: 0,
            buf_stop: 4,
            tempo: 120.0,
        };
        proc_.render_mixed(&mut ctx);

        assert!(out_bufs.get(&0).unwrap().contents().iter().all(|&x| x == 1.0));
        assert!(out_bufs.get(&1).unwrap().contents().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn centre_panning_passes_audio_through() {
        let proc_ = PanningProc::new();
        let mut in_bufs = BTreeMap::new();
        let mut left = WorkBuffer::new(4);
        left.contents_mut().fill(0.25);
        in_bufs.insert(1u8, left);
        let mut right = WorkBuffer::new(4);
        right.contents_mut().fill(0.75);
        in_bufs.insert(2u8, right);

        let mut out_bufs = BTreeMap::new();
        out_bufs.insert(0u8, WorkBuffer::new(4));
        out_bufs.insert(1u8, WorkBuffer::new(4));

        let mut ext = ProcExt::None;
        let mut wbs = WorkBuffers::new(4);
        let mut ctx = MixedRenderCtx {
            in_bufs: &in_bufs,
            out_bufs: &mut out_bufs,
            ext: &mut ext,
            wbs: &mut wbs,
            audio_rate: 48000,
            buf_start: 0,
            buf_stop: 4,
            tempo: 120.0,
        };
        proc_.render_mixed(&mut ctx);

        assert_eq!(out_bufs.get(&0).unwrap().contents()[0], 0.25);
        assert_eq!(out_bufs.get(&1).unwrap().contents()[0], 0.75);
    }
}
