//! Schroeder reverb kernel.
//!
//! Eight parallel comb filters followed by four allpasses per channel,
//! with the classic tuning table. Receive port 0 carries the (mono) audio
//! input; ports 2 and 3 stream the reflectivity and damp parameters, which
//! fall back to the stored settings when unconnected. Reflectivity is
//! mapped into the feedback domain as `2^(-5 / refl)` and damp is given as
//! a percentage.

use crate::buffer::{WorkBuffer, WorkBufferId};
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, MixedRenderCtx, ProcExt};
use crate::error::EngineError;

const FREEVERB_COMBS: usize = 8;
const FREEVERB_ALLPASSES: usize = 4;

const FIXED_GAIN: f64 = 0.015;
const STEREO_SPREAD: f64 = 0.000521542;

const COMB_TUNING: [f64; FREEVERB_COMBS] = [
    0.025306123,
    0.026938776,
    0.028956917,
    0.030748300,
    0.032244898,
    0.033809524,
    0.035306123,
    0.036666667,
];

const ALLPASS_TUNING: [f64; FREEVERB_ALLPASSES] = [
    0.012607710,
    0.010000001,
    0.007732427,
    0.005102041,
];

#[derive(Debug, Clone)]
struct Comb {
    buffer: Vec<f32>,
    pos: usize,
    filter_store: f32,
}

impl Comb {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            pos: 0,
            filter_store: 0.0,
        }
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.filter_store = 0.0;
        self.pos = 0;
    }

    fn process(
        &mut self,
        out: &mut [f32],
        input: &[f32],
        refls: &[f32],
        damps: &[f32],
        start: usize,
        stop: usize,
    ) {
        for i in start..stop {
            let delayed = self.buffer[self.pos];
            out[i] += delayed;

            let damp = damps[i];
            self.filter_store = delayed * (1.0 - damp) + self.filter_store * damp;
            self.buffer[self.pos] = input[i] + self.filter_store * refls[i];

            self.pos += 1;
            if self.pos >= self.buffer.len() {
                self.pos = 0;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Allpass {
    buffer: Vec<f32>,
    pos: usize,
    feedback: f32,
}

impl Allpass {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            pos: 0,
            feedback: 0.5,
        }
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }

    fn process(&mut self, frames: &mut [f32], start: usize, stop: usize) {
        for frame in frames[start..stop].iter_mut() {
            let input = *frame;
            let delayed = self.buffer[self.pos];
            *frame = -input + delayed;
            self.buffer[self.pos] = input + delayed * self.feedback;

            self.pos += 1;
            if self.pos >= self.buffer.len() {
                self.pos = 0;
            }
        }
    }
}

/// Transient reverb state.
#[derive(Debug)]
pub struct FreeverbPState {
    combs: [Vec<Comb>; 2],
    allpasses: [Vec<Allpass>; 2],
}

impl FreeverbPState {
    pub fn new(audio_rate: u32) -> Self {
        let mut state = Self {
            combs: [Vec::new(), Vec::new()],
            allpasses: [Vec::new(), Vec::new()],
        };
        state.set_audio_rate(audio_rate);
        state
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        let rate = audio_rate as f64;
        for ch in 0..2 {
            let spread = if ch == 0 { 0.0 } else { STEREO_SPREAD };
            self.combs[ch] = COMB_TUNING
                .iter()
                .map(|&t| Comb::new(((t + spread) * rate) as usize))
                .collect();
            self.allpasses[ch] = ALLPASS_TUNING
                .iter()
                .map(|&t| Allpass::new(((t + spread) * rate) as usize))
                .collect();
        }
    }

    pub fn clear_history(&mut self) {
        for ch in 0..2 {
            for comb in &mut self.combs[ch] {
                comb.clear();
            }
            for allpass in &mut self.allpasses[ch] {
                allpass.clear();
            }
        }
    }
}

#[derive(Debug)]
pub struct FreeverbProc {
    /// Reflectivity setting used when port 2 is unconnected.
    reflect_setting: f64,
    /// Damp percentage used when port 3 is unconnected.
    damp_setting: f64,
    gain: f64,
}

impl FreeverbProc {
    pub fn new() -> Self {
        Self {
            reflect_setting: 200.0,
            damp_setting: 50.0,
            gain: FIXED_GAIN,
        }
    }
}

impl Default for FreeverbProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcImpl for FreeverbProc {
    fn proc_type(&self) -> &'static str {
        "freeverb"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        match key {
            "p_f_refl.json" => {
                self.reflect_setting = value.as_float().unwrap_or(200.0).max(0.001);
            }
            "p_f_damp.json" => {
                self.damp_setting = value.as_float().unwrap_or(50.0).clamp(0.0, 100.0);
            }
            _ => {}
        }
        Ok(())
    }

    fn has_mixed_output(&self) -> bool {
        true
    }

    fn new_ext(&self, audio_rate: u32, _buf_size: usize) -> ProcExt {
        ProcExt::Freeverb(FreeverbPState::new(audio_rate))
    }

    fn render_mixed(&self, ctx: &mut MixedRenderCtx) {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);

        let state = match ctx.ext {
            ProcExt::Freeverb(state) => state,
            _ => return,
        };

        // Per-sample reflectivity, mapped into the feedback domain
        let (refl_wb, damp_wb) = ctx.wbs.get_pair_mut(WorkBufferId::Impl1, WorkBufferId::Impl2);
        {
            let refls = refl_wb.contents_mut();
            match port_contents(ctx.in_bufs, 2) {
                Some(values) => {
                    const MAX_PARAM_INV: f64 = -5.0 / 200.0;
                    const MIN_PARAM_INV: f64 = -5.0 / 0.001;
                    for i in buf_start..buf_stop {
                        let param_inv = -5.0 / (values[i] as f64).max(0.0);
                        refls[i] = param_inv.clamp(MIN_PARAM_INV, MAX_PARAM_INV).exp2() as f32;
                    }
                }
                None => {
                    let fixed = (-5.0 / self.reflect_setting).exp2() as f32;
                    refls[buf_start..buf_stop].fill(fixed);
                }
            }

            let damps = damp_wb.contents_mut();
            match port_contents(ctx.in_bufs, 3) {
                Some(values) => {
                    for i in buf_start..buf_stop {
                        damps[i] = (values[i] * 0.01).clamp(0.0, 1.0);
                    }
                }
                None => {
                    let fixed = (self.damp_setting * 0.01) as f32;
                    damps[buf_start..buf_stop].fill(fixed);
                }
            }
        }

        // The comb input is the gained mono mix of the input
        let input = port_contents(ctx.in_bufs, 0);
        {
            let comb_input = ctx.wbs.get_mut(WorkBufferId::Impl3).contents_mut();
            match input {
                Some(values) => {
                    let gain = (2.0 * self.gain) as f32;
                    for i in buf_start..buf_stop {
                        comb_input[i] = values[i] * gain;
                    }
                }
                None => comb_input[buf_start..buf_stop].fill(0.0),
            }
        }

        for ch in 0..2usize {
            let out = match ctx.out_bufs.get_mut(&(ch as u8)) {
                Some(buf) => buf,
                None => continue,
            };
            let frames = out.contents_mut();
            frames[buf_start..buf_stop].fill(0.0);

            let refls = ctx.wbs.get(WorkBufferId::Impl1).contents();
            let damps = ctx.wbs.get(WorkBufferId::Impl2).contents();
            let comb_input = ctx.wbs.get(WorkBufferId::Impl3).contents();

            for comb in &mut state.combs[ch] {
                comb.process(frames, comb_input, refls, damps, buf_start, buf_stop);
            }
            for allpass in &mut state.allpasses[ch] {
                allpass.process(frames, buf_start, buf_stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WorkBuffers;
    use std::collections::BTreeMap;

    fn render_impulse(frames: usize) -> Vec<f32> {
        let proc_ = FreeverbProc::new();
        let mut ext = proc_.new_ext(48000, frames);

        let mut in_bufs = BTreeMap::new();
        let mut input = WorkBuffer::new(frames);
        input.contents_mut()[0] = 1.0;
        in_bufs.insert(0u8, input);

        let mut out_bufs = BTreeMap::new();
        out_bufs.insert(0u8, WorkBuffer::new(frames));
        out_bufs.insert(1u8, WorkBuffer::new(frames));

        let mut wbs = WorkBuffers::new(frames);
        let mut ctx = MixedRenderCtx {
            in_bufs: &in_bufs,
            out_bufs: &mut out_bufs,
            ext: &mut ext,
            wbs: &mut wbs,
            audio_rate: 48000,
            buf_start: 0,
            buf_stop: frames,
            tempo: 120.0,
        };
        proc_.render_mixed(&mut ctx);
        out_bufs.get(&0).unwrap().contents().to_vec()
    }

    #[test]
    fn impulse_produces_a_delayed_tail() {
        // The shortest comb is ~25 ms, i.e. ~1214 frames at 48 kHz
        let out = render_impulse(4096);
        assert!(out[..1000].iter().all(|&x| x.abs() < 1e-6));
        assert!(out.iter().any(|&x| x.abs() > 1e-6));
    }

    #[test]
    fn comb_buffer_sizes_follow_the_tuning_table() {
        let state = FreeverbPState::new(48000);
        assert_eq!(
            state.combs[0][0].buffer.len(),
            (COMB_TUNING[0] * 48000.0) as usize
        );
        assert!(state.combs[1][0].buffer.len() > state.combs[0][0].buffer.len());
    }
}
