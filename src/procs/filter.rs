//! Two-pole lowpass filter kernel.
//!
//! Receive port 0 streams the cutoff parameter, port 1 the resonance, and
//! ports 2 and 3 the stereo audio input; send ports 0 and 1 carry the
//! output. Filter coefficients are recomputed only when a parameter moves
//! by more than 0.01, and the old and new responses are crossfaded to keep
//! the transition silent. The crossfade is faster at low resonance. The
//! cutoff parameter maps to `2^((param + CUTOFF_BIAS) / 12)` Hz and the
//! filter bypasses itself at the Nyquist frequency.
//!
//! Voices additionally carry an auto-wah: a delayed LFO that displaces the
//! cutoff parameter stream before the coefficients are derived from it.

use crate::buffer::{WorkBuffer, WorkBufferId};
use crate::device::{ParamValue, ProcImpl};
use crate::device_state::{port_contents, MixedRenderCtx, ProcExt, VoiceRenderCtx};
use crate::error::EngineError;
use crate::note_controls::AutowahControls;
use crate::voice_state::{VoiceExt, VoiceState};
use std::collections::BTreeMap;
use std::f64::consts::PI;

const CUTOFF_INF_LIMIT: f64 = 100.0;
const CUTOFF_BIAS: f64 = 81.37631656229591;
const FILTER_XFADE_SPEED_MIN: f64 = 40.0;
const FILTER_XFADE_SPEED_MAX: f64 = 200.0;
const MAX_CUTOFF_CHANGE: f64 = 0.01;
const MAX_RESONANCE_CHANGE: f64 = 0.01;

pub const FILTER_DEFAULT_CUTOFF: f64 = 100.0;
pub const FILTER_DEFAULT_RESONANCE: f64 = 0.0;

fn get_cutoff_freq(param: f64) -> f64 {
    if param >= CUTOFF_INF_LIMIT {
        f64::INFINITY
    } else {
        ((param.max(-100.0) + CUTOFF_BIAS) / 12.0).exp2()
    }
}

fn get_resonance(param: f64) -> f64 {
    let clamped = param.clamp(0.0, 100.0);
    1.055_f64.powf(clamped) * 0.5
}

fn get_xfade_step(audio_rate: f64, true_cutoff: f64, resonance_param: f64) -> f64 {
    if true_cutoff >= audio_rate * 0.5 {
        return FILTER_XFADE_SPEED_MAX / audio_rate;
    }
    let range = FILTER_XFADE_SPEED_MAX - FILTER_XFADE_SPEED_MIN;
    let norm = resonance_param.clamp(0.0, 100.0) / 100.0;
    (FILTER_XFADE_SPEED_MAX - norm * range) / audio_rate
}

/// One set of biquad coefficients with per-channel history.
#[derive(Debug, Clone)]
struct SingleFilterState {
    b: [f64; 3],
    a: [f64; 2],
    x_hist: [[f64; 2]; 2],
    y_hist: [[f64; 2]; 2],
}

impl SingleFilterState {
    fn bypass() -> Self {
        Self {
            b: [1.0, 0.0, 0.0],
            a: [0.0, 0.0],
            x_hist: [[0.0; 2]; 2],
            y_hist: [[0.0; 2]; 2],
        }
    }

    /// Two-pole lowpass design at a normalised frequency.
    fn design(freq_norm: f64, resonance: f64) -> Self {
        let w0 = 2.0 * PI * freq_norm.clamp(0.0001, 0.4999);
        let alpha = w0.sin() / (2.0 * resonance.max(0.05));
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b: [
                (1.0 - cos_w0) / 2.0 / a0,
                (1.0 - cos_w0) / a0,
                (1.0 - cos_w0) / 2.0 / a0,
            ],
            a: [-2.0 * cos_w0 / a0, (1.0 - alpha) / a0],
            x_hist: [[0.0; 2]; 2],
            y_hist: [[0.0; 2]; 2],
        }
    }

    fn clear_history(&mut self) {
        self.x_hist = [[0.0; 2]; 2];
        self.y_hist = [[0.0; 2]; 2];
    }

    #[inline]
    fn process(&mut self, ch: usize, x: f64) -> f64 {
        let xh = &mut self.x_hist[ch];
        let yh = &mut self.y_hist[ch];
        let y = self.b[0] * x + self.b[1] * xh[0] + self.b[2] * xh[1]
            - self.a[0] * yh[0]
            - self.a[1] * yh[1];
        xh[1] = xh[0];
        xh[0] = x;
        yh[1] = yh[0];
        yh[0] = y;
        y
    }
}

/// Shared transient state of the filter, used by both the mixed path and
/// individual voices.
#[derive(Debug, Clone)]
pub struct FilterStateImpl {
    anything_rendered: bool,
    applied_cutoff: f64,
    applied_resonance: f64,
    true_cutoff: f64,
    xfade_pos: f64,
    xfade_update: f64,
    state_used: i32,
    xfade_state_used: i32,
    states: [SingleFilterState; 2],
}

impl FilterStateImpl {
    pub fn new() -> Self {
        Self {
            anything_rendered: false,
            applied_cutoff: FILTER_DEFAULT_CUTOFF,
            applied_resonance: FILTER_DEFAULT_RESONANCE,
            true_cutoff: f64::INFINITY,
            xfade_pos: 1.0,
            xfade_update: 0.0,
            state_used: -1,
            xfade_state_used: -1,
            states: [SingleFilterState::bypass(), SingleFilterState::bypass()],
        }
    }

    fn apply_segment(
        &mut self,
        ins: &[Option<&[f32]>; 2],
        outs: &mut BTreeMap<u8, WorkBuffer>,
        xfade_start: f64,
        xfade_step: f64,
        start: usize,
        stop: usize,
    ) {
        if start >= stop {
            return;
        }

        // No filter built yet: pass the signal through untouched
        if self.state_used == -1 && self.xfade_state_used == -1 {
            for ch in 0..2u8 {
                if let (Some(input), Some(out)) = (ins[ch as usize], outs.get_mut(&ch)) {
                    let frames = out.contents_mut();
                    frames[start..stop].copy_from_slice(&input[start..stop]);
                }
            }
            return;
        }

        for ch in 0..2usize {
            let input = match ins[ch] {
                Some(input) => input,
                None => continue,
            };
            let out = match outs.get_mut(&(ch as u8)) {
                Some(out) => out,
                None => continue,
            };
            let frames = out.contents_mut();

            let mut xfade = xfade_start.min(1.0);
            let (cur, old) = (self.state_used, self.xfade_state_used);

            for i in start..stop {
                let x = input[i] as f64;

                let mut result = if cur > -1 {
                    // Split borrow of the two states is avoided by indexing
                    // one at a time
                    self.states[cur as usize].process(ch, x)
                } else {
                    x
                };

                if xfade < 1.0 {
                    let fade_result = if old > -1 {
                        self.states[old as usize].process(ch, x)
                    } else {
                        x
                    };
                    result = result * xfade + fade_result * (1.0 - xfade);
                    xfade += xfade_step;
                }

                frames[i] = result as f32;
            }
        }
    }

    /// Run the filter over one block, tracking parameter changes.
    #[allow(clippy::too_many_arguments)]
    pub fn process_block(
        &mut self,
        cutoffs: &[f32],
        resonances: &[f32],
        ins: &[Option<&[f32]>; 2],
        outs: &mut BTreeMap<u8, WorkBuffer>,
        buf_start: usize,
        buf_stop: usize,
        audio_rate: u32,
    ) {
        let audio_rate = audio_rate as f64;
        let nyquist = audio_rate * 0.5;

        self.xfade_update = get_xfade_step(audio_rate, self.true_cutoff, self.applied_resonance);

        let mut seg_start = buf_start;
        let mut xfade_start = self.xfade_pos;

        for i in buf_start..buf_stop {
            let cutoff = cutoffs[i] as f64;
            let resonance = resonances[i] as f64;

            let needs_update = self.xfade_pos >= 1.0
                && ((cutoff - self.applied_cutoff).abs() > MAX_CUTOFF_CHANGE
                    || (resonance - self.applied_resonance).abs() > MAX_RESONANCE_CHANGE);

            if needs_update {
                // Finish the current segment with the old settings
                self.apply_segment(ins, outs, xfade_start, self.xfade_update, seg_start, i);
                seg_start = i;

                self.xfade_state_used = self.state_used;
                self.xfade_pos = if self.anything_rendered { 0.0 } else { 1.0 };

                self.applied_cutoff = cutoff;
                self.true_cutoff = get_cutoff_freq(cutoff);
                self.applied_resonance = resonance;

                self.xfade_update =
                    get_xfade_step(audio_rate, self.true_cutoff, self.applied_resonance);

                if self.true_cutoff < nyquist {
                    let new_state = 1 - self.state_used.abs();
                    let freq_norm = self.true_cutoff.max(1.0) / audio_rate;
                    let resonance_q = get_resonance(self.applied_resonance);
                    self.states[new_state as usize] =
                        SingleFilterState::design(freq_norm, resonance_q);
                    self.states[new_state as usize].clear_history();
                    self.state_used = new_state;
                } else {
                    if self.state_used == -1 {
                        self.xfade_pos = 1.0;
                    }
                    self.state_used = -1;
                }

                xfade_start = self.xfade_pos;
            }

            self.anything_rendered = true;
            self.xfade_pos += self.xfade_update;
        }

        self.apply_segment(
            ins,
            outs,
            xfade_start,
            self.xfade_update,
            seg_start,
            buf_stop,
        );
    }
}

/// Per-voice filter state.
#[derive(Debug, Clone)]
pub struct FilterVoice {
    pub state: FilterStateImpl,
    pub autowah: AutowahControls,
}

impl Default for FilterVoice {
    fn default() -> Self {
        Self {
            state: FilterStateImpl::new(),
            autowah: AutowahControls::default(),
        }
    }
}

impl Default for FilterStateImpl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct FilterProc {
    cutoff: f64,
    resonance: f64,
}

impl FilterProc {
    pub fn new() -> Self {
        Self {
            cutoff: FILTER_DEFAULT_CUTOFF,
            resonance: FILTER_DEFAULT_RESONANCE,
        }
    }
}

impl Default for FilterProc {
    fn default() -> Self {
        Self::new()
    }
}

fn fill_param_buffers(
    wbs: &mut crate::buffer::WorkBuffers,
    cutoff_in: Option<&[f32]>,
    resonance_in: Option<&[f32]>,
    def_cutoff: f64,
    def_resonance: f64,
    buf_start: usize,
    buf_stop: usize,
) {
    let (cutoff_wb, resonance_wb) = wbs.get_pair_mut(WorkBufferId::Impl1, WorkBufferId::Impl2);

    let cutoffs = cutoff_wb.contents_mut();
    match cutoff_in {
        Some(values) => cutoffs[buf_start..buf_stop].copy_from_slice(&values[buf_start..buf_stop]),
        None => cutoffs[buf_start..buf_stop].fill(def_cutoff as f32),
    }

    let resonances = resonance_wb.contents_mut();
    match resonance_in {
        Some(values) => {
            resonances[buf_start..buf_stop].copy_from_slice(&values[buf_start..buf_stop])
        }
        None => resonances[buf_start..buf_stop].fill(def_resonance as f32),
    }
}

impl ProcImpl for FilterProc {
    fn proc_type(&self) -> &'static str {
        "filter"
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        match key {
            "p_f_cutoff.json" => {
                self.cutoff = value.as_float().unwrap_or(FILTER_DEFAULT_CUTOFF);
            }
            "p_f_resonance.json" => {
                self.resonance = value.as_float().unwrap_or(FILTER_DEFAULT_RESONANCE);
            }
            _ => {}
        }
        Ok(())
    }

    fn supports_voices(&self) -> bool {
        true
    }

    fn has_mixed_output(&self) -> bool {
        true
    }

    fn new_ext(&self, _audio_rate: u32, _buf_size: usize) -> ProcExt {
        ProcExt::Filter(FilterStateImpl::new())
    }

    fn init_vstate(&self, vstate: &mut VoiceState) {
        vstate.ext = VoiceExt::Filter(FilterVoice::default());
    }

    fn render_voice(&self, ctx: &mut VoiceRenderCtx) -> usize {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);

        if port_contents(ctx.voice_in, 2).is_none() && port_contents(ctx.voice_in, 3).is_none() {
            ctx.vstate.active = false;
            return buf_start;
        }

        fill_param_buffers(
            ctx.wbs,
            port_contents(ctx.voice_in, 0),
            port_contents(ctx.voice_in, 1),
            self.cutoff,
            self.resonance,
            buf_start,
            buf_stop,
        );

        let fvoice = match &mut ctx.vstate.ext {
            VoiceExt::Filter(voice) => voice,
            _ => {
                ctx.vstate.active = false;
                return buf_start;
            }
        };

        // Auto-wah displaces the cutoff stream before the coefficients are
        // derived from it
        if fvoice.autowah.active() {
            fvoice.autowah.set_tempo(ctx.tempo);
            fvoice.autowah.set_audio_rate(ctx.audio_rate);
            let cutoffs = ctx.wbs.get_mut(WorkBufferId::Impl1).contents_mut();
            for frame in cutoffs[buf_start..buf_stop].iter_mut() {
                *frame += fvoice.autowah.step() as f32;
            }
        }

        let ins = [port_contents(ctx.voice_in, 2), port_contents(ctx.voice_in, 3)];
        let cutoffs = ctx.wbs.get(WorkBufferId::Impl1).contents();
        let resonances = ctx.wbs.get(WorkBufferId::Impl2).contents();

        fvoice.state.process_block(
            cutoffs,
            resonances,
            &ins,
            ctx.voice_out,
            buf_start,
            buf_stop,
            ctx.audio_rate,
        );

        buf_stop
    }

    fn render_mixed(&self, ctx: &mut MixedRenderCtx) {
        let (buf_start, buf_stop) = (ctx.buf_start, ctx.buf_stop);

        fill_param_buffers(
            ctx.wbs,
            port_contents(ctx.in_bufs, 0),
            port_contents(ctx.in_bufs, 1),
            self.cutoff,
            self.resonance,
            buf_start,
            buf_stop,
        );

        let state = match ctx.ext {
            ProcExt::Filter(state) => state,
            _ => return,
        };

        let ins = [port_contents(ctx.in_bufs, 2), port_contents(ctx.in_bufs, 3)];
        let cutoffs = ctx.wbs.get(WorkBufferId::Impl1).contents();
        let resonances = ctx.wbs.get(WorkBufferId::Impl2).contents();

        state.process_block(
            cutoffs,
            resonances,
            &ins,
            ctx.out_bufs,
            buf_start,
            buf_stop,
            ctx.audio_rate,
        );
    }
}
