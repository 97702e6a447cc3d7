//! Continuous parameter primitives: sliders, LFOs, linear controls and the
//! time-envelope cursor.
//!
//! These are the building blocks every "smooth" parameter change goes
//! through. They are sample-deterministic: given the same audio rate, tempo
//! and sequence of set/slide calls, they produce bit-identical streams.

use crate::buffer::WorkBuffer;
use crate::envelope::Envelope;
use crate::tstamp::Tstamp;
use std::f64::consts::PI;

/// Interpolation shape of a [`Slider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlideMode {
    #[default]
    Linear,
    Exponential,
}

/// Slides a scalar from its current value to a target over a musical
/// duration.
#[derive(Debug, Clone)]
pub struct Slider {
    mode: SlideMode,
    audio_rate: u32,
    tempo: f64,
    length: Tstamp,
    from: f64,
    target: f64,
    value: f64,
    progress: f64,
    progress_update: f64,
    in_progress: bool,
}

impl Slider {
    pub fn new(mode: SlideMode) -> Self {
        Self {
            mode,
            audio_rate: 48000,
            tempo: 120.0,
            length: Tstamp::zero(),
            from: 0.0,
            target: 0.0,
            value: 0.0,
            progress: 1.0,
            progress_update: 0.0,
            in_progress: false,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn set_length(&mut self, length: Tstamp) {
        self.length = length;
        if self.in_progress {
            self.refresh_update();
        }
    }

    pub fn length(&self) -> Tstamp {
        self.length
    }

    /// Set the value directly, cancelling any slide.
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        self.from = value;
        self.target = value;
        self.progress = 1.0;
        self.in_progress = false;
    }

    /// Begin sliding from the current value towards `target`.
    ///
    /// A zero-length slide, or one whose target equals the current value,
    /// completes immediately.
    pub fn slide_target(&mut self, target: f64) {
        if target == self.value || self.length.is_zero() {
            self.set_value(target);
            return;
        }
        self.from = self.value;
        self.target = target;
        self.progress = 0.0;
        self.in_progress = true;
        self.refresh_update();
    }

    fn refresh_update(&mut self) {
        let frames = self.length.to_frames(self.tempo, self.audio_rate);
        self.progress_update = if frames > 0.0 { 1.0 / frames } else { 1.0 };
    }

    /// Advance one sample and return the new value.
    pub fn step(&mut self) -> f64 {
        if !self.in_progress {
            return self.value;
        }

        self.progress += self.progress_update;
        if self.progress >= 1.0 {
            self.value = self.target;
            self.from = self.target;
            self.in_progress = false;
            return self.value;
        }

        self.value = self.interpolate();
        self.value
    }

    fn interpolate(&self) -> f64 {
        // An infinite start has no usable midpoints; hold it until the
        // slide completes
        if !self.from.is_finite() {
            return self.from;
        }
        match self.mode {
            SlideMode::Linear => self.from + (self.target - self.from) * self.progress,
            SlideMode::Exponential => {
                if self.from > 0.0 && self.target > 0.0 {
                    self.from * (self.target / self.from).powf(self.progress)
                } else {
                    // Exponential interpolation needs same-sign operands;
                    // fall back to linear near zero crossings
                    self.from + (self.target - self.from) * self.progress
                }
            }
        }
    }

    /// Advance `frames` samples without observing intermediate values.
    pub fn skip(&mut self, frames: usize) {
        if !self.in_progress {
            return;
        }
        self.progress += self.progress_update * frames as f64;
        if self.progress >= 1.0 {
            self.value = self.target;
            self.from = self.target;
            self.in_progress = false;
        } else {
            self.value = self.interpolate();
        }
    }

    /// Rescale the remaining slide for a new tempo.
    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        if self.in_progress {
            self.refresh_update();
        }
    }

    /// Rescale the remaining slide for a new audio rate.
    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.audio_rate = audio_rate;
        if self.in_progress {
            self.refresh_update();
        }
    }
}

/// Output domain of an [`Lfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoMode {
    /// `step` returns the raw displacement `sin(phase) * depth`.
    Linear,
    /// `step` returns the factor `2^(sin(phase) * depth / 1200)`, the cents
    /// convention used by pitch vibrato.
    Exponential,
}

/// A low-frequency oscillator with slidable speed and depth.
///
/// Turning the LFO off lets the current half-cycle finish before the
/// oscillator deactivates, so modulated signals return to their centre
/// without a step.
#[derive(Debug, Clone)]
pub struct Lfo {
    mode: LfoMode,
    audio_rate: u32,
    tempo: f64,
    on: bool,
    phase: f64,
    speed: f64,
    depth: f64,
    speed_slider: Slider,
    depth_slider: Slider,
}

impl Lfo {
    pub fn new(mode: LfoMode) -> Self {
        Self {
            mode,
            audio_rate: 48000,
            tempo: 120.0,
            on: false,
            phase: 0.0,
            speed: 0.0,
            depth: 0.0,
            speed_slider: Slider::new(SlideMode::Linear),
            depth_slider: Slider::new(SlideMode::Linear),
        }
    }

    /// Whether stepping currently produces a non-neutral output.
    pub fn active(&self) -> bool {
        self.on || self.phase != 0.0
    }

    pub fn turn_on(&mut self) {
        self.on = true;
    }

    pub fn turn_off(&mut self) {
        self.on = false;
    }

    pub fn set_speed(&mut self, cycles_per_second: f64) {
        self.speed_slider.slide_target(cycles_per_second);
        if !self.active() {
            self.speed = cycles_per_second;
            self.speed_slider.set_value(cycles_per_second);
        }
    }

    pub fn set_speed_slide(&mut self, length: Tstamp) {
        self.speed_slider.set_length(length);
    }

    pub fn set_depth(&mut self, depth: f64) {
        self.depth_slider.slide_target(depth);
        if !self.active() {
            self.depth = depth;
            self.depth_slider.set_value(depth);
        }
    }

    pub fn set_depth_slide(&mut self, length: Tstamp) {
        self.depth_slider.set_length(length);
    }

    pub fn depth(&self) -> f64 {
        self.depth
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        self.speed_slider.set_tempo(tempo);
        self.depth_slider.set_tempo(tempo);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.audio_rate = audio_rate;
        self.speed_slider.set_audio_rate(audio_rate);
        self.depth_slider.set_audio_rate(audio_rate);
    }

    /// Advance one sample.
    pub fn step(&mut self) -> f64 {
        if !self.active() {
            return self.neutral();
        }

        self.speed = self.speed_slider.step();
        self.depth = self.depth_slider.step();

        let displacement = self.phase.sin() * self.depth;

        let update = self.speed * (self.tempo / 60.0) / self.audio_rate as f64 * 2.0 * PI;
        let prev_half = (self.phase / PI).floor();
        self.phase += update;
        if self.phase >= 2.0 * PI {
            self.phase -= 2.0 * PI;
        }

        // A stopped LFO deactivates at the next half-cycle boundary
        if !self.on && (self.phase / PI).floor() != prev_half {
            self.phase = 0.0;
        }

        match self.mode {
            LfoMode::Linear => displacement,
            LfoMode::Exponential => (displacement / 1200.0).exp2(),
        }
    }

    /// Advance `frames` samples, discarding the outputs.
    pub fn skip(&mut self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    fn neutral(&self) -> f64 {
        match self.mode {
            LfoMode::Linear => 0.0,
            LfoMode::Exponential => 1.0,
        }
    }
}

/// A streamable scalar control: value, value slider and oscillation.
///
/// The per-sample output is the slid value multiplied by the LFO factor.
#[derive(Debug, Clone)]
pub struct LinearControls {
    value: f64,
    slider: Slider,
    lfo: Lfo,
}

impl LinearControls {
    pub fn new() -> Self {
        Self {
            value: 0.0,
            slider: Slider::new(SlideMode::Linear),
            lfo: Lfo::new(LfoMode::Exponential),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        self.slider.set_value(value);
    }

    pub fn slide_target(&mut self, target: f64) {
        self.slider.slide_target(target);
    }

    pub fn slide_length(&mut self, length: Tstamp) {
        self.slider.set_length(length);
    }

    pub fn osc_speed(&mut self, cycles_per_second: f64) {
        self.lfo.set_speed(cycles_per_second);
        if cycles_per_second > 0.0 {
            self.lfo.turn_on();
        } else {
            self.lfo.turn_off();
        }
    }

    pub fn osc_depth(&mut self, depth: f64) {
        self.lfo.set_depth(depth);
        if depth != 0.0 {
            self.lfo.turn_on();
        }
    }

    pub fn osc_speed_slide(&mut self, length: Tstamp) {
        self.lfo.set_speed_slide(length);
    }

    pub fn osc_depth_slide(&mut self, length: Tstamp) {
        self.lfo.set_depth_slide(length);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.slider.set_tempo(tempo);
        self.lfo.set_tempo(tempo);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.slider.set_audio_rate(audio_rate);
        self.lfo.set_audio_rate(audio_rate);
    }

    /// Write samples for `[start, stop)` and carry the previous value into
    /// the prefix slot.
    pub fn fill_work_buffer(&mut self, wb: &mut WorkBuffer, start: usize, stop: usize) {
        wb.set(start as i32 - 1, self.value as f32);
        for i in start..stop {
            if self.slider.in_progress() {
                self.value = self.slider.step();
            }
            let factor = if self.lfo.active() { self.lfo.step() } else { 1.0 };
            wb.set(i as i32, (self.value * factor) as f32);
        }
    }

    /// Advance without writing.
    pub fn skip(&mut self, frames: usize) {
        if self.slider.in_progress() {
            self.slider.skip(frames);
            self.value = self.slider.value();
        }
        if self.lfo.active() {
            self.lfo.skip(frames);
        }
    }
}

impl Default for LinearControls {
    fn default() -> Self {
        Self::new()
    }
}

/// A cursor stepping through an [`Envelope`] in scaled real time.
#[derive(Debug, Clone)]
pub struct TimeEnvState {
    pos: f64,
    pub is_finished: bool,
    last_value: f64,
}

impl TimeEnvState {
    pub fn new() -> Self {
        Self {
            pos: 0.0,
            is_finished: false,
            last_value: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.is_finished = false;
        self.last_value = 0.0;
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    /// Render envelope values for `[buf_start, buf_stop)` into `out`.
    ///
    /// `freqs` is a per-frame pitch stream in Hz; elapsed time is scaled by
    /// `(freq / center_freq) ^ scale_amount`. Returns the index where
    /// processing stopped, which is less than `buf_stop` only when a
    /// non-looping envelope ran out mid-block (and `is_finished` is set).
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        env: &Envelope,
        loop_enabled: bool,
        scale_amount: f64,
        scale_center: f64,
        freqs: &[f32],
        out: &mut [f32],
        buf_start: usize,
        buf_stop: usize,
        audio_rate: u32,
    ) -> usize {
        if self.is_finished {
            return buf_start;
        }

        let dt = 1.0 / audio_rate as f64;
        let center_freq = 440.0 * (scale_center / 1200.0).exp2();
        let (last_x, _) = env.last_node();
        let loop_marks = if loop_enabled { env.loop_marks() } else { None };

        for i in buf_start..buf_stop {
            let value = env.value_at(self.pos);
            out[i] = value as f32;
            self.last_value = value;

            let time_scale = if scale_amount == 0.0 {
                1.0
            } else {
                let freq = freqs[i] as f64;
                if freq > 0.0 {
                    (freq / center_freq).powf(scale_amount)
                } else {
                    1.0
                }
            };

            self.pos += dt * time_scale;

            if let Some((loop_start, loop_end)) = loop_marks {
                let (loop_start_x, _) = env.node(loop_start);
                let (loop_end_x, _) = env.node(loop_end);
                if self.pos > loop_end_x {
                    let span = loop_end_x - loop_start_x;
                    if span > 0.0 {
                        self.pos = loop_start_x + (self.pos - loop_start_x) % span;
                    } else {
                        self.pos = loop_start_x;
                    }
                }
            } else if self.pos > last_x {
                self.is_finished = true;
                return i + 1;
            }
        }

        buf_stop
    }
}

impl Default for TimeEnvState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn slider_hits_target_exactly_without_overshoot() {
        // 4 beats at 120 BPM and 48000 Hz is 96000 frames
        let mut slider = Slider::new(SlideMode::Linear);
        slider.set_audio_rate(48000);
        slider.set_tempo(120.0);
        slider.set_value(f64::NEG_INFINITY);
        slider.set_length(Tstamp::new(4, 0));
        slider.slide_target(0.0);

        let mut value = slider.value();
        for _ in 0..96000 {
            value = slider.step();
            assert!(value <= 0.0, "slider overshot the target");
        }
        assert_eq!(value, 0.0);
        assert!(!slider.in_progress());
    }

    #[test]
    fn slide_to_current_value_completes_immediately() {
        let mut slider = Slider::new(SlideMode::Linear);
        slider.set_value(3.5);
        slider.set_length(Tstamp::new(2, 0));
        slider.slide_target(3.5);
        assert!(!slider.in_progress());
        assert_eq!(slider.step(), 3.5);
    }

    #[test]
    fn skip_matches_stepping() {
        let make = || {
            let mut s = Slider::new(SlideMode::Linear);
            s.set_audio_rate(1000);
            s.set_tempo(60.0);
            s.set_value(0.0);
            s.set_length(Tstamp::new(1, 0));
            s.slide_target(1.0);
            s
        };
        let mut stepped = make();
        for _ in 0..500 {
            stepped.step();
        }
        let mut skipped = make();
        skipped.skip(500);
        assert_relative_eq!(stepped.value(), skipped.value(), max_relative = 1e-9);
    }

    #[test]
    fn lfo_finishes_half_cycle_after_turn_off() {
        let mut lfo = Lfo::new(LfoMode::Linear);
        lfo.set_audio_rate(1000);
        lfo.set_tempo(60.0);
        lfo.set_speed(10.0);
        lfo.set_depth(1.0);
        lfo.turn_on();

        for _ in 0..10 {
            lfo.step();
        }
        lfo.turn_off();
        assert!(lfo.active());

        // 10 Hz at 1 kHz: a half cycle is 50 samples, so the LFO must stop
        // well within one full cycle
        let mut steps = 0;
        while lfo.active() && steps < 200 {
            lfo.step();
            steps += 1;
        }
        assert!(!lfo.active());
        assert!(steps <= 100);
        assert_eq!(lfo.step(), 0.0);
    }

    #[test]
    fn linear_controls_carry_previous_value_in_prefix() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(1000);
        lc.set_tempo(60.0);
        lc.set_value(2.0);

        let mut wb = WorkBuffer::new(8);
        lc.fill_work_buffer(&mut wb, 0, 8);
        assert_eq!(wb.get(-1), 2.0);
        assert!(wb.contents().iter().all(|&x| x == 2.0));
    }

    #[test]
    fn time_env_reports_finish_mid_block() {
        let env = Envelope::new(vec![(0.0, 1.0), (0.005, 0.0)]);
        let mut state = TimeEnvState::new();
        let freqs = vec![440.0_f32; 16];
        let mut out = vec![0.0_f32; 16];
        // 1 kHz rate: envelope of 5 ms ends after 5 frames
        let stop = state.process(&env, false, 0.0, 0.0, &freqs, &mut out, 0, 16, 1000);
        assert!(state.is_finished);
        assert!(stop < 16);
        assert_relative_eq!(out[0] as f64, 1.0);
    }
}
