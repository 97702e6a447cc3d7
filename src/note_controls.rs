//! Carried pitch and force controls.
//!
//! A channel keeps one set of these for portamento and legato: when carry
//! is enabled, a new note starts from the channel's carried state instead
//! of its own parameters. The pitch and force processors hold their own
//! copies inside voice state and step them per sample.

use crate::controls::{Lfo, LfoMode, SlideMode, Slider};
use crate::tstamp::Tstamp;

/// Convert cents relative to 440 Hz into a frequency.
#[inline]
pub fn cents_to_freq(cents: f64) -> f64 {
    440.0 * (cents / 1200.0).exp2()
}

/// Pitch value, slide and vibrato of one note.
#[derive(Debug, Clone)]
pub struct PitchControls {
    /// Current pitch in Hz.
    pub pitch: f64,
    pub slider: Slider,
    pub vibrato: Lfo,
    /// Carried-pitch adjustment factor.
    pub freq_mul: f64,
}

impl PitchControls {
    pub fn new(cents: f64) -> Self {
        let pitch = cents_to_freq(cents);
        let mut slider = Slider::new(SlideMode::Exponential);
        slider.set_value(pitch);
        Self {
            pitch,
            slider,
            vibrato: Lfo::new(LfoMode::Exponential),
            freq_mul: 1.0,
        }
    }

    pub fn set_pitch(&mut self, cents: f64) {
        self.pitch = cents_to_freq(cents);
        self.slider.set_value(self.pitch);
    }

    pub fn slide_target(&mut self, cents: f64) {
        self.slider.slide_target(cents_to_freq(cents));
    }

    pub fn slide_length(&mut self, length: Tstamp) {
        self.slider.set_length(length);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.slider.set_tempo(tempo);
        self.vibrato.set_tempo(tempo);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.slider.set_audio_rate(audio_rate);
        self.vibrato.set_audio_rate(audio_rate);
    }
}

impl Default for PitchControls {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Force value, slide and tremolo of one note, in decibels.
#[derive(Debug, Clone)]
pub struct ForceControls {
    pub force_db: f64,
    pub slider: Slider,
    /// Tremolo LFO; depth in dB.
    pub tremolo: Lfo,
}

impl ForceControls {
    pub fn new() -> Self {
        let mut slider = Slider::new(SlideMode::Linear);
        slider.set_value(0.0);
        Self {
            force_db: 0.0,
            slider,
            tremolo: Lfo::new(LfoMode::Linear),
        }
    }

    pub fn set_force(&mut self, db: f64) {
        self.force_db = db;
        self.slider.set_value(db);
    }

    pub fn slide_target(&mut self, db: f64) {
        self.slider.slide_target(db);
    }

    pub fn slide_length(&mut self, length: Tstamp) {
        self.slider.set_length(length);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.slider.set_tempo(tempo);
        self.tremolo.set_tempo(tempo);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.slider.set_audio_rate(audio_rate);
        self.tremolo.set_audio_rate(audio_rate);
    }
}

impl Default for ForceControls {
    fn default() -> Self {
        Self::new()
    }
}

/// Auto-wah of one note: an LFO displacing the filter cutoff parameter,
/// with a ramp-in delay before the full depth is reached.
#[derive(Debug, Clone)]
pub struct AutowahControls {
    /// Depth is in cutoff parameter units.
    pub lfo: Lfo,
    delay: Tstamp,
    delay_progress: f64,
    audio_rate: u32,
    tempo: f64,
}

impl AutowahControls {
    pub fn new() -> Self {
        Self {
            lfo: Lfo::new(LfoMode::Linear),
            delay: Tstamp::zero(),
            delay_progress: 1.0,
            audio_rate: 48000,
            tempo: 120.0,
        }
    }

    pub fn active(&self) -> bool {
        self.lfo.active()
    }

    pub fn set_speed(&mut self, cycles_per_second: f64) {
        self.lfo.set_speed(cycles_per_second);
        if cycles_per_second > 0.0 {
            self.lfo.turn_on();
        } else {
            self.lfo.turn_off();
        }
    }

    pub fn set_depth(&mut self, depth: f64) {
        self.lfo.set_depth(depth);
        if depth != 0.0 {
            self.lfo.turn_on();
        }
    }

    pub fn set_delay(&mut self, delay: Tstamp) {
        self.delay = delay;
    }

    pub fn delay(&self) -> Tstamp {
        self.delay
    }

    /// Restart the ramp-in; called when a new note takes these controls.
    pub fn restart_delay(&mut self) {
        self.delay_progress = if self.delay.is_zero() { 1.0 } else { 0.0 };
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        self.lfo.set_tempo(tempo);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.audio_rate = audio_rate;
        self.lfo.set_audio_rate(audio_rate);
    }

    /// Advance one sample and return the cutoff displacement.
    pub fn step(&mut self) -> f64 {
        if !self.lfo.active() {
            return 0.0;
        }
        if self.delay_progress < 1.0 {
            let delay_frames = self.delay.to_frames(self.tempo, self.audio_rate);
            if delay_frames > 0.0 {
                self.delay_progress = (self.delay_progress + 1.0 / delay_frames).min(1.0);
            } else {
                self.delay_progress = 1.0;
            }
        }
        self.lfo.step() * self.delay_progress
    }
}

impl Default for AutowahControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cents_reference_is_a440() {
        assert_relative_eq!(cents_to_freq(0.0), 440.0);
        assert_relative_eq!(cents_to_freq(1200.0), 880.0);
        assert_relative_eq!(cents_to_freq(-1200.0), 220.0);
    }

    #[test]
    fn pitch_slide_to_current_pitch_is_complete() {
        let mut pc = PitchControls::new(0.0);
        pc.slide_length(Tstamp::new(2, 0));
        pc.slide_target(0.0);
        assert!(!pc.slider.in_progress());
        assert_relative_eq!(pc.slider.value(), 440.0);
    }

    #[test]
    fn autowah_depth_ramps_in_over_the_delay() {
        let mut aw = AutowahControls::new();
        aw.set_audio_rate(1000);
        aw.set_tempo(60.0);
        aw.set_speed(10.0);
        aw.set_depth(24.0);
        // One beat at 60 BPM and 1 kHz is 1000 frames
        aw.set_delay(Tstamp::new(1, 0));
        aw.restart_delay();

        let early: f64 = (0..25).map(|_| aw.step().abs()).fold(0.0, f64::max);
        for _ in 0..2000 {
            aw.step();
        }
        let late: f64 = (0..100).map(|_| aw.step().abs()).fold(0.0, f64::max);
        assert!(early < late);
        assert!(late > 12.0);
    }

    #[test]
    fn inactive_autowah_displaces_nothing() {
        let mut aw = AutowahControls::new();
        assert!(!aw.active());
        assert_eq!(aw.step(), 0.0);
    }
}
