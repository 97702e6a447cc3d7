//! Per-channel playback state.
//!
//! A channel tracks its selected audio unit input, the foreground voices
//! of the most recent note (one per voice processor), carried pitch/force
//! controls, arpeggio memory, the conditional execution stack and a
//! channel-scoped control variable state.

use crate::limits::CHANNELS_MAX;
use crate::note_controls::{AutowahControls, ForceControls, PitchControls};
use crate::random::Random;
use std::collections::HashMap;

/// Reference to a pool voice with its id at the time of allocation.
#[derive(Debug, Clone, Copy)]
pub struct FgVoice {
    pub index: usize,
    pub id: u64,
}

#[derive(Debug)]
pub struct Channel {
    pub num: usize,
    /// Index of the audio unit receiving this channel's notes.
    pub au_index: usize,
    /// Foreground voices keyed by processor index.
    pub fg: HashMap<usize, FgVoice>,

    pub pitch_controls: PitchControls,
    pub carry_pitch: bool,
    pub force_controls: ForceControls,
    pub carry_force: bool,
    /// Auto-wah settings applied to new filter voices.
    pub autowah: AutowahControls,

    pub arpeggio_speed: f64,
    pub arpeggio_notes: Vec<f64>,
    pub arpeggio_on: bool,

    /// Conditional execution frames; an event fires only if all are true.
    cond_frames: Vec<bool>,
    /// Result of the most recent condition expression.
    pub cond: bool,

    /// Selected control variable name for subsequent cv events.
    pub selected_cv: Option<String>,
    /// Selected environment variable name for subsequent env events.
    pub selected_env_var: Option<String>,
    /// Carried stream values keyed by control variable name.
    pub carried_cv: HashMap<String, f64>,

    /// Channel random stream for expression evaluation.
    pub rand: Random,
}

impl Channel {
    pub fn new(num: usize, seed: u64) -> Self {
        Self {
            num,
            au_index: 0,
            fg: HashMap::new(),
            pitch_controls: PitchControls::default(),
            carry_pitch: false,
            force_controls: ForceControls::default(),
            carry_force: false,
            autowah: AutowahControls::default(),
            arpeggio_speed: 24.0,
            arpeggio_notes: Vec::new(),
            arpeggio_on: false,
            cond_frames: Vec::new(),
            cond: false,
            selected_cv: None,
            selected_env_var: None,
            carried_cv: HashMap::new(),
            rand: Random::from_seed(seed.wrapping_add(num as u64)),
        }
    }

    /// Whether events on this channel currently execute.
    pub fn is_active(&self) -> bool {
        self.cond_frames.iter().all(|&frame| frame)
    }

    pub fn cond_if(&mut self) {
        let parent_active = self.is_active();
        let cond = self.cond;
        self.cond_frames.push(parent_active && cond);
    }

    pub fn cond_else(&mut self) {
        if let Some(top) = self.cond_frames.pop() {
            let parent_active = self.is_active();
            self.cond_frames.push(parent_active && !top);
        }
    }

    pub fn cond_end_if(&mut self) {
        self.cond_frames.pop();
    }

    /// Forget all foreground voices (e.g. on reset).
    pub fn clear_fg(&mut self) {
        self.fg.clear();
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.pitch_controls.set_audio_rate(audio_rate);
        self.force_controls.set_audio_rate(audio_rate);
        self.autowah.set_audio_rate(audio_rate);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.pitch_controls.set_tempo(tempo);
        self.force_controls.set_tempo(tempo);
        self.autowah.set_tempo(tempo);
    }
}

/// Create the full channel array.
pub fn new_channels(seed: u64) -> Vec<Channel> {
    (0..CHANNELS_MAX).map(|num| Channel::new(num, seed)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_frames_nest() {
        let mut ch = Channel::new(0, 0);
        assert!(ch.is_active());

        ch.cond = false;
        ch.cond_if();
        assert!(!ch.is_active());

        // The inner frame stays inactive because the parent is inactive
        ch.cond = true;
        ch.cond_if();
        assert!(!ch.is_active());
        ch.cond_end_if();

        ch.cond_else();
        assert!(ch.is_active());
        ch.cond_end_if();
        assert!(ch.is_active());
    }

    #[test]
    fn channels_get_distinct_random_streams() {
        let mut channels = new_channels(42);
        let a = channels[0].rand.next_u64();
        let b = channels[1].rand.next_u64();
        assert_ne!(a, b);
    }
}
