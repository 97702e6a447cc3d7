//! Per-voice transient state.
//!
//! Every voice carries the same common block plus one kernel-specific
//! extension. The extension is a tagged enum rather than a raw byte blob:
//! the largest variant fixes the allocation and dispatch is a static
//! `match` inside each kernel.

use crate::procs::add::AddVoice;
use crate::procs::envgen::EnvgenVoice;
use crate::procs::filter::FilterVoice;
use crate::procs::force::ForceVoice;
use crate::procs::panning::PanningVoice;
use crate::procs::pitch::PitchVoice;
use crate::procs::stream::StreamVoice;
use crate::random::Random;

/// Kernel-specific per-voice data.
#[derive(Debug, Clone, Default)]
pub enum VoiceExt {
    #[default]
    None,
    Add(AddVoice),
    Envgen(EnvgenVoice),
    Pitch(PitchVoice),
    Force(ForceVoice),
    Panning(PanningVoice),
    Filter(FilterVoice),
    Stream(StreamVoice),
}

/// The playback state of a single voice.
#[derive(Debug, Clone)]
pub struct VoiceState {
    /// Whether there is anything left to process.
    pub active: bool,
    /// Set when the kernel has produced its final frames; the voice is
    /// deactivated after the current block's contents are consumed.
    pub has_finished: bool,
    /// Whether the note is still held.
    pub note_on: bool,
    /// First frame index after which the voice no longer needs to stay
    /// alive within the current block.
    pub keep_alive_stop: usize,
    pub has_release_data: bool,
    pub release_stop: usize,
    /// Progress of the attack ramp in `[0, 1]`.
    pub ramp_attack: f64,
    /// Hit index for percussion maps; negative for normal notes.
    pub hit_index: i32,
    /// Playback position in frames since note-on.
    pub pos: u64,
    pub pos_rem: f64,
    /// Frames since note-off.
    pub noff_pos: u64,
    pub noff_pos_rem: f64,
    /// Pitch parameter at note-on, in cents relative to 440 Hz.
    pub orig_pitch_param: f64,
    /// Linear force factor including note-on variation.
    pub force: f64,
    /// Parameter random stream, consulted at note-on time.
    pub rand_p: Random,
    /// Signal random stream, consulted inside DSP.
    pub rand_s: Random,
    pub ext: VoiceExt,
}

impl VoiceState {
    pub fn new() -> Self {
        Self {
            active: false,
            has_finished: false,
            note_on: false,
            keep_alive_stop: 0,
            has_release_data: false,
            release_stop: 0,
            ramp_attack: 0.0,
            hit_index: -1,
            pos: 0,
            pos_rem: 0.0,
            noff_pos: 0,
            noff_pos_rem: 0.0,
            orig_pitch_param: 0.0,
            force: 1.0,
            rand_p: Random::from_seed(0),
            rand_s: Random::from_seed(0),
            ext: VoiceExt::None,
        }
    }

    /// Reset to the inactive state, dropping kernel data.
    pub fn clear(&mut self) {
        *self = Self {
            rand_p: self.rand_p,
            rand_s: self.rand_s,
            ..Self::new()
        };
    }

    /// Begin a new note.
    pub fn init(&mut self, seed: u64) {
        self.clear();
        self.active = true;
        self.note_on = true;
        self.rand_p.set_seed(seed);
        self.rand_s.set_seed(seed.wrapping_add(1));
    }

    /// Mark the note released at the current position.
    pub fn set_note_off(&mut self) {
        self.note_on = false;
        self.noff_pos = 0;
        self.noff_pos_rem = 0.0;
    }

    /// Mark the voice as having emitted its final frames.
    pub fn set_finished(&mut self) {
        self.has_finished = true;
    }

    pub fn mark_release_data(&mut self, release_stop: usize) {
        self.has_release_data = true;
        self.release_stop = release_stop;
    }
}

impl Default for VoiceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_activates_and_reseeds() {
        let mut state = VoiceState::new();
        state.init(1234);
        assert!(state.active);
        assert!(state.note_on);

        let mut other = VoiceState::new();
        other.init(1234);
        assert_eq!(state.rand_p.next_u64(), other.rand_p.next_u64());
    }

    #[test]
    fn clear_deactivates_and_drops_extension() {
        let mut state = VoiceState::new();
        state.init(1);
        state.ext = VoiceExt::Panning(Default::default());
        state.clear();
        assert!(!state.active);
        assert!(matches!(state.ext, VoiceExt::None));
    }
}
