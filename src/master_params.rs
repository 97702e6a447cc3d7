//! Transport state and playback statistics.

use crate::controls::{SlideMode, Slider};
use crate::tstamp::Tstamp;
use crate::value::PatInstRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// How playback advances at the end of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// Follow the album track order.
    Album,
    /// Repeat the current pattern.
    PatternLoop,
    /// Play the current pattern once and stop.
    PatternOnce,
}

/// Output amplitude bookkeeping per channel.
#[derive(Debug, Clone, Copy)]
pub struct RenderStats {
    pub min_amp: [f32; 2],
    pub max_amp: [f32; 2],
    pub clipped: [u64; 2],
    pub frames_total: u64,
}

impl Default for RenderStats {
    fn default() -> Self {
        Self {
            min_amp: [f32::INFINITY; 2],
            max_amp: [f32::NEG_INFINITY; 2],
            clipped: [0; 2],
            frames_total: 0,
        }
    }
}

impl RenderStats {
    pub fn observe(&mut self, ch: usize, value: f32) {
        self.min_amp[ch] = self.min_amp[ch].min(value);
        self.max_amp[ch] = self.max_amp[ch].max(value);
        if !(-1.0..=1.0).contains(&value) {
            self.clipped[ch] += 1;
        }
    }
}

#[derive(Debug)]
pub struct MasterParams {
    pub playback: PlaybackState,
    pub play_mode: PlayMode,

    /// Album track currently played.
    pub track: usize,
    /// Song behind the current track.
    pub song: Option<usize>,
    /// System index inside the song's order list.
    pub system: usize,
    /// Pattern instance currently played.
    pub piref: Option<PatInstRef>,
    /// Row position inside the pattern.
    pub pos: Tstamp,

    pub tempo: f64,
    pub tempo_slider: Slider,
    pub volume_db: f64,
    pub volume_slider: Slider,

    pub jump_target_track: Option<usize>,
    pub jump_target_pat: Option<PatInstRef>,
    pub jump_target_row: Tstamp,
    pub do_jump: bool,

    /// Remaining pattern delay.
    pub pattern_delay: Tstamp,

    pub infinite: bool,

    pub goto_track: usize,
    pub goto_system: usize,
    pub goto_row: Tstamp,

    pub active_scale: usize,
    pub scale_fixed_point: usize,

    pub stats: RenderStats,
}

impl MasterParams {
    pub fn new() -> Self {
        Self {
            playback: PlaybackState::Playing,
            play_mode: PlayMode::Album,
            track: 0,
            song: None,
            system: 0,
            piref: None,
            pos: Tstamp::zero(),
            tempo: 120.0,
            tempo_slider: Slider::new(SlideMode::Linear),
            volume_db: 0.0,
            volume_slider: Slider::new(SlideMode::Linear),
            jump_target_track: None,
            jump_target_pat: None,
            jump_target_row: Tstamp::zero(),
            do_jump: false,
            pattern_delay: Tstamp::zero(),
            infinite: false,
            goto_track: 0,
            goto_system: 0,
            goto_row: Tstamp::zero(),
            active_scale: 0,
            scale_fixed_point: 0,
            stats: RenderStats::default(),
        }
    }

    /// Set the tempo directly, cancelling any slide.
    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        self.tempo_slider.set_value(tempo);
    }

    /// A jump cancels a tempo slide but keeps the value reached so far.
    pub fn stop_tempo_slide(&mut self) {
        let tempo = self.tempo;
        self.tempo_slider.set_value(tempo);
    }
}

impl Default for MasterParams {
    fn default() -> Self {
        Self::new()
    }
}
