//! Musical timestamps with exact rational arithmetic.
//!
//! A [`Tstamp`] is a pair of whole beats and a remainder counted in
//! [`TSTAMP_BEAT`](crate::limits::TSTAMP_BEAT) units. The remainder base is
//! highly composite, so common beat subdivisions stay exact through
//! addition and subtraction.

use crate::limits::TSTAMP_BEAT;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::{Add, Neg, Sub};

/// A position or duration in musical time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tstamp {
    beats: i64,
    rem: i32,
}

impl Tstamp {
    /// The zero timestamp.
    pub const fn zero() -> Self {
        Self { beats: 0, rem: 0 }
    }

    /// Create a timestamp, normalising the remainder into `[0, TSTAMP_BEAT)`.
    pub fn new(beats: i64, rem: i64) -> Self {
        Self {
            beats: beats + rem.div_euclid(TSTAMP_BEAT),
            rem: rem.rem_euclid(TSTAMP_BEAT) as i32,
        }
    }

    pub fn beats(&self) -> i64 {
        self.beats
    }

    pub fn rem(&self) -> i32 {
        self.rem
    }

    /// Whether this timestamp is `[0, 0]`.
    pub fn is_zero(&self) -> bool {
        self.beats == 0 && self.rem == 0
    }

    /// Fractional number of beats.
    pub fn to_beats(&self) -> f64 {
        self.beats as f64 + self.rem as f64 / TSTAMP_BEAT as f64
    }

    /// Build from a fractional beat count.
    pub fn from_beats(beats: f64) -> Self {
        let whole = beats.floor();
        let frac = beats - whole;
        Self::new(whole as i64, (frac * TSTAMP_BEAT as f64) as i64)
    }

    /// Length in seconds at the given tempo (beats per minute).
    pub fn to_seconds(&self, tempo: f64) -> f64 {
        self.to_beats() * 60.0 / tempo
    }

    /// Length in audio frames at the given tempo and audio rate.
    pub fn to_frames(&self, tempo: f64, audio_rate: u32) -> f64 {
        self.to_seconds(tempo) * audio_rate as f64
    }

    /// Build from a frame count at the given tempo and audio rate.
    pub fn from_frames(frames: f64, tempo: f64, audio_rate: u32) -> Self {
        Self::from_beats(frames * tempo / (60.0 * audio_rate as f64))
    }
}

impl Default for Tstamp {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialOrd for Tstamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tstamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.beats
            .cmp(&other.beats)
            .then(self.rem.cmp(&other.rem))
    }
}

impl Add for Tstamp {
    type Output = Tstamp;

    fn add(self, other: Tstamp) -> Tstamp {
        Tstamp::new(
            self.beats + other.beats,
            self.rem as i64 + other.rem as i64,
        )
    }
}

impl Sub for Tstamp {
    type Output = Tstamp;

    fn sub(self, other: Tstamp) -> Tstamp {
        Tstamp::new(
            self.beats - other.beats,
            self.rem as i64 - other.rem as i64,
        )
    }
}

impl Neg for Tstamp {
    type Output = Tstamp;

    fn neg(self) -> Tstamp {
        Tstamp::zero() - self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn remainder_is_normalised() {
        let ts = Tstamp::new(0, TSTAMP_BEAT + 1);
        assert_eq!(ts.beats(), 1);
        assert_eq!(ts.rem(), 1);

        let ts = Tstamp::new(1, -1);
        assert_eq!(ts.beats(), 0);
        assert_eq!(ts.rem(), (TSTAMP_BEAT - 1) as i32);
    }

    #[test]
    fn remainder_stays_in_range_after_arithmetic() {
        let a = Tstamp::new(2, TSTAMP_BEAT / 2);
        let b = Tstamp::new(0, TSTAMP_BEAT / 2 + 7);
        let sum = a + b;
        assert!(sum.rem() >= 0 && (sum.rem() as i64) < TSTAMP_BEAT);
        let diff = b - a;
        assert!(diff.rem() >= 0 && (diff.rem() as i64) < TSTAMP_BEAT);
    }

    #[test]
    fn ordering_compares_beats_then_remainder() {
        assert!(Tstamp::new(1, 0) < Tstamp::new(2, 0));
        assert!(Tstamp::new(1, 5) > Tstamp::new(1, 4));
        assert_eq!(Tstamp::new(3, 9), Tstamp::new(3, 9));
    }

    #[test]
    fn frame_conversion_round_trips() {
        let ts = Tstamp::new(4, 0);
        // 4 beats at 120 BPM is 2 seconds
        assert_relative_eq!(ts.to_frames(120.0, 48000), 96000.0);
        let back = Tstamp::from_frames(96000.0, 120.0, 48000);
        assert_eq!(back.beats(), 4);
        assert_eq!(back.rem(), 0);
    }
}
