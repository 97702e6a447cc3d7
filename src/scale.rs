//! Tuning tables.
//!
//! A scale maps note indices to pitch offsets in cents relative to a
//! reference pitch. Master events can retune single notes or shift the whole
//! table while keeping one fixed point unchanged.

use crate::error::EngineError;
use crate::limits::SCALE_NOTES_MAX;

#[derive(Debug, Clone)]
pub struct Scale {
    /// Cent offsets from the reference pitch, one per note.
    note_offsets: Vec<f64>,
    /// Frequency of note 0 in Hz.
    pub ref_pitch: f64,
    /// Size of one octave in cents.
    pub octave_width: f64,
}

impl Scale {
    /// Twelve-tone equal temperament around 440 Hz.
    pub fn equal_temperament() -> Self {
        Self {
            note_offsets: (0..12).map(|i| i as f64 * 100.0).collect(),
            ref_pitch: 440.0,
            octave_width: 1200.0,
        }
    }

    /// Parse the JSON form:
    /// `{ "ref_pitch": 440, "octave_width": 1200, "notes": [c0, c1, ...] }`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EngineError> {
        let obj = json
            .as_object()
            .ok_or_else(|| EngineError::format("Scale description is not an object"))?;

        let ref_pitch = obj
            .get("ref_pitch")
            .and_then(|v| v.as_f64())
            .unwrap_or(440.0);
        if !(ref_pitch > 0.0) {
            return Err(EngineError::format("Scale reference pitch is not positive"));
        }

        let octave_width = obj
            .get("octave_width")
            .and_then(|v| v.as_f64())
            .unwrap_or(1200.0);
        if !octave_width.is_finite() || octave_width <= 0.0 {
            return Err(EngineError::format("Scale octave width is invalid"));
        }

        let mut note_offsets = Vec::new();
        if let Some(notes) = obj.get("notes").and_then(|v| v.as_array()) {
            if notes.len() > SCALE_NOTES_MAX {
                return Err(EngineError::format("Scale has too many notes"));
            }
            for note in notes {
                let cents = note
                    .as_f64()
                    .ok_or_else(|| EngineError::format("Scale note is not a number"))?;
                note_offsets.push(cents);
            }
        }
        if note_offsets.is_empty() {
            note_offsets = (0..12).map(|i| i as f64 * 100.0).collect();
        }

        Ok(Self {
            note_offsets,
            ref_pitch,
            octave_width,
        })
    }

    pub fn note_count(&self) -> usize {
        self.note_offsets.len()
    }

    /// Cent offset of a note index, wrapping octaves.
    pub fn note_cents(&self, note: i64) -> f64 {
        let count = self.note_offsets.len() as i64;
        let octave = note.div_euclid(count);
        let index = note.rem_euclid(count) as usize;
        self.note_offsets[index] + octave as f64 * self.octave_width
    }

    /// Frequency of a note index in Hz.
    pub fn note_freq(&self, note: i64) -> f64 {
        self.ref_pitch * (self.note_cents(note) / 1200.0).exp2()
    }

    /// Retune one note to a new cent offset.
    pub fn set_note_cents(&mut self, note: usize, cents: f64) -> Result<(), EngineError> {
        let slot = self
            .note_offsets
            .get_mut(note)
            .ok_or_else(|| EngineError::argument("Scale note index out of range"))?;
        *slot = cents;
        Ok(())
    }

    /// Shift every note so that `fixed_point` keeps its current offset.
    pub fn shift(&mut self, fixed_point: usize, cents: f64) {
        if fixed_point >= self.note_offsets.len() {
            return;
        }
        let anchor = self.note_offsets[fixed_point];
        for (i, offset) in self.note_offsets.iter_mut().enumerate() {
            if i != fixed_point {
                *offset += cents;
            }
        }
        self.note_offsets[fixed_point] = anchor;
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::equal_temperament()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn equal_temperament_octaves_double() {
        let scale = Scale::equal_temperament();
        assert_relative_eq!(scale.note_freq(0), 440.0);
        assert_relative_eq!(scale.note_freq(12), 880.0);
        assert_relative_eq!(scale.note_freq(-12), 220.0);
    }

    #[test]
    fn shift_keeps_fixed_point() {
        let mut scale = Scale::equal_temperament();
        scale.shift(0, 50.0);
        assert_relative_eq!(scale.note_cents(0), 0.0);
        assert_relative_eq!(scale.note_cents(1), 150.0);
    }

    #[test]
    fn parses_json_notes() {
        let json = serde_json::json!({
            "ref_pitch": 220.0,
            "octave_width": 1200.0,
            "notes": [0.0, 200.0, 400.0]
        });
        let scale = Scale::from_json(&json).unwrap();
        assert_eq!(scale.note_count(), 3);
        assert_relative_eq!(scale.note_cents(3), 1200.0);
    }
}
