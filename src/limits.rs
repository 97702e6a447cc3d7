//! Engine-wide limits and boundary constants.
//!
//! These values bound every table in a project and fix the granularity of
//! musical time. They are part of the public surface: keys, connection paths
//! and event arguments are validated against them.

/// Number of timestamp remainder units in one beat.
///
/// The value is 2^7 · 3^3 · 5 · 7 · 11 · 13 · 17 · 19, so every beat
/// subdivision up to 19 parts is exact.
pub const TSTAMP_BEAT: i64 = 882_161_280;

/// Maximum number of songs in a project.
pub const SONGS_MAX: usize = 256;

/// Maximum number of patterns.
pub const PATTERNS_MAX: usize = 1024;

/// Maximum number of instances of one pattern.
pub const PAT_INSTANCES_MAX: usize = 1024;

/// Maximum number of tracks in an album.
pub const TRACKS_MAX: usize = 256;

/// Maximum number of systems (pattern slots) in a song.
pub const SYSTEMS_MAX: usize = 1024;

/// Maximum number of playback channels, and of note columns in a pattern.
pub const CHANNELS_MAX: usize = 64;

/// Maximum number of note columns in a pattern.
pub const COLUMNS_MAX: usize = CHANNELS_MAX;

/// Maximum number of audio units in a table (root level or nested).
pub const AUDIO_UNITS_MAX: usize = 256;

/// Maximum number of processors inside one audio unit.
pub const PROCESSORS_MAX: usize = 256;

/// Maximum number of ports in one direction on a device.
///
/// Port numbers are written as two lowercase hex digits in connection paths,
/// so this can never exceed 256.
pub const DEVICE_PORTS_MAX: usize = 256;

/// Number of output channels rendered by the engine.
pub const BUFFERS_MAX: usize = 2;

/// Maximum number of tuning tables.
pub const SCALES_MAX: usize = 16;

/// Maximum number of notes in one tuning table.
pub const SCALE_NOTES_MAX: usize = 128;

/// Maximum number of tones in an arpeggio.
pub const ARPEGGIO_TONES_MAX: usize = 64;

/// Number of voices in the voice pool.
pub const VOICES_DEFAULT: usize = 256;

/// Upper bound for a configured voice pool.
pub const VOICES_MAX: usize = 1024;

/// Maximum length of an environment variable name.
pub const VAR_NAME_MAX: usize = 32;

/// Characters allowed to start an environment variable name.
pub const VAR_INIT_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_";

/// Characters allowed in the remainder of an environment variable name.
pub const VAR_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_0123456789";

/// Maximum length of an event name.
pub const EVENT_NAME_MAX: usize = 12;

/// Number of frames over which a starting voice ramps from silence.
pub const RAMP_ATTACK_TIME: f64 = 500.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_has_exact_subdivisions() {
        for div in 1..=19 {
            assert_eq!(TSTAMP_BEAT % div, 0, "beat not divisible by {}", div);
        }
    }

    #[test]
    fn port_numbers_fit_two_hex_digits() {
        assert!(DEVICE_PORTS_MAX <= 256);
    }
}
