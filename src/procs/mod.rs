//! The compiled-in DSP kernels.
//!
//! Each kernel implements [`ProcImpl`](crate::device::ProcImpl) and is
//! selected by the `p_proc_type.json` key of its processor directory.

pub mod add;
pub mod envgen;
pub mod filter;
pub mod force;
pub mod freeverb;
pub mod panning;
pub mod pitch;
pub mod stream;

use crate::buffer::WorkBuffer;
use crate::device::ProcImpl;
use crate::limits::RAMP_ATTACK_TIME;
use crate::voice_state::VoiceState;
use std::collections::BTreeMap;

/// Instantiate the kernel registered for a processor type name.
pub fn new_proc_impl(proc_type: &str) -> Option<Box<dyn ProcImpl>> {
    match proc_type {
        "add" => Some(Box::new(add::AddProc::new())),
        "envgen" => Some(Box::new(envgen::EnvgenProc::new())),
        "filter" => Some(Box::new(filter::FilterProc::new())),
        "force" => Some(Box::new(force::ForceProc::new())),
        "freeverb" => Some(Box::new(freeverb::FreeverbProc::new())),
        "panning" => Some(Box::new(panning::PanningProc::new())),
        "pitch" => Some(Box::new(pitch::PitchProc::new())),
        "stream" => Some(Box::new(stream::StreamProc::new())),
        _ => None,
    }
}

/// Scale freshly rendered output by the attack ramp of a starting voice.
///
/// The ramp rises linearly from 0 to 1 over [`RAMP_ATTACK_TIME`] frames and
/// is shared across the listed ports so stereo pairs stay matched.
pub fn apply_ramp_attack(
    vstate: &mut VoiceState,
    voice_out: &mut BTreeMap<u8, WorkBuffer>,
    ports: &[u8],
    buf_start: usize,
    buf_stop: usize,
) {
    if vstate.ramp_attack >= 1.0 {
        return;
    }

    let step = 1.0 / RAMP_ATTACK_TIME;
    let mut final_ramp = vstate.ramp_attack;

    for &port in ports {
        let mut ramp = vstate.ramp_attack;
        if let Some(buf) = voice_out.get_mut(&port) {
            let contents = buf.contents_mut();
            let stop = buf_stop.min(contents.len());
            for frame in contents[buf_start..stop].iter_mut() {
                if ramp >= 1.0 {
                    break;
                }
                *frame *= ramp as f32;
                ramp += step;
            }
        }
        final_ramp = ramp;
    }

    vstate.ramp_attack = final_ramp.min(1.0);
}

/// Convert decibels to a linear scale factor.
#[inline]
pub fn db_to_scale(db: f64) -> f64 {
    if db == f64::NEG_INFINITY {
        0.0
    } else {
        10f64.powf(db / 20.0)
    }
}

/// Convert a linear scale factor to decibels.
#[inline]
pub fn scale_to_db(scale: f64) -> f64 {
    if scale <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * scale.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn registry_knows_every_kernel() {
        for name in [
            "add", "envgen", "filter", "force", "freeverb", "panning", "pitch", "stream",
        ] {
            let kernel = new_proc_impl(name).unwrap();
            assert_eq!(kernel.proc_type(), name);
        }
        assert!(new_proc_impl("nonsense").is_none());
    }

    #[test]
    fn db_conversions_round_trip() {
        assert_relative_eq!(db_to_scale(0.0), 1.0);
        assert_relative_eq!(db_to_scale(-6.0), 0.501187, max_relative = 1e-5);
        assert_relative_eq!(scale_to_db(db_to_scale(-13.5)), -13.5, max_relative = 1e-9);
        assert_eq!(db_to_scale(f64::NEG_INFINITY), 0.0);
    }

    #[test]
    fn ramp_attack_scales_and_advances() {
        let mut vstate = VoiceState::new();
        vstate.ramp_attack = 0.0;
        let mut out = BTreeMap::new();
        let mut buf = WorkBuffer::new(16);
        buf.contents_mut().fill(1.0);
        out.insert(0u8, buf);

        apply_ramp_attack(&mut vstate, &mut out, &[0], 0, 16);
        let contents = out.get(&0).unwrap().contents();
        assert_eq!(contents[0], 0.0);
        assert!(contents[15] > 0.0 && contents[15] < 1.0);
        assert!(vstate.ramp_attack > 0.0 && vstate.ramp_attack < 1.0);
    }
}
