//! The event name table.
//!
//! Every trigger name maps to a kind (which subsystem handles it) and a
//! declared argument type. The table is small enough that lookup is a
//! linear scan of a static slice.

use crate::value::{PatInstRef, Value};
use crate::tstamp::Tstamp;

/// Which subsystem an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // General, per channel
    Comment,
    Cond,
    CondIf,
    CondElse,
    CondEndIf,

    // Control, global
    Pause,
    Resume,
    PlayPattern,
    SelectEnvVar,
    SetEnvVar,
    GotoSetTrack,
    GotoSetSystem,
    GotoSetRow,
    Goto,
    InfiniteOn,
    InfiniteOff,

    // Master transport
    SetTempo,
    SlideTempo,
    SlideTempoLength,
    SetVolume,
    SlideVolume,
    SlideVolumeLength,
    Jump,
    JumpSetPat,
    JumpSetRow,
    JumpSetTrack,
    PatternDelay,
    SetScale,
    SetScaleFixedPoint,
    ShiftScale,

    // Channel
    NoteOn,
    NoteOff,
    Hit,
    SetAuInput,
    SetForce,
    SlideForce,
    SlideForceLength,
    TremoloSpeed,
    TremoloDepth,
    AutowahSpeed,
    AutowahDepth,
    AutowahDelay,
    CarryForceOn,
    CarryForceOff,
    SlidePitch,
    SlidePitchLength,
    VibratoSpeed,
    VibratoDepth,
    CarryPitchOn,
    CarryPitchOff,
    ArpeggioOn,
    ArpeggioOff,
    ArpeggioReset,
    ArpeggioSpeed,
    ArpeggioNote,

    // Audio unit, via the channel's current input
    SelectControlVar,
    SetControlVar,
    SlideControlVar,
    SlideControlVarLength,
    OscControlVarSpeed,
    OscControlVarDepth,
    AuBypassOn,
    AuBypassOff,
    AuSustain,

    // Query
    QueryLocation,
    QueryVoiceCount,
    QueryActualForce,
}

/// Declared argument type of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    None,
    Bool,
    Int,
    Float,
    Tstamp,
    String,
    PatInstRef,
    /// Accept any value as is.
    Any,
}

/// The static event table.
pub const EVENTS: &[(&str, EventKind, ArgType)] = &[
    ("#", EventKind::Comment, ArgType::String),
    ("?", EventKind::Cond, ArgType::Bool),
    ("?if", EventKind::CondIf, ArgType::None),
    ("?else", EventKind::CondElse, ArgType::None),
    ("?endif", EventKind::CondEndIf, ArgType::None),
    ("cpause", EventKind::Pause, ArgType::None),
    ("cresume", EventKind::Resume, ArgType::None),
    ("cpattern", EventKind::PlayPattern, ArgType::PatInstRef),
    ("c.evn", EventKind::SelectEnvVar, ArgType::String),
    ("c.ev", EventKind::SetEnvVar, ArgType::Any),
    ("c.gt", EventKind::GotoSetTrack, ArgType::Int),
    ("c.gs", EventKind::GotoSetSystem, ArgType::Int),
    ("c.gr", EventKind::GotoSetRow, ArgType::Tstamp),
    ("cg", EventKind::Goto, ArgType::None),
    ("c.i+", EventKind::InfiniteOn, ArgType::None),
    ("c.i-", EventKind::InfiniteOff, ArgType::None),
    ("m.t", EventKind::SetTempo, ArgType::Float),
    ("m/t", EventKind::SlideTempo, ArgType::Float),
    ("m/=t", EventKind::SlideTempoLength, ArgType::Tstamp),
    ("m.v", EventKind::SetVolume, ArgType::Float),
    ("m/v", EventKind::SlideVolume, ArgType::Float),
    ("m/=v", EventKind::SlideVolumeLength, ArgType::Tstamp),
    ("mjump", EventKind::Jump, ArgType::None),
    ("mj.pat", EventKind::JumpSetPat, ArgType::PatInstRef),
    ("mj.row", EventKind::JumpSetRow, ArgType::Tstamp),
    ("mj.track", EventKind::JumpSetTrack, ArgType::Int),
    ("mpd", EventKind::PatternDelay, ArgType::Tstamp),
    ("m.scale", EventKind::SetScale, ArgType::Int),
    ("m.scalefix", EventKind::SetScaleFixedPoint, ArgType::Int),
    ("m.scaleshift", EventKind::ShiftScale, ArgType::Float),
    ("n+", EventKind::NoteOn, ArgType::Float),
    ("n-", EventKind::NoteOff, ArgType::None),
    ("h", EventKind::Hit, ArgType::Int),
    (".a", EventKind::SetAuInput, ArgType::Int),
    (".f", EventKind::SetForce, ArgType::Float),
    ("/f", EventKind::SlideForce, ArgType::Float),
    ("/=f", EventKind::SlideForceLength, ArgType::Tstamp),
    (".ts", EventKind::TremoloSpeed, ArgType::Float),
    (".td", EventKind::TremoloDepth, ArgType::Float),
    (".aws", EventKind::AutowahSpeed, ArgType::Float),
    (".awd", EventKind::AutowahDepth, ArgType::Float),
    (".awl", EventKind::AutowahDelay, ArgType::Tstamp),
    ("fc+", EventKind::CarryForceOn, ArgType::None),
    ("fc-", EventKind::CarryForceOff, ArgType::None),
    ("/p", EventKind::SlidePitch, ArgType::Float),
    ("/=p", EventKind::SlidePitchLength, ArgType::Tstamp),
    (".vs", EventKind::VibratoSpeed, ArgType::Float),
    (".vd", EventKind::VibratoDepth, ArgType::Float),
    ("pc+", EventKind::CarryPitchOn, ArgType::None),
    ("pc-", EventKind::CarryPitchOff, ArgType::None),
    ("arp+", EventKind::ArpeggioOn, ArgType::None),
    ("arp-", EventKind::ArpeggioOff, ArgType::None),
    (".arpr", EventKind::ArpeggioReset, ArgType::None),
    (".arps", EventKind::ArpeggioSpeed, ArgType::Float),
    (".arpn", EventKind::ArpeggioNote, ArgType::Float),
    (".xc", EventKind::SelectControlVar, ArgType::String),
    ("=cv", EventKind::SetControlVar, ArgType::Any),
    ("/cv", EventKind::SlideControlVar, ArgType::Float),
    ("/=cv", EventKind::SlideControlVarLength, ArgType::Tstamp),
    ("ocv.s", EventKind::OscControlVarSpeed, ArgType::Float),
    ("ocv.d", EventKind::OscControlVarDepth, ArgType::Float),
    ("abp+", EventKind::AuBypassOn, ArgType::None),
    ("abp-", EventKind::AuBypassOff, ArgType::None),
    ("a.sus", EventKind::AuSustain, ArgType::Float),
    ("qlocation", EventKind::QueryLocation, ArgType::None),
    ("qvoices", EventKind::QueryVoiceCount, ArgType::None),
    ("qf", EventKind::QueryActualForce, ArgType::None),
];

/// Look up an event by name.
pub fn lookup(name: &str) -> Option<(EventKind, ArgType)> {
    EVENTS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, kind, arg)| (*kind, *arg))
}

/// Coerce an evaluated value to the declared argument type.
///
/// Ints promote to floats and timestamps; everything else must match.
pub fn coerce_arg(value: Value, declared: ArgType) -> Option<Value> {
    match declared {
        ArgType::None => Some(Value::None),
        ArgType::Any => Some(value),
        ArgType::Bool => matches!(&value, Value::Bool(_)).then_some(value),
        ArgType::String => matches!(&value, Value::String(_)).then_some(value),
        ArgType::PatInstRef => matches!(&value, Value::PatInstRef(_)).then_some(value),
        ArgType::Int => match value {
            Value::Int(_) => Some(value),
            _ => None,
        },
        ArgType::Float => match value {
            Value::Float(_) => Some(value),
            Value::Int(i) => Some(Value::Float(i as f64)),
            _ => None,
        },
        ArgType::Tstamp => match value {
            Value::Tstamp(_) => Some(value),
            Value::Int(i) => Some(Value::Tstamp(Tstamp::new(i, 0))),
            _ => None,
        },
    }
}

/// Parse a constant JSON argument to the declared type.
pub fn parse_const_arg(json: &serde_json::Value, declared: ArgType) -> Option<Value> {
    match declared {
        ArgType::None => Some(Value::None),
        ArgType::Any => {
            let value = match json {
                serde_json::Value::Null => Value::None,
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .map(Value::Int)
                    .or_else(|| n.as_f64().map(Value::Float))?,
                serde_json::Value::String(s) => Value::String(s.clone()),
                serde_json::Value::Array(items) if items.len() == 2 => Value::Tstamp(
                    Tstamp::new(items[0].as_i64()?, items[1].as_i64()?),
                ),
                _ => return None,
            };
            Some(value)
        }
        ArgType::Bool => json.as_bool().map(Value::Bool),
        ArgType::Int => json.as_i64().map(Value::Int),
        ArgType::Float => json.as_f64().map(Value::Float),
        ArgType::String => json.as_str().map(|s| Value::String(s.to_string())),
        ArgType::Tstamp => {
            let items = json.as_array().filter(|a| a.len() == 2)?;
            Some(Value::Tstamp(Tstamp::new(
                items[0].as_i64()?,
                items[1].as_i64()?,
            )))
        }
        ArgType::PatInstRef => {
            let items = json.as_array().filter(|a| a.len() == 2)?;
            Some(Value::PatInstRef(PatInstRef::new(
                items[0].as_i64()? as i16,
                items[1].as_i64()? as i16,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, (name, _, _)) in EVENTS.iter().enumerate() {
            for (other, _, _) in &EVENTS[i + 1..] {
                assert_ne!(name, other, "duplicate event name {}", name);
            }
        }
    }

    #[test]
    fn lookup_finds_note_events() {
        assert_eq!(lookup("n+"), Some((EventKind::NoteOn, ArgType::Float)));
        assert_eq!(lookup("mjump"), Some((EventKind::Jump, ArgType::None)));
        assert_eq!(lookup("bogus"), None);
    }

    #[test]
    fn int_arguments_promote() {
        assert_eq!(
            coerce_arg(Value::Int(3), ArgType::Float),
            Some(Value::Float(3.0))
        );
        assert_eq!(
            coerce_arg(Value::Int(2), ArgType::Tstamp),
            Some(Value::Tstamp(Tstamp::new(2, 0)))
        );
        assert_eq!(coerce_arg(Value::String("x".into()), ArgType::Float), None);
    }

    #[test]
    fn const_args_parse_by_declared_type() {
        assert_eq!(
            parse_const_arg(&serde_json::json!(0), ArgType::Float),
            Some(Value::Float(0.0))
        );
        assert_eq!(
            parse_const_arg(&serde_json::json!([0, 0]), ArgType::Tstamp),
            Some(Value::Tstamp(Tstamp::zero()))
        );
        assert_eq!(parse_const_arg(&serde_json::json!(null), ArgType::None), Some(Value::None));
    }
}
