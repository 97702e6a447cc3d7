//! The event engine.
//!
//! Triggers arrive by name with an unevaluated argument; the handler looks
//! the name up, evaluates the argument (constants directly, strings as
//! expressions over the environment with `$` bound to the caller's meta
//! value), coerces it to the declared type and dispatches to the owning
//! subsystem. Every processed event lands in two ring buffers for external
//! observers, and the bind table may cascade further events depth-first.

pub mod bind;
pub mod names;

use crate::audio_unit::CvOp;
use crate::channel::{Channel, FgVoice};
use crate::device_state::DeviceStates;
use crate::error::EngineError;
use crate::expr::{self, EnvState};
use crate::limits::CHANNELS_MAX;
use crate::master_params::{MasterParams, PlayMode, PlaybackState};
use crate::module::Module;
use crate::note_controls::PitchControls;
use crate::scale::Scale;
use crate::tstamp::Tstamp;
use crate::value::Value;
use crate::voice::{VoicePool, VoicePrio};
use crate::voice_state::VoiceExt;
use bind::BIND_RECURSION_MAX;
use names::{coerce_arg, lookup, parse_const_arg, ArgType, EventKind};
use std::collections::VecDeque;

/// One processed event, as seen by external observers.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredEvent {
    pub ch: i32,
    pub name: String,
    pub arg: Value,
}

/// A bounded ring of fired events.
#[derive(Debug)]
pub struct EventBuffer {
    entries: VecDeque<FiredEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: FiredEvent) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<FiredEvent> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The pair of observer buffers: one for host polling, one for UI echo.
#[derive(Debug)]
pub struct EventLog {
    pub general: EventBuffer,
    pub tracker: EventBuffer,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            general: EventBuffer::new(1024),
            tracker: EventBuffer::new(1024),
        }
    }

    fn record(&mut self, ch: i32, name: &str, arg: &Value) {
        let event = FiredEvent {
            ch,
            name: name.to_string(),
            arg: arg.clone(),
        };
        self.general.push(event.clone());
        self.tracker.push(event);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an event handler may touch.
pub struct EventCtx<'a> {
    pub module: &'a Module,
    pub master: &'a mut MasterParams,
    pub channels: &'a mut [Channel],
    pub pool: &'a mut VoicePool,
    pub dstates: &'a mut DeviceStates,
    pub env: &'a mut EnvState,
    pub scales: &'a mut Vec<Scale>,
    pub log: &'a mut EventLog,
    pub audio_rate: u32,
}

/// Process one trigger with an unevaluated argument.
pub fn trigger(
    ctx: &mut EventCtx,
    ch_index: usize,
    name: &str,
    arg_json: &serde_json::Value,
    meta: Option<&Value>,
) -> Result<(), EngineError> {
    if ch_index >= CHANNELS_MAX {
        return Err(EngineError::argument("Channel index out of range"));
    }

    let (_, arg_type) =
        lookup(name).ok_or_else(|| EngineError::format(format!("Unknown event: {}", name)))?;

    let arg = match arg_json {
        serde_json::Value::String(text) if arg_type != ArgType::String => {
            // A string argument for a non-string event is an expression
            let meta = meta.cloned().unwrap_or(Value::None);
            let value = {
                let channel = &mut ctx.channels[ch_index];
                expr::evaluate(text, ctx.env, &meta, &mut channel.rand)
                    .map_err(|e| EngineError::format(e.to_string()))?
            };
            coerce_arg(value, arg_type).ok_or_else(|| {
                EngineError::format(format!("Event {} received an incompatible argument", name))
            })?
        }
        _ => parse_const_arg(arg_json, arg_type).ok_or_else(|| {
            EngineError::format(format!("Event {} received a malformed argument", name))
        })?,
    };

    trigger_value(ctx, ch_index, name, arg, 0)
}

/// Process an event whose argument is already evaluated.
pub fn trigger_value(
    ctx: &mut EventCtx,
    ch_index: usize,
    name: &str,
    arg: Value,
    depth: usize,
) -> Result<(), EngineError> {
    let (kind, _) =
        lookup(name).ok_or_else(|| EngineError::format(format!("Unknown event: {}", name)))?;

    // Conditional bookkeeping always executes; everything else is gated by
    // the channel's conditional stack
    let is_cond_event = matches!(
        kind,
        EventKind::Cond | EventKind::CondIf | EventKind::CondElse | EventKind::CondEndIf
    );
    if !is_cond_event && !ctx.channels[ch_index].is_active() {
        return Ok(());
    }

    dispatch(ctx, ch_index, kind, &arg)?;
    ctx.log.record(ch_index as i32, name, &arg);

    // Bind cascade, depth-first in declaration order
    if depth < BIND_RECURSION_MAX && !ctx.module.bind.is_empty() {
        let matching: Vec<bind::BindEntry> = {
            let channel = &mut ctx.channels[ch_index];
            ctx.module
                .bind
                .iter()
                .filter(|entry| entry.matches(name, &arg, ctx.env, &mut channel.rand))
                .cloned()
                .collect()
        };
        for entry in matching {
            for target in &entry.targets {
                let target_ch =
                    (ch_index as i64 + target.ch_offset).rem_euclid(CHANNELS_MAX as i64) as usize;
                let target_arg = match &target.expr {
                    None => Value::None,
                    Some(expression) => {
                        let channel = &mut ctx.channels[ch_index];
                        match expr::evaluate(expression, ctx.env, &arg, &mut channel.rand) {
                            Ok(value) => value,
                            Err(_) => continue,
                        }
                    }
                };
                let coerced = lookup(&target.event_name)
                    .and_then(|(_, target_type)| coerce_arg(target_arg, target_type));
                if let Some(coerced) = coerced {
                    trigger_value(ctx, target_ch, &target.event_name, coerced, depth + 1)?;
                }
            }
        }
    }

    Ok(())
}

fn dispatch(
    ctx: &mut EventCtx,
    ch_index: usize,
    kind: EventKind,
    arg: &Value,
) -> Result<(), EngineError> {
    match kind {
        EventKind::Comment => {}

        EventKind::Cond => {
            if let Value::Bool(value) = arg {
                ctx.channels[ch_index].cond = *value;
            }
        }
        EventKind::CondIf => ctx.channels[ch_index].cond_if(),
        EventKind::CondElse => ctx.channels[ch_index].cond_else(),
        EventKind::CondEndIf => ctx.channels[ch_index].cond_end_if(),

        EventKind::Pause => ctx.master.playback = PlaybackState::Paused,
        EventKind::Resume => ctx.master.playback = PlaybackState::Playing,
        EventKind::PlayPattern => {
            if let Value::PatInstRef(piref) = arg {
                ctx.master.piref = Some(*piref);
                ctx.master.pos = Tstamp::zero();
                ctx.master.play_mode = PlayMode::PatternLoop;
                ctx.master.playback = PlaybackState::Playing;
            }
        }
        EventKind::SelectEnvVar => {
            if let Value::String(name) = arg {
                ctx.channels[ch_index].selected_env_var = Some(name.clone());
            }
        }
        EventKind::SetEnvVar => {
            let name = match &ctx.channels[ch_index].selected_env_var {
                Some(name) => name.clone(),
                None => return Ok(()),
            };
            if let Some(declared) = ctx.module.env_var_type(&name) {
                let value = if arg.value_type() == declared {
                    Some(arg.clone())
                } else {
                    arg.convert(declared)
                };
                if let Some(value) = value {
                    ctx.env.set(name, value);
                }
            }
        }
        EventKind::GotoSetTrack => {
            if let Value::Int(track) = arg {
                ctx.master.goto_track = (*track).max(0) as usize;
            }
        }
        EventKind::GotoSetSystem => {
            if let Value::Int(system) = arg {
                ctx.master.goto_system = (*system).max(0) as usize;
            }
        }
        EventKind::GotoSetRow => {
            if let Value::Tstamp(row) = arg {
                ctx.master.goto_row = *row;
            }
        }
        EventKind::Goto => {
            ctx.master.jump_target_track = Some(ctx.master.goto_track);
            ctx.master.jump_target_pat = None;
            ctx.master.jump_target_row = ctx.master.goto_row;
            ctx.master.do_jump = true;
        }
        EventKind::InfiniteOn => ctx.master.infinite = true,
        EventKind::InfiniteOff => ctx.master.infinite = false,

        EventKind::SetTempo => {
            if let Value::Float(tempo) = arg {
                if tempo.is_finite() && *tempo > 0.0 {
                    ctx.master.set_tempo(tempo.clamp(1.0, 999.0));
                }
            }
        }
        EventKind::SlideTempo => {
            if let Value::Float(target) = arg {
                if target.is_finite() && *target > 0.0 {
                    let tempo = ctx.master.tempo;
                    ctx.master.tempo_slider.set_value(tempo);
                    ctx.master.tempo_slider.slide_target(target.clamp(1.0, 999.0));
                }
            }
        }
        EventKind::SlideTempoLength => {
            if let Value::Tstamp(length) = arg {
                ctx.master.tempo_slider.set_length(*length);
            }
        }
        EventKind::SetVolume => {
            if let Value::Float(db) = arg {
                ctx.master.volume_db = *db;
                ctx.master.volume_slider.set_value(*db);
            }
        }
        EventKind::SlideVolume => {
            if let Value::Float(target) = arg {
                let db = ctx.master.volume_db;
                ctx.master.volume_slider.set_value(db);
                ctx.master.volume_slider.slide_target(*target);
            }
        }
        EventKind::SlideVolumeLength => {
            if let Value::Tstamp(length) = arg {
                ctx.master.volume_slider.set_length(*length);
            }
        }
        EventKind::Jump => {
            ctx.master.do_jump = true;
        }
        EventKind::JumpSetPat => {
            if let Value::PatInstRef(piref) = arg {
                ctx.master.jump_target_pat = Some(*piref);
            }
        }
        EventKind::JumpSetRow => {
            if let Value::Tstamp(row) = arg {
                ctx.master.jump_target_row = *row;
            }
        }
        EventKind::JumpSetTrack => {
            if let Value::Int(track) = arg {
                ctx.master.jump_target_track = Some((*track).max(0) as usize);
            }
        }
        EventKind::PatternDelay => {
            if let Value::Tstamp(delay) = arg {
                ctx.master.pattern_delay = *delay;
            }
        }
        EventKind::SetScale => {
            if let Value::Int(index) = arg {
                if (0..crate::limits::SCALES_MAX as i64).contains(index) {
                    ctx.master.active_scale = *index as usize;
                }
            }
        }
        EventKind::SetScaleFixedPoint => {
            if let Value::Int(index) = arg {
                ctx.master.scale_fixed_point = (*index).max(0) as usize;
            }
        }
        EventKind::ShiftScale => {
            if let Value::Float(cents) = arg {
                let index = ctx.master.active_scale;
                let fixed_point = ctx.master.scale_fixed_point;
                if let Some(scale) = ctx.scales.get_mut(index) {
                    scale.shift(fixed_point, *cents);
                }
            }
        }

        EventKind::NoteOn => {
            if let Value::Float(cents) = arg {
                note_on(ctx, ch_index, *cents, -1);
            }
        }
        EventKind::NoteOff => note_off(ctx, ch_index),
        EventKind::Hit => {
            if let Value::Int(hit) = arg {
                note_on(ctx, ch_index, 0.0, (*hit).max(0) as i32);
            }
        }
        EventKind::SetAuInput => {
            if let Value::Int(index) = arg {
                if (0..crate::limits::AUDIO_UNITS_MAX as i64).contains(index) {
                    ctx.channels[ch_index].au_index = *index as usize;
                }
            }
        }

        EventKind::SetForce => {
            if let Value::Float(db) = arg {
                let channel = &mut ctx.channels[ch_index];
                channel.force_controls.set_force(*db);
                for_each_fg_force(ctx, ch_index, |fc| fc.set_force(*db));
            }
        }
        EventKind::SlideForce => {
            if let Value::Float(db) = arg {
                ctx.channels[ch_index].force_controls.slide_target(*db);
                for_each_fg_force(ctx, ch_index, |fc| fc.slide_target(*db));
            }
        }
        EventKind::SlideForceLength => {
            if let Value::Tstamp(length) = arg {
                ctx.channels[ch_index].force_controls.slide_length(*length);
                for_each_fg_force(ctx, ch_index, |fc| fc.slide_length(*length));
            }
        }
        EventKind::TremoloSpeed => {
            if let Value::Float(speed) = arg {
                let channel = &mut ctx.channels[ch_index];
                channel.force_controls.tremolo.set_speed(*speed);
                if *speed > 0.0 {
                    channel.force_controls.tremolo.turn_on();
                } else {
                    channel.force_controls.tremolo.turn_off();
                }
                let speed = *speed;
                for_each_fg_force(ctx, ch_index, move |fc| {
                    fc.tremolo.set_speed(speed);
                    if speed > 0.0 {
                        fc.tremolo.turn_on();
                    } else {
                        fc.tremolo.turn_off();
                    }
                });
            }
        }
        EventKind::TremoloDepth => {
            if let Value::Float(depth) = arg {
                let channel = &mut ctx.channels[ch_index];
                channel.force_controls.tremolo.set_depth(*depth);
                let depth = *depth;
                for_each_fg_force(ctx, ch_index, move |fc| fc.tremolo.set_depth(depth));
            }
        }
        EventKind::AutowahSpeed => {
            if let Value::Float(speed) = arg {
                ctx.channels[ch_index].autowah.set_speed(*speed);
                let speed = *speed;
                for_each_fg_autowah(ctx, ch_index, move |aw| aw.set_speed(speed));
            }
        }
        EventKind::AutowahDepth => {
            if let Value::Float(depth) = arg {
                ctx.channels[ch_index].autowah.set_depth(*depth);
                let depth = *depth;
                for_each_fg_autowah(ctx, ch_index, move |aw| aw.set_depth(depth));
            }
        }
        EventKind::AutowahDelay => {
            if let Value::Tstamp(delay) = arg {
                ctx.channels[ch_index].autowah.set_delay(*delay);
                let delay = *delay;
                for_each_fg_autowah(ctx, ch_index, move |aw| aw.set_delay(delay));
            }
        }
        EventKind::CarryForceOn => ctx.channels[ch_index].carry_force = true,
        EventKind::CarryForceOff => ctx.channels[ch_index].carry_force = false,

        EventKind::SlidePitch => {
            if let Value::Float(cents) = arg {
                ctx.channels[ch_index].pitch_controls.slide_target(*cents);
                let cents = *cents;
                for_each_fg_pitch(ctx, ch_index, move |pc| pc.slide_target(cents));
            }
        }
        EventKind::SlidePitchLength => {
            if let Value::Tstamp(length) = arg {
                ctx.channels[ch_index].pitch_controls.slide_length(*length);
                let length = *length;
                for_each_fg_pitch(ctx, ch_index, move |pc| pc.slide_length(length));
            }
        }
        EventKind::VibratoSpeed => {
            if let Value::Float(speed) = arg {
                let channel = &mut ctx.channels[ch_index];
                channel.pitch_controls.vibrato.set_speed(*speed);
                if *speed > 0.0 {
                    channel.pitch_controls.vibrato.turn_on();
                } else {
                    channel.pitch_controls.vibrato.turn_off();
                }
                let speed = *speed;
                for_each_fg_pitch(ctx, ch_index, move |pc| {
                    pc.vibrato.set_speed(speed);
                    if speed > 0.0 {
                        pc.vibrato.turn_on();
                    } else {
                        pc.vibrato.turn_off();
                    }
                });
            }
        }
        EventKind::VibratoDepth => {
            if let Value::Float(depth) = arg {
                ctx.channels[ch_index].pitch_controls.vibrato.set_depth(*depth);
                let depth = *depth;
                for_each_fg_pitch(ctx, ch_index, move |pc| pc.vibrato.set_depth(depth));
            }
        }
        EventKind::CarryPitchOn => ctx.channels[ch_index].carry_pitch = true,
        EventKind::CarryPitchOff => ctx.channels[ch_index].carry_pitch = false,

        EventKind::ArpeggioOn => {
            let channel = &mut ctx.channels[ch_index];
            channel.arpeggio_on = true;
            let notes = channel.arpeggio_notes.clone();
            let speed = channel.arpeggio_speed;
            for_each_fg_pitch_voice(ctx, ch_index, move |pv| {
                pv.set_arpeggio(pv.orig_cents, notes.clone());
                pv.arpeggio_speed = speed;
            });
        }
        EventKind::ArpeggioOff => {
            ctx.channels[ch_index].arpeggio_on = false;
            for_each_fg_pitch_voice(ctx, ch_index, |pv| pv.disable_arpeggio());
        }
        EventKind::ArpeggioReset => {
            // A new phrase starts its tone list from scratch
            ctx.channels[ch_index].arpeggio_notes.clear();
            for_each_fg_pitch_voice(ctx, ch_index, |pv| pv.reset_arpeggio());
        }
        EventKind::ArpeggioSpeed => {
            if let Value::Float(speed) = arg {
                if *speed > 0.0 {
                    ctx.channels[ch_index].arpeggio_speed = *speed;
                    let speed = *speed;
                    for_each_fg_pitch_voice(ctx, ch_index, move |pv| pv.arpeggio_speed = speed);
                }
            }
        }
        EventKind::ArpeggioNote => {
            if let Value::Float(cents) = arg {
                let channel = &mut ctx.channels[ch_index];
                if channel.arpeggio_notes.len() < crate::limits::ARPEGGIO_TONES_MAX {
                    channel.arpeggio_notes.push(*cents);
                }
            }
        }

        EventKind::SelectControlVar => {
            if let Value::String(name) = arg {
                ctx.channels[ch_index].selected_cv = Some(name.clone());
            }
        }
        EventKind::SetControlVar => {
            apply_cv_op(ctx, ch_index, CvOp::Set(arg.clone()));
        }
        EventKind::SlideControlVar => {
            if let Value::Float(target) = arg {
                apply_cv_op(ctx, ch_index, CvOp::SlideTarget(*target));
            }
        }
        EventKind::SlideControlVarLength => {
            if let Value::Tstamp(length) = arg {
                apply_cv_op(ctx, ch_index, CvOp::SlideLength(*length));
            }
        }
        EventKind::OscControlVarSpeed => {
            if let Value::Float(speed) = arg {
                apply_cv_op(ctx, ch_index, CvOp::OscSpeed(*speed));
            }
        }
        EventKind::OscControlVarDepth => {
            if let Value::Float(depth) = arg {
                apply_cv_op(ctx, ch_index, CvOp::OscDepth(*depth));
            }
        }

        EventKind::AuBypassOn | EventKind::AuBypassOff => {
            let au_index = ctx.channels[ch_index].au_index;
            if let Some(au) = ctx.module.aus.get(&au_index) {
                if let Some(state) = ctx.dstates.get_mut(au.device_id) {
                    if let Some(au_state) = state.au_state_mut() {
                        au_state.bypass = kind == EventKind::AuBypassOn;
                    }
                }
            }
        }
        EventKind::AuSustain => {
            if let Value::Float(sustain) = arg {
                let au_index = ctx.channels[ch_index].au_index;
                if let Some(au) = ctx.module.aus.get(&au_index) {
                    if let Some(state) = ctx.dstates.get_mut(au.device_id) {
                        if let Some(au_state) = state.au_state_mut() {
                            au_state.sustain = sustain.clamp(0.0, 1.0);
                        }
                    }
                }
            }
        }

        EventKind::QueryLocation => {
            let pos = ctx.master.pos;
            let track = ctx.master.track as i64;
            let system = ctx.master.system as i64;
            ctx.log
                .record(ch_index as i32, "Atrack", &Value::Int(track));
            ctx.log
                .record(ch_index as i32, "Asystem", &Value::Int(system));
            ctx.log
                .record(ch_index as i32, "Arow", &Value::Tstamp(pos));
        }
        EventKind::QueryVoiceCount => {
            let count = ctx.pool.active_count() as i64;
            ctx.log
                .record(ch_index as i32, "Avoices", &Value::Int(count));
        }
        EventKind::QueryActualForce => {
            let db = ctx.channels[ch_index].force_controls.force_db;
            ctx.log.record(ch_index as i32, "Af", &Value::Float(db));
        }
    }
    Ok(())
}

/// Start the voices of one note (or hit) on a channel.
fn note_on(ctx: &mut EventCtx, ch_index: usize, cents: f64, hit_index: i32) {
    let au_index = ctx.channels[ch_index].au_index;
    let au = match ctx.module.aus.get(&au_index) {
        Some(au) if au.existent => au,
        _ => return,
    };

    // The previous note's voices move to the background
    note_off(ctx, ch_index);

    let group_id = ctx.pool.new_group_id();
    let proc_order = au.voice_proc_order();

    for proc_index in proc_order {
        let proc_ = match au.procs.get(&proc_index) {
            Some(p) => p,
            None => continue,
        };
        let kernel = match &proc_.kernel {
            Some(kernel) => kernel,
            None => continue,
        };

        let voice_index = ctx.pool.get_voice();
        let voice = match ctx.pool.voice_mut(voice_index) {
            Some(voice) => voice,
            None => continue,
        };

        voice.group_id = group_id;
        voice.ch_num = ch_index as i32;
        voice.au_index = au_index;
        voice.proc_index = proc_index;
        voice.proc_device = proc_.device_id;

        let seed = ctx.module.random_seed ^ voice.id;
        voice.state.init(seed);
        voice.state.orig_pitch_param = cents;
        voice.state.hit_index = hit_index;
        kernel.init_vstate(&mut voice.state);

        // Carried controls replace the fresh per-note state
        let channel = &mut ctx.channels[ch_index];
        match &mut voice.state.ext {
            VoiceExt::Pitch(pv) => {
                if channel.carry_pitch {
                    pv.controls = channel.pitch_controls.clone();
                } else {
                    channel.pitch_controls = PitchControls::new(cents);
                }
                if channel.arpeggio_on && !channel.arpeggio_notes.is_empty() {
                    pv.set_arpeggio(cents, channel.arpeggio_notes.clone());
                    pv.arpeggio_speed = channel.arpeggio_speed;
                }
            }
            VoiceExt::Force(fv) => {
                if channel.carry_force {
                    fv.controls = channel.force_controls.clone();
                } else {
                    channel.force_controls = Default::default();
                }
            }
            VoiceExt::Filter(fv) => {
                fv.autowah = channel.autowah.clone();
                fv.autowah.restart_delay();
            }
            VoiceExt::Stream(sv) => {
                if let Some(&carried) = channel
                    .selected_cv
                    .as_ref()
                    .and_then(|name| channel.carried_cv.get(name))
                {
                    sv.controls.set_value(carried);
                }
            }
            _ => {}
        }

        channel.fg.insert(
            proc_index,
            FgVoice {
                index: voice_index,
                id: voice.id,
            },
        );
    }
}

/// Release the foreground voices of a channel.
fn note_off(ctx: &mut EventCtx, ch_index: usize) {
    let fg: Vec<FgVoice> = ctx.channels[ch_index].fg.values().copied().collect();
    for fg_voice in fg {
        if let Some(voice) = ctx.pool.get_checked(fg_voice.index, fg_voice.id) {
            voice.state.set_note_off();
            voice.prio = VoicePrio::Bg;
        }
    }
    ctx.channels[ch_index].fg.clear();
}

fn apply_cv_op(ctx: &mut EventCtx, ch_index: usize, op: CvOp) {
    let (au_index, name) = {
        let channel = &ctx.channels[ch_index];
        match &channel.selected_cv {
            Some(name) => (channel.au_index, name.clone()),
            None => return,
        }
    };
    if let Some(au) = ctx.module.aus.get(&au_index) {
        let channel = &mut ctx.channels[ch_index];
        au.update_control_var(&name, &op, ctx.dstates, ctx.env, &mut channel.rand);

        // Track carried values for voice streams
        if let CvOp::Set(Value::Float(value)) = &op {
            channel.carried_cv.insert(name, *value);
        }
    }
}

fn for_each_fg_force(
    ctx: &mut EventCtx,
    ch_index: usize,
    f: impl Fn(&mut crate::note_controls::ForceControls),
) {
    let fg: Vec<FgVoice> = ctx.channels[ch_index].fg.values().copied().collect();
    for fg_voice in fg {
        if let Some(voice) = ctx.pool.get_checked(fg_voice.index, fg_voice.id) {
            if let VoiceExt::Force(fv) = &mut voice.state.ext {
                f(&mut fv.controls);
            }
        }
    }
}

fn for_each_fg_pitch(
    ctx: &mut EventCtx,
    ch_index: usize,
    f: impl Fn(&mut PitchControls),
) {
    let fg: Vec<FgVoice> = ctx.channels[ch_index].fg.values().copied().collect();
    for fg_voice in fg {
        if let Some(voice) = ctx.pool.get_checked(fg_voice.index, fg_voice.id) {
            if let VoiceExt::Pitch(pv) = &mut voice.state.ext {
                f(&mut pv.controls);
            }
        }
    }
}

fn for_each_fg_autowah(
    ctx: &mut EventCtx,
    ch_index: usize,
    f: impl Fn(&mut crate::note_controls::AutowahControls),
) {
    let fg: Vec<FgVoice> = ctx.channels[ch_index].fg.values().copied().collect();
    for fg_voice in fg {
        if let Some(voice) = ctx.pool.get_checked(fg_voice.index, fg_voice.id) {
            if let VoiceExt::Filter(fv) = &mut voice.state.ext {
                f(&mut fv.autowah);
            }
        }
    }
}

fn for_each_fg_pitch_voice(
    ctx: &mut EventCtx,
    ch_index: usize,
    f: impl Fn(&mut crate::procs::pitch::PitchVoice),
) {
    let fg: Vec<FgVoice> = ctx.channels[ch_index].fg.values().copied().collect();
    for fg_voice in fg {
        if let Some(voice) = ctx.pool.get_checked(fg_voice.index, fg_voice.id) {
            if let VoiceExt::Pitch(pv) = &mut voice.state.ext {
                f(pv);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::new_channels;
    use crate::expr::EnvState;
    use crate::master_params::MasterParams;
    use crate::module::Module;
    use crate::voice::VoicePool;

    fn test_module() -> Module {
        let mut module = Module::new();
        module
            .set_key("au_00/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
            .set_key("au_00/proc_00/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
            .set_key("au_00/proc_00/p_proc_type.json", &serde_json::json!("add"))
            .unwrap();
        module
            .set_key(
                "au_00/p_connections.json",
                &serde_json::json!([["proc_00/C/out_00", "out_00"]]),
            )
            .unwrap();
        module.validate().unwrap();
        module
    }

    struct Fixture {
        module: Module,
        master: MasterParams,
        channels: Vec<Channel>,
        pool: VoicePool,
        dstates: DeviceStates,
        env: EnvState,
        scales: Vec<Scale>,
        log: EventLog,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                module: test_module(),
                master: MasterParams::new(),
                channels: new_channels(0),
                pool: VoicePool::new(4),
                dstates: DeviceStates::new(64),
                env: EnvState::new(),
                scales: vec![Scale::default()],
                log: EventLog::new(),
            }
        }

        fn ctx(&mut self) -> EventCtx<'_> {
            EventCtx {
                module: &self.module,
                master: &mut self.master,
                channels: &mut self.channels,
                pool: &mut self.pool,
                dstates: &mut self.dstates,
                env: &mut self.env,
                scales: &mut self.scales,
                log: &mut self.log,
                audio_rate: 48000,
            }
        }
    }

    #[test]
    fn note_on_allocates_a_voice_group() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        drop(ctx);

        assert_eq!(fx.pool.active_count(), 1);
        assert_eq!(fx.channels[0].fg.len(), 1);
        let voice = fx.pool.voice(0).unwrap();
        assert_eq!(voice.prio, VoicePrio::New);
        assert!(voice.state.note_on);
    }

    #[test]
    fn note_off_demotes_to_background() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        trigger(&mut ctx, 0, "n-", &serde_json::Value::Null, None).unwrap();
        drop(ctx);

        let voice = fx.pool.voice(0).unwrap();
        assert_eq!(voice.prio, VoicePrio::Bg);
        assert!(!voice.state.note_on);
        assert!(fx.channels[0].fg.is_empty());
    }

    #[test]
    fn voice_stealing_scenario() {
        // Pool of two; three notes on the same channel
        let mut fx = Fixture::new();
        fx.pool = VoicePool::new(2);
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        drop(ctx);
        let first_fg = *fx.channels[0].fg.get(&0).unwrap();

        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(100), None).unwrap();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(200), None).unwrap();
        drop(ctx);

        // Both voices live, all ids distinct, the first handle is stale
        assert_eq!(fx.pool.active_count(), 2);
        let ids: Vec<u64> = fx.pool.iter().map(|v| v.id).collect();
        assert_ne!(ids[0], ids[1]);
        assert!(fx.pool.get_checked(first_fg.index, first_fg.id).is_none());
    }

    #[test]
    fn conditional_events_gate_execution() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "?", &serde_json::json!(false), None).unwrap();
        trigger(&mut ctx, 0, "?if", &serde_json::Value::Null, None).unwrap();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        drop(ctx);
        assert_eq!(fx.pool.active_count(), 0);

        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "?else", &serde_json::Value::Null, None).unwrap();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        trigger(&mut ctx, 0, "?endif", &serde_json::Value::Null, None).unwrap();
        drop(ctx);
        assert_eq!(fx.pool.active_count(), 1);
    }

    #[test]
    fn tempo_events_update_master() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "m.t", &serde_json::json!(150.0), None).unwrap();
        drop(ctx);
        assert_eq!(fx.master.tempo, 150.0);
    }

    #[test]
    fn expression_arguments_are_evaluated() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "m.t", &serde_json::json!("60 * 2"), None).unwrap();
        drop(ctx);
        assert_eq!(fx.master.tempo, 120.0);
    }

    #[test]
    fn bind_cascade_fires_targets() {
        let mut fx = Fixture::new();
        fx.module
            .set_key(
                "p_bind.json",
                &serde_json::json!([["n+", null, [[0, ["m.t", "$ + 60"]]]]]),
            )
            .unwrap();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(120.0), None).unwrap();
        drop(ctx);
        assert_eq!(fx.master.tempo, 180.0);
    }

    fn chain_module() -> Module {
        let mut module = Module::new();
        for (key, json) in [
            ("au_00/p_manifest.json", serde_json::json!({})),
            ("au_00/proc_00/p_manifest.json", serde_json::json!({})),
            ("au_00/proc_00/p_proc_type.json", serde_json::json!("add")),
            ("au_00/proc_01/p_manifest.json", serde_json::json!({})),
            ("au_00/proc_01/p_proc_type.json", serde_json::json!("filter")),
            (
                "au_00/p_connections.json",
                serde_json::json!([
                    ["proc_00/C/out_00", "proc_01/C/in_02"],
                    ["proc_01/C/out_00", "out_00"],
                ]),
            ),
        ] {
            module.set_key(key, &json).unwrap();
        }
        module.validate().unwrap();
        module
    }

    #[test]
    fn autowah_events_configure_filter_voices() {
        let mut fx = Fixture::new();
        fx.module = chain_module();

        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, ".aws", &serde_json::json!(5.0), None).unwrap();
        trigger(&mut ctx, 0, ".awd", &serde_json::json!(24.0), None).unwrap();
        trigger(&mut ctx, 0, ".awl", &serde_json::json!([1, 0]), None).unwrap();
        trigger(&mut ctx, 0, "n+", &serde_json::json!(0), None).unwrap();
        drop(ctx);

        // Settings are carried by the channel and by the new filter voice
        assert!(fx.channels[0].autowah.active());
        let filter_voice = fx
            .pool
            .iter()
            .find(|v| matches!(v.state.ext, VoiceExt::Filter(_)))
            .unwrap();
        match &filter_voice.state.ext {
            VoiceExt::Filter(fv) => {
                assert!(fv.autowah.active());
                assert_eq!(fv.autowah.delay(), crate::tstamp::Tstamp::new(1, 0));
            }
            _ => unreachable!(),
        }

        // Later updates reach the foreground voice as well
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, ".awl", &serde_json::json!([2, 0]), None).unwrap();
        drop(ctx);
        let filter_voice = fx
            .pool
            .iter()
            .find(|v| matches!(v.state.ext, VoiceExt::Filter(_)))
            .unwrap();
        match &filter_voice.state.ext {
            VoiceExt::Filter(fv) => {
                assert_eq!(fv.autowah.delay(), crate::tstamp::Tstamp::new(2, 0))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn arpeggio_reset_clears_the_note_list() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, ".arpn", &serde_json::json!(0.0), None).unwrap();
        trigger(&mut ctx, 0, ".arpn", &serde_json::json!(1200.0), None).unwrap();
        drop(ctx);
        assert_eq!(fx.channels[0].arpeggio_notes.len(), 2);

        let mut ctx = fx.ctx();
        trigger(&mut ctx, 0, ".arpr", &serde_json::Value::Null, None).unwrap();
        drop(ctx);
        assert!(fx.channels[0].arpeggio_notes.is_empty());
    }

    #[test]
    fn events_are_recorded_in_both_buffers() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        trigger(&mut ctx, 3, "m.t", &serde_json::json!(90.0), None).unwrap();
        drop(ctx);
        assert_eq!(fx.log.general.len(), 1);
        assert_eq!(fx.log.tracker.len(), 1);
        let events = fx.log.general.drain();
        assert_eq!(events[0].ch, 3);
        assert_eq!(events[0].name, "m.t");
    }
}
