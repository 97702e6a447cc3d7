//! The rendering driver.
//!
//! A player owns everything that changes while audio runs: transport,
//! channels, the voice pool, device states, scratch buffers, the
//! environment and the event log. Each requested block advances pattern
//! time, fires due triggers, renders voice groups, walks the mixed graph
//! and finalises the master output with the mix and master volume.

use crate::audio_unit::AudioUnit;
use crate::buffer::{AudioBuffer, WorkBuffers};
use crate::channel::{new_channels, Channel};
use crate::connections::Connections;
use crate::device::{DeviceId, PortType};
use crate::device_state::{DevState, DevStateKind, DeviceStates, ProcState};
use crate::error::EngineError;
use crate::events::{self, EventCtx, EventLog};
use crate::expr::EnvState;
use crate::limits::{BUFFERS_MAX, COLUMNS_MAX, SCALES_MAX, VOICES_DEFAULT};
use crate::master_params::{MasterParams, PlayMode, PlaybackState};
use crate::module::Module;
use crate::pattern::Pattern;
use crate::procs::db_to_scale;
use crate::scale::Scale;
use crate::tstamp::Tstamp;
use crate::value::PatInstRef;
use crate::voice::{VoicePool, VoicePrio};
use crate::voice_state::VoiceExt;
use log::debug;

/// Frames rendered per chunk while the tempo slider is active.
const TEMPO_SLIDE_CHUNK: usize = 16;

/// Boundary advances allowed without rendering before giving up (guards
/// against order lists made entirely of zero-length patterns).
const MAX_SILENT_ADVANCES: usize = 1024;

#[derive(Debug)]
pub struct Player {
    pub audio_rate: u32,
    pub audio_buffer_size: usize,

    pub master: MasterParams,
    pub channels: Vec<Channel>,
    pub pool: VoicePool,
    pub dstates: DeviceStates,
    pub wbs: WorkBuffers,
    pub env: EnvState,
    pub scales: Vec<Scale>,
    pub log: EventLog,

    master_out: AudioBuffer,

    /// Frames rendered since `master.pos` last changed.
    row_frames: u64,
    /// Remaining pattern-delay frames.
    delay_frames: u64,
    /// Next unfired trigger per column; index 0 is the global column.
    col_next: Vec<usize>,
    /// Pattern instance the column cursors refer to.
    cursor_piref: Option<PatInstRef>,
    transport_started: bool,
}

impl Player {
    pub fn new(module: &Module, audio_rate: u32, audio_buffer_size: usize) -> Self {
        let mut player = Self {
            audio_rate,
            audio_buffer_size,
            master: MasterParams::new(),
            channels: new_channels(module.random_seed),
            pool: VoicePool::new(VOICES_DEFAULT),
            dstates: DeviceStates::new(audio_buffer_size),
            wbs: WorkBuffers::new(audio_buffer_size),
            env: EnvState::new(),
            scales: Vec::new(),
            log: EventLog::new(),
            master_out: AudioBuffer::new(audio_buffer_size),
            row_frames: 0,
            delay_frames: 0,
            col_next: vec![0; COLUMNS_MAX + 1],
            cursor_piref: None,
            transport_started: false,
        };
        player.reset(module);
        debug!(
            "player ready: {} devices, rate {} Hz, block {} frames",
            module.device_count(),
            audio_rate,
            audio_buffer_size
        );
        player
    }

    /// Rebuild all transient state from the validated module.
    pub fn reset(&mut self, module: &Module) {
        self.master = MasterParams::new();
        self.master.tempo_slider.set_audio_rate(self.audio_rate);
        self.master.volume_slider.set_audio_rate(self.audio_rate);
        self.channels = new_channels(module.random_seed);
        for channel in &mut self.channels {
            channel.set_audio_rate(self.audio_rate);
        }
        self.pool.reset_all();
        self.env = EnvState::new();
        for decl in &module.environment {
            self.env.set(decl.name.clone(), decl.initial.clone());
        }
        self.scales = (0..SCALES_MAX)
            .map(|i| module.scales.get(&i).cloned().unwrap_or_default())
            .collect();
        self.dstates = build_device_states(module, self.audio_rate, self.audio_buffer_size);
        self.row_frames = 0;
        self.delay_frames = 0;
        self.col_next = vec![0; COLUMNS_MAX + 1];
        self.cursor_piref = None;
        self.transport_started = false;
    }

    pub fn set_audio_rate(&mut self, module: &Module, audio_rate: u32) {
        self.audio_rate = audio_rate;
        self.reset(module);
    }

    pub fn set_audio_buffer_size(&mut self, buf_size: usize) {
        self.audio_buffer_size = buf_size;
        self.master_out.resize(buf_size);
        self.wbs.resize(buf_size);
        self.dstates.resize_buffers(buf_size);
    }

    pub fn buffer(&self, ch: usize) -> Option<&[f32]> {
        if ch < BUFFERS_MAX {
            Some(self.master_out.channel(ch).contents())
        } else {
            None
        }
    }

    /// Fire an external event outside pattern playback.
    pub fn fire(
        &mut self,
        module: &Module,
        ch: usize,
        name: &str,
        arg: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut ctx = EventCtx {
            module,
            master: &mut self.master,
            channels: &mut self.channels,
            pool: &mut self.pool,
            dstates: &mut self.dstates,
            env: &mut self.env,
            scales: &mut self.scales,
            log: &mut self.log,
            audio_rate: self.audio_rate,
        };
        events::trigger(&mut ctx, ch, name, arg, None)
    }

    /// Render up to `nframes` frames into the master output buffers.
    pub fn play(&mut self, module: &Module, nframes: usize) -> usize {
        let nframes = nframes.min(self.audio_buffer_size);
        if nframes == 0 {
            return 0;
        }

        self.master_out.clear(0, nframes);

        if self.master.playback == PlaybackState::Paused {
            return nframes;
        }

        self.start_transport(module);

        let mut rendered = 0;
        let mut silent_advances = 0;

        while rendered < nframes {
            if self.master.playback == PlaybackState::Stopped {
                break;
            }
            if self.master.do_jump {
                self.perform_jump(module);
            }

            // Pattern delay holds the row while audio continues
            if self.delay_frames > 0 {
                let chunk = (nframes - rendered).min(self.delay_frames as usize);
                let chunk = self.capped_chunk(chunk);
                self.render_chunk(module, rendered, rendered + chunk);
                self.delay_frames -= chunk as u64;
                rendered += chunk;
                continue;
            }

            let pattern = self.current_pattern(module);
            let Some((piref, pat_length)) = pattern.map(|(p, pat)| (p, pat.length)) else {
                // No transport: keep rendering for externally fired voices
                let chunk = self.capped_chunk(nframes - rendered);
                self.render_chunk(module, rendered, rendered + chunk);
                rendered += chunk;
                continue;
            };

            self.sync_cursors(module, piref);
            self.fire_current_row(module);

            if self.master.do_jump {
                continue;
            }
            if self.delay_frames > 0 {
                continue;
            }
            if self.master.playback != PlaybackState::Playing {
                break;
            }

            // Next stop: the closest later trigger or the pattern end
            let boundary = self
                .next_trigger_pos(module)
                .map(|ts| ts.min(pat_length))
                .unwrap_or(pat_length);

            let needed = self.frames_to(boundary);
            if self.row_frames >= needed {
                if boundary >= pat_length {
                    silent_advances += 1;
                    if silent_advances > MAX_SILENT_ADVANCES {
                        self.master.playback = PlaybackState::Stopped;
                        break;
                    }
                    self.advance_pattern(module);
                } else {
                    self.master.pos = boundary;
                    self.row_frames = 0;
                }
                continue;
            }

            let mut chunk = (needed - self.row_frames) as usize;
            chunk = chunk.min(nframes - rendered);
            chunk = self.capped_chunk(chunk);
            if chunk == 0 {
                break;
            }

            self.render_chunk(module, rendered, rendered + chunk);
            self.row_frames += chunk as u64;
            rendered += chunk;
            silent_advances = 0;
        }

        // Anything not rendered after a stop stays silent
        if self.master.playback == PlaybackState::Stopped {
            rendered
        } else {
            nframes
        }
    }

    fn capped_chunk(&self, chunk: usize) -> usize {
        if self.master.tempo_slider.in_progress() {
            chunk.min(TEMPO_SLIDE_CHUNK).max(1)
        } else {
            chunk
        }
    }

    /// Resolve the album position on the first play call.
    fn start_transport(&mut self, module: &Module) {
        if self.transport_started {
            return;
        }
        self.transport_started = true;

        if self.master.piref.is_some() {
            return;
        }
        let Some(tracks) = &module.album_tracks else {
            return;
        };
        let Some(&song_index) = tracks.first() else {
            return;
        };
        let Some(song) = module.songs.get(&song_index) else {
            return;
        };
        self.master.song = Some(song_index);
        self.master.track = 0;
        self.master.system = 0;
        self.master.set_tempo(song.tempo);
        self.master.piref = song.order_list.first().copied();
        self.master.pos = Tstamp::zero();
        self.row_frames = 0;
        debug!("transport starts at song {}", song_index);
    }

    fn current_pattern<'m>(&self, module: &'m Module) -> Option<(PatInstRef, &'m Pattern)> {
        let piref = self.master.piref?;
        let pattern = module.patterns.get(&(piref.pat as usize))?;
        if !pattern.existent {
            return None;
        }
        Some((piref, pattern))
    }

    /// Reset column cursors when the pattern changes under them.
    fn sync_cursors(&mut self, module: &Module, piref: PatInstRef) {
        if self.cursor_piref == Some(piref) {
            return;
        }
        self.cursor_piref = Some(piref);
        let pos = self.master.pos;
        if let Some(pattern) = module.patterns.get(&(piref.pat as usize)) {
            self.col_next[0] = pattern.global_col.first_at_or_after(pos);
            for col in 0..COLUMNS_MAX {
                self.col_next[col + 1] = pattern
                    .column(col)
                    .map(|c| c.first_at_or_after(pos))
                    .unwrap_or(0);
            }
        }
    }

    /// Fire every trigger at the current row, global column first.
    fn fire_current_row(&mut self, module: &Module) {
        let Some((_, pattern)) = self.current_pattern(module) else {
            return;
        };
        let pos = self.master.pos;

        // Collect this row's triggers so event handlers may freely mutate
        // the player state
        let mut due: Vec<(usize, String, serde_json::Value)> = Vec::new();

        {
            let triggers = pattern.global_col.triggers();
            let mut idx = self.col_next[0];
            while idx < triggers.len() && triggers[idx].0 == pos {
                let trig = &triggers[idx].1;
                due.push((
                    0,
                    trig.name.clone(),
                    trig.arg.clone().unwrap_or(serde_json::Value::Null),
                ));
                idx += 1;
            }
            self.col_next[0] = idx;
        }

        for col in 0..COLUMNS_MAX {
            let Some(column) = pattern.column(col) else {
                continue;
            };
            let triggers = column.triggers();
            let mut idx = self.col_next[col + 1];
            while idx < triggers.len() && triggers[idx].0 == pos {
                let trig = &triggers[idx].1;
                due.push((
                    col,
                    trig.name.clone(),
                    trig.arg.clone().unwrap_or(serde_json::Value::Null),
                ));
                idx += 1;
            }
            self.col_next[col + 1] = idx;
        }

        for (ch, name, arg) in due {
            let mut ctx = EventCtx {
                module,
                master: &mut self.master,
                channels: &mut self.channels,
                pool: &mut self.pool,
                dstates: &mut self.dstates,
                env: &mut self.env,
                scales: &mut self.scales,
                log: &mut self.log,
                audio_rate: self.audio_rate,
            };
            if let Err(err) = events::trigger(&mut ctx, ch, &name, &arg, None) {
                debug!("trigger {} failed: {}", name, err);
            }

            // A pattern delay fired on this row converts to frames now
            if !self.master.pattern_delay.is_zero() {
                let delay = self.master.pattern_delay;
                self.master.pattern_delay = Tstamp::zero();
                self.delay_frames +=
                    delay.to_frames(self.master.tempo, self.audio_rate).ceil() as u64;
            }
        }
    }

    /// Position of the next unfired trigger in any column.
    fn next_trigger_pos(&self, module: &Module) -> Option<Tstamp> {
        let (_, pattern) = self.current_pattern(module)?;
        let mut next: Option<Tstamp> = None;

        let mut consider = |candidate: Option<&(Tstamp, crate::pattern::Trigger)>| {
            if let Some((pos, _)) = candidate {
                next = Some(match next {
                    Some(best) => best.min(*pos),
                    None => *pos,
                });
            }
        };

        consider(pattern.global_col.triggers().get(self.col_next[0]));
        for col in 0..COLUMNS_MAX {
            if let Some(column) = pattern.column(col) {
                consider(column.triggers().get(self.col_next[col + 1]));
            }
        }
        next
    }

    /// Frames from the current row to `target` at the current tempo.
    fn frames_to(&self, target: Tstamp) -> u64 {
        let span = target - self.master.pos;
        if span <= Tstamp::zero() {
            return 0;
        }
        span.to_frames(self.master.tempo, self.audio_rate).ceil() as u64
    }

    fn perform_jump(&mut self, module: &Module) {
        self.master.do_jump = false;
        // An interrupted tempo slide keeps the tempo it reached
        self.master.stop_tempo_slide();

        if let Some(target_pat) = self.master.jump_target_pat {
            self.master.piref = Some(target_pat);
        } else if let Some(track) = self.master.jump_target_track {
            if let Some(tracks) = &module.album_tracks {
                if let Some(&song_index) = tracks.get(track) {
                    if let Some(song) = module.songs.get(&song_index) {
                        self.master.track = track;
                        self.master.song = Some(song_index);
                        self.master.system = 0;
                        self.master.piref = song.order_list.first().copied();
                    }
                }
            }
        }
        self.master.jump_target_track = None;

        self.master.pos = self.master.jump_target_row;
        self.row_frames = 0;
        self.cursor_piref = None;
        debug!(
            "jump to {:?} row [{}, {}]",
            self.master.piref,
            self.master.pos.beats(),
            self.master.pos.rem()
        );
    }

    fn advance_pattern(&mut self, module: &Module) {
        self.master.pos = Tstamp::zero();
        self.row_frames = 0;
        self.cursor_piref = None;

        match self.master.play_mode {
            PlayMode::PatternLoop => {}
            PlayMode::PatternOnce => {
                self.master.playback = PlaybackState::Stopped;
            }
            PlayMode::Album => {
                let Some(song_index) = self.master.song else {
                    self.master.playback = PlaybackState::Stopped;
                    return;
                };
                let Some(song) = module.songs.get(&song_index) else {
                    self.master.playback = PlaybackState::Stopped;
                    return;
                };

                self.master.system += 1;
                if self.master.system < song.order_list.len() {
                    self.master.piref = song.order_list.get(self.master.system).copied();
                    return;
                }

                // Song finished: next track, or wrap in infinite mode
                let tracks = module.album_tracks.as_deref().unwrap_or(&[]);
                self.master.track += 1;
                if self.master.track >= tracks.len() {
                    if self.master.infinite && !tracks.is_empty() {
                        self.master.track = 0;
                    } else {
                        self.master.playback = PlaybackState::Stopped;
                        self.master.piref = None;
                        return;
                    }
                }
                let song_index = tracks[self.master.track];
                self.master.song = Some(song_index);
                self.master.system = 0;
                if let Some(song) = module.songs.get(&song_index) {
                    self.master.set_tempo(song.tempo);
                    self.master.piref = song.order_list.first().copied();
                } else {
                    self.master.playback = PlaybackState::Stopped;
                }
            }
        }
    }

    /// Render audio for `[start, stop)` of the current block.
    fn render_chunk(&mut self, module: &Module, start: usize, stop: usize) {
        if start >= stop {
            return;
        }

        // Tempo slide advances at chunk granularity
        if self.master.tempo_slider.in_progress() {
            self.master.tempo_slider.skip(stop - start);
            self.master.tempo = self.master.tempo_slider.value();
        }
        let tempo = self.master.tempo;

        for (_, state) in self.dstates.iter_mut() {
            state.clear_buffers(start, stop);
        }

        self.render_voice_groups(module, start, stop, tempo);

        if let Some(connections) = &module.connections {
            self.mix_graph(module, connections, None, start, stop, tempo);
        }

        self.finalize_output(module, start, stop);
    }

    fn render_voice_groups(&mut self, module: &Module, start: usize, stop: usize, tempo: f64) {
        for group_id in self.pool.active_group_ids() {
            let members = self.pool.group_members(group_id);
            if members.is_empty() {
                continue;
            }

            let au_index = self.pool.voice(members[0]).map(|v| v.au_index).unwrap_or(0);
            let Some(au) = module.aus.get(&au_index) else {
                continue;
            };

            // Render in the unit's processing order
            let order = au.voice_proc_order();
            let mut ordered: Vec<usize> = Vec::with_capacity(members.len());
            for proc_index in &order {
                for &member in &members {
                    if self.pool.voice(member).map(|v| v.proc_index) == Some(*proc_index) {
                        ordered.push(member);
                    }
                }
            }

            for &voice_index in &ordered {
                self.render_one_voice(module, au, voice_index, start, stop, tempo);
            }

            // Make rendered voices audible on the mixed path
            for &voice_index in &ordered {
                let Some(voice) = self.pool.voice(voice_index) else {
                    continue;
                };
                if voice.prio == VoicePrio::Inactive {
                    continue;
                }
                if proc_feeds_mixed(au, voice.proc_index) {
                    self.dstates.mix_voice_signals(voice.proc_device, start, stop);
                }
            }

            // Deactivate voices that finished during this block
            for &voice_index in &ordered {
                if let Some(voice) = self.pool.voice_mut(voice_index) {
                    if voice.prio != VoicePrio::Inactive && voice.state.has_finished {
                        voice.reset();
                    } else if voice.prio == VoicePrio::New {
                        voice.prio = VoicePrio::Fg;
                    }
                }
            }

            // A group left with only pass-through voices produces nothing
            let has_source = ordered.iter().any(|&i| {
                self.pool
                    .voice(i)
                    .map(|v| {
                        v.prio != VoicePrio::Inactive
                            && !matches!(
                                v.state.ext,
                                VoiceExt::Filter(_) | VoiceExt::Panning(_)
                            )
                    })
                    .unwrap_or(false)
            });
            if !has_source {
                for &voice_index in &ordered {
                    if let Some(voice) = self.pool.voice_mut(voice_index) {
                        if voice.prio != VoicePrio::Inactive {
                            voice.reset();
                        }
                    }
                }
            }
        }
    }

    fn render_one_voice(
        &mut self,
        module: &Module,
        au: &AudioUnit,
        voice_index: usize,
        start: usize,
        stop: usize,
        tempo: f64,
    ) {
        let Some(voice) = self.pool.voice(voice_index) else {
            return;
        };
        if voice.prio == VoicePrio::Inactive || !voice.state.active {
            return;
        }
        let proc_index = voice.proc_index;
        let proc_device = voice.proc_device;
        let group_id = voice.group_id;

        let Some(proc_) = au.procs.get(&proc_index) else {
            return;
        };
        let Some(kernel) = &proc_.kernel else {
            return;
        };

        let au_sustain = self
            .dstates
            .get(au.device_id)
            .and_then(|s| match &s.kind {
                DevStateKind::Au(au_state) => Some(au_state.sustain),
                _ => None,
            })
            .unwrap_or(0.0);

        // Fresh voice buffers, then voice signals from upstream group
        // members
        if let Some(state) = self.dstates.get_mut(proc_device) {
            state.clear_voice_buffers(start, stop);
        }
        if let Some(connections) = &au.connections {
            let proc_name = format!("proc_{:02x}", proc_index);
            if let Some(node) = connections.node_by_name(&proc_name) {
                let edges: Vec<_> = node.receives.clone();
                for edge in edges {
                    let src_node = connections.node(edge.src);
                    let Some(src_digits) = src_node.name.strip_prefix("proc_") else {
                        continue;
                    };
                    let Ok(src_proc) = usize::from_str_radix(src_digits, 16) else {
                        continue;
                    };
                    // Only voices of the same group feed this input
                    let src_voice_device = self
                        .pool
                        .iter()
                        .find(|v| {
                            v.prio != VoicePrio::Inactive
                                && v.group_id == group_id
                                && v.proc_index == src_proc
                        })
                        .map(|v| v.proc_device);
                    if let Some(src_device) = src_voice_device {
                        self.dstates.transfer_voice(
                            src_device,
                            edge.send_port,
                            proc_device,
                            edge.recv_port,
                            start,
                            stop,
                        );
                    }
                }
            }
        }

        let Some(voice) = self.pool.voice_mut(voice_index) else {
            return;
        };
        let Some(state) = self.dstates.get_mut(proc_device) else {
            return;
        };
        let audio_rate = state.audio_rate;
        let Some(proc_state) = state.proc_state_mut() else {
            return;
        };
        let ProcState {
            voice_in,
            voice_out,
            ext,
        } = proc_state;

        voice.state.keep_alive_stop = 0;
        let mut ctx = crate::device_state::VoiceRenderCtx {
            vstate: &mut voice.state,
            voice_in,
            voice_out,
            ext,
            au_sustain,
            wbs: &mut self.wbs,
            audio_rate,
            buf_start: start,
            buf_stop: stop,
            tempo,
        };
        let _render_stop = kernel.render_voice(&mut ctx);

        if !voice.state.active {
            voice.reset();
            return;
        }
        if !voice.state.note_on && voice.prio == VoicePrio::Fg {
            voice.prio = VoicePrio::Bg;
        }
    }

    /// Walk one connection graph, dependencies first.
    fn mix_graph(
        &mut self,
        module: &Module,
        connections: &Connections,
        au: Option<&AudioUnit>,
        start: usize,
        stop: usize,
        tempo: f64,
    ) {
        for &node_key in connections.topo_order() {
            let node = connections.node(node_key);
            let Some(dst_device) = node.device_id else {
                continue;
            };

            // Gather inputs from upstream sends
            for edge in &node.receives {
                let src_node = connections.node(edge.src);
                let Some(src_device) = src_node.device_id else {
                    continue;
                };
                self.dstates.transfer_mixed(
                    src_device,
                    edge.send_port,
                    dst_device,
                    edge.recv_port,
                    start,
                    stop,
                );
            }

            // Process the node itself
            if node.name.is_empty() || node.name == "Iin" {
                continue;
            }
            if let Some(digits) = node.name.strip_prefix("au_") {
                let Ok(index) = usize::from_str_radix(digits, 16) else {
                    continue;
                };
                let target = match au {
                    Some(parent) => parent.sub_aus.get(&index),
                    None => module.aus.get(&index),
                };
                if let Some(target) = target {
                    if target.existent {
                        self.mix_audio_unit(module, target, start, stop, tempo);
                    }
                }
            } else if let Some(digits) = node.name.strip_prefix("proc_") {
                let Ok(index) = usize::from_str_radix(digits, 16) else {
                    continue;
                };
                if let Some(parent) = au {
                    self.render_mixed_proc(parent, index, start, stop, tempo);
                }
            }
        }
    }

    fn mix_audio_unit(
        &mut self,
        module: &Module,
        au: &AudioUnit,
        start: usize,
        stop: usize,
        tempo: f64,
    ) {
        let bypass = self
            .dstates
            .get(au.device_id)
            .and_then(|s| match &s.kind {
                DevStateKind::Au(au_state) => Some(au_state.bypass),
                _ => None,
            })
            .unwrap_or(false);

        if bypass {
            if let Some(state) = self.dstates.get_mut(au.device_id) {
                bypass_mix(state, start, stop);
            }
            return;
        }

        let Some(connections) = &au.connections else {
            return;
        };

        // The unit's external inputs enter the subgraph through the input
        // interface
        transfer_in_to_out(&mut self.dstates, au.device_id, au.in_iface_id, start, stop);

        self.mix_graph(module, connections, Some(au), start, stop, tempo);

        // The output interface's gathered inputs are the unit's result
        transfer_in_to_out(&mut self.dstates, au.out_iface_id, au.device_id, start, stop);
    }

    fn render_mixed_proc(
        &mut self,
        au: &AudioUnit,
        proc_index: usize,
        start: usize,
        stop: usize,
        tempo: f64,
    ) {
        let Some(proc_) = au.procs.get(&proc_index) else {
            return;
        };
        if !proc_.existent {
            return;
        }
        let Some(kernel) = &proc_.kernel else {
            return;
        };
        if !kernel.has_mixed_output() {
            return;
        }

        let Some(state) = self.dstates.get_mut(proc_.device_id) else {
            return;
        };
        let audio_rate = state.audio_rate;
        let DevState {
            in_bufs,
            out_bufs,
            kind,
            ..
        } = state;
        let DevStateKind::Proc(proc_state) = kind else {
            return;
        };

        let mut ctx = crate::device_state::MixedRenderCtx {
            in_bufs,
            out_bufs,
            ext: &mut proc_state.ext,
            wbs: &mut self.wbs,
            audio_rate,
            buf_start: start,
            buf_stop: stop,
            tempo,
        };
        kernel.render_mixed(&mut ctx);
    }

    /// Copy the master's gathered inputs into the output buffers with the
    /// mix and master volume applied, updating playback statistics.
    fn finalize_output(&mut self, module: &Module, start: usize, stop: usize) {
        let mix_scale = db_to_scale(module.mix_vol_db);
        let sliding = self.master.volume_slider.in_progress();

        let master_state = self.dstates.get(module.master_id);
        for ch in 0..BUFFERS_MAX {
            let out = self.master_out.channel_mut(ch);
            let src = master_state.and_then(|s| s.in_bufs.get(&(ch as u8)));

            let mut volume_slider = self.master.volume_slider.clone();
            let mut volume = db_to_scale(self.master.volume_db);
            for i in start..stop {
                if sliding {
                    volume = db_to_scale(volume_slider.step());
                }
                let value = src.map(|b| b.get(i as i32)).unwrap_or(0.0)
                    * (mix_scale * volume) as f32;
                out.set(i as i32, value);
                self.master.stats.observe(ch, value);
            }
            // Both channels share one slider; keep the advanced copy after
            // the last channel
            if ch == BUFFERS_MAX - 1 {
                self.master.volume_slider = volume_slider;
                if sliding {
                    self.master.volume_db = self.master.volume_slider.value();
                }
            }
        }
        self.master.stats.frames_total += (stop - start) as u64;
    }
}

/// Whether a processor's output reaches any non-voice destination inside
/// its unit (the interface or a mixed-only processor).
fn proc_feeds_mixed(au: &AudioUnit, proc_index: usize) -> bool {
    let Some(connections) = &au.connections else {
        return false;
    };
    let proc_name = format!("proc_{:02x}", proc_index);
    let Some(src_key) = connections
        .iter_nodes()
        .find(|(_, n)| n.name == proc_name)
        .map(|(k, _)| k)
    else {
        return false;
    };

    for (_, node) in connections.iter_nodes() {
        for edge in &node.receives {
            if edge.src != src_key {
                continue;
            }
            if let Some(digits) = node.name.strip_prefix("proc_") {
                let dst_is_voice = usize::from_str_radix(digits, 16)
                    .ok()
                    .and_then(|i| au.procs.get(&i))
                    .map(|p| p.supports_voices())
                    .unwrap_or(false);
                if !dst_is_voice {
                    return true;
                }
            } else {
                // Interface or nested unit
                return true;
            }
        }
    }
    false
}

/// Add a device's receive buffers into its own send buffers.
fn bypass_mix(state: &mut DevState, start: usize, stop: usize) {
    let DevState {
        in_bufs, out_bufs, ..
    } = state;
    for (port, in_buf) in in_bufs.iter() {
        if let Some(out_buf) = out_bufs.get_mut(port) {
            out_buf.mix(in_buf, start, stop);
        }
    }
}

/// Add `src`'s receive buffers into `dst`'s send buffers (matching ports).
/// Used to move a unit's input into its input interface and a unit's
/// gathered output out of its output interface.
fn transfer_in_to_out(
    dstates: &mut DeviceStates,
    src: DeviceId,
    dst: DeviceId,
    start: usize,
    stop: usize,
) {
    let ports: Vec<u8> = dstates
        .get(src)
        .map(|s| s.in_bufs.keys().copied().collect())
        .unwrap_or_default();
    for port in ports {
        dstates.transfer_across(src, false, dst, true, port, start, stop);
    }
}

/// Build the device state table for a validated module.
pub fn build_device_states(module: &Module, audio_rate: u32, buf_size: usize) -> DeviceStates {
    let mut dstates = DeviceStates::new(buf_size);

    dstates.insert(
        module.master_id,
        DevState::new(audio_rate, buf_size, DevStateKind::Generic),
    );

    for au in module.aus.values() {
        build_au_states(au, audio_rate, buf_size, &mut dstates);
    }

    // Buffers for every connected port
    if let Some(connections) = &module.connections {
        for (node_key, port_type, port) in connections.port_usage() {
            let node = connections.node(node_key);
            if let Some(device) = node.device_id {
                if let Some(state) = dstates.get_mut(device) {
                    state.add_buffer(port_type, port);
                }
            }
        }
    }
    for au in module.aus.values() {
        allocate_au_buffers(au, &mut dstates);
    }

    dstates
}

fn build_au_states(au: &AudioUnit, audio_rate: u32, buf_size: usize, dstates: &mut DeviceStates) {
    dstates.insert(
        au.device_id,
        DevState::new(audio_rate, buf_size, DevStateKind::Au(Default::default())),
    );
    dstates.insert(
        au.in_iface_id,
        DevState::new(audio_rate, buf_size, DevStateKind::Generic),
    );
    dstates.insert(
        au.out_iface_id,
        DevState::new(audio_rate, buf_size, DevStateKind::Generic),
    );

    for proc_ in au.procs.values() {
        let ext = proc_
            .kernel
            .as_ref()
            .map(|k| k.new_ext(audio_rate, buf_size))
            .unwrap_or_default();
        let state = DevState::new(
            audio_rate,
            buf_size,
            DevStateKind::Proc(ProcState {
                ext,
                ..Default::default()
            }),
        );
        dstates.insert(proc_.device_id, state);
    }

    for sub_au in au.sub_aus.values() {
        build_au_states(sub_au, audio_rate, buf_size, dstates);
    }
}

fn allocate_au_buffers(au: &AudioUnit, dstates: &mut DeviceStates) {
    if let Some(connections) = &au.connections {
        for (node_key, port_type, port) in connections.port_usage() {
            let node = connections.node(node_key);
            let Some(device) = node.device_id else {
                continue;
            };
            if let Some(state) = dstates.get_mut(device) {
                state.add_buffer(port_type, port);
                // Voice processors mirror every mixed port with a voice
                // buffer
                state.add_voice_buffer(port_type, port);
            }
        }

        // The input interface sends the unit's external input into the
        // subgraph on matching port numbers
        let in_ports: Vec<u8> = dstates
            .get(au.device_id)
            .map(|s| s.in_bufs.keys().copied().collect())
            .unwrap_or_default();
        if let Some(iface) = dstates.get_mut(au.in_iface_id) {
            for port in in_ports {
                iface.add_buffer(PortType::Send, port);
            }
        }

        // The unit's send buffers must exist for every port its output
        // interface gathers
        let out_ports: Vec<u8> = dstates
            .get(au.out_iface_id)
            .map(|s| s.in_bufs.keys().copied().collect())
            .unwrap_or_default();
        if let Some(state) = dstates.get_mut(au.device_id) {
            for port in out_ports {
                state.add_buffer(PortType::Send, port);
            }
        }
    }

    for sub_au in au.sub_aus.values() {
        allocate_au_buffers(sub_au, dstates);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_module() -> Module {
        let mut module = Module::new();
        for (key, json) in [
            ("au_00/p_manifest.json", serde_json::json!({})),
            ("au_00/proc_00/p_manifest.json", serde_json::json!({})),
            ("au_00/proc_00/p_proc_type.json", serde_json::json!("add")),
            (
                "au_00/p_connections.json",
                serde_json::json!([
                    ["proc_00/C/out_00", "out_00"],
                    ["proc_00/C/out_01", "out_01"],
                ]),
            ),
            (
                "p_connections.json",
                serde_json::json!([
                    ["au_00/out_00", "out_00"],
                    ["au_00/out_01", "out_01"],
                ]),
            ),
        ] {
            module.set_key(key, &json).unwrap();
        }
        module.validate().unwrap();
        module
    }

    #[test]
    fn fired_note_renders_a_sine_on_the_master_output() {
        let module = sine_module();
        let mut player = Player::new(&module, 48000, 256);
        player
            .fire(&module, 0, "n+", &serde_json::json!(0))
            .unwrap();
        let frames = player.play(&module, 64);
        assert_eq!(frames, 64);

        let out = player.buffer(0).unwrap();
        assert_eq!(out[0], 0.0);
        let expected = (std::f64::consts::TAU * 440.0 * 12.0 / 48000.0).sin();
        assert!((out[12] as f64 - expected).abs() < 1e-5);
    }

    #[test]
    fn mix_zero_frames_is_a_no_op() {
        let module = sine_module();
        let mut player = Player::new(&module, 48000, 64);
        assert_eq!(player.play(&module, 0), 0);
        assert_eq!(player.master.pos, Tstamp::zero());
        assert_eq!(player.master.stats.frames_total, 0);
    }

    #[test]
    fn block_splitting_is_bit_identical() {
        let module = sine_module();

        let mut one_call = Player::new(&module, 48000, 256);
        one_call
            .fire(&module, 0, "n+", &serde_json::json!(0))
            .unwrap();
        one_call.play(&module, 128);
        let reference = one_call.buffer(0).unwrap()[..128].to_vec();

        let mut many_calls = Player::new(&module, 48000, 256);
        many_calls
            .fire(&module, 0, "n+", &serde_json::json!(0))
            .unwrap();
        let mut collected = Vec::new();
        for _ in 0..128 {
            many_calls.play(&module, 1);
            collected.push(many_calls.buffer(0).unwrap()[0]);
        }

        assert_eq!(reference, collected);
    }

    #[test]
    fn voice_rings_past_the_pattern_end() {
        let mut module = sine_module();
        for (key, json) in [
            ("album/p_manifest.json", serde_json::json!({})),
            ("album/p_tracks.json", serde_json::json!([0])),
            ("song_00/p_manifest.json", serde_json::json!({})),
            ("song_00/p_order_list.json", serde_json::json!([[0, 0]])),
            ("pat_000/p_manifest.json", serde_json::json!({})),
            (
                "pat_000/instance_000/p_manifest.json",
                serde_json::json!({}),
            ),
            ("pat_000/p_pattern.json", serde_json::json!({"length": [1, 0]})),
            (
                "pat_000/col_00/p_triggers.json",
                serde_json::json!([[[0, 0], ["n+", 0]]]),
            ),
        ] {
            module.set_key(key, &json).unwrap();
        }
        module.validate().unwrap();

        let mut player = Player::new(&module, 48000, 4096);
        let mut total = 0;
        while total < 24000 {
            total += player.play(&module, 4096);
        }
        assert!(player.pool.active_count() > 0);
    }

    #[test]
    fn pattern_jump_moves_the_transport() {
        let mut module = sine_module();
        for (key, json) in [
            ("album/p_manifest.json", serde_json::json!({})),
            ("album/p_tracks.json", serde_json::json!([0])),
            ("song_00/p_manifest.json", serde_json::json!({})),
            (
                "song_00/p_order_list.json",
                serde_json::json!([[0, 0], [1, 0]]),
            ),
            ("pat_000/p_manifest.json", serde_json::json!({})),
            (
                "pat_000/instance_000/p_manifest.json",
                serde_json::json!({}),
            ),
            ("pat_000/p_pattern.json", serde_json::json!({"length": [4, 0]})),
            (
                "pat_000/gcol/p_triggers.json",
                serde_json::json!([
                    [[2, 0], ["mj.pat", [1, 0]]],
                    [[2, 0], ["mj.row", [0, 0]]],
                    [[2, 0], ["mjump", null]],
                ]),
            ),
            ("pat_001/p_manifest.json", serde_json::json!({})),
            (
                "pat_001/instance_000/p_manifest.json",
                serde_json::json!({}),
            ),
            ("pat_001/p_pattern.json", serde_json::json!({"length": [8, 0]})),
        ] {
            module.set_key(key, &json).unwrap();
        }
        module.validate().unwrap();

        let mut player = Player::new(&module, 48000, 4096);
        // Rows at 120 BPM: [2, 0] is one second, i.e. 48000 frames
        let mut total = 0;
        while total < 100_000 {
            let rendered = player.play(&module, 4096);
            total += rendered;
            if rendered == 0 {
                break;
            }
        }
        assert_eq!(player.master.piref, Some(PatInstRef::new(1, 0)));
        // Everything after frame 48 000 was rendered inside pattern 1
        assert_eq!(player.row_frames, (total - 48_000) as u64);
    }

    #[test]
    fn zero_length_pattern_advances_without_rendering() {
        let mut module = sine_module();
        for (key, json) in [
            ("album/p_manifest.json", serde_json::json!({})),
            ("album/p_tracks.json", serde_json::json!([0])),
            ("song_00/p_manifest.json", serde_json::json!({})),
            ("song_00/p_order_list.json", serde_json::json!([[0, 0]])),
            ("pat_000/p_manifest.json", serde_json::json!({})),
            (
                "pat_000/instance_000/p_manifest.json",
                serde_json::json!({}),
            ),
            ("pat_000/p_pattern.json", serde_json::json!({"length": [0, 0]})),
        ] {
            module.set_key(key, &json).unwrap();
        }
        module.validate().unwrap();

        let mut player = Player::new(&module, 48000, 64);
        player.play(&module, 64);
        assert_eq!(player.master.playback, PlaybackState::Stopped);
    }
}
