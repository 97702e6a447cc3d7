//! Transient per-device state.
//!
//! Device states live outside the project data so that key updates never
//! race with rendering: the project tables describe configuration, the
//! [`DeviceStates`] table holds everything that changes while audio runs.
//! Each state owns one mono buffer per connected port; processors also own
//! a voice-scoped buffer pair per port for the currently rendered voice.

use crate::buffer::{WorkBuffer, WorkBuffers};
use crate::device::{DeviceId, PortType};
use crate::procs::filter::FilterStateImpl;
use crate::procs::freeverb::FreeverbPState;
use crate::procs::stream::StreamPState;
use crate::voice_state::VoiceState;
use std::collections::{BTreeMap, HashMap};

/// Kernel-specific mixed-path state of a processor.
#[derive(Debug, Default)]
pub enum ProcExt {
    #[default]
    None,
    Filter(FilterStateImpl),
    Freeverb(FreeverbPState),
    Stream(StreamPState),
}

/// Processor-specific extras on top of the common device state.
#[derive(Debug, Default)]
pub struct ProcState {
    pub voice_in: BTreeMap<u8, WorkBuffer>,
    pub voice_out: BTreeMap<u8, WorkBuffer>,
    pub ext: ProcExt,
}

/// Audio-unit-specific extras.
#[derive(Debug)]
pub struct AuState {
    pub bypass: bool,
    pub sustain: f64,
}

impl Default for AuState {
    fn default() -> Self {
        Self {
            bypass: false,
            sustain: 0.0,
        }
    }
}

#[derive(Debug)]
pub enum DevStateKind {
    /// Master node and interface devices.
    Generic,
    Au(AuState),
    Proc(ProcState),
}

/// Transient state of one device.
#[derive(Debug)]
pub struct DevState {
    pub audio_rate: u32,
    pub buf_size: usize,
    pub in_bufs: BTreeMap<u8, WorkBuffer>,
    pub out_bufs: BTreeMap<u8, WorkBuffer>,
    pub kind: DevStateKind,
}

impl DevState {
    pub fn new(audio_rate: u32, buf_size: usize, kind: DevStateKind) -> Self {
        Self {
            audio_rate,
            buf_size,
            in_bufs: BTreeMap::new(),
            out_bufs: BTreeMap::new(),
            kind,
        }
    }

    /// Ensure a buffer exists for the given port.
    pub fn add_buffer(&mut self, port_type: PortType, port: u8) {
        let buf_size = self.buf_size;
        let bufs = match port_type {
            PortType::Receive => &mut self.in_bufs,
            PortType::Send => &mut self.out_bufs,
        };
        bufs.entry(port).or_insert_with(|| WorkBuffer::new(buf_size));
    }

    /// Ensure voice buffers exist for the given port of a processor.
    pub fn add_voice_buffer(&mut self, port_type: PortType, port: u8) {
        let buf_size = self.buf_size;
        if let DevStateKind::Proc(proc) = &mut self.kind {
            let bufs = match port_type {
                PortType::Receive => &mut proc.voice_in,
                PortType::Send => &mut proc.voice_out,
            };
            bufs.entry(port).or_insert_with(|| WorkBuffer::new(buf_size));
        }
    }

    pub fn resize_buffers(&mut self, buf_size: usize) {
        self.buf_size = buf_size;
        for buf in self.in_bufs.values_mut().chain(self.out_bufs.values_mut()) {
            buf.resize(buf_size);
        }
        if let DevStateKind::Proc(proc) = &mut self.kind {
            for buf in proc.voice_in.values_mut().chain(proc.voice_out.values_mut()) {
                buf.resize(buf_size);
            }
        }
    }

    pub fn clear_buffers(&mut self, start: usize, stop: usize) {
        for buf in self.in_bufs.values_mut().chain(self.out_bufs.values_mut()) {
            buf.clear(start, stop);
        }
    }

    pub fn clear_voice_buffers(&mut self, start: usize, stop: usize) {
        if let DevStateKind::Proc(proc) = &mut self.kind {
            for buf in proc.voice_in.values_mut().chain(proc.voice_out.values_mut()) {
                buf.clear(start, stop);
            }
        }
    }

    pub fn proc_state_mut(&mut self) -> Option<&mut ProcState> {
        match &mut self.kind {
            DevStateKind::Proc(proc) => Some(proc),
            _ => None,
        }
    }

    pub fn au_state_mut(&mut self) -> Option<&mut AuState> {
        match &mut self.kind {
            DevStateKind::Au(au) => Some(au),
            _ => None,
        }
    }
}

/// Read the frame contents of a port buffer, if it exists.
pub fn port_contents(bufs: &BTreeMap<u8, WorkBuffer>, port: u8) -> Option<&[f32]> {
    bufs.get(&port).map(WorkBuffer::contents)
}

/// The state table of every device in a validated project.
#[derive(Debug, Default)]
pub struct DeviceStates {
    states: HashMap<DeviceId, DevState>,
    scratch: WorkBuffer,
}

impl DeviceStates {
    pub fn new(buf_size: usize) -> Self {
        Self {
            states: HashMap::new(),
            scratch: WorkBuffer::new(buf_size),
        }
    }

    pub fn insert(&mut self, id: DeviceId, state: DevState) {
        self.states.insert(id, state);
    }

    pub fn get(&self, id: DeviceId) -> Option<&DevState> {
        self.states.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut DevState> {
        self.states.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&DeviceId, &mut DevState)> {
        self.states.iter_mut()
    }

    pub fn resize_buffers(&mut self, buf_size: usize) {
        self.scratch.resize(buf_size);
        for state in self.states.values_mut() {
            state.resize_buffers(buf_size);
        }
    }

    /// Add `src`'s mixed send buffer into `dst`'s mixed receive buffer.
    ///
    /// Routed through a scratch buffer so two table entries are never
    /// borrowed at once.
    pub fn transfer_mixed(
        &mut self,
        src: DeviceId,
        src_port: u8,
        dst: DeviceId,
        dst_port: u8,
        start: usize,
        stop: usize,
    ) {
        let mut scratch = std::mem::take(&mut self.scratch);
        if let Some(src_buf) = self.states.get(&src).and_then(|s| s.out_bufs.get(&src_port)) {
            scratch.copy(src_buf, start, stop);
            if let Some(dst_buf) = self
                .states
                .get_mut(&dst)
                .and_then(|s| s.in_bufs.get_mut(&dst_port))
            {
                dst_buf.mix(&scratch, start, stop);
            }
        }
        self.scratch = scratch;
    }

    /// Add `src`'s voice send buffer into `dst`'s voice receive buffer.
    pub fn transfer_voice(
        &mut self,
        src: DeviceId,
        src_port: u8,
        dst: DeviceId,
        dst_port: u8,
        start: usize,
        stop: usize,
    ) {
        let mut scratch = std::mem::take(&mut self.scratch);
        let src_buf = self.states.get(&src).and_then(|s| match &s.kind {
            DevStateKind::Proc(proc) => proc.voice_out.get(&src_port),
            _ => None,
        });
        if let Some(src_buf) = src_buf {
            scratch.copy(src_buf, start, stop);
            let dst_buf = self.states.get_mut(&dst).and_then(|s| match &mut s.kind {
                DevStateKind::Proc(proc) => proc.voice_in.get_mut(&dst_port),
                _ => None,
            });
            if let Some(dst_buf) = dst_buf {
                dst_buf.mix(&scratch, start, stop);
            }
        }
        self.scratch = scratch;
    }

    /// Add one port buffer of `src` into one port buffer of `dst`, picking
    /// the receive or send side of each device.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_across(
        &mut self,
        src: DeviceId,
        src_out: bool,
        dst: DeviceId,
        dst_out: bool,
        port: u8,
        start: usize,
        stop: usize,
    ) {
        let mut scratch = std::mem::take(&mut self.scratch);
        let copied = match self.states.get(&src) {
            Some(state) => {
                let bufs = if src_out { &state.out_bufs } else { &state.in_bufs };
                match bufs.get(&port) {
                    Some(buf) => {
                        scratch.copy(buf, start, stop);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };
        if copied {
            if let Some(state) = self.states.get_mut(&dst) {
                let bufs = if dst_out {
                    &mut state.out_bufs
                } else {
                    &mut state.in_bufs
                };
                if let Some(buf) = bufs.get_mut(&port) {
                    buf.mix(&scratch, start, stop);
                }
            }
        }
        self.scratch = scratch;
    }

    /// Add a processor's voice send buffers into its own mixed send
    /// buffers, making the rendered voice audible on the mixed path.
    pub fn mix_voice_signals(&mut self, id: DeviceId, start: usize, stop: usize) {
        if let Some(state) = self.states.get_mut(&id) {
            if let DevStateKind::Proc(proc) = &mut state.kind {
                for (port, voice_buf) in &proc.voice_out {
                    if let Some(mixed_buf) = state.out_bufs.get_mut(port) {
                        mixed_buf.mix(voice_buf, start, stop);
                    }
                }
            }
        }
    }
}

/// Everything a kernel needs to render one voice block.
pub struct VoiceRenderCtx<'a> {
    pub vstate: &'a mut VoiceState,
    pub voice_in: &'a BTreeMap<u8, WorkBuffer>,
    pub voice_out: &'a mut BTreeMap<u8, WorkBuffer>,
    pub ext: &'a mut ProcExt,
    pub au_sustain: f64,
    pub wbs: &'a mut WorkBuffers,
    pub audio_rate: u32,
    pub buf_start: usize,
    pub buf_stop: usize,
    pub tempo: f64,
}

/// Everything a kernel needs to render one mixed block.
pub struct MixedRenderCtx<'a> {
    pub in_bufs: &'a BTreeMap<u8, WorkBuffer>,
    pub out_bufs: &'a mut BTreeMap<u8, WorkBuffer>,
    pub ext: &'a mut ProcExt,
    pub wbs: &'a mut WorkBuffers,
    pub audio_rate: u32,
    pub buf_start: usize,
    pub buf_stop: usize,
    pub tempo: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_mixed_adds_between_devices() {
        let mut states = DeviceStates::new(8);
        let mut src = DevState::new(48000, 8, DevStateKind::Generic);
        src.add_buffer(PortType::Send, 0);
        src.out_bufs.get_mut(&0).unwrap().contents_mut().fill(0.5);
        let mut dst = DevState::new(48000, 8, DevStateKind::Generic);
        dst.add_buffer(PortType::Receive, 3);
        states.insert(1, src);
        states.insert(2, dst);

        states.transfer_mixed(1, 0, 2, 3, 0, 8);
        states.transfer_mixed(1, 0, 2, 3, 0, 8);
        let out = states.get(2).unwrap().in_bufs.get(&3).unwrap();
        assert!(out.contents().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn missing_buffers_make_transfer_a_no_op() {
        let mut states = DeviceStates::new(8);
        states.insert(1, DevState::new(48000, 8, DevStateKind::Generic));
        states.insert(2, DevState::new(48000, 8, DevStateKind::Generic));
        states.transfer_mixed(1, 0, 2, 0, 0, 8);
    }

    #[test]
    fn buffer_sizes_follow_resize() {
        let mut states = DeviceStates::new(8);
        let mut dev = DevState::new(48000, 8, DevStateKind::Proc(ProcState::default()));
        dev.add_buffer(PortType::Send, 0);
        dev.add_voice_buffer(PortType::Send, 0);
        states.insert(1, dev);

        states.resize_buffers(64);
        let state = states.get(1).unwrap();
        assert_eq!(state.out_bufs.get(&0).unwrap().len(), 64);
        match &state.kind {
            DevStateKind::Proc(proc) => {
                assert_eq!(proc.voice_out.get(&0).unwrap().len(), 64)
            }
            _ => unreachable!(),
        }
    }
}
