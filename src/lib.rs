//! # Kunquat: A Modular Music Rendering Engine
//!
//! `kunquat` renders music from a *project*: a tree of typed keys mapping
//! to JSON values that describe songs, patterns, audio units, processors,
//! envelopes, connections and event bindings. A [`Handle`](handle::Handle)
//! consumes key uploads, validates the project and produces stereo float
//! frames on demand.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Handle                                 │  Key uploads, validation,
//! │  - set_data / validate / mix / fire     │  audio pull
//! ├─────────────────────────────────────────┤
//! │  Player                                 │  Per-block data flow
//! │  - transport, events, voices, mixing    │
//! ├─────────────────────────────────────────┤
//! │  Device graph                           │  Audio units & processors
//! │  - typed ports, cycle-free connections  │  with per-device state
//! ├─────────────────────────────────────────┤
//! │  DSP kernels                            │  add, filter, envgen,
//! │  - voice and mixed rendering            │  pitch, force, panning,
//! │                                         │  stream, freeverb
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Data flow per block
//!
//! 1. The player advances pattern time and fires every trigger whose row
//!    falls inside the block.
//! 2. Event handlers mutate channel, voice and device state and may start
//!    new voices.
//! 3. Each active voice group renders through its processor chain into
//!    voice-scoped buffers.
//! 4. Mixed signals flow through the connection graphs in dependency
//!    order.
//! 5. The master output is finalised with the mix and master volume, and
//!    amplitude statistics are updated.
//!
//! ## Quick start
//!
//! ```rust
//! use kunquat::prelude::*;
//!
//! let mut handle = Handle::new();
//!
//! // A minimal instrument: one additive oscillator wired to the output
//! handle.set_data("au_00/p_manifest.json", b"{}").unwrap();
//! handle.set_data("au_00/proc_00/p_manifest.json", b"{}").unwrap();
//! handle.set_data("au_00/proc_00/p_proc_type.json", b"\"add\"").unwrap();
//! handle
//!     .set_data(
//!         "au_00/p_connections.json",
//!         br#"[["proc_00/C/out_00", "out_00"], ["proc_00/C/out_01", "out_01"]]"#,
//!     )
//!     .unwrap();
//! handle
//!     .set_data(
//!         "p_connections.json",
//!         br#"[["au_00/out_00", "out_00"], ["au_00/out_01", "out_01"]]"#,
//!     )
//!     .unwrap();
//!
//! handle.validate().unwrap();
//! handle.fire(0, r#"["n+", 0]"#).unwrap();
//! let frames = handle.mix(256).unwrap();
//! let left = handle.buffer(0).unwrap();
//! assert_eq!(frames, 256);
//! assert!(left.iter().any(|&x| x != 0.0));
//! ```
//!
//! ## Determinism
//!
//! Rendering is sample-deterministic: a fixed project seed and the same
//! sequence of calls produce bit-identical output, regardless of how the
//! requested frames are split across `mix` calls.

pub mod audio_unit;
pub mod buffer;
pub mod channel;
pub mod connections;
pub mod control_vars;
pub mod controls;
pub mod device;
pub mod device_state;
pub mod envelope;
pub mod error;
pub mod events;
pub mod expr;
pub mod handle;
pub mod limits;
pub mod master_params;
pub mod module;
pub mod note_controls;
pub mod pattern;
pub mod player;
pub mod processor;
pub mod procs;
pub mod random;
pub mod sample;
pub mod scale;
pub mod streader;
pub mod tstamp;
pub mod value;
pub mod voice;
pub mod voice_state;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{EngineError, ErrorKind};
    pub use crate::handle::Handle;

    pub use crate::envelope::Envelope;
    pub use crate::tstamp::Tstamp;
    pub use crate::value::{PatInstRef, Value, ValueType};

    pub use crate::buffer::{AudioBuffer, WorkBuffer, WorkBuffers};
    pub use crate::controls::{Lfo, LfoMode, LinearControls, SlideMode, Slider, TimeEnvState};

    pub use crate::connections::{ConnLevel, Connections};
    pub use crate::device::{DeviceId, ParamValue, PortType, ProcImpl};

    pub use crate::events::{EventLog, FiredEvent};
    pub use crate::expr::{evaluate, EnvState};
    pub use crate::random::Random;

    pub use crate::master_params::{MasterParams, PlayMode, PlaybackState, RenderStats};
    pub use crate::voice::{Voice, VoicePool, VoicePrio};
}

// Re-export the handle at the crate root for convenience
pub use handle::Handle;
