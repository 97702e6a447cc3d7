//! The handle API.
//!
//! A handle owns one project and everything needed to render it. The
//! caller uploads keys, validates, and then pulls audio: `mix(n)` renders
//! up to `n` frames and `buffer(ch)` exposes the result per channel.
//! Failed operations return an error and leave it retrievable from the
//! handle, so bindings with a C-like surface can poll `error_string`.

use crate::error::{EngineError, ErrorKind};
use crate::module::Module;
use crate::player::Player;
use log::{debug, info};
use std::collections::HashMap;

const DEFAULT_AUDIO_RATE: u32 = 48000;
const DEFAULT_BUFFER_SIZE: usize = 2048;

pub struct Handle {
    module: Module,
    keys: HashMap<String, Vec<u8>>,
    player: Option<Player>,
    validated: bool,
    audio_rate: u32,
    audio_buffer_size: usize,
    last_error: Option<EngineError>,
}

impl Handle {
    pub fn new() -> Self {
        info!("creating handle");
        Self {
            module: Module::new(),
            keys: HashMap::new(),
            player: None,
            validated: false,
            audio_rate: DEFAULT_AUDIO_RATE,
            audio_buffer_size: DEFAULT_BUFFER_SIZE,
            last_error: None,
        }
    }

    fn record<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// The most recent error message, or an empty string.
    pub fn error_string(&self) -> &str {
        self.last_error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("")
    }

    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Upload one key. The raw bytes are kept for reading back; the parsed
    /// form goes into the project. Empty data deletes the key.
    pub fn set_data(&mut self, key: &str, data: &[u8]) -> Result<(), EngineError> {
        let result = self.set_data_inner(key, data);
        self.record(result)
    }

    fn set_data_inner(&mut self, key: &str, data: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() || key.contains("..") || !key.is_ascii() {
            return Err(EngineError::argument(format!("Invalid key: {:?}", key)));
        }

        let json = if data.is_empty() {
            serde_json::Value::Null
        } else {
            let text = std::str::from_utf8(data)
                .map_err(|_| EngineError::format(format!("{}: data is not UTF-8", key)))?;
            serde_json::from_str(text)
                .map_err(|e| EngineError::format(format!("{}: {}", key, e)))?
        };

        self.module.set_key(key, &json)?;

        if data.is_empty() {
            self.keys.remove(key);
        } else {
            self.keys.insert(key.to_string(), data.to_vec());
        }
        self.validated = false;
        debug!("set {} ({} bytes)", key, data.len());
        Ok(())
    }

    /// Read back the raw bytes of a key.
    pub fn get_data(&self, key: &str) -> Option<&[u8]> {
        self.keys.get(key).map(Vec::as_slice)
    }

    /// Check the project and prepare the rendering state.
    pub fn validate(&mut self) -> Result<(), EngineError> {
        let result = self.validate_inner();
        self.record(result)
    }

    fn validate_inner(&mut self) -> Result<(), EngineError> {
        self.module.validate()?;
        self.player = Some(Player::new(
            &self.module,
            self.audio_rate,
            self.audio_buffer_size,
        ));
        self.validated = true;
        info!("project validated: {} devices", self.module.device_count());
        Ok(())
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn set_audio_rate(&mut self, rate: u32) -> Result<(), EngineError> {
        if rate == 0 {
            let err = Err(EngineError::argument("Audio rate must be positive"));
            return self.record(err);
        }
        self.audio_rate = rate;
        if let Some(player) = &mut self.player {
            let module = &self.module;
            player.set_audio_rate(module, rate);
        }
        Ok(())
    }

    pub fn audio_rate(&self) -> u32 {
        self.audio_rate
    }

    pub fn set_audio_buffer_size(&mut self, size: usize) -> Result<(), EngineError> {
        if size == 0 {
            let err = Err(EngineError::argument("Buffer size must be positive"));
            return self.record(err);
        }
        self.audio_buffer_size = size;
        if let Some(player) = &mut self.player {
            player.set_audio_buffer_size(size);
        }
        Ok(())
    }

    pub fn audio_buffer_size(&self) -> usize {
        self.audio_buffer_size
    }

    /// Render up to `nframes` frames. Returns the number actually mixed.
    pub fn mix(&mut self, nframes: usize) -> Result<usize, EngineError> {
        if !self.validated {
            let err = Err(EngineError::argument(
                "Cannot mix: the project has not been validated",
            ));
            return self.record(err);
        }
        let module = &self.module;
        let player = self
            .player
            .as_mut()
            .unwrap_or_else(|| unreachable!("validated handles have a player"));
        Ok(player.play(module, nframes))
    }

    /// The rendered frames of one output channel.
    pub fn buffer(&self, ch: usize) -> Option<&[f32]> {
        self.player.as_ref().and_then(|p| p.buffer(ch))
    }

    /// Fire an event described as `["name", argument]`.
    pub fn fire(&mut self, ch: usize, event_json: &str) -> Result<(), EngineError> {
        let result = self.fire_inner(ch, event_json);
        self.record(result)
    }

    fn fire_inner(&mut self, ch: usize, event_json: &str) -> Result<(), EngineError> {
        if !self.validated {
            return Err(EngineError::argument(
                "Cannot fire: the project has not been validated",
            ));
        }
        let parsed: serde_json::Value = serde_json::from_str(event_json)
            .map_err(|e| EngineError::format(format!("Event is not valid JSON: {}", e)))?;
        let parts = parsed
            .as_array()
            .filter(|p| !p.is_empty() && p.len() <= 2)
            .ok_or_else(|| EngineError::format("Event is not a [name, argument] pair"))?;
        let name = parts[0]
            .as_str()
            .ok_or_else(|| EngineError::format("Event name is not a string"))?;
        let arg = parts.get(1).cloned().unwrap_or(serde_json::Value::Null);

        let module = &self.module;
        let player = self
            .player
            .as_mut()
            .unwrap_or_else(|| unreachable!("validated handles have a player"));
        player.fire(module, ch, name, &arg)
    }

    /// Drain the observer event buffer.
    pub fn receive_events(&mut self) -> Vec<crate::events::FiredEvent> {
        self.player
            .as_mut()
            .map(|p| p.log.general.drain())
            .unwrap_or_default()
    }

    /// Playback statistics of the master output.
    pub fn stats(&self) -> Option<&crate::master_params::RenderStats> {
        self.player.as_ref().map(|p| &p.master.stats)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(handle: &mut Handle, key: &str, json: serde_json::Value) {
        handle.set_data(key, json.to_string().as_bytes()).unwrap();
    }

    fn sine_project() -> Handle {
        let mut handle = Handle::new();
        upload(&mut handle, "au_00/p_manifest.json", serde_json::json!({}));
        upload(
            &mut handle,
            "au_00/proc_00/p_manifest.json",
            serde_json::json!({}),
        );
        upload(
            &mut handle,
            "au_00/proc_00/p_proc_type.json",
            serde_json::json!("add"),
        );
        upload(
            &mut handle,
            "au_00/p_connections.json",
            serde_json::json!([
                ["proc_00/C/out_00", "out_00"],
                ["proc_00/C/out_01", "out_01"],
            ]),
        );
        upload(
            &mut handle,
            "p_connections.json",
            serde_json::json!([
                ["au_00/out_00", "out_00"],
                ["au_00/out_01", "out_01"],
            ]),
        );
        handle
    }

    #[test]
    fn keys_round_trip_exactly() {
        let mut handle = Handle::new();
        let bytes = br#"{ "length": [4, 0] }"#;
        handle.set_data("pat_000/p_pattern.json", bytes).unwrap();
        assert_eq!(handle.get_data("pat_000/p_pattern.json"), Some(&bytes[..]));

        // Deletion removes the stored bytes
        handle.set_data("pat_000/p_pattern.json", b"").unwrap();
        assert_eq!(handle.get_data("pat_000/p_pattern.json"), None);
    }

    #[test]
    fn mix_requires_validation() {
        let mut handle = sine_project();
        let err = handle.mix(64).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Argument);
        assert!(!handle.error_string().is_empty());

        handle.validate().unwrap();
        assert_eq!(handle.mix(64).unwrap(), 64);
    }

    #[test]
    fn validate_is_idempotent() {
        let mut handle = sine_project();
        handle.validate().unwrap();
        handle.validate().unwrap();
        assert!(handle.is_validated());
    }

    #[test]
    fn malformed_json_reports_a_format_error() {
        let mut handle = Handle::new();
        let err = handle
            .set_data("p_composition.json", b"{ not json")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
        assert!(handle.error_string().contains("p_composition.json"));
    }

    #[test]
    fn fired_note_produces_the_expected_sine() {
        let mut handle = sine_project();
        handle.validate().unwrap();
        handle.fire(0, r#"["n+", 0]"#).unwrap();
        handle.mix(64).unwrap();

        let out = handle.buffer(0).unwrap();
        assert_eq!(out[0], 0.0);
        let expected = (std::f64::consts::TAU * 440.0 * 12.0 / 48000.0).sin();
        assert!((out[12] as f64 - expected).abs() < 1e-5);

        let stats = handle.stats().unwrap();
        assert_eq!(stats.clipped, [0, 0]);
    }

    #[test]
    fn fire_accepts_expression_arguments() {
        let mut handle = sine_project();
        handle.validate().unwrap();
        handle.fire(0, r#"["n+", "600 * 2"]"#).unwrap();
        assert_eq!(handle.mix(16).unwrap(), 16);
    }

    #[test]
    fn bad_events_are_rejected() {
        let mut handle = sine_project();
        handle.validate().unwrap();
        assert!(handle.fire(0, "not json").is_err());
        assert!(handle.fire(0, r#"["no_such_event", 1]"#).is_err());
        assert!(handle.fire(9999, r#"["n+", 0]"#).is_err());
    }

    #[test]
    fn cycle_in_connections_is_a_format_error() {
        let mut handle = Handle::new();
        let err = handle
            .set_data(
                "p_connections.json",
                br#"[["au_00/out_00", "au_01/in_00"], ["au_01/out_00", "au_00/in_00"]]"#,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn nonexistent_connected_unit_renders_silence() {
        let mut handle = Handle::new();
        // au_01 is wired up but never given a manifest
        upload(
            &mut handle,
            "p_connections.json",
            serde_json::json!([["au_01/out_00", "out_00"]]),
        );
        handle.validate().unwrap();
        handle.mix(64).unwrap();
        let out = handle.buffer(0).unwrap();
        assert!(out[..64].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn events_can_be_observed() {
        let mut handle = sine_project();
        handle.validate().unwrap();
        handle.fire(0, r#"["m.t", 90.0]"#).unwrap();
        let events = handle.receive_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "m.t");
    }
}
