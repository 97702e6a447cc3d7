//! The loaded project.
//!
//! A module is the parsed form of every uploaded key: sheet data (songs,
//! patterns, an album), the audio unit table, the root connection graph,
//! the environment declarations and the bind table. It stays immutable
//! while a block renders; key uploads happen between blocks and mark the
//! handle as needing validation.

use crate::audio_unit::AudioUnit;
use crate::connections::{ConnLevel, Connections};
use crate::device::DeviceId;
use crate::error::EngineError;
use crate::events::bind::{parse_bind, BindEntry};
use crate::limits::{AUDIO_UNITS_MAX, PATTERNS_MAX, SCALES_MAX, SONGS_MAX, TRACKS_MAX};
use crate::pattern::{Column, Pattern};
use crate::scale::Scale;
use crate::tstamp::Tstamp;
use crate::value::{PatInstRef, Value, ValueType};
use std::collections::BTreeMap;

/// One song: an ordered list of pattern instances plus defaults.
#[derive(Debug, Clone)]
pub struct Song {
    pub existent: bool,
    pub tempo: f64,
    pub global_vol_db: f64,
    pub order_list: Vec<PatInstRef>,
}

impl Default for Song {
    fn default() -> Self {
        Self {
            existent: false,
            tempo: 120.0,
            global_vol_db: 0.0,
            order_list: Vec::new(),
        }
    }
}

/// A declared environment variable with its initial value.
#[derive(Debug, Clone)]
pub struct EnvVarDecl {
    pub name: String,
    pub initial: Value,
}

#[derive(Debug, Default)]
pub struct Module {
    pub random_seed: u64,
    pub mix_vol_db: f64,
    pub aus: BTreeMap<usize, AudioUnit>,
    pub connections: Option<Connections>,
    pub patterns: BTreeMap<usize, Pattern>,
    pub songs: BTreeMap<usize, Song>,
    pub album_tracks: Option<Vec<usize>>,
    pub environment: Vec<EnvVarDecl>,
    pub bind: Vec<BindEntry>,
    pub scales: BTreeMap<usize, Scale>,
    /// Id of the master device after validation.
    pub master_id: DeviceId,
    device_id_counter: DeviceId,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and store one key upload.
    pub fn set_key(&mut self, key: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        if let Some(rest) = key.strip_prefix("au_") {
            let (index, subkey) = split_index(rest, 2)?;
            if index >= AUDIO_UNITS_MAX {
                return Err(EngineError::format("Audio unit index out of range"));
            }
            return self
                .aus
                .entry(index)
                .or_insert_with(AudioUnit::new)
                .set_key(subkey, json);
        }

        if let Some(rest) = key.strip_prefix("pat_") {
            return self.set_pattern_key(rest, json);
        }

        if let Some(rest) = key.strip_prefix("song_") {
            let (index, subkey) = split_index(rest, 2)?;
            if index >= SONGS_MAX {
                return Err(EngineError::format("Song index out of range"));
            }
            return self.set_song_key(index, subkey, json);
        }

        if let Some(rest) = key.strip_prefix("album/") {
            return self.set_album_key(rest, json);
        }

        if let Some(rest) = key.strip_prefix("scale_") {
            let (index, subkey) = split_index(rest, 1)?;
            if index >= SCALES_MAX {
                return Err(EngineError::format("Scale index out of range"));
            }
            if subkey == "p_scale.json" {
                self.scales.insert(index, Scale::from_json(json)?);
            }
            return Ok(());
        }

        match key {
            "p_connections.json" => {
                self.connections = Some(Connections::from_json(json, ConnLevel::Global)?);
            }
            "p_random_seed.json" => {
                self.random_seed = json
                    .as_u64()
                    .ok_or_else(|| EngineError::format("Random seed is not an integer"))?;
            }
            "p_composition.json" => {
                if let Some(vol) = json.get("mix_vol").and_then(|v| v.as_f64()) {
                    if !vol.is_finite() {
                        return Err(EngineError::format("Mix volume is not finite"));
                    }
                    self.mix_vol_db = vol;
                }
            }
            "p_environment.json" => {
                self.environment = parse_environment(json)?;
            }
            "p_bind.json" => {
                self.bind = parse_bind(json)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_pattern_key(&mut self, rest: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        let (index, subkey) = split_index(rest, 3)?;
        if index >= PATTERNS_MAX {
            return Err(EngineError::format("Pattern index out of range"));
        }
        let pat = self.patterns.entry(index).or_insert_with(Pattern::new);

        if let Some(inst_rest) = subkey.strip_prefix("instance_") {
            let (inst, inst_key) = split_index(inst_rest, 3)?;
            if inst_key == "p_manifest.json" && !json.is_null() {
                pat.add_instance(inst)?;
            }
            return Ok(());
        }

        if let Some(col_rest) = subkey.strip_prefix("col_") {
            let (col, col_key) = split_index(col_rest, 2)?;
            if col_key == "p_triggers.json" {
                pat.set_column(col, Column::from_json(json)?)?;
            }
            return Ok(());
        }

        if let Some(gcol_key) = subkey.strip_prefix("gcol/") {
            if gcol_key == "p_triggers.json" {
                pat.global_col = Column::from_json(json)?;
            }
            return Ok(());
        }

        match subkey {
            "p_manifest.json" => pat.existent = !json.is_null(),
            "p_pattern.json" => pat.parse_header(json)?,
            _ => {}
        }
        Ok(())
    }

    fn set_song_key(
        &mut self,
        index: usize,
        subkey: &str,
        json: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let song = self.songs.entry(index).or_insert_with(Song::default);
        match subkey {
            "p_manifest.json" => song.existent = !json.is_null(),
            "p_song.json" => {
                if let Some(tempo) = json.get("tempo").and_then(|t| t.as_f64()) {
                    if !(tempo.is_finite() && tempo > 0.0) {
                        return Err(EngineError::format("Song tempo is not positive"));
                    }
                    song.tempo = tempo;
                }
                if let Some(vol) = json.get("global_vol").and_then(|v| v.as_f64()) {
                    song.global_vol_db = vol;
                }
            }
            "p_order_list.json" => {
                let list = json
                    .as_array()
                    .ok_or_else(|| EngineError::format("Order list is not an array"))?;
                let mut order = Vec::with_capacity(list.len());
                for item in list {
                    let pair = item
                        .as_array()
                        .filter(|p| p.len() == 2)
                        .ok_or_else(|| EngineError::format("Order entry is not a pair"))?;
                    let piref = PatInstRef::new(
                        pair[0].as_i64().unwrap_or(-1) as i16,
                        pair[1].as_i64().unwrap_or(-1) as i16,
                    );
                    if !piref.is_valid() {
                        return Err(EngineError::format("Order entry out of range"));
                    }
                    order.push(piref);
                }
                song.order_list = order;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_album_key(&mut self, subkey: &str, json: &serde_json::Value) -> Result<(), EngineError> {
        match subkey {
            "p_manifest.json" => {
                if self.album_tracks.is_none() && !json.is_null() {
                    self.album_tracks = Some(Vec::new());
                }
            }
            "p_tracks.json" => {
                let list = json
                    .as_array()
                    .ok_or_else(|| EngineError::format("Track list is not an array"))?;
                let mut tracks = Vec::with_capacity(list.len());
                for item in list {
                    let song = item
                        .as_u64()
                        .ok_or_else(|| EngineError::format("Track entry is not an integer"))?
                        as usize;
                    if song >= SONGS_MAX {
                        return Err(EngineError::format("Track entry out of range"));
                    }
                    tracks.push(song);
                }
                if tracks.len() > TRACKS_MAX {
                    return Err(EngineError::format("Too many tracks"));
                }
                self.album_tracks = Some(tracks);
            }
            _ => {}
        }
        Ok(())
    }

    /// Check cross-references and assign device ids.
    pub fn validate(&mut self) -> Result<(), EngineError> {
        // Orphan checks: everything referenced must be marked existent
        if let Some(tracks) = &self.album_tracks {
            for &track in tracks {
                if !self.songs.get(&track).map(|s| s.existent).unwrap_or(false) {
                    return Err(EngineError::format(format!(
                        "Album references nonexistent song {}",
                        track
                    )));
                }
            }
        }
        for (song_index, song) in &self.songs {
            if !song.existent {
                continue;
            }
            for piref in &song.order_list {
                let pat = self.patterns.get(&(piref.pat as usize));
                let ok = pat
                    .map(|p| p.existent && p.instances.contains(&(piref.inst as usize)))
                    .unwrap_or(false);
                if !ok {
                    return Err(EngineError::format(format!(
                        "Song {} references nonexistent pattern instance [{}, {}]",
                        song_index, piref.pat, piref.inst
                    )));
                }
            }
        }
        for au in self.aus.values() {
            for (proc_index, proc_) in &au.procs {
                if proc_.existent && proc_.kernel.is_none() {
                    return Err(EngineError::format(format!(
                        "Processor {} has no type",
                        proc_index
                    )));
                }
            }
        }

        // Device id assignment: master first, then the unit tree
        self.device_id_counter = 0;
        self.master_id = 0;
        let mut counter = 1;
        for au in self.aus.values_mut() {
            assign_au_ids(au, &mut counter);
        }
        self.device_id_counter = counter;

        // Resolve connection node names to device ids
        if let Some(connections) = &mut self.connections {
            let aus = &self.aus;
            connections.resolve(&mut |name| {
                if name.is_empty() {
                    return Some(0);
                }
                let digits = name.strip_prefix("au_")?;
                let index = usize::from_str_radix(digits, 16).ok()?;
                aus.get(&index).map(|au| au.device_id)
            })?;
        }
        for au in self.aus.values_mut() {
            resolve_au_connections(au)?;
        }

        Ok(())
    }

    pub fn device_count(&self) -> DeviceId {
        self.device_id_counter
    }

    /// The declared type of an environment variable, if any.
    pub fn env_var_type(&self, name: &str) -> Option<ValueType> {
        self.environment
            .iter()
            .find(|decl| decl.name == name)
            .map(|decl| decl.initial.value_type())
    }
}

fn assign_au_ids(au: &mut AudioUnit, counter: &mut DeviceId) {
    au.device_id = *counter;
    au.in_iface_id = *counter + 1;
    au.out_iface_id = *counter + 2;
    *counter += 3;
    for proc_ in au.procs.values_mut() {
        proc_.device_id = *counter;
        *counter += 1;
    }
    for sub_au in au.sub_aus.values_mut() {
        assign_au_ids(sub_au, counter);
    }
}

fn resolve_au_connections(au: &mut AudioUnit) -> Result<(), EngineError> {
    let procs = &au.procs;
    let sub_aus = &au.sub_aus;
    let in_iface_id = au.in_iface_id;
    let out_iface_id = au.out_iface_id;
    if let Some(connections) = &mut au.connections {
        connections.resolve(&mut |name| {
            if name.is_empty() {
                return Some(out_iface_id);
            }
            if name == "Iin" {
                return Some(in_iface_id);
            }
            if let Some(digits) = name.strip_prefix("proc_") {
                let index = usize::from_str_radix(digits, 16).ok()?;
                return procs.get(&index).map(|p| p.device_id);
            }
            if let Some(digits) = name.strip_prefix("au_") {
                let index = usize::from_str_radix(digits, 16).ok()?;
                return sub_aus.get(&index).map(|a| a.device_id);
            }
            None
        })?;
    }
    for sub_au in au.sub_aus.values_mut() {
        resolve_au_connections(sub_au)?;
    }
    Ok(())
}

fn parse_environment(json: &serde_json::Value) -> Result<Vec<EnvVarDecl>, EngineError> {
    let list = json
        .as_array()
        .ok_or_else(|| EngineError::format("Environment is not an array"))?;

    let mut decls = Vec::with_capacity(list.len());
    for item in list {
        let obj = item
            .as_object()
            .ok_or_else(|| EngineError::format("Environment entry is not an object"))?;
        let name = obj
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| EngineError::format("Environment entry has no name"))?;
        if name.is_empty() || name.len() >= crate::limits::VAR_NAME_MAX {
            return Err(EngineError::format("Environment variable name is invalid"));
        }
        let declared = match obj.get("type").and_then(|t| t.as_str()) {
            Some("bool") => ValueType::Bool,
            Some("int") => ValueType::Int,
            Some("float") => ValueType::Float,
            Some("tstamp") => ValueType::Tstamp,
            other => {
                return Err(EngineError::format(format!(
                    "Unknown environment variable type: {:?}",
                    other
                )))
            }
        };
        let initial = obj
            .get("init")
            .and_then(|v| Value::from_json(v, declared))
            .unwrap_or(match declared {
                ValueType::Bool => Value::Bool(false),
                ValueType::Int => Value::Int(0),
                ValueType::Float => Value::Float(0.0),
                _ => Value::Tstamp(Tstamp::zero()),
            });
        decls.push(EnvVarDecl {
            name: name.to_string(),
            initial,
        });
    }
    Ok(decls)
}

fn split_index(rest: &str, digits: usize) -> Result<(usize, &str), EngineError> {
    if rest.len() < digits + 1 {
        return Err(EngineError::format("Truncated key"));
    }
    let index = usize::from_str_radix(&rest[..digits], 16)
        .map_err(|_| EngineError::format("Bad index in key"))?;
    if &rest[digits..digits + 1] != "/" {
        return Err(EngineError::format("Missing '/' after index in key"));
    }
    Ok((index, &rest[digits + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_module() -> Module {
        let mut module = Module::new();
        module
            .set_key("album/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
            .set_key("album/p_tracks.json", &serde_json::json!([0]))
            .unwrap();
        module
            .set_key("song_00/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
            .set_key("song_00/p_order_list.json", &serde_json::json!([[0, 0]]))
            .unwrap();
        module
            .set_key("pat_000/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
            .set_key("pat_000/instance_000/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module
    }

    #[test]
    fn minimal_project_validates() {
        let mut module = minimal_module();
        module.validate().unwrap();
    }

    #[test]
    fn orphan_pattern_instances_are_rejected() {
        let mut module = minimal_module();
        module
            .set_key("song_00/p_order_list.json", &serde_json::json!([[5, 0]]))
            .unwrap();
        assert!(module.validate().is_err());
    }

    #[test]
    fn device_ids_are_unique_after_validate() {
        let mut module = minimal_module();
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
            .set_key("au_01/p_manifest.json", &serde_json::json!({}))
            .unwrap();
        module.validate().unwrap();

        let au0 = module.aus.get(&0).unwrap();
        let au1 = module.aus.get(&1).unwrap();
        let mut ids = vec![
            au0.device_id,
            au0.in_iface_id,
            au0.out_iface_id,
            au0.procs.get(&0).unwrap().device_id,
            au1.device_id,
        ];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn environment_declarations_parse() {
        let mut module = Module::new();
        module
            .set_key(
                "p_environment.json",
                &serde_json::json!([
                    { "name": "vol", "type": "float", "init": 0.5 },
                    { "name": "on", "type": "bool" }
                ]),
            )
            .unwrap();
        assert_eq!(module.environment.len(), 2);
        assert_eq!(module.environment[0].initial, Value::Float(0.5));
        assert_eq!(module.environment[1].initial, Value::Bool(false));
    }
}
