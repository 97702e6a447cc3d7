//! Patterns, columns and triggers.
//!
//! A pattern is a length in musical time plus up to one trigger column per
//! channel and a global column for transport events. Columns keep their
//! triggers sorted by row position; equal positions preserve input order.

use crate::error::EngineError;
use crate::limits::{COLUMNS_MAX, PAT_INSTANCES_MAX};
use crate::tstamp::Tstamp;
use std::collections::BTreeSet;

/// One trigger: an event name plus its unevaluated argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub name: String,
    /// Constant JSON argument, or a string holding an expression.
    pub arg: Option<serde_json::Value>,
}

/// A time-ordered sequence of triggers.
#[derive(Debug, Clone, Default)]
pub struct Column {
    triggers: Vec<(Tstamp, Trigger)>,
}

impl Column {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON form `[[[beats, rem], [name, arg?]], ...]`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EngineError> {
        let rows = json
            .as_array()
            .ok_or_else(|| EngineError::format("Trigger list is not an array"))?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            let pair = row
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| EngineError::format("Trigger row is not a pair"))?;

            let pos = pair[0]
                .as_array()
                .filter(|p| p.len() == 2)
                .and_then(|p| Some(Tstamp::new(p[0].as_i64()?, p[1].as_i64()?)))
                .ok_or_else(|| EngineError::format("Trigger position is not a timestamp"))?;

            let event = pair[1]
                .as_array()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| EngineError::format("Trigger event is not an array"))?;
            let name = event[0]
                .as_str()
                .ok_or_else(|| EngineError::format("Trigger event name is not a string"))?
                .to_string();
            let arg = event.get(1).cloned();

            triggers.push((pos, Trigger { name, arg }));
        }

        // Stable order by position keeps same-row triggers in input order
        triggers.sort_by_key(|(pos, _)| *pos);
        Ok(Self { triggers })
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn triggers(&self) -> &[(Tstamp, Trigger)] {
        &self.triggers
    }

    /// Index of the first trigger at or after `pos`.
    pub fn first_at_or_after(&self, pos: Tstamp) -> usize {
        self.triggers.partition_point(|(p, _)| *p < pos)
    }

    /// Position of the next trigger strictly after `pos`, if any.
    pub fn next_pos_after(&self, pos: Tstamp) -> Option<Tstamp> {
        let idx = self.triggers.partition_point(|(p, _)| *p <= pos);
        self.triggers.get(idx).map(|(p, _)| *p)
    }
}

/// A section of music.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub existent: bool,
    pub length: Tstamp,
    /// Existing instance numbers of this pattern.
    pub instances: BTreeSet<usize>,
    pub global_col: Column,
    cols: Vec<Option<Column>>,
}

impl Pattern {
    pub fn new() -> Self {
        Self {
            existent: false,
            length: Tstamp::new(16, 0),
            instances: BTreeSet::new(),
            global_col: Column::new(),
            cols: Vec::new(),
        }
    }

    /// Parse the `p_pattern.json` header: `{ "length": [beats, rem] }`.
    pub fn parse_header(&mut self, json: &serde_json::Value) -> Result<(), EngineError> {
        let obj = json
            .as_object()
            .ok_or_else(|| EngineError::format("Pattern header is not an object"))?;
        if let Some(length) = obj.get("length") {
            let pair = length
                .as_array()
                .filter(|p| p.len() == 2)
                .and_then(|p| Some(Tstamp::new(p[0].as_i64()?, p[1].as_i64()?)))
                .ok_or_else(|| EngineError::format("Pattern length is not a timestamp"))?;
            if pair < Tstamp::zero() {
                return Err(EngineError::format("Pattern length is negative"));
            }
            self.length = pair;
        }
        Ok(())
    }

    pub fn add_instance(&mut self, index: usize) -> Result<(), EngineError> {
        if index >= PAT_INSTANCES_MAX {
            return Err(EngineError::format("Pattern instance number out of range"));
        }
        self.instances.insert(index);
        Ok(())
    }

    pub fn set_column(&mut self, index: usize, col: Column) -> Result<(), EngineError> {
        if index >= COLUMNS_MAX {
            return Err(EngineError::format("Column index out of range"));
        }
        if self.cols.len() <= index {
            self.cols.resize(index + 1, None);
        }
        self.cols[index] = Some(col);
        Ok(())
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.cols.get(index).and_then(|c| c.as_ref())
    }

    pub fn column_count(&self) -> usize {
        self.cols.len()
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_parse_and_sort_by_position() {
        let json = serde_json::json!([
            [[1, 0], ["n+", 0]],
            [[0, 0], ["n+", -100]],
            [[0, 0], ["n-", null]],
        ]);
        let col = Column::from_json(&json).unwrap();
        assert_eq!(col.len(), 3);
        assert_eq!(col.triggers()[0].0, Tstamp::zero());
        // Stable sort keeps same-position rows in input order
        assert_eq!(col.triggers()[0].1.name, "n+");
        assert_eq!(col.triggers()[1].1.name, "n-");
        assert_eq!(col.triggers()[2].0, Tstamp::new(1, 0));
    }

    #[test]
    fn next_pos_skips_the_current_row() {
        let json = serde_json::json!([
            [[0, 0], ["n+", 0]],
            [[2, 0], ["n-", null]],
        ]);
        let col = Column::from_json(&json).unwrap();
        assert_eq!(col.next_pos_after(Tstamp::zero()), Some(Tstamp::new(2, 0)));
        assert_eq!(col.next_pos_after(Tstamp::new(2, 0)), None);
    }

    #[test]
    fn header_sets_length() {
        let mut pat = Pattern::new();
        pat.parse_header(&serde_json::json!({ "length": [4, 0] }))
            .unwrap();
        assert_eq!(pat.length, Tstamp::new(4, 0));
        assert!(pat
            .parse_header(&serde_json::json!({ "length": [-1, 0] }))
            .is_err());
    }

    #[test]
    fn zero_length_is_allowed() {
        let mut pat = Pattern::new();
        pat.parse_header(&serde_json::json!({ "length": [0, 0] }))
            .unwrap();
        assert!(pat.length.is_zero());
    }
}
