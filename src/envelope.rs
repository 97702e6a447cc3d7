//! Piecewise linear envelopes.
//!
//! Envelopes are static project data: a list of `(x, y)` nodes with
//! non-decreasing x, optionally two loop marks (node indices). Processors
//! read them through [`Envelope::value_at`] or step through them with a
//! time-envelope cursor.

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    nodes: Vec<(f64, f64)>,
    loop_start: Option<usize>,
    loop_end: Option<usize>,
}

impl Envelope {
    pub fn new(nodes: Vec<(f64, f64)>) -> Self {
        Self {
            nodes,
            loop_start: None,
            loop_end: None,
        }
    }

    /// Parse the JSON form: `{ "nodes": [[x, y], ...], "marks": [l0, l1] }`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EngineError> {
        let obj = json
            .as_object()
            .ok_or_else(|| EngineError::format("Envelope description is not an object"))?;

        let node_list = obj
            .get("nodes")
            .and_then(|n| n.as_array())
            .ok_or_else(|| EngineError::format("Envelope has no node list"))?;

        let mut nodes = Vec::with_capacity(node_list.len());
        let mut prev_x = f64::NEG_INFINITY;
        for node in node_list {
            let pair = node
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| EngineError::format("Envelope node is not a pair"))?;
            let x = pair[0]
                .as_f64()
                .ok_or_else(|| EngineError::format("Envelope node x is not a number"))?;
            let y = pair[1]
                .as_f64()
                .ok_or_else(|| EngineError::format("Envelope node y is not a number"))?;
            if !x.is_finite() || !y.is_finite() {
                return Err(EngineError::format("Envelope node is not finite"));
            }
            if x < prev_x {
                return Err(EngineError::format("Envelope nodes are not in order"));
            }
            prev_x = x;
            nodes.push((x, y));
        }

        if nodes.is_empty() {
            return Err(EngineError::format("Envelope has no nodes"));
        }

        let mut env = Envelope::new(nodes);

        if let Some(marks) = obj.get("marks").and_then(|m| m.as_array()) {
            if marks.len() >= 2 {
                let start = marks[0].as_u64().map(|v| v as usize);
                let end = marks[1].as_u64().map(|v| v as usize);
                if let (Some(start), Some(end)) = (start, end) {
                    env.set_loop(start, end)?;
                }
            }
        }

        Ok(env)
    }

    pub fn set_loop(&mut self, start: usize, end: usize) -> Result<(), EngineError> {
        if start >= self.nodes.len() || end >= self.nodes.len() || start > end {
            return Err(EngineError::format("Envelope loop marks out of range"));
        }
        self.loop_start = Some(start);
        self.loop_end = Some(end);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> (f64, f64) {
        self.nodes[index]
    }

    pub fn first_node(&self) -> (f64, f64) {
        self.nodes[0]
    }

    pub fn last_node(&self) -> (f64, f64) {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn loop_marks(&self) -> Option<(usize, usize)> {
        match (self.loop_start, self.loop_end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }

    /// Interpolated value at `x`, clamping outside the node range.
    pub fn value_at(&self, x: f64) -> f64 {
        let first = self.first_node();
        if x <= first.0 {
            return first.1;
        }
        let last = self.last_node();
        if x >= last.0 {
            return last.1;
        }

        // Find the first node at or after x
        let idx = self
            .nodes
            .partition_point(|&(nx, _)| nx < x);
        let (x1, y1) = self.nodes[idx - 1];
        let (x2, y2) = self.nodes[idx];
        if x2 == x1 {
            return y2;
        }
        y1 + (y2 - y1) * (x - x1) / (x2 - x1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interpolates_between_nodes() {
        let env = Envelope::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.0)]);
        assert_relative_eq!(env.value_at(0.5), 0.5);
        assert_relative_eq!(env.value_at(1.5), 0.5);
    }

    #[test]
    fn clamps_outside_range() {
        let env = Envelope::new(vec![(0.0, 0.25), (1.0, 0.75)]);
        assert_eq!(env.value_at(-1.0), 0.25);
        assert_eq!(env.value_at(9.0), 0.75);
    }

    #[test]
    fn parses_json_with_marks() {
        let json = serde_json::json!({
            "nodes": [[0.0, 1.0], [0.5, 0.5], [1.0, 0.0]],
            "marks": [0, 1]
        });
        let env = Envelope::from_json(&json).unwrap();
        assert_eq!(env.node_count(), 3);
        assert_eq!(env.loop_marks(), Some((0, 1)));
    }

    #[test]
    fn rejects_unordered_nodes() {
        let json = serde_json::json!({ "nodes": [[1.0, 0.0], [0.0, 1.0]] });
        assert!(Envelope::from_json(&json).is_err());
    }
}
