//! The device connection graph.
//!
//! Connections are read from lists of `[source, destination]` path pairs.
//! Each path names a device directory and a port, with two lowercase hex
//! digits for every index: `au_03/out_00`, `proc_01/C/in_02`, or a bare
//! `out_00` on the enclosing master. Construction rejects malformed paths
//! and any cycle; traversal order is computed once and reused for every
//! rendered block. Nodes stay pure data, and the cycle search keeps its
//! colouring in a side table.

use crate::device::{DeviceId, PortType};
use crate::error::EngineError;
use crate::limits::{AUDIO_UNITS_MAX, DEVICE_PORTS_MAX, PROCESSORS_MAX};
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;

new_key_type! {
    /// Key of a node in one connection graph.
    pub struct NodeKey;
}

/// Which graph a connection list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnLevel {
    /// The root graph between audio units and the master outputs.
    Global,
    /// The graph inside one audio unit.
    Au,
}

/// An edge arriving at a node.
#[derive(Debug, Clone)]
pub struct Edge {
    pub recv_port: u8,
    pub src: NodeKey,
    pub send_port: u8,
}

/// A node of the graph: a named device plus its incoming edges.
#[derive(Debug)]
pub struct DeviceNode {
    pub name: String,
    /// Resolved when the project is validated.
    pub device_id: Option<DeviceId>,
    pub receives: Vec<Edge>,
}

/// A validated, acyclic connection graph.
#[derive(Debug)]
pub struct Connections {
    level: ConnLevel,
    nodes: SlotMap<NodeKey, DeviceNode>,
    by_name: HashMap<String, NodeKey>,
    master: NodeKey,
    /// Master-reachable nodes, dependencies first, master last.
    topo: Vec<NodeKey>,
}

impl Connections {
    /// Build a graph from the JSON list form `[[src, dst], ...]`.
    pub fn from_json(json: &serde_json::Value, level: ConnLevel) -> Result<Self, EngineError> {
        let mut nodes = SlotMap::with_key();
        let mut by_name = HashMap::new();
        let master = nodes.insert(DeviceNode {
            name: String::new(),
            device_id: None,
            receives: Vec::new(),
        });
        by_name.insert(String::new(), master);

        let mut graph = Self {
            level,
            nodes,
            by_name,
            master,
            topo: Vec::new(),
        };

        let list = json
            .as_array()
            .ok_or_else(|| EngineError::format("Connection list is not an array"))?;

        for entry in list {
            let pair = entry
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| EngineError::format("Connection is not a [src, dst] pair"))?;
            let src_path = pair[0]
                .as_str()
                .ok_or_else(|| EngineError::format("Connection source is not a string"))?;
            let dst_path = pair[1]
                .as_str()
                .ok_or_else(|| EngineError::format("Connection destination is not a string"))?;

            let (mut src_name, src_port) =
                validate_connection_path(src_path, level, PortType::Send)?;
            let (dst_name, dst_port) =
                validate_connection_path(dst_path, level, PortType::Receive)?;

            // Inside an audio unit the bare input ports belong to the input
            // interface device
            if level == ConnLevel::Au && src_name.is_empty() {
                src_name = "Iin".to_string();
            }

            let src_key = graph.get_or_insert(src_name);
            let dst_key = graph.get_or_insert(dst_name);
            graph.nodes[dst_key].receives.push(Edge {
                recv_port: dst_port,
                src: src_key,
                send_port: src_port,
            });
        }

        if graph.is_cyclic() {
            return Err(EngineError::format(
                "The connection graph contains a cycle",
            ));
        }

        graph.topo = graph.build_topo_order();
        Ok(graph)
    }

    /// An empty graph (no connection key present).
    pub fn empty(level: ConnLevel) -> Self {
        Self::from_json(&serde_json::json!([]), level)
            .unwrap_or_else(|_| unreachable!("empty connection list is valid"))
    }

    fn get_or_insert(&mut self, name: String) -> NodeKey {
        if let Some(&key) = self.by_name.get(&name) {
            return key;
        }
        let key = self.nodes.insert(DeviceNode {
            name: name.clone(),
            device_id: None,
            receives: Vec::new(),
        });
        self.by_name.insert(name, key);
        key
    }

    pub fn level(&self) -> ConnLevel {
        self.level
    }

    pub fn master_key(&self) -> NodeKey {
        self.master
    }

    pub fn node(&self, key: NodeKey) -> &DeviceNode {
        &self.nodes[key]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&DeviceNode> {
        self.by_name.get(name).map(|&key| &self.nodes[key])
    }

    /// Master-reachable nodes in processing order (dependencies first).
    pub fn topo_order(&self) -> &[NodeKey] {
        &self.topo
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = (NodeKey, &DeviceNode)> {
        self.nodes.iter()
    }

    /// Resolve node names to device ids with the given lookup.
    pub fn resolve(
        &mut self,
        lookup: &mut dyn FnMut(&str) -> Option<DeviceId>,
    ) -> Result<(), EngineError> {
        for node in self.nodes.values_mut() {
            node.device_id = lookup(&node.name);
        }
        Ok(())
    }

    /// Every (node, direction, port) that takes part in a connection.
    pub fn port_usage(&self) -> Vec<(NodeKey, PortType, u8)> {
        let mut usage = Vec::new();
        for (key, node) in self.nodes.iter() {
            for edge in &node.receives {
                usage.push((key, PortType::Receive, edge.recv_port));
                usage.push((edge.src, PortType::Send, edge.send_port));
            }
        }
        usage
    }

    fn is_cyclic(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            New,
            Visiting,
            Done,
        }

        let mut colors: HashMap<NodeKey, Color> =
            self.nodes.keys().map(|k| (k, Color::New)).collect();

        fn visit(
            graph: &SlotMap<NodeKey, DeviceNode>,
            colors: &mut HashMap<NodeKey, Color>,
            key: NodeKey,
        ) -> bool {
            match colors[&key] {
                Color::Visiting => return true,
                Color::Done => return false,
                Color::New => {}
            }
            colors.insert(key, Color::Visiting);
            for edge in &graph[key].receives {
                if visit(graph, colors, edge.src) {
                    return true;
                }
            }
            colors.insert(key, Color::Done);
            false
        }

        self.nodes
            .keys()
            .any(|key| colors[&key] == Color::New && visit(&self.nodes, &mut colors, key))
    }

    fn build_topo_order(&self) -> Vec<NodeKey> {
        let mut order = Vec::new();
        let mut visited: HashMap<NodeKey, bool> = HashMap::new();

        fn visit(
            graph: &SlotMap<NodeKey, DeviceNode>,
            visited: &mut HashMap<NodeKey, bool>,
            order: &mut Vec<NodeKey>,
            key: NodeKey,
        ) {
            if visited.get(&key).copied().unwrap_or(false) {
                return;
            }
            visited.insert(key, true);
            for edge in &graph[key].receives {
                visit(graph, visited, order, edge.src);
            }
            order.push(key);
        }

        visit(&self.nodes, &mut visited, &mut order, self.master);
        order
    }
}

fn read_index(digits: &str) -> Option<usize> {
    const HEX: &str = "0123456789abcdef";
    let bytes = digits.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let hi = HEX.find(bytes[0] as char)?;
    let lo = HEX.find(bytes[1] as char)?;
    Some(hi * 16 + lo)
}

/// Validate a connection path and split it into a device name and a port
/// number.
///
/// The path shape is `[au_XX/][proc_XX/C/](in_XX|out_XX)`. The rules of
/// which end may send or receive depend on whether the path is rooted at
/// the enclosing master: a master "sends" into the graph through its `in_`
/// ports and "receives" the result on its `out_` ports.
pub fn validate_connection_path(
    path: &str,
    level: ConnLevel,
    direction: PortType,
) -> Result<(String, u8), EngineError> {
    let mut rest = path;
    let mut root = true;
    let mut device_name = String::new();

    if let Some(after) = rest.strip_prefix("au_") {
        root = false;
        let index = read_index(after)
            .filter(|&i| i < AUDIO_UNITS_MAX)
            .ok_or_else(|| {
                EngineError::format(format!(
                    "Invalid audio unit number in the connection: \"{}\"",
                    path
                ))
            })?;
        rest = &after[2..];
        rest = rest.strip_prefix('/').ok_or_else(|| {
            EngineError::format(format!(
                "Missing trailing '/' after the audio unit number in the connection: \"{}\"",
                path
            ))
        })?;
        device_name = format!("au_{:02x}", index);
    } else if let Some(after) = rest.strip_prefix("proc_") {
        if level != ConnLevel::Au {
            return Err(EngineError::format(format!(
                "Processor directory in a root-level connection: \"{}\"",
                path
            )));
        }
        root = false;
        let index = read_index(after)
            .filter(|&i| i < PROCESSORS_MAX)
            .ok_or_else(|| {
                EngineError::format(format!(
                    "Invalid processor number in the connection: \"{}\"",
                    path
                ))
            })?;
        rest = &after[2..];
        rest = rest.strip_prefix('/').ok_or_else(|| {
            EngineError::format(format!(
                "Missing trailing '/' after the processor number in the connection: \"{}\"",
                path
            ))
        })?;
        rest = rest.strip_prefix("C/").ok_or_else(|| {
            EngineError::format(format!(
                "Invalid processor parameter directory in the connection: \"{}\"",
                path
            ))
        })?;
        device_name = format!("proc_{:02x}", index);
    }

    let is_input = rest.starts_with("in_");
    let is_output = rest.starts_with("out_");
    if !is_input && !is_output {
        return Err(EngineError::format(format!(
            "Invalid connection: \"{}\"",
            path
        )));
    }

    if is_input && root && level != ConnLevel::Au {
        return Err(EngineError::format(format!(
            "Input ports are not allowed for master: \"{}\"",
            path
        )));
    }

    match direction {
        PortType::Receive => {
            let can_receive = (!root && is_input) || (root && is_output);
            if !can_receive {
                return Err(EngineError::format(format!(
                    "Destination port is not for receiving data: \"{}\"",
                    path
                )));
            }
        }
        PortType::Send => {
            let can_send = (!root && is_output) || (root && is_input);
            if !can_send {
                return Err(EngineError::format(format!(
                    "Source port is not for sending data: \"{}\"",
                    path
                )));
            }
        }
    }

    let digits = &rest[rest.find('_').map(|i| i + 1).unwrap_or(0)..];
    let port = read_index(digits)
        .filter(|&p| p < DEVICE_PORTS_MAX)
        .ok_or_else(|| EngineError::format(format!("Invalid port number: \"{}\"", path)))?;

    let tail = &digits[2..];
    if !tail.is_empty() && tail != "/" {
        return Err(EngineError::format(format!(
            "Connection path contains garbage after the port specification: \"{}\"",
            path
        )));
    }

    Ok((device_name, port as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_to_device_and_port() {
        assert_eq!(
            validate_connection_path("au_00/out_00", ConnLevel::Global, PortType::Send).unwrap(),
            ("au_00".to_string(), 0)
        );
        assert_eq!(
            validate_connection_path("out_01", ConnLevel::Global, PortType::Receive).unwrap(),
            (String::new(), 1)
        );
        assert_eq!(
            validate_connection_path("proc_0a/C/in_02", ConnLevel::Au, PortType::Receive)
                .unwrap(),
            ("proc_0a".to_string(), 2)
        );
    }

    #[test]
    fn master_cannot_receive_through_inputs() {
        assert!(
            validate_connection_path("in_00", ConnLevel::Global, PortType::Receive).is_err()
        );
        // Inside an audio unit the bare input port is the unit's own input
        assert!(validate_connection_path("in_00", ConnLevel::Au, PortType::Send).is_ok());
    }

    #[test]
    fn processor_paths_are_au_level_only() {
        assert!(validate_connection_path(
            "proc_00/C/out_00",
            ConnLevel::Global,
            PortType::Send
        )
        .is_err());
    }

    #[test]
    fn bad_indices_and_garbage_are_rejected() {
        assert!(validate_connection_path("au_0g/out_00", ConnLevel::Global, PortType::Send)
            .is_err());
        assert!(validate_connection_path(
            "au_00/out_00xyz",
            ConnLevel::Global,
            PortType::Send
        )
        .is_err());
    }

    #[test]
    fn builds_graph_and_orders_dependencies_first() {
        let json = serde_json::json!([
            ["au_00/out_00", "au_01/in_00"],
            ["au_01/out_00", "out_00"],
        ]);
        let graph = Connections::from_json(&json, ConnLevel::Global).unwrap();
        let order: Vec<&str> = graph
            .topo_order()
            .iter()
            .map(|&k| graph.node(k).name.as_str())
            .collect();
        assert_eq!(order, vec!["au_00", "au_01", ""]);
    }

    #[test]
    fn cycles_are_rejected() {
        let json = serde_json::json!([
            ["au_00/out_00", "au_01/in_00"],
            ["au_01/out_00", "au_00/in_00"],
        ]);
        let err = Connections::from_json(&json, ConnLevel::Global).unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn au_level_bare_input_becomes_interface_node() {
        let json = serde_json::json!([
            ["in_00", "proc_00/C/in_00"],
            ["proc_00/C/out_00", "out_00"],
        ]);
        let graph = Connections::from_json(&json, ConnLevel::Au).unwrap();
        assert!(graph.node_by_name("Iin").is_some());
    }
}
