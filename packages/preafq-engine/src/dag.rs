use crate::error::{EngineError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Type carried by a node port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    File,
    FileList,
    Float,
    Integer,
    Text,
    Bool,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::File => "file",
            PortType::FileList => "file_list",
            PortType::Float => "float",
            PortType::Integer => "integer",
            PortType::Text => "text",
            PortType::Bool => "bool",
        }
    }

    /// Can a value of type `source` be delivered to a port of this type?
    ///
    /// A single file feeding a list input is promoted to a one-element list.
    pub fn accepts(&self, source: PortType) -> bool {
        *self == source || (*self == PortType::FileList && source == PortType::File)
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value flowing along an edge (or set as a literal input)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PortValue {
    File(PathBuf),
    FileList(Vec<PathBuf>),
    Float(f64),
    Integer(i64),
    Text(String),
    Bool(bool),
}

impl PortValue {
    pub fn port_type(&self) -> PortType {
        match self {
            PortValue::File(_) => PortType::File,
            PortValue::FileList(_) => PortType::FileList,
            PortValue::Float(_) => PortType::Float,
            PortValue::Integer(_) => PortType::Integer,
            PortValue::Text(_) => PortType::Text,
            PortValue::Bool(_) => PortType::Bool,
        }
    }

    /// Converts the value to the representation expected by a port of type `ty`.
    pub fn coerce_to(self, ty: PortType) -> Self {
        match (self, ty) {
            (PortValue::File(path), PortType::FileList) => PortValue::FileList(vec![path]),
            (value, _) => value,
        }
    }

    /// Every file path referenced by this value.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            PortValue::File(path) => vec![path.as_path()],
            PortValue::FileList(paths) => paths.iter().map(PathBuf::as_path).collect(),
            _ => vec![],
        }
    }
}

/// Port declaration on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub ty: PortType,
    pub required: bool,
}

/// Node declaration: name plus typed input and output ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, ty: PortType) -> Self {
        self.inputs.push(PortSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional_input(mut self, name: impl Into<String>, ty: PortType) -> Self {
        self.inputs.push(PortSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, ty: PortType) -> Self {
        self.outputs.push(PortSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// (node, port) address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Directed connection from a producer output to a consumer input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: PortRef,
    pub to: PortRef,
}

/// Typed workflow graph
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    nodes: BTreeMap<String, NodeSpec>,
    edges: Vec<Edge>,
    literals: BTreeMap<PortRef, PortValue>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            literals: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<&mut Self> {
        if self.nodes.contains_key(&spec.name) {
            return Err(EngineError::DuplicateNode(spec.name));
        }
        self.nodes.insert(spec.name.clone(), spec);
        Ok(self)
    }

    /// Connect `from_node.from_port` to `to_node.to_port`.
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<&mut Self> {
        let edge = Edge {
            from: PortRef::new(from_node, from_port),
            to: PortRef::new(to_node, to_port),
        };
        self.check_edge(&edge)?;
        if self.is_bound(&edge.to) {
            return Err(EngineError::InputAlreadyBound {
                node: edge.to.node,
                port: edge.to.port,
            });
        }
        self.edges.push(edge);
        Ok(self)
    }

    /// Give an input a literal value instead of a connection.
    pub fn set_input(&mut self, node: &str, port: &str, value: PortValue) -> Result<&mut Self> {
        let target = PortRef::new(node, port);
        let spec = self.input_spec(&target)?;
        if !spec.ty.accepts(value.port_type()) {
            return Err(EngineError::PortTypeMismatch {
                port: target.to_string(),
                expected: spec.ty.to_string(),
                found: value.port_type().to_string(),
            });
        }
        if self.is_bound(&target) {
            return Err(EngineError::InputAlreadyBound {
                node: target.node,
                port: target.port,
            });
        }
        let value = value.coerce_to(spec.ty);
        self.literals.insert(target, value);
        Ok(self)
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn literal(&self, port: &PortRef) -> Option<&PortValue> {
        self.literals.get(port)
    }

    /// Edges feeding the given node
    pub fn incoming<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to.node == node)
    }

    pub fn is_bound(&self, port: &PortRef) -> bool {
        self.literals.contains_key(port) || self.edges.iter().any(|e| &e.to == port)
    }

    fn input_spec(&self, port: &PortRef) -> Result<&PortSpec> {
        let node = self
            .nodes
            .get(&port.node)
            .ok_or_else(|| EngineError::NodeNotFound(port.node.clone()))?;
        node.input_port(&port.port)
            .ok_or_else(|| EngineError::PortNotFound {
                node: port.node.clone(),
                port: port.port.clone(),
            })
    }

    fn output_spec(&self, port: &PortRef) -> Result<&PortSpec> {
        let node = self
            .nodes
            .get(&port.node)
            .ok_or_else(|| EngineError::NodeNotFound(port.node.clone()))?;
        node.output_port(&port.port)
            .ok_or_else(|| EngineError::PortNotFound {
                node: port.node.clone(),
                port: port.port.clone(),
            })
    }

    fn check_edge(&self, edge: &Edge) -> Result<()> {
        let source = self.output_spec(&edge.from)?;
        let target = self.input_spec(&edge.to)?;
        if !target.ty.accepts(source.ty) {
            return Err(EngineError::PortTypeMismatch {
                port: edge.to.to_string(),
                expected: target.ty.to_string(),
                found: source.ty.to_string(),
            });
        }
        Ok(())
    }

    /// Validate the whole graph and compute its execution phases.
    ///
    /// Checks that:
    /// - Every edge references existing, type-compatible ports
    /// - No input is bound twice
    /// - Every required input is connected or has a literal
    /// - The graph is acyclic
    pub fn validate(&self) -> Result<ExecutionPlan> {
        let mut binding_count: HashMap<&PortRef, usize> = HashMap::new();
        for edge in &self.edges {
            self.check_edge(edge)?;
            *binding_count.entry(&edge.to).or_default() += 1;
        }
        for port in self.literals.keys() {
            self.input_spec(port)?;
            *binding_count.entry(port).or_default() += 1;
        }
        if let Some((port, _)) = binding_count.iter().find(|(_, &count)| count > 1) {
            return Err(EngineError::InputAlreadyBound {
                node: port.node.clone(),
                port: port.port.clone(),
            });
        }

        for node in self.nodes.values() {
            for input in node.inputs.iter().filter(|p| p.required) {
                let port = PortRef::new(node.name.as_str(), input.name.as_str());
                if !binding_count.contains_key(&port) {
                    return Err(EngineError::UnboundInput {
                        node: port.node,
                        port: port.port,
                    });
                }
            }
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for name in self.nodes.keys() {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for edge in &self.edges {
            graph.update_edge(
                index[edge.from.node.as_str()],
                index[edge.to.node.as_str()],
                (),
            );
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| EngineError::CycleDetected(graph[cycle.node_id()].to_string()))?;

        // Phase = 1 + deepest producer phase
        let mut phase_of: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in &order {
            let phase = graph
                .neighbors_directed(*idx, petgraph::Direction::Incoming)
                .map(|pred| phase_of[&pred] + 1)
                .max()
                .unwrap_or(0);
            phase_of.insert(*idx, phase);
        }

        let depth = phase_of.values().copied().max().map_or(0, |d| d + 1);
        let mut phases = vec![Vec::new(); depth];
        for (idx, phase) in phase_of {
            phases[phase].push(graph[idx].to_string());
        }
        for phase in &mut phases {
            phase.sort();
        }

        Ok(ExecutionPlan { phases })
    }
}

/// Validated execution order: phases of mutually independent nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    phases: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn phases(&self) -> &[Vec<String>] {
        &self.phases
    }

    pub fn node_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Phase index of a node, if it is part of the plan
    pub fn phase_of(&self, node: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|n| n == node))
    }

    /// Execution plan as string (for logging)
    pub fn describe(&self) -> String {
        self.phases
            .iter()
            .enumerate()
            .map(|(i, group)| {
                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, group.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, group.join(""))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
