//! JSON graph format read by the CPU engine, and its validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, DType};
use crate::engine::{OpId, Port, Status, parse_port_name};

/// A serialized graph: a flat list of named nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub version: u32,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    #[serde(flatten)]
    pub op: OpDef,
    /// Input ports as `"name"` or `"name:index"`.
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OpDef {
    /// Fed at run time. `-1` in `shape` accepts any extent.
    Placeholder { dtype: DType, shape: Vec<i64> },
    Const { value: Literal },
    /// Holds `value` once the session ran an `Init` op.
    Variable { value: Literal },
    /// Initializes every variable of the graph.
    Init,
    Identity,
    MatMul,
    Add,
    Sub,
    Mul,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    /// Splits the last axis into `num` equal parts, one output port each.
    Split { num: usize },
}

impl OpDef {
    pub fn kind(&self) -> &'static str {
        match self {
            OpDef::Placeholder { .. } => "Placeholder",
            OpDef::Const { .. } => "Const",
            OpDef::Variable { .. } => "Variable",
            OpDef::Init => "Init",
            OpDef::Identity => "Identity",
            OpDef::MatMul => "MatMul",
            OpDef::Add => "Add",
            OpDef::Sub => "Sub",
            OpDef::Mul => "Mul",
            OpDef::Relu => "Relu",
            OpDef::Sigmoid => "Sigmoid",
            OpDef::Tanh => "Tanh",
            OpDef::Softmax => "Softmax",
            OpDef::Split { .. } => "Split",
        }
    }

    fn arity(&self) -> usize {
        match self {
            OpDef::Placeholder { .. } | OpDef::Const { .. } | OpDef::Variable { .. } | OpDef::Init => 0,
            OpDef::MatMul | OpDef::Add | OpDef::Sub | OpDef::Mul => 2,
            _ => 1,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            OpDef::Init => 0,
            OpDef::Split { num } => *num,
            _ => 1,
        }
    }
}

/// A constant tensor value: either explicit `values` or a `fill` scalar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Literal {
    pub dtype: DType,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<f64>,
}

impl Literal {
    fn to_buffer(&self) -> Result<Buffer, String> {
        let len = Buffer::element_count(self.dtype, &self.shape)
            .map_err(|_| format!("literal shape {:?} overflows", self.shape))?;
        let values = match self.fill {
            Some(fill) if self.values.is_empty() => vec![fill; len],
            Some(_) => return Err("literal sets both values and fill".into()),
            None if self.values.len() == len => self.values.clone(),
            None => {
                return Err(format!(
                    "literal of shape {:?} needs {len} values, got {}",
                    self.shape,
                    self.values.len()
                ));
            }
        };
        Ok(Buffer::from_f64(self.dtype, self.shape.clone(), values))
    }
}

/// A validated node with resolved input ports.
#[derive(Debug)]
pub(crate) struct Node {
    pub name: String,
    pub op: OpDef,
    pub inputs: Vec<Port>,
    /// Materialized `Const`/`Variable` value.
    pub value: Option<Buffer>,
}

/// A validated graph, nodes in topological order of evaluation.
#[derive(Debug)]
pub(crate) struct CompiledGraph {
    pub nodes: Vec<Node>,
    pub order: Vec<OpId>,
    pub names: HashMap<String, OpId>,
}

impl CompiledGraph {
    pub fn parse(data: &[u8]) -> Result<Self, Status> {
        let def: GraphDef = serde_json::from_slice(data)
            .map_err(|e| Status::new(format!("malformed graph definition: {e}")))?;
        Self::compile(def)
    }

    pub fn compile(def: GraphDef) -> Result<Self, Status> {
        let mut names = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if node.name.is_empty() || node.name.contains(':') {
                return Err(Status::new(format!("invalid node name {:?}", node.name)));
            }
            if names.insert(node.name.clone(), OpId(i)).is_some() {
                return Err(Status::new(format!("duplicate node name {:?}", node.name)));
            }
        }

        let mut nodes = Vec::with_capacity(def.nodes.len());
        for node in def.nodes {
            if node.inputs.len() != node.op.arity() {
                return Err(Status::new(format!(
                    "node {:?} ({}) takes {} input(s), got {}",
                    node.name,
                    node.op.kind(),
                    node.op.arity(),
                    node.inputs.len()
                )));
            }
            if let OpDef::Split { num: 0 } = node.op {
                return Err(Status::new(format!("node {:?} splits into zero parts", node.name)));
            }

            let mut inputs = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let (src, index) = parse_port_name(input)
                    .map_err(|_| Status::new(format!("node {:?}: malformed input {input:?}", node.name)))?;
                let op = *names.get(src).ok_or_else(|| {
                    Status::new(format!("node {:?}: unknown input {input:?}", node.name))
                })?;
                inputs.push(Port::new(op, index));
            }

            let value = match &node.op {
                OpDef::Const { value } | OpDef::Variable { value } => Some(
                    value
                        .to_buffer()
                        .map_err(|e| Status::new(format!("node {:?}: {e}", node.name)))?,
                ),
                _ => None,
            };

            nodes.push(Node {
                name: node.name,
                op: node.op,
                inputs,
                value,
            });
        }

        for node in &nodes {
            for port in &node.inputs {
                let src = &nodes[port.op.0];
                if port.index >= src.op.num_outputs() {
                    return Err(Status::new(format!(
                        "node {:?}: input {}:{} out of range",
                        node.name, src.name, port.index
                    )));
                }
            }
        }

        let order = topological_order(&nodes)?;
        Ok(Self { nodes, order, names })
    }

    pub fn node(&self, op: OpId) -> Option<&Node> {
        self.nodes.get(op.0)
    }
}

/// Kahn's algorithm over input edges; fails on a cycle.
fn topological_order(nodes: &[Node]) -> Result<Vec<OpId>, Status> {
    let mut pending: Vec<usize> = nodes.iter().map(|n| n.inputs.len()).collect();
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for port in &node.inputs {
            consumers[port.op.0].push(i);
        }
    }

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    ready.reverse();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop() {
        order.push(OpId(i));
        for &c in &consumers[i] {
            pending[c] -= 1;
            if pending[c] == 0 {
                ready.push(c);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = pending
            .iter()
            .position(|&p| p > 0)
            .map(|i| nodes[i].name.as_str())
            .unwrap_or_default();
        return Err(Status::new(format!("graph contains a cycle through node {stuck:?}")));
    }
    Ok(order)
}
