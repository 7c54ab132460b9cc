//! Built-in reference engine.
//!
//! Evaluates graphs serialized as JSON [`GraphDef`]s on the CPU. Variables
//! live per session and are set by running an `Init` operation as a target.

mod graphdef;
mod kernels;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::engine::{
    Engine, EngineSession, LoadedGraph, ModelSource, OpId, Port, SessionOptions, Status,
};

pub use graphdef::{GraphDef, Literal, NodeDef, OpDef};
use graphdef::{CompiledGraph, Node};
use kernels::{Binary, Unary};

/// The reference CPU engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn load(&self, source: &ModelSource) -> Result<Box<dyn LoadedGraph>, Status> {
        let data = source.read()?;
        let graph = CompiledGraph::parse(&data)?;
        debug!(nodes = graph.nodes.len(), "cpu: graph compiled");
        Ok(Box::new(CpuGraph(Arc::new(graph))))
    }
}

struct CpuGraph(Arc<CompiledGraph>);

impl LoadedGraph for CpuGraph {
    fn operation(&self, name: &str) -> Option<OpId> {
        self.0.names.get(name).copied()
    }

    fn num_outputs(&self, op: OpId) -> usize {
        self.0.node(op).map_or(0, |n| n.op.num_outputs())
    }

    fn operation_names(&self) -> Vec<String> {
        self.0.nodes.iter().map(|n| n.name.clone()).collect()
    }

    fn new_session(&self, options: &SessionOptions) -> Result<Box<dyn EngineSession>, Status> {
        let threads = match options.num_threads {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        Ok(Box::new(CpuSession {
            graph: self.0.clone(),
            variables: RwLock::new(vec![None; self.0.nodes.len()]),
            threads,
            closed: false,
        }))
    }
}

struct CpuSession {
    graph: Arc<CompiledGraph>,
    /// Variable values indexed by node; `None` until initialized.
    variables: RwLock<Vec<Option<Buffer>>>,
    threads: usize,
    closed: bool,
}

impl CpuSession {
    fn node(&self, op: OpId) -> Result<&Node, Status> {
        self.graph
            .node(op)
            .ok_or_else(|| Status::new(format!("no operation with id {}", op.0)))
    }

    fn check_port(&self, port: Port) -> Result<&Node, Status> {
        let node = self.node(port.op)?;
        if port.index >= node.op.num_outputs() {
            return Err(Status::new(format!(
                "operation '{}' has no output {}",
                node.name, port.index
            )));
        }
        Ok(node)
    }

    fn initialize_variables(&self) {
        let mut vars = self.variables.write();
        for (slot, node) in vars.iter_mut().zip(&self.graph.nodes) {
            if let OpDef::Variable { .. } = node.op {
                *slot = node.value.clone();
            }
        }
        trace!("cpu: variables initialized");
    }

    fn eval(
        &self,
        node: &Node,
        op: OpId,
        args: &[&Buffer],
        vars: &[Option<Buffer>],
    ) -> Result<Vec<Buffer>, Status> {
        let fail = |e: String| Status::new(format!("{} '{}': {e}", node.op.kind(), node.name));
        let one = |r: Result<Buffer, String>| r.map(|b| vec![b]).map_err(fail);
        match &node.op {
            OpDef::Placeholder { .. } => Err(Status::new(format!(
                "You must feed a value for placeholder '{}'",
                node.name
            ))),
            OpDef::Const { .. } => Ok(node.value.iter().cloned().collect()),
            OpDef::Variable { .. } => match vars.get(op.0).and_then(Option::as_ref) {
                Some(value) => Ok(vec![value.clone()]),
                None => Err(Status::new(format!(
                    "attempting to use uninitialized variable '{}'",
                    node.name
                ))),
            },
            OpDef::Init => Ok(Vec::new()),
            OpDef::Identity => Ok(vec![args[0].clone()]),
            OpDef::MatMul => one(kernels::matmul(args[0], args[1], self.threads)),
            OpDef::Add => one(kernels::binary(args[0], args[1], Binary::Add)),
            OpDef::Sub => one(kernels::binary(args[0], args[1], Binary::Sub)),
            OpDef::Mul => one(kernels::binary(args[0], args[1], Binary::Mul)),
            OpDef::Relu => one(kernels::unary(args[0], Unary::Relu)),
            OpDef::Sigmoid => one(kernels::unary(args[0], Unary::Sigmoid)),
            OpDef::Tanh => one(kernels::unary(args[0], Unary::Tanh)),
            OpDef::Softmax => one(kernels::softmax(args[0])),
            OpDef::Split { num } => kernels::split(args[0], *num).map_err(fail),
        }
    }
}

/// Checks a fed value against the placeholder's declared type and shape.
fn check_placeholder(node: &Node, value: &Buffer) -> Result<(), Status> {
    let OpDef::Placeholder { dtype, shape } = &node.op else {
        return Ok(());
    };
    if value.dtype() != *dtype {
        return Err(Status::new(format!(
            "placeholder '{}' expects {dtype}, fed {}",
            node.name,
            value.dtype()
        )));
    }
    let fits = value.rank() == shape.len()
        && shape
            .iter()
            .zip(value.shape())
            .all(|(&want, &got)| want < 0 || want as usize == got);
    if !fits {
        return Err(Status::new(format!(
            "placeholder '{}' expects shape {shape:?}, fed {:?}",
            node.name,
            value.shape()
        )));
    }
    Ok(())
}

impl EngineSession for CpuSession {
    fn run(
        &self,
        feed_ports: &[Port],
        feed_values: &[&Buffer],
        fetches: &[Port],
        targets: &[OpId],
    ) -> Result<Vec<Buffer>, Status> {
        if self.closed {
            return Err(Status::new("session has been closed"));
        }
        if feed_ports.len() != feed_values.len() {
            return Err(Status::new(format!(
                "{} feed port(s) for {} value(s)",
                feed_ports.len(),
                feed_values.len()
            )));
        }

        let mut fed: HashMap<Port, &Buffer> = HashMap::with_capacity(feed_ports.len());
        for (&port, &value) in feed_ports.iter().zip(feed_values) {
            let node = self.check_port(port)?;
            check_placeholder(node, value)?;
            if fed.insert(port, value).is_some() {
                return Err(Status::new(format!(
                    "port {}:{} fed more than once",
                    node.name, port.index
                )));
            }
        }

        let mut pending: Vec<OpId> = Vec::new();
        for &port in fetches {
            self.check_port(port)?;
            if !fed.contains_key(&port) {
                pending.push(port.op);
            }
        }
        for &target in targets {
            let node = self.node(target)?;
            if let OpDef::Init = node.op {
                self.initialize_variables();
            } else {
                pending.push(target);
            }
        }

        // Walk back from the requested nodes, stopping at fed ports.
        let nodes = &self.graph.nodes;
        let mut needed = vec![false; nodes.len()];
        while let Some(op) = pending.pop() {
            if std::mem::replace(&mut needed[op.0], true) {
                continue;
            }
            for port in &nodes[op.0].inputs {
                if !fed.contains_key(port) && !needed[port.op.0] {
                    pending.push(port.op);
                }
            }
        }

        let vars = self.variables.read();
        let mut values: Vec<Option<Vec<Buffer>>> = vec![None; nodes.len()];
        for &op in &self.graph.order {
            if !needed[op.0] {
                continue;
            }
            let node = &nodes[op.0];
            let mut args = Vec::with_capacity(node.inputs.len());
            for port in &node.inputs {
                let arg = match fed.get(port) {
                    Some(&value) => value,
                    None => values[port.op.0]
                        .as_ref()
                        .and_then(|outs| outs.get(port.index))
                        .ok_or_else(|| {
                            Status::new(format!(
                                "input {}:{} was not computed",
                                nodes[port.op.0].name, port.index
                            ))
                        })?,
                };
                args.push(arg);
            }
            let outputs = self.eval(node, op, &args, &vars)?;
            values[op.0] = Some(outputs);
        }
        drop(vars);

        fetches
            .iter()
            .map(|port| match fed.get(port) {
                Some(&value) => Ok(value.clone()),
                None => values[port.op.0]
                    .as_ref()
                    .and_then(|outs| outs.get(port.index))
                    .cloned()
                    .ok_or_else(|| {
                        Status::new(format!(
                            "output {}:{} was not computed",
                            nodes[port.op.0].name, port.index
                        ))
                    }),
            })
            .collect()
    }

    fn close(&mut self) -> Result<(), Status> {
        self.closed = true;
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<(), Status> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_embed::SIMPLE_GRAPH;

    fn load(source: impl Into<ModelSource>) -> Box<dyn LoadedGraph> {
        CpuEngine::new().load(&source.into()).unwrap()
    }

    fn port(graph: &dyn LoadedGraph, name: &str, index: usize) -> Port {
        Port::new(graph.operation(name).unwrap(), index)
    }

    #[test]
    fn simple_graph_metadata() {
        let graph = load(SIMPLE_GRAPH);
        let names = graph.operation_names();
        for name in ["input", "weights", "biases", "output", "init"] {
            assert!(names.iter().any(|n| n == name), "missing {name}");
        }
        assert_eq!(graph.num_outputs(graph.operation("init").unwrap()), 0);
        assert_eq!(graph.num_outputs(graph.operation("output").unwrap()), 1);
        assert_eq!(graph.num_outputs(OpId(999)), 0);
    }

    #[test]
    fn init_then_evaluate() {
        let graph = load(SIMPLE_GRAPH);
        let session = graph.new_session(&SessionOptions::single_threaded()).unwrap();
        let init = graph.operation("init").unwrap();
        assert!(session.run(&[], &[], &[], &[init]).unwrap().is_empty());

        let x = Buffer::from_vec(&[2, 10], vec![1.0f32; 20]).unwrap();
        let out = session
            .run(&[port(&*graph, "input", 0)], &[&x], &[port(&*graph, "output", 0)], &[])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].shape(), &[2, 1]);
        assert_eq!(out[0].as_slice::<f32>().unwrap(), &[11.0, 11.0]);
    }

    #[test]
    fn variables_are_per_session() {
        let graph = load(SIMPLE_GRAPH);
        let a = graph.new_session(&SessionOptions::default()).unwrap();
        let b = graph.new_session(&SessionOptions::default()).unwrap();
        a.run(&[], &[], &[], &[graph.operation("init").unwrap()]).unwrap();

        let weights = port(&*graph, "weights", 0);
        assert_eq!(a.run(&[], &[], &[weights], &[]).unwrap()[0].shape(), &[10, 1]);
        let err = b.run(&[], &[], &[weights], &[]).unwrap_err();
        assert!(err.message().contains("uninitialized variable 'weights'"));
    }

    #[test]
    fn unfed_placeholder_is_named() {
        let graph = load(SIMPLE_GRAPH);
        let session = graph.new_session(&SessionOptions::default()).unwrap();
        session.run(&[], &[], &[], &[graph.operation("init").unwrap()]).unwrap();
        let err = session.run(&[], &[], &[port(&*graph, "output", 0)], &[]).unwrap_err();
        assert!(err.message().contains("placeholder 'input'"));
    }

    #[test]
    fn feeds_are_validated() {
        let graph = load(SIMPLE_GRAPH);
        let session = graph.new_session(&SessionOptions::default()).unwrap();
        let input = port(&*graph, "input", 0);

        let wrong_type = Buffer::from_vec(&[1, 10], vec![0i32; 10]).unwrap();
        assert!(session.run(&[input], &[&wrong_type], &[], &[]).is_err());
        let wrong_shape = Buffer::from_vec(&[1, 9], vec![0.0f32; 9]).unwrap();
        assert!(session.run(&[input], &[&wrong_shape], &[], &[]).is_err());

        let ok = Buffer::from_vec(&[1, 10], vec![0.0f32; 10]).unwrap();
        let err = session.run(&[input, input], &[&ok, &ok], &[], &[]).unwrap_err();
        assert!(err.message().contains("more than once"));
        assert!(session.run(&[input], &[], &[], &[]).is_err());
    }

    #[test]
    fn fetching_a_fed_port_returns_the_feed() {
        let graph = load(SIMPLE_GRAPH);
        let session = graph.new_session(&SessionOptions::default()).unwrap();
        let input = port(&*graph, "input", 0);
        let x = Buffer::from_vec(&[1, 10], (0..10).map(|i| i as f32).collect()).unwrap();
        let out = session.run(&[input], &[&x], &[input], &[]).unwrap();
        assert_eq!(out[0], x);
    }

    #[test]
    fn closed_session_refuses_runs() {
        let graph = load(SIMPLE_GRAPH);
        let mut session = graph.new_session(&SessionOptions::default()).unwrap();
        session.close().unwrap();
        assert!(session.run(&[], &[], &[], &[]).is_err());
        session.delete().unwrap();
    }

    #[test]
    fn graph_def_round_trips_through_json() {
        let def: GraphDef = serde_json::from_slice(SIMPLE_GRAPH).unwrap();
        let bytes = serde_json::to_vec(&def).unwrap();
        let graph = load(bytes);
        assert!(graph.operation("output").is_some());
    }
}
