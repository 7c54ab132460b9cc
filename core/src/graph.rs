//! Graph: owner of one loaded, immutable computation graph.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::engine::{Engine, LoadedGraph, ModelSource, OpId, Port};
use crate::error::{DnnError, Result};

/// A graph is either uninitialized or holds one loaded engine graph.
///
/// Sessions borrow the graph they are bound to, so a graph cannot be
/// reloaded or reset while any session still uses it. Any number of sessions
/// may share one graph across threads.
pub struct Graph {
    engine: Arc<dyn Engine>,
    handle: Option<Box<dyn LoadedGraph>>,
    source: Option<String>,
}

impl Graph {
    /// Creates an uninitialized graph that will load through `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            handle: None,
            source: None,
        }
    }

    /// Creates a graph and loads `source` immediately.
    pub fn from_source(engine: Arc<dyn Engine>, source: impl Into<ModelSource>) -> Result<Self> {
        let mut graph = Self::new(engine);
        graph.load(source)?;
        Ok(graph)
    }

    /// Loads a graph, tearing down any previously loaded one first.
    ///
    /// On failure the graph is left uninitialized.
    pub fn load(&mut self, source: impl Into<ModelSource>) -> Result<()> {
        self.reset();

        let source = source.into();
        debug!(engine = self.engine.name(), %source, "dnn: loading graph");
        let handle = self.engine.load(&source).map_err(|status| {
            DnnError::InvalidGraph(format!("error while loading graph from {source}: {status}"))
        })?;

        self.handle = Some(handle);
        self.source = Some(source.to_string());
        Ok(())
    }

    /// Releases the loaded graph. No-op on an uninitialized graph.
    pub fn reset(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(source = self.source.as_deref().unwrap_or(""), "dnn: releasing graph");
            drop(handle);
        }
        self.source = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Describes where the graph was loaded from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Resolves an operation name.
    pub fn operation(&self, name: &str) -> Result<OpId> {
        self.handle()?
            .operation(name)
            .ok_or_else(|| DnnError::InvalidOperation(format!("no such operation in graph: {name}")))
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.operation(name).is_some())
    }

    /// Resolves `name:index` to a port, checking that the operation has
    /// that many outputs.
    pub fn resolve_port(&self, name: &str, index: usize) -> Result<Port> {
        let op = self.operation(name)?;
        let outputs = self.handle()?.num_outputs(op);
        if index >= outputs {
            return Err(DnnError::InvalidOperation(format!(
                "operation {name} has {outputs} output(s), no port {name}:{index}"
            )));
        }
        Ok(Port::new(op, index))
    }

    /// Names of all operations; empty when uninitialized.
    pub fn operation_names(&self) -> Vec<String> {
        self.handle
            .as_ref()
            .map(|h| h.operation_names())
            .unwrap_or_default()
    }

    pub(crate) fn handle(&self) -> Result<&dyn LoadedGraph> {
        self.handle.as_deref().ok_or_else(|| {
            DnnError::InvalidGraph("cannot find operation in uninitialized graph".into())
        })
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("engine", &self.engine.name())
            .field("source", &self.source)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuEngine;
    use crate::model_embed::SIMPLE_GRAPH;

    fn engine() -> Arc<dyn Engine> {
        Arc::new(CpuEngine::new())
    }

    #[test]
    fn new_graph_is_uninitialized() {
        let graph = Graph::new(engine());
        assert!(!graph.is_loaded());
        assert!(graph.operation_names().is_empty());
        assert!(!graph.has_operation("input"));
        assert!(matches!(graph.operation("input"), Err(DnnError::InvalidGraph(_))));
    }

    #[test]
    fn load_and_resolve() {
        let graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        assert!(graph.is_loaded());
        assert!(graph.has_operation("output"));
        let port = graph.resolve_port("output", 0).unwrap();
        assert_eq!(port.index, 0);
        assert_eq!(graph.operation("output").unwrap(), port.op);
    }

    #[test]
    fn resolve_missing_operation() {
        let graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        let err = graph.resolve_port("nope", 0).unwrap_err();
        assert!(matches!(err, DnnError::InvalidOperation(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn resolve_port_index_out_of_range() {
        let graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        let err = graph.resolve_port("output", 1).unwrap_err();
        assert!(matches!(err, DnnError::InvalidOperation(_)));
    }

    #[test]
    fn failed_load_leaves_graph_uninitialized() {
        let mut graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        let err = graph.load(b"not json".to_vec()).unwrap_err();
        assert!(matches!(err, DnnError::InvalidGraph(_)));
        assert!(!graph.is_loaded());
        assert!(graph.source().is_none());
    }

    #[test]
    fn oversized_literal_fails_load() {
        let mut graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        let def = br#"{"nodes": [{"name": "c", "op": "Const",
            "value": {"dtype": "float32", "shape": [4294967296, 4294967296], "fill": 1.0}}]}"#;
        let err = graph.load(def.to_vec()).unwrap_err();
        assert!(matches!(err, DnnError::InvalidGraph(_)));
        assert!(err.to_string().contains("overflows"));
        assert!(!graph.is_loaded());
    }

    #[test]
    fn missing_file_is_invalid_graph() {
        let err = Graph::from_source(engine(), "/nonexistent/simplegraph.json").unwrap_err();
        assert!(matches!(err, DnnError::InvalidGraph(_)));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut graph = Graph::from_source(engine(), SIMPLE_GRAPH).unwrap();
        graph.reset();
        assert!(!graph.is_loaded());
        graph.reset();
        assert!(!graph.is_loaded());

        graph.load(SIMPLE_GRAPH).unwrap();
        assert!(graph.is_loaded());
    }
}
