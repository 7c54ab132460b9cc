//! IO: a binding between a tensor and one port of a graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::Port;
use crate::graph::Graph;
use crate::tensor::SharedTensor;

static NEXT_IO_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one IO record. Ids are unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoId(u64);

impl IoId {
    fn next() -> Self {
        IoId(NEXT_IO_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Immutable binding of a tensor to `op_name:op_index` of a graph.
///
/// Created by [`Session`](crate::Session); the tensor is referenced, not
/// owned.
pub struct Io<'g> {
    id: IoId,
    tensor: SharedTensor,
    graph: &'g Graph,
    port: Port,
    op_name: String,
    op_index: usize,
}

impl<'g> Io<'g> {
    /// The port must already be resolved against `graph`.
    pub(crate) fn new(
        tensor: SharedTensor,
        graph: &'g Graph,
        port: Port,
        op_name: &str,
        op_index: usize,
    ) -> Self {
        Self {
            id: IoId::next(),
            tensor,
            graph,
            port,
            op_name: op_name.to_string(),
            op_index,
        }
    }

    pub fn id(&self) -> IoId {
        self.id
    }

    pub fn tensor(&self) -> &SharedTensor {
        &self.tensor
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn op_index(&self) -> usize {
        self.op_index
    }

    /// Reports whether this IO binds `tensor` to `op_name:op_index`.
    pub fn matches(&self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> bool {
        self.tensor.same(tensor) && self.op_name == op_name && self.op_index == op_index
    }

    /// Reports whether both IOs bind the same (tensor, name, index) triple.
    pub fn same_binding(&self, other: &Io<'_>) -> bool {
        self.matches(&other.tensor, &other.op_name, other.op_index)
    }
}

impl fmt::Display for Io<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.op_name, self.op_index)
    }
}

impl fmt::Debug for Io<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Io")
            .field("id", &self.id)
            .field("port", &format_args!("{}:{}", self.op_name, self.op_index))
            .finish()
    }
}
