//! Session: an execution context bound to one graph, holding named input and
//! output bindings.
//!
//! A session runs in two modes. The stateful [`Session::run`] evaluates the
//! session's own IO lists and keeps a prepared cache of the port and tensor
//! arrays it hands to the engine; any change to the lists marks the cache
//! stale. The stateless [`Session::run_with`] evaluates caller-supplied IO
//! lists and touches no session state, so several threads may share one
//! bound session that way, provided the engine tolerates concurrent runs on
//! one engine session.
//!
//! Stateful runs and the IO-list mutators take `&mut self` and therefore
//! have to be serialized by the caller.

use std::fmt;

use parking_lot::RwLockReadGuard;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::engine::{EngineSession, Port, SessionOptions};
use crate::error::{DnnError, Result};
use crate::graph::Graph;
use crate::io::{Io, IoId};
use crate::tensor::{SharedTensor, Tensor};

/// Owns an engine session and closes then deletes it exactly once.
struct SessionHandle(Option<Box<dyn EngineSession>>);

impl SessionHandle {
    fn get(&self) -> Option<&dyn EngineSession> {
        self.0.as_deref()
    }

    /// Closes and deletes the engine session. Both steps are attempted even
    /// if the first fails; failures are reported together.
    fn release(&mut self) -> Result<()> {
        let Some(mut session) = self.0.take() else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Err(status) = session.close() {
            errors.push(format!("error while closing session: {status}"));
        }
        if let Err(status) = session.delete() {
            errors.push(format!("error while deleting session: {status}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DnnError::InvalidSession(errors.join("; ")))
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "dnn: engine session teardown failed");
        }
    }
}

/// Flat engine-call arrays derived from the IO lists, in list order.
#[derive(Default)]
struct RunCache {
    feed_ports: Vec<Port>,
    feed_tensors: Vec<SharedTensor>,
    fetch_ports: Vec<Port>,
    fetch_tensors: Vec<SharedTensor>,
}

impl RunCache {
    fn clear(&mut self) {
        self.feed_ports.clear();
        self.feed_tensors.clear();
        self.fetch_ports.clear();
        self.fetch_tensors.clear();
    }
}

/// An execution context bound to one [`Graph`].
///
/// The session borrows its graph, so the graph outlives every session bound
/// to it and cannot be reloaded underneath one.
pub struct Session<'g> {
    graph: Option<&'g Graph>,
    handle: SessionHandle,
    options: SessionOptions,
    inputs: Vec<Io<'g>>,
    outputs: Vec<Io<'g>>,
    prepared: bool,
    cache: RunCache,
}

impl<'g> Session<'g> {
    /// Creates an unbound session with default options.
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    /// Creates an unbound session that binds with `options`.
    pub fn with_options(options: SessionOptions) -> Self {
        Self {
            graph: None,
            handle: SessionHandle(None),
            options,
            inputs: Vec::new(),
            outputs: Vec::new(),
            prepared: false,
            cache: RunCache::default(),
        }
    }

    /// Creates a session bound to `graph`.
    pub fn from_graph(graph: &'g Graph) -> Result<Self> {
        Self::from_graph_with_options(graph, SessionOptions::default())
    }

    pub fn from_graph_with_options(graph: &'g Graph, options: SessionOptions) -> Result<Self> {
        let mut session = Self::with_options(options);
        session.bind(graph)?;
        Ok(session)
    }

    /// Binds the session to a loaded graph.
    ///
    /// Any previous binding is reset first; a failure to tear down the old
    /// engine session is logged, not returned. Creates the engine session and
    /// runs the configured init operation when the graph has one.
    pub fn bind(&mut self, graph: &'g Graph) -> Result<()> {
        if let Err(err) = self.reset() {
            warn!(%err, "dnn: previous session teardown failed");
        }

        if !graph.is_loaded() {
            return Err(DnnError::InvalidSession(
                "cannot bind session to uninitialized graph".into(),
            ));
        }
        let loaded = graph.handle()?;

        let session = loaded.new_session(&self.options).map_err(|status| {
            DnnError::InvalidSession(format!("error while creating new session: {status}"))
        })?;

        let init = self.options.init_op.as_deref().unwrap_or_default();
        let init_result = match loaded.operation(init) {
            Some(op) => session.run(&[], &[], &[], &[op]).map(drop),
            None => {
                debug!(init, "dnn: no init operation to run");
                Ok(())
            }
        };

        let mut handle = SessionHandle(Some(session));
        if let Err(status) = init_result {
            if let Err(err) = handle.release() {
                warn!(%err, "dnn: releasing session after failed init");
            }
            return Err(DnnError::InvalidSession(format!(
                "error while initializing variables with {init}: {status}"
            )));
        }

        self.handle = handle;
        self.graph = Some(graph);
        debug!(engine = graph.engine().name(), "dnn: session bound");
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.graph.is_some()
    }

    pub fn graph(&self) -> Option<&'g Graph> {
        self.graph
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Replaces the options used by the next [`Session::bind`].
    pub fn set_options(&mut self, options: SessionOptions) {
        self.options = options;
    }

    /// Builds an IO against the bound graph without storing it.
    ///
    /// Such IOs are meant for [`Session::run_with`].
    pub fn create_io(&self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> Result<Io<'g>> {
        let graph = self.graph.ok_or_else(|| {
            DnnError::InvalidSession("cannot create IO object for uninitialized session".into())
        })?;
        let port = graph.resolve_port(op_name, op_index)?;
        Ok(Io::new(tensor.clone(), graph, port, op_name, op_index))
    }

    /// Binds an allocated tensor as the feed of `op_name:op_index`.
    pub fn add_input(&mut self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> Result<IoId> {
        {
            let t = tensor.read();
            if t.is_empty() {
                return Err(DnnError::InvalidTensor(format!(
                    "cannot create input using uninitialized {} for operation: {op_name}:{op_index}",
                    describe(&t)
                )));
            }
        }
        if self.has_input(tensor, op_name, op_index) {
            return Err(DnnError::InvalidInput(format!(
                "duplicate input tensor for operation: {op_name}:{op_index}"
            )));
        }
        if let Some(output) = self.outputs.iter().find(|io| io.tensor().same(tensor)) {
            return Err(DnnError::InvalidInput(format!(
                "tensor for operation {op_name}:{op_index} is already bound as output {output}"
            )));
        }

        let input = self.create_io(tensor, op_name, op_index)?;
        let id = input.id();
        self.inputs.push(input);
        self.invalidate();
        Ok(id)
    }

    /// Binds a tensor to receive the value of `op_name:op_index`.
    pub fn add_output(&mut self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> Result<IoId> {
        if self.has_output(tensor, op_name, op_index) {
            return Err(DnnError::InvalidOutput(format!(
                "duplicate output tensor for operation: {op_name}:{op_index}"
            )));
        }
        if let Some(input) = self.inputs.iter().find(|io| io.tensor().same(tensor)) {
            return Err(DnnError::InvalidOutput(format!(
                "tensor for operation {op_name}:{op_index} is already bound as input {input}"
            )));
        }

        let output = self.create_io(tensor, op_name, op_index)?;
        let id = output.id();
        self.outputs.push(output);
        self.invalidate();
        Ok(id)
    }

    /// Removes an input by id. Returns whether anything was removed.
    pub fn remove_input(&mut self, id: IoId) -> bool {
        let removed = remove_where(&mut self.inputs, |io| io.id() == id);
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Removes the input binding `tensor` to `op_name:op_index`.
    pub fn remove_input_by(&mut self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> bool {
        let removed = remove_where(&mut self.inputs, |io| io.matches(tensor, op_name, op_index));
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Removes an output by id. Returns whether anything was removed.
    pub fn remove_output(&mut self, id: IoId) -> bool {
        let removed = remove_where(&mut self.outputs, |io| io.id() == id);
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Removes the output binding `tensor` to `op_name:op_index`.
    pub fn remove_output_by(&mut self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> bool {
        let removed = remove_where(&mut self.outputs, |io| io.matches(tensor, op_name, op_index));
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn has_input(&self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> bool {
        self.inputs.iter().any(|io| io.matches(tensor, op_name, op_index))
    }

    pub fn has_output(&self, tensor: &SharedTensor, op_name: &str, op_index: usize) -> bool {
        self.outputs.iter().any(|io| io.matches(tensor, op_name, op_index))
    }

    pub fn has_input_id(&self, id: IoId) -> bool {
        self.input(id).is_some()
    }

    pub fn has_output_id(&self, id: IoId) -> bool {
        self.output(id).is_some()
    }

    pub fn input(&self, id: IoId) -> Option<&Io<'g>> {
        self.inputs.iter().find(|io| io.id() == id)
    }

    pub fn output(&self, id: IoId) -> Option<&Io<'g>> {
        self.outputs.iter().find(|io| io.id() == id)
    }

    pub fn inputs(&self) -> &[Io<'g>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Io<'g>] {
        &self.outputs
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Reports whether the run cache reflects the current IO lists.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Rebuilds the run cache from the IO lists. No-op when already prepared.
    pub fn prepare(&mut self) {
        if self.prepared {
            return;
        }

        self.cache.clear();
        for input in &self.inputs {
            self.cache.feed_ports.push(input.port());
            self.cache.feed_tensors.push(input.tensor().clone());
        }
        for output in &self.outputs {
            self.cache.fetch_ports.push(output.port());
            self.cache.fetch_tensors.push(output.tensor().clone());
        }

        self.prepared = true;
        debug!(
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            "dnn: prepared run cache"
        );
    }

    /// Evaluates the graph with the session's own bindings.
    ///
    /// Every output tensor is emptied before the engine call and receives
    /// the engine's buffer afterwards; on failure the outputs stay empty.
    pub fn run(&mut self) -> Result<()> {
        if self.graph.is_none() || self.handle.get().is_none() {
            return Err(DnnError::InvalidSession("cannot run uninitialized session".into()));
        }

        self.prepare();

        let session = self
            .handle
            .get()
            .ok_or_else(|| DnnError::InvalidSession("cannot run uninitialized session".into()))?;
        execute(
            session,
            &self.inputs,
            &self.cache.feed_ports,
            &self.cache.feed_tensors,
            &self.cache.fetch_ports,
            &self.cache.fetch_tensors,
            "stateful",
        )
    }

    /// Evaluates the graph with caller-supplied bindings.
    ///
    /// The session's IO lists and run cache are left untouched. IOs must have
    /// been created by a session bound to the same graph.
    pub fn run_with(&self, inputs: &[Io<'g>], outputs: &[Io<'g>]) -> Result<()> {
        let (Some(graph), Some(session)) = (self.graph, self.handle.get()) else {
            return Err(DnnError::InvalidSession("cannot run uninitialized session".into()));
        };

        check_io_list(graph, inputs, "input", DnnError::InvalidInput)?;
        check_io_list(graph, outputs, "output", DnnError::InvalidOutput)?;
        for output in outputs {
            if let Some(input) = inputs.iter().find(|io| io.tensor().same(output.tensor())) {
                return Err(DnnError::InvalidOutput(format!(
                    "tensor for output {output} is also passed as input {input}"
                )));
            }
        }
        for input in inputs {
            let t = input.tensor().read();
            if t.is_empty() {
                return Err(empty_input(&t, input));
            }
        }

        let feed_ports: Vec<Port> = inputs.iter().map(Io::port).collect();
        let feed_tensors: Vec<SharedTensor> = inputs.iter().map(|io| io.tensor().clone()).collect();
        let fetch_ports: Vec<Port> = outputs.iter().map(Io::port).collect();
        let fetch_tensors: Vec<SharedTensor> = outputs.iter().map(|io| io.tensor().clone()).collect();

        execute(
            session,
            inputs,
            &feed_ports,
            &feed_tensors,
            &fetch_ports,
            &fetch_tensors,
            "stateless",
        )
    }

    /// Drops all bindings, releases the engine session and unbinds the graph.
    ///
    /// Teardown always runs to completion; a failed engine close or delete is
    /// reported afterwards. Safe to call repeatedly.
    pub fn reset(&mut self) -> Result<()> {
        self.invalidate();
        self.inputs.clear();
        self.outputs.clear();

        let result = self.handle.release();
        if self.graph.take().is_some() {
            debug!("dnn: session reset");
        }
        result
    }

    fn invalidate(&mut self) {
        self.prepared = false;
        self.cache.clear();
    }
}

impl Default for Session<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.reset() {
            warn!(%err, "dnn: session teardown failed");
        }
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bound", &self.is_bound())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("prepared", &self.prepared)
            .finish()
    }
}

fn remove_where<'g>(list: &mut Vec<Io<'g>>, pred: impl Fn(&Io<'g>) -> bool) -> bool {
    match list.iter().position(pred) {
        Some(i) => {
            list.remove(i);
            true
        }
        None => false,
    }
}

/// `tensor 'name'`, or `tensor` when unnamed.
fn describe(tensor: &Tensor) -> String {
    match tensor.name() {
        "" => "tensor".to_string(),
        name => format!("tensor '{name}'"),
    }
}

fn empty_input(tensor: &Tensor, input: &Io<'_>) -> DnnError {
    DnnError::InvalidTensor(format!(
        "input {} for operation {input} is empty",
        describe(tensor)
    ))
}

/// Rejects IOs of another graph and repeated (tensor, name, index) triples.
fn check_io_list(
    graph: &Graph,
    list: &[Io<'_>],
    what: &str,
    error: fn(String) -> DnnError,
) -> Result<()> {
    for (i, io) in list.iter().enumerate() {
        if !std::ptr::eq(io.graph(), graph) {
            return Err(error(format!("{what} {io} was created for a different graph")));
        }
        if list[..i].iter().any(|other| other.same_binding(io)) {
            return Err(error(format!("duplicate {what} tensor for operation: {io}")));
        }
    }
    Ok(())
}

/// One engine call: lock and collect input buffers, empty the outputs, run,
/// and hand the produced buffers to the output tensors.
fn execute(
    session: &dyn EngineSession,
    inputs: &[Io<'_>],
    feed_ports: &[Port],
    feed_tensors: &[SharedTensor],
    fetch_ports: &[Port],
    fetch_tensors: &[SharedTensor],
    mode: &str,
) -> Result<()> {
    let guards: Vec<RwLockReadGuard<'_, Tensor>> =
        feed_tensors.iter().map(SharedTensor::read_recursive).collect();
    let mut feed_values: Vec<&Buffer> = Vec::with_capacity(guards.len());
    for (guard, input) in guards.iter().zip(inputs) {
        let buffer = guard.buffer().ok_or_else(|| empty_input(guard, input))?;
        feed_values.push(buffer);
    }

    for tensor in fetch_tensors {
        tensor.write().clear();
    }

    let results = session
        .run(feed_ports, &feed_values, fetch_ports, &[])
        .map_err(|status| {
            DnnError::InvalidSession(format!("error during {mode} evaluation: {status}"))
        })?;
    drop(feed_values);
    drop(guards);

    if results.len() != fetch_tensors.len() {
        return Err(DnnError::InvalidSession(format!(
            "engine returned {} output(s) for {} fetch(es)",
            results.len(),
            fetch_tensors.len()
        )));
    }
    for (tensor, buffer) in fetch_tensors.iter().zip(results) {
        tensor.write().replace_buffer(buffer);
    }
    Ok(())
}
