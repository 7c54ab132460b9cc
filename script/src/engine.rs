//! Engine adapter that evaluates graphs through a [`ScriptHost`].
//!
//! The host is driven with a fixed vocabulary of global functions:
//!
//! - `load_graph(path)` returns `((name, n_outputs), ...)` for every
//!   operation of the loaded graph
//! - `start_session()` opens the host's evaluation session
//! - `define_inputs(ports...)` and `define_outputs(ports...)` receive
//!   `"name:index"` strings
//! - `eval_session((arrays...))` feeds the defined inputs in order and
//!   returns the defined outputs in order
//!
//! One host holds one interpreter context, so every graph and session built
//! on it shares a single port-definition cache and runs one at a time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dnnrt_core::{
    Buffer, Engine, EngineSession, LoadedGraph, ModelSource, OpId, Port, SessionOptions, Status,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, ScriptError};
use crate::host::{ScriptHost, ScriptValue};
use crate::interpreter::{InterpreterLease, Lifecycle};

/// Port lists last sent to the host; `None` when unknown.
#[derive(Default)]
struct PortCache {
    inputs: Option<Vec<String>>,
    outputs: Option<Vec<String>>,
}

/// State shared by everything built on one host.
struct HostBinding {
    host: Arc<dyn ScriptHost>,
    ports: Mutex<PortCache>,
}

impl HostBinding {
    fn call(&self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        debug!(function = name, args = args.len(), "script: call");
        let args = self.host.create_tuple(args);
        self.host.call(name, args)
    }
}

/// An [`Engine`] backed by a script host.
pub struct ScriptEngine {
    binding: Arc<HostBinding>,
    bootstrap: Option<String>,
    lifecycle: Option<Arc<Lifecycle>>,
}

impl ScriptEngine {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self {
            binding: Arc::new(HostBinding {
                host,
                ports: Mutex::new(PortCache::default()),
            }),
            bootstrap: None,
            lifecycle: None,
        }
    }

    /// Script run before every `load_graph`, typically defining the
    /// vocabulary functions.
    pub fn with_bootstrap(mut self, code: impl Into<String>) -> Self {
        self.bootstrap = Some(code.into());
        self
    }

    /// Makes every loaded graph and open session hold a lease on
    /// `lifecycle`.
    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn host(&self) -> &Arc<dyn ScriptHost> {
        &self.binding.host
    }

    fn lease(&self) -> Result<Option<InterpreterLease>> {
        self.lifecycle.as_ref().map(Lifecycle::acquire).transpose()
    }

    fn load_path(&self, path: &Path) -> Result<ScriptGraph> {
        let lease = self.lease()?;
        if let Some(code) = &self.bootstrap {
            self.binding.host.run_script(code)?;
        }

        let path = path.to_string_lossy().into_owned();
        let listing = self
            .binding
            .call("load_graph", vec![path.into()])?
            .into_tuple("load_graph result")?;

        let mut ops = Vec::with_capacity(listing.len());
        let mut names = HashMap::with_capacity(listing.len());
        for entry in listing {
            let (name, outputs) = match entry.as_tuple() {
                Some([name, outputs]) => (name.as_str(), outputs.as_int()),
                _ => (None, None),
            };
            let (Some(name), Some(outputs)) = (name, outputs.and_then(|n| usize::try_from(n).ok()))
            else {
                return Err(ScriptError::Type(format!(
                    "load_graph result: expected (name, n_outputs), got {entry:?}"
                )));
            };
            if names.insert(name.to_string(), OpId(ops.len())).is_some() {
                return Err(ScriptError::Type(format!(
                    "load_graph result: duplicate operation {name:?}"
                )));
            }
            ops.push((name.to_string(), outputs));
        }
        // A new graph invalidates whatever ports the host had defined.
        *self.binding.ports.lock() = PortCache::default();

        Ok(ScriptGraph {
            binding: self.binding.clone(),
            lifecycle: self.lifecycle.clone(),
            ops: Arc::new(ops),
            names,
            _lease: lease,
        })
    }
}

impl Engine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    fn load(&self, source: &ModelSource) -> std::result::Result<Box<dyn LoadedGraph>, Status> {
        match source {
            ModelSource::Path(path) => Ok(Box::new(self.load_path(path)?)),
            other => Err(ScriptError::Unsupported(format!(
                "script hosts load graphs from paths only, got {other}"
            ))
            .into()),
        }
    }
}

struct ScriptGraph {
    binding: Arc<HostBinding>,
    lifecycle: Option<Arc<Lifecycle>>,
    ops: Arc<Vec<(String, usize)>>,
    names: HashMap<String, OpId>,
    _lease: Option<InterpreterLease>,
}

impl LoadedGraph for ScriptGraph {
    fn operation(&self, name: &str) -> Option<OpId> {
        self.names.get(name).copied()
    }

    fn num_outputs(&self, op: OpId) -> usize {
        self.ops.get(op.0).map_or(0, |(_, n)| *n)
    }

    fn operation_names(&self) -> Vec<String> {
        self.ops.iter().map(|(name, _)| name.clone()).collect()
    }

    fn new_session(
        &self,
        _options: &SessionOptions,
    ) -> std::result::Result<Box<dyn EngineSession>, Status> {
        let lease = self.lifecycle.as_ref().map(Lifecycle::acquire).transpose()?;
        let mut ports = self.binding.ports.lock();
        self.binding.call("start_session", Vec::new())?;
        *ports = PortCache::default();
        drop(ports);

        Ok(Box::new(ScriptSession {
            binding: self.binding.clone(),
            ops: self.ops.clone(),
            closed: false,
            _lease: lease,
        }))
    }
}

struct ScriptSession {
    binding: Arc<HostBinding>,
    ops: Arc<Vec<(String, usize)>>,
    closed: bool,
    _lease: Option<InterpreterLease>,
}

impl ScriptSession {
    fn port_names(&self, ports: &[Port]) -> Result<Vec<String>> {
        ports
            .iter()
            .map(|port| {
                self.ops
                    .get(port.op.0)
                    .map(|(name, _)| format!("{name}:{}", port.index))
                    .ok_or_else(|| ScriptError::Type(format!("no operation with id {}", port.op.0)))
            })
            .collect()
    }

    fn evaluate(
        &self,
        feed_ports: &[Port],
        feed_values: &[&Buffer],
        fetches: &[Port],
    ) -> Result<Vec<Buffer>> {
        let inputs = self.port_names(feed_ports)?;
        let outputs = self.port_names(fetches)?;

        let mut cache = self.binding.ports.lock();
        if cache.inputs.as_ref() != Some(&inputs) {
            cache.inputs = None;
            let args = inputs.iter().map(|p| ScriptValue::from(p.as_str())).collect();
            self.binding.call("define_inputs", args)?;
            cache.inputs = Some(inputs);
        }
        if cache.outputs.as_ref() != Some(&outputs) {
            cache.outputs = None;
            let args = outputs.iter().map(|p| ScriptValue::from(p.as_str())).collect();
            self.binding.call("define_outputs", args)?;
            cache.outputs = Some(outputs);
        }

        let arrays = feed_values
            .iter()
            .map(|&b| ScriptValue::Array(b.clone()))
            .collect();
        let arrays = self.binding.host.create_tuple(arrays);
        let results = self
            .binding
            .call("eval_session", vec![arrays])?
            .into_tuple("eval_session result")?;
        drop(cache);

        if results.len() != fetches.len() {
            return Err(ScriptError::Type(format!(
                "eval_session returned {} value(s) for {} output(s)",
                results.len(),
                fetches.len()
            )));
        }
        results
            .into_iter()
            .map(|v| v.into_array("eval_session result"))
            .collect()
    }
}

impl EngineSession for ScriptSession {
    fn run(
        &self,
        feed_ports: &[Port],
        feed_values: &[&Buffer],
        fetches: &[Port],
        _targets: &[OpId],
    ) -> std::result::Result<Vec<Buffer>, Status> {
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
        // Target-only runs have nothing to evaluate; start_session already
        // initialized the host session.
        if feed_ports.is_empty() && fetches.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.evaluate(feed_ports, feed_values, fetches)?)
    }

    fn close(&mut self) -> std::result::Result<(), Status> {
        self.closed = true;
        Ok(())
    }

    fn delete(self: Box<Self>) -> std::result::Result<(), Status> {
        Ok(())
    }
}
