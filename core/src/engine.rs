//! The execution-engine boundary.
//!
//! An engine turns a [`ModelSource`] into a [`LoadedGraph`], and a loaded
//! graph opens [`EngineSession`]s that evaluate it. The binding layer
//! ([`Graph`](crate::Graph), [`Session`](crate::Session)) only talks to
//! engines through these traits, so the same invariants hold for every
//! backend.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::Buffer;
use crate::error::{DnnError, Result};

/// Diagnostic returned by a failed engine call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Status(String);

impl Status {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Engine-internal handle of an operation inside a loaded graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// One output of an operation: the resolved form of `"name:index"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub op: OpId,
    pub index: usize,
}

impl Port {
    pub fn new(op: OpId, index: usize) -> Self {
        Self { op, index }
    }
}

/// Splits a port identifier such as `"output:0"` into name and index.
/// A name without `:` refers to index 0.
pub fn parse_port_name(port: &str) -> Result<(&str, usize)> {
    let (name, index) = match port.rsplit_once(':') {
        Some((name, index)) => {
            let index = index.parse::<usize>().map_err(|_| {
                DnnError::InvalidOperation(format!("malformed port index in {port:?}"))
            })?;
            (name, index)
        }
        None => (port, 0),
    };
    if name.is_empty() {
        return Err(DnnError::InvalidOperation(format!(
            "empty operation name in {port:?}"
        )));
    }
    Ok((name, index))
}

/// Where a serialized graph is read from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Static(&'static [u8]),
}

impl ModelSource {
    /// Returns the serialized graph, reading the file for path sources.
    pub fn read(&self) -> std::result::Result<Cow<'_, [u8]>, Status> {
        match self {
            ModelSource::Path(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|e| Status::new(format!("read {}: {e}", path.display()))),
            ModelSource::Bytes(data) => Ok(Cow::Borrowed(data)),
            ModelSource::Static(data) => Ok(Cow::Borrowed(data)),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Path(path) => write!(f, "{}", path.display()),
            ModelSource::Bytes(data) => write!(f, "<{} bytes>", data.len()),
            ModelSource::Static(data) => write!(f, "<{} static bytes>", data.len()),
        }
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        ModelSource::Path(path)
    }
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        ModelSource::Path(path.to_path_buf())
    }
}

impl From<&str> for ModelSource {
    fn from(path: &str) -> Self {
        ModelSource::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for ModelSource {
    fn from(data: Vec<u8>) -> Self {
        ModelSource::Bytes(data)
    }
}

impl From<&'static [u8]> for ModelSource {
    fn from(data: &'static [u8]) -> Self {
        ModelSource::Static(data)
    }
}

/// Options applied when a session is bound to a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Threads an engine may use inside one run. 0 lets the engine decide,
    /// 1 forces single-threaded execution.
    pub num_threads: usize,

    /// Operation run as a target right after the session is created, if the
    /// graph contains it.
    pub init_op: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            num_threads: 0,
            init_op: Some("init".to_string()),
        }
    }
}

impl SessionOptions {
    pub fn single_threaded() -> Self {
        Self {
            num_threads: 1,
            ..Self::default()
        }
    }

    /// Parses options from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DnnError::InvalidConfig(e.to_string()))
    }
}

/// A backend able to load serialized graphs.
pub trait Engine: Send + Sync {
    /// Short backend name used in diagnostics.
    fn name(&self) -> &str;

    /// Parses `source` into a loaded graph.
    fn load(&self, source: &ModelSource) -> std::result::Result<Box<dyn LoadedGraph>, Status>;
}

/// An immutable graph inside an engine.
///
/// Implementations must tolerate concurrent reads; nothing mutates a loaded
/// graph.
pub trait LoadedGraph: Send + Sync {
    /// Looks up an operation by name.
    fn operation(&self, name: &str) -> Option<OpId>;

    /// Number of output ports of `op`.
    fn num_outputs(&self, op: OpId) -> usize;

    /// Names of all operations, in graph order.
    fn operation_names(&self) -> Vec<String>;

    /// Opens an execution context for this graph.
    fn new_session(
        &self,
        options: &SessionOptions,
    ) -> std::result::Result<Box<dyn EngineSession>, Status>;
}

/// An execution context of one loaded graph.
pub trait EngineSession: Send + Sync {
    /// Evaluates the graph.
    ///
    /// `feed_ports[i]` is fed with `feed_values[i]`. Returns one newly
    /// allocated buffer per entry of `fetches`, in the same order; the caller
    /// owns them. `targets` are operations run for their effects only.
    fn run(
        &self,
        feed_ports: &[Port],
        feed_values: &[&Buffer],
        fetches: &[Port],
        targets: &[OpId],
    ) -> std::result::Result<Vec<Buffer>, Status>;

    /// Stops accepting runs. Called once before [`EngineSession::delete`].
    fn close(&mut self) -> std::result::Result<(), Status>;

    /// Releases the context.
    fn delete(self: Box<Self>) -> std::result::Result<(), Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_names() {
        assert_eq!(parse_port_name("output:0").unwrap(), ("output", 0));
        assert_eq!(parse_port_name("split:2").unwrap(), ("split", 2));
        assert_eq!(parse_port_name("input").unwrap(), ("input", 0));
        assert_eq!(parse_port_name("scope/a:1").unwrap(), ("scope/a", 1));
        assert!(matches!(
            parse_port_name("output:x"),
            Err(DnnError::InvalidOperation(_))
        ));
        assert!(parse_port_name(":1").is_err());
        assert!(parse_port_name("").is_err());
    }

    #[test]
    fn session_options_from_json() {
        let opts = SessionOptions::from_json(r#"{"num_threads": 1}"#).unwrap();
        assert_eq!(opts.num_threads, 1);
        assert_eq!(opts.init_op.as_deref(), Some("init"));

        let opts = SessionOptions::from_json(r#"{"init_op": null}"#).unwrap();
        assert_eq!(opts.init_op, None);

        let err = SessionOptions::from_json("{").unwrap_err();
        assert!(matches!(err, DnnError::InvalidConfig(_)));
    }

    #[test]
    fn single_threaded_options() {
        let opts = SessionOptions::single_threaded();
        assert_eq!(opts.num_threads, 1);
        assert_eq!(opts.init_op, SessionOptions::default().init_op);
    }

    #[test]
    fn read_sources() {
        let bytes = ModelSource::from(vec![1u8, 2, 3]);
        assert_eq!(&*bytes.read().unwrap(), &[1, 2, 3]);

        let missing = ModelSource::from("/nonexistent/graph.json");
        let err = missing.read().unwrap_err();
        assert!(err.message().contains("/nonexistent/graph.json"));
    }
}
