//! Scripting execution backend for dnnrt.
//!
//! [`ScriptEngine`] implements the [`dnnrt_core::Engine`] boundary on top of
//! an embedded interpreter reached through the [`ScriptHost`] trait, so a
//! [`dnnrt_core::Graph`] and [`dnnrt_core::Session`] can delegate loading and
//! evaluation to a script instead of a native engine. The binding-layer
//! checks (duplicate IOs, empty inputs, output hand-over) are the same for
//! both backends.
//!
//! Interpreter start and stop is reference counted by [`Lifecycle`].
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use dnnrt_core::{Graph, Session};
//! use dnnrt_script::{Lifecycle, ScriptEngine};
//!
//! let lifecycle = Lifecycle::install(Arc::new(MyInterpreter::new()))?;
//! let engine = ScriptEngine::new(Arc::new(MyHost::new()))
//!     .with_bootstrap(VOCABULARY)
//!     .with_lifecycle(lifecycle);
//! let graph = Graph::from_source(Arc::new(engine), "model/graph")?;
//! let session = Session::from_graph(&graph)?;
//! ```

mod engine;
mod error;
mod host;
mod interpreter;

pub use engine::ScriptEngine;
pub use error::{Result, ScriptError};
pub use host::{ScriptHost, ScriptValue};
pub use interpreter::{Interpreter, InterpreterLease, Lifecycle};

#[cfg(test)]
mod tests;
