//! Graph, session, IO and tensor binding layer for repeated neural-network
//! inference.
//!
//! A [`Graph`] loads a serialized computation graph through an [`Engine`].
//! A [`Session`] binds to a loaded graph, holds named input and output
//! bindings ([`Io`]) between caller-owned [`Tensor`]s and graph ports, and
//! evaluates the graph on demand. The crate ships a pure-Rust reference
//! engine ([`cpu::CpuEngine`]) reading JSON graph definitions.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dnnrt_core::cpu::CpuEngine;
//! use dnnrt_core::{DType, Graph, Session, SharedTensor};
//!
//! let graph = Graph::from_source(Arc::new(CpuEngine::new()), "simplegraph.json").unwrap();
//! let mut session = Session::from_graph(&graph).unwrap();
//!
//! let input = SharedTensor::empty();
//! input.write().allocate(2, &[1, 10], DType::Float32).unwrap();
//! let output = SharedTensor::empty();
//!
//! session.add_input(&input, "input", 0).unwrap();
//! session.add_output(&output, "output", 0).unwrap();
//!
//! for i in 0..10 {
//!     input.write().set(&[0, i], i as f32).unwrap();
//! }
//! session.run().unwrap();
//! let y: f32 = output.read().get(&[0, 0]).unwrap();
//! ```
//!
//! # Threading
//!
//! One graph may be shared by any number of sessions across threads.
//! Stateless runs ([`Session::run_with`]) take `&self` and may run
//! concurrently on one session; everything else takes `&mut self`.

mod buffer;
pub mod cpu;
mod engine;
mod error;
mod graph;
mod io;
pub mod model;
mod model_embed;
mod session;
mod tensor;

pub use buffer::{Buffer, DType, Data, Element};
pub use engine::{
    Engine, EngineSession, LoadedGraph, ModelSource, OpId, Port, SessionOptions, Status,
    parse_port_name,
};
pub use error::{DnnError, Result};
pub use graph::Graph;
pub use io::{Io, IoId};
pub use model::{ModelId, list_models, load_model, register_model};
pub use model_embed::register_embedded_models;
pub use session::Session;
pub use tensor::{SharedTensor, Tensor};
