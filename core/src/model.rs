//! Model registry: register and load serialized graphs by ID.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{DnnError, Result};
use crate::graph::Graph;

/// Identifies a built-in model.
pub struct ModelId;

impl ModelId {
    /// Single dense layer used by the hello-world scenario.
    /// Input `input`: [-1, 10] float32
    /// Output `output`: [-1, 1] float32, `input x ones[10, 1] + 1`
    /// Init operation: `init`
    pub const SIMPLE_GRAPH: &str = "simplegraph";
}

/// Describes a registered model.
pub struct ModelInfo {
    pub id: String,
    pub data: &'static [u8],
}

pub(crate) static REGISTRY: Lazy<Mutex<HashMap<String, ModelInfo>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a model with the given ID and serialized graph data.
/// Registering an existing ID replaces it.
pub fn register_model(id: &str, data: &'static [u8]) {
    REGISTRY.lock().insert(
        id.to_string(),
        ModelInfo {
            id: id.to_string(),
            data,
        },
    );
}

/// Loads a registered model by ID into a new graph.
pub fn load_model(engine: Arc<dyn Engine>, id: &str) -> Result<Graph> {
    let data = REGISTRY
        .lock()
        .get(id)
        .map(|info| info.data)
        .ok_or_else(|| DnnError::ModelNotRegistered(id.to_string()))?;
    Graph::from_source(engine, data)
}

/// Returns the IDs of all registered models, sorted.
pub fn list_models() -> Vec<String> {
    let mut ids: Vec<String> = REGISTRY.lock().keys().cloned().collect();
    ids.sort();
    ids
}
