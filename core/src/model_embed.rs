//! Embedded model files.

use crate::model::{ModelId, register_model};

pub(crate) static SIMPLE_GRAPH: &[u8] = include_bytes!("simplegraph.json");

/// Registers all built-in embedded models.
pub fn register_embedded_models() {
    register_model(ModelId::SIMPLE_GRAPH, SIMPLE_GRAPH);
}
