use thiserror::Error;

/// Errors returned by graph, session and tensor operations.
///
/// Variants that originate from an engine call carry the engine's own
/// diagnostic text after the structural context.
#[derive(Debug, Error)]
pub enum DnnError {
    #[error("dnn: invalid graph: {0}")]
    InvalidGraph(String),

    #[error("dnn: invalid session: {0}")]
    InvalidSession(String),

    #[error("dnn: invalid operation: {0}")]
    InvalidOperation(String),

    #[error("dnn: invalid input: {0}")]
    InvalidInput(String),

    #[error("dnn: invalid output: {0}")]
    InvalidOutput(String),

    #[error("dnn: invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("dnn: invalid config: {0}")]
    InvalidConfig(String),

    #[error("dnn: model {0:?} not registered")]
    ModelNotRegistered(String),
}

/// Result type for binding-layer operations.
pub type Result<T> = std::result::Result<T, DnnError>;
