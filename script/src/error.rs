use dnnrt_core::Status;
use thiserror::Error;

/// Errors raised by a script host or the interpreter lifecycle.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script: error during execution of script: {0}")]
    Script(String),

    #[error("script: error during invocation of {name}: {message}")]
    Call { name: String, message: String },

    #[error("script: unexpected value: {0}")]
    Type(String),

    #[error("script: unsupported: {0}")]
    Unsupported(String),

    #[error("script: interpreter: {0}")]
    Interpreter(String),

    #[error("script: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn call(name: &str, message: impl Into<String>) -> Self {
        ScriptError::Call {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

impl From<ScriptError> for Status {
    fn from(err: ScriptError) -> Self {
        Status::new(err.to_string())
    }
}

/// Result type for script operations.
pub type Result<T> = std::result::Result<T, ScriptError>;
