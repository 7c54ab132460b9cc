//! Values exchanged with a script host, and the host interface itself.

use std::path::Path;

use dnnrt_core::Buffer;

use crate::error::{Result, ScriptError};

/// A value passed to or returned from a script function.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ScriptValue>),
    /// A dense numeric array.
    Array(Buffer),
}

impl ScriptValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::None => "none",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Int(_) => "int",
            ScriptValue::Float(_) => "float",
            ScriptValue::Str(_) => "str",
            ScriptValue::Tuple(_) => "tuple",
            ScriptValue::Array(_) => "array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Unwraps a tuple, naming `what` in the error otherwise.
    pub fn into_tuple(self, what: &str) -> Result<Vec<ScriptValue>> {
        match self {
            ScriptValue::Tuple(items) => Ok(items),
            other => Err(ScriptError::Type(format!(
                "{what}: expected tuple, got {}",
                other.type_name()
            ))),
        }
    }

    /// Unwraps an array, naming `what` in the error otherwise.
    pub fn into_array(self, what: &str) -> Result<Buffer> {
        match self {
            ScriptValue::Array(buffer) => Ok(buffer),
            other => Err(ScriptError::Type(format!(
                "{what}: expected array, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(v: bool) -> Self {
        ScriptValue::Bool(v)
    }
}

impl From<i64> for ScriptValue {
    fn from(v: i64) -> Self {
        ScriptValue::Int(v)
    }
}

impl From<f64> for ScriptValue {
    fn from(v: f64) -> Self {
        ScriptValue::Float(v)
    }
}

impl From<&str> for ScriptValue {
    fn from(v: &str) -> Self {
        ScriptValue::Str(v.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(v: String) -> Self {
        ScriptValue::Str(v)
    }
}

impl From<Buffer> for ScriptValue {
    fn from(v: Buffer) -> Self {
        ScriptValue::Array(v)
    }
}

/// An embedded interpreter context that scripts run in.
///
/// Functions defined by [`ScriptHost::run_script`] are invoked by name
/// through [`ScriptHost::call`]. Calls may come from several threads; the
/// host serializes them as its interpreter requires.
pub trait ScriptHost: Send + Sync {
    /// Executes `code` in the host's global context.
    fn run_script(&self, code: &str) -> Result<()>;

    /// Calls the global function `name`. `args` is a tuple built with
    /// [`ScriptHost::create_tuple`]; hosts reject anything else.
    fn call(&self, name: &str, args: ScriptValue) -> Result<ScriptValue>;

    /// Packs positional arguments.
    fn create_tuple(&self, values: Vec<ScriptValue>) -> ScriptValue {
        ScriptValue::Tuple(values)
    }

    /// Reads `path` and executes it like [`ScriptHost::run_script`].
    fn run_file(&self, path: &Path) -> Result<()> {
        let code = std::fs::read_to_string(path)?;
        self.run_script(&code)
    }
}
