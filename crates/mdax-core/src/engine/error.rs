use thiserror::Error;

use super::config::ConfigError;
use super::solvers::LinearSolveError;
use crate::core::jacobian::store::JacobianError;
use crate::core::models::component::ComponentError;
use crate::core::models::system::SetupError;
use crate::core::registry::{
    DuplicateVariableError, UninitializedOutputError, UnknownVariableError,
};

/// Connection problems, all detected at setup before any component runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Input '{input}' is not connected to any output")]
    Unconnected { input: String },

    #[error("Connection source '{src}' does not exist in group '{group}'")]
    NonexistentSource { group: String, src: String },

    #[error("Connection target '{target}' does not exist in group '{group}'")]
    NonexistentTarget { group: String, target: String },

    #[error("Connection source '{src}' in group '{group}' is an input, not an output")]
    SourceNotOutput { group: String, src: String },

    #[error("Connection target '{target}' in group '{group}' is an output, not an input")]
    TargetNotInput { group: String, target: String },

    #[error("Cannot connect '{src}' of shape {src_shape} to '{target}' of shape {target_shape}")]
    ShapeMismatch {
        src: String,
        target: String,
        src_shape: String,
        target_shape: String,
    },

    #[error("Source index {index} is out of range for '{src}' of size {size}")]
    IndexOutOfRange {
        src: String,
        index: usize,
        size: usize,
    },

    #[error("Input '{input}' is connected to both '{first}' and '{second}'")]
    MultipleSources {
        input: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
pub enum MdoError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    DuplicateVariable(#[from] DuplicateVariableError),

    #[error(transparent)]
    UnknownVariable(#[from] UnknownVariableError),

    #[error(transparent)]
    UninitializedOutput(#[from] UninitializedOutputError),

    #[error("Component '{path}' failed: {source}")]
    Component {
        path: String,
        #[source]
        source: ComponentError,
    },

    #[error(transparent)]
    Jacobian(#[from] JacobianError),

    #[error(transparent)]
    LinearSolve(#[from] LinearSolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another process of the collective failed; its own error is reported there.
    #[error("Process {rank} failed during {phase}")]
    RemoteFailure { rank: usize, phase: &'static str },
}

impl MdoError {
    pub(crate) fn component(path: &str, source: ComponentError) -> Self {
        MdoError::Component {
            path: path.to_string(),
            source,
        }
    }
}
