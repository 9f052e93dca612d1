//! Filter-graph error types.
//!
//! Errors split into two groups. Recoverable ones are raised by a filter body
//! about its own inputs; the scheduler records them on the node and clears the
//! node's outputs. Everything else aborts the refresh pass.

use crate::accel::AccelError;
use crate::pipeline::id::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input '{slot}' is missing: {message}")]
    MissingInput { slot: String, message: String },

    #[error("Input '{slot}' is invalid: {message}")]
    InvalidInput { slot: String, message: String },

    #[error("Degenerate input: {0}")]
    Degenerate(String),

    #[error("Waveform too short: {0}")]
    WaveformTooShort(String),

    #[error("File error: {0}")]
    File(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node {node_id:?} error: {message}")]
    Node { node_id: NodeId, message: String },

    #[error("Node {0:?} not found")]
    NodeNotFound(NodeId),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Cycle detected in filter graph")]
    CycleDetected,

    #[error("Unknown filter protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Parameter '{name}': {message}")]
    ParameterType { name: String, message: String },

    #[error("Accelerator error: {0}")]
    Accel(#[from] AccelError),
}

/// Per-node error classes kept in a node's error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingInput,
    InvalidInput,
    Degenerate,
    File,
}

impl PipelineError {
    pub fn missing(slot: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::MissingInput {
            slot: slot.into(),
            message: message.into(),
        }
    }

    pub fn invalid(slot: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::InvalidInput {
            slot: slot.into(),
            message: message.into(),
        }
    }

    /// The class this error is recorded under, or `None` if it must
    /// propagate out of the refresh pass.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::MissingInput { .. } => Some(ErrorKind::MissingInput),
            PipelineError::InvalidInput { .. } => Some(ErrorKind::InvalidInput),
            PipelineError::Degenerate(_) | PipelineError::WaveformTooShort(_) => {
                Some(ErrorKind::Degenerate)
            }
            PipelineError::File(_) | PipelineError::Io(_) => Some(ErrorKind::File),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_some()
    }
}

impl From<crate::formats::FormatError> for PipelineError {
    fn from(err: crate::formats::FormatError) -> Self {
        PipelineError::File(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(PipelineError::missing("din", "not connected").is_recoverable());
        assert!(PipelineError::WaveformTooShort("1 crossing".into()).is_recoverable());
        assert_eq!(
            PipelineError::WaveformTooShort("x".into()).kind(),
            Some(ErrorKind::Degenerate)
        );
        assert!(!PipelineError::CycleDetected.is_recoverable());
        assert!(!PipelineError::Accel(AccelError::contract("double dispatch")).is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = PipelineError::invalid("in0", "expected analog");
        assert_eq!(err.to_string(), "Input 'in0' is invalid: expected analog");
    }
}
