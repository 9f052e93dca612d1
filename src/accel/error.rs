//! Accelerator-specific error types.

use thiserror::Error;

/// Errors raised by the compute device, accelerator buffers and pipelines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccelError {
    #[error("Out of device memory: requested {requested} bytes with {in_use} of {budget} in use")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        budget: usize,
    },

    #[error("Host allocation of {0} elements failed")]
    HostAllocation(usize),

    #[error("Compute program not found: {0}")]
    ProgramNotFound(String),

    #[error("Binding layout mismatch for {program}: {message}")]
    LayoutMismatch { program: String, message: String },

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Compute program {program} failed: {message}")]
    Kernel { program: String, message: String },

    #[error("No compute adapter available")]
    NoAdapter,

    #[error("GPU backend error: {0}")]
    Backend(String),
}

impl AccelError {
    /// Shorthand for a contract violation with a formatted message.
    pub fn contract(message: impl Into<String>) -> Self {
        AccelError::ContractViolation(message.into())
    }
}

pub type AccelResult<T> = std::result::Result<T, AccelError>;
