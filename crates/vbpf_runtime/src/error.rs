//! Error types for the program runtime.

use vbpf_jit::JitError;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while building, rewriting or publishing programs.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Allocation or growth of program or code memory failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A memory protection change failed.
    #[error("memory protection change failed: {0}")]
    Protection(#[from] std::io::Error),

    // =========================================================================
    // Rewrite Errors
    // =========================================================================
    /// A branch or line-info offset would not fit its encoding after a rewrite.
    #[error("offset out of range at instruction {insn}")]
    OutOfRange { insn: usize },

    // =========================================================================
    // Runtime Selection Errors
    // =========================================================================
    /// Native code was required but could not be produced.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The program has not reached a locked, runnable state.
    #[error("program is not runnable: {0}")]
    InvalidState(String),

    /// The program does not match the owner metadata of a program-holding map.
    #[error("program incompatible with map {map_id}: {reason}")]
    Incompatible { map_id: u32, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// The runtime configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Membership Errors
    // =========================================================================
    /// The program is already a member.
    #[error("program {0} is already attached")]
    AlreadyExists(u32),

    /// The program or slot is not a member.
    #[error("no such program: {0}")]
    NotFound(String),
}

impl From<JitError> for RuntimeError {
    fn from(err: JitError) -> Self {
        match err {
            JitError::Protection(io) => Self::Protection(io),
            err @ JitError::UnknownRegion { .. } => Self::InvalidState(err.to_string()),
            other => Self::OutOfMemory(other.to_string()),
        }
    }
}
