//! Error types for the tracelet JIT middle-end
//!
//! Expected pass-gate rejections are not errors: gates return `false` and log
//! a reason, and the driver simply moves on. `CompileError` covers the cases
//! where the current trace must be abandoned or a shared resource ran out.

use thiserror::Error;

/// Main error type for a trace compilation
#[derive(Error, Debug)]
pub enum CompileError {
    /// The code cache cannot hold the new translation.
    ///
    /// This is sticky for the whole JIT: the driver records it in the
    /// context and rejects further compile orders until the cache is reset.
    #[error("code cache full: needed {needed} bytes, {available} available")]
    CodeCacheFull { needed: usize, available: usize },

    /// The data cache cannot hold the new constants/tables.
    #[error("data cache full: needed {needed} bytes, {available} available")]
    DataCacheFull { needed: usize, available: usize },

    /// The trace request does not describe something we can build a CFG from.
    #[error("malformed trace: {0}")]
    MalformedTrace(String),

    /// A transform found the CFG in a shape its gate should have excluded.
    /// The trace is discarded; the interpreter keeps running the code.
    #[error("structural failure in {pass}: {message}")]
    Structural { pass: &'static str, message: String },

    /// An externally supplied pass named a pipeline anchor that does not
    /// exist; raised only when the configuration makes such failures fatal.
    #[error("cannot register pass {pass:?}: no pass named {anchor:?}")]
    PassRegistration { pass: &'static str, anchor: String },
}

/// Result type alias for tracelet
pub type Result<T> = std::result::Result<T, CompileError>;
