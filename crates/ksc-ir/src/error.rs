//! Error types for IR parsing, validation and loading.

use thiserror::Error;

/// Result type for IR operations
pub type Result<T> = std::result::Result<T, IrError>;

/// Errors produced by the IR layer. Every message is stable: callers
/// (and frontends matching historical diagnostics) key off these texts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// KSIR1 text could not be parsed
    #[error("{0}")]
    Parse(String),

    /// A structural invariant does not hold
    #[error("{0}")]
    Validate(String),

    /// An attr names a user type that is declared nowhere in scope.
    /// Kept structured so the dispatcher can re-render the legacy
    /// `/seq/0/type` diagnostic.
    #[error("attr references unknown user type: {type_name}")]
    UnknownUserType {
        spec_name: String,
        type_name: String,
    },

    /// Import DFS re-entered a file already on the visit stack
    #[error("import cycle detected: {0}")]
    ImportCycle(String),

    /// Two imported modules declare the same symbol
    #[error("duplicate symbol across imports: {kind} {name}")]
    DuplicateSymbol { kind: &'static str, name: String },

    /// An import name resolved to no file on the search path
    #[error("failed to resolve import: {name} from {from}")]
    ImportNotFound { name: String, from: String },

    /// An IR file could not be read
    #[error("failed to open IR file: {0}")]
    OpenFile(String),
}
