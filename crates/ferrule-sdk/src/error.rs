//! Error types for the bridge boundary

use crate::ids::ContextId;
use crate::status::Status;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Recoverable failure conditions of bridge operations.
///
/// Contract violations (stale handles, out-of-order scope closes, unknown
/// callback identifiers) are not represented here: they abort via panic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The context was torn down before or during the operation
    #[error("{0} has been torn down")]
    ContextGone(ContextId),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// A host value had the wrong type
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        got: &'static str,
    },

    /// A second `escape` on the same escapable scope
    #[error("Escape already called on this scope")]
    EscapeCalledTwice,

    /// Non-blocking enqueue on a full threadsafe function queue
    #[error("Threadsafe function queue is full")]
    QueueFull,

    /// The threadsafe function no longer accepts calls
    #[error("Threadsafe function is closing")]
    Closing,

    /// Cancel requested after the work left the queued state
    #[error("Async work can no longer be cancelled")]
    CancelRejected,

    /// Release requested after the acquisition count reached zero
    #[error("Threadsafe function has already been fully released")]
    AlreadyFinal,

    /// A host exception is pending; the caller must handle it first
    #[error("A host exception is pending")]
    PendingException,

    /// Failure raised by managed code inside a closure
    #[error("{message}")]
    Managed {
        /// Optional machine-readable code
        code: Option<String>,
        /// Human-readable message
        message: String,
    },
}

impl BridgeError {
    /// Managed-side failure with a message
    pub fn failure(message: impl Into<String>) -> Self {
        BridgeError::Managed {
            code: None,
            message: message.into(),
        }
    }

    /// Managed-side failure with a code and a message
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Managed {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Status code reported for this error
    pub fn status(&self) -> Status {
        match self {
            BridgeError::ContextGone(_) => Status::ContextGone,
            BridgeError::InvalidArg(_) => Status::InvalidArg,
            BridgeError::TypeMismatch { expected, .. } => match *expected {
                "object" => Status::ObjectExpected,
                "string" => Status::StringExpected,
                "function" => Status::FunctionExpected,
                "number" => Status::NumberExpected,
                "boolean" => Status::BooleanExpected,
                _ => Status::InvalidArg,
            },
            BridgeError::EscapeCalledTwice => Status::EscapeCalledTwice,
            BridgeError::QueueFull => Status::QueueFull,
            BridgeError::Closing => Status::Closing,
            BridgeError::CancelRejected => Status::GenericFailure,
            BridgeError::AlreadyFinal => Status::InvalidArg,
            BridgeError::PendingException => Status::PendingException,
            BridgeError::Managed { .. } => Status::GenericFailure,
        }
    }

    /// Code attached to a host error built from this failure
    pub fn code(&self) -> Option<&str> {
        match self {
            BridgeError::Managed { code, .. } => code.as_deref(),
            other => Some(other.status().name()),
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::failure(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::failure(s)
    }
}
