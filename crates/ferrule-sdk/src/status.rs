//! Status codes reported across the bridge boundary

use std::fmt;

/// Outcome code of a bridge operation.
///
/// Every failure condition maps to exactly one status so that a caller on
/// the far side of the boundary can branch on a plain integer.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded
    Ok = 0,
    /// An argument was invalid for the operation
    InvalidArg = 1,
    /// An object was expected
    ObjectExpected = 2,
    /// A string was expected
    StringExpected = 3,
    /// A function was expected
    FunctionExpected = 5,
    /// A number was expected
    NumberExpected = 6,
    /// A boolean was expected
    BooleanExpected = 7,
    /// Generic failure, including managed-side failures
    GenericFailure = 9,
    /// A host exception is pending
    PendingException = 10,
    /// The operation was cancelled
    Cancelled = 11,
    /// `escape` was called twice on the same escapable scope
    EscapeCalledTwice = 12,
    /// A threadsafe function queue is full
    QueueFull = 15,
    /// A threadsafe function is closing or closed
    Closing = 16,
    /// The context backing the operation has been torn down
    ContextGone = 20,
}

impl Status {
    /// Numeric code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Stable lower-case name, used as the `code` of thrown host errors
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidArg => "invalid_arg",
            Status::ObjectExpected => "object_expected",
            Status::StringExpected => "string_expected",
            Status::FunctionExpected => "function_expected",
            Status::NumberExpected => "number_expected",
            Status::BooleanExpected => "boolean_expected",
            Status::GenericFailure => "generic_failure",
            Status::PendingException => "pending_exception",
            Status::Cancelled => "cancelled",
            Status::EscapeCalledTwice => "escape_called_twice",
            Status::QueueFull => "queue_full",
            Status::Closing => "closing",
            Status::ContextGone => "context_gone",
        }
    }

    /// Whether this status reports success
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::QueueFull.code(), 15);
        assert!(Status::Ok.is_ok());
        assert!(!Status::Closing.is_ok());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::EscapeCalledTwice.to_string(), "escape_called_twice");
    }
}
