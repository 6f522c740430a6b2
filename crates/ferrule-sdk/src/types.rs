//! Modes and small enums shared across the boundary

use std::fmt;

/// Enqueue behavior of a threadsafe function call when its queue is full
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallMode {
    /// Suspend the calling thread until space frees or the function closes
    Blocking,
    /// Return `QueueFull` immediately
    NonBlocking,
}

/// How a thread gives up its claim on a threadsafe function
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Orderly release: queued invocations still run before teardown
    Release,
    /// Discard queued invocations and reject further calls
    Abort,
}

/// Status handed to an async work completion step
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsyncStatus {
    /// The execute step ran to completion
    Ok,
    /// The work was cancelled before its execute step started
    Cancelled,
}

/// Type tag of a host value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean,
    /// IEEE 754 number
    Number,
    /// UTF-8 string
    String,
    /// Plain object, error or promise
    Object,
    /// Callable function object
    Function,
    /// Opaque native data owned by the host
    External,
}

impl ValueType {
    /// Lower-case type name, as reported in type mismatch errors
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Undefined => "undefined",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Object => "object",
            ValueType::Function => "function",
            ValueType::External => "external",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_names() {
        assert_eq!(ValueType::Function.name(), "function");
        assert_eq!(ValueType::Undefined.to_string(), "undefined");
    }
}
