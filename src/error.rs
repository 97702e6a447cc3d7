//! Engine error values.
//!
//! Every fallible operation reports an [`EngineError`]: a kind for
//! programmatic handling plus a human-readable message. The handle keeps the
//! most recent error so callers polling a C-like surface can retrieve it
//! after a failed call.

use std::fmt;

/// Broad classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An allocation or capacity limit failed.
    Memory,
    /// Malformed input: JSON, connection path, expression or key layout.
    Format,
    /// A bad argument to an API call.
    Argument,
    /// A failure propagated from a collaborator outside the core.
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Memory => write!(f, "memory"),
            ErrorKind::Format => write!(f, "format"),
            ErrorKind::Argument => write!(f, "argument"),
            ErrorKind::Resource => write!(f, "resource"),
        }
    }
}

/// An error raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Memory, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::format(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = EngineError::format("unexpected token");
        assert_eq!(err.to_string(), "format error: unexpected token");
    }
}
