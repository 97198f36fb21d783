//! Error types for aoti-container.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::tensor::{DType, Shape};

/// Result type alias for aoti-container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Which side of the model signature an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Input,
    Output,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Coarse error taxonomy. Decides the status code reported at the C boundary
/// and whether the instance that produced the error may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad artifact, device unavailable, invalid binaries directory.
    Initialization,
    /// Arity, dtype or shape mismatch, invalid handle, out-of-range index.
    ContractViolation,
    /// The proxy executor failed while servicing a delegated operator.
    DelegatedExecution,
    /// The compiled graph itself failed.
    Execution,
    /// Every instance has been retired, or a bounded wait expired.
    Exhausted,
    /// Configuration, IO and serialization failures outside the runtime core.
    Environment,
    /// Generic failure status from the C boundary. Code 1 covers
    /// initialization, execution and refused deletes alike, so it is not
    /// classified further.
    Unclassified,
}

/// Errors that can occur while creating or running a model container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// An instance failed to initialize.
    #[error("Initialization failed: {0}")]
    Init(String),

    /// Wrong number of inputs or outputs.
    #[error("Expected {expected} {kind}s, got {actual}")]
    Arity {
        kind: IoKind,
        expected: usize,
        actual: usize,
    },

    /// Tensor dtype differs from the declared one.
    #[error("{kind} {index} has dtype {actual}, expected {expected}")]
    DtypeMismatch {
        kind: IoKind,
        index: usize,
        expected: DType,
        actual: DType,
    },

    /// Tensor shape is outside the declared maximum bounds.
    #[error("{kind} {index} has shape {actual}, which exceeds maximum {max}")]
    ShapeOutOfBounds {
        kind: IoKind,
        index: usize,
        actual: Shape,
        max: Shape,
    },

    /// Output slot too small to hold the largest result.
    #[error("output {index} holds {available} bytes, needs at least {required}")]
    OutputCapacity {
        index: usize,
        required: usize,
        available: usize,
    },

    /// Signature index out of range.
    #[error("{kind} index {index} out of range ({count} declared)")]
    IndexOutOfRange {
        kind: IoKind,
        index: usize,
        count: usize,
    },

    /// Null or otherwise unusable handle passed across the boundary.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The graph delegates operators but no proxy executor was supplied.
    #[error("Graph delegates operators but no proxy executor was supplied")]
    MissingProxy,

    /// Proxy executor failed on a delegated operator.
    #[error("Proxy executor failed on extern node {node}: {message}")]
    Delegated { node: usize, message: String },

    /// Compiled graph execution failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// No usable instance remains in the pool.
    #[error("All {0} model instances have been retired")]
    Exhausted(usize),

    /// Bounded wait for a free instance expired.
    #[error("No free model instance within {0:?}")]
    Timeout(std::time::Duration),

    /// Non-zero status code received from the C boundary.
    #[error("Runtime call failed with status {code}: {message}")]
    Status { code: i32, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl ContainerError {
    /// Create an initialization error.
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create an invalid-handle error.
    pub fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::InvalidHandle(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Init(_) => ErrorClass::Initialization,
            Self::Arity { .. }
            | Self::DtypeMismatch { .. }
            | Self::ShapeOutOfBounds { .. }
            | Self::OutputCapacity { .. }
            | Self::IndexOutOfRange { .. }
            | Self::InvalidHandle(_)
            | Self::MissingProxy => ErrorClass::ContractViolation,
            Self::Delegated { .. } => ErrorClass::DelegatedExecution,
            Self::Execution(_) => ErrorClass::Execution,
            Self::Exhausted(_) | Self::Timeout(_) => ErrorClass::Exhausted,
            Self::Status { code, .. } => match *code {
                crate::ffi::AOTI_RUNTIME_CONTRACT_VIOLATION => ErrorClass::ContractViolation,
                crate::ffi::AOTI_RUNTIME_DELEGATED_FAILURE => ErrorClass::DelegatedExecution,
                crate::ffi::AOTI_RUNTIME_EXHAUSTED => ErrorClass::Exhausted,
                _ => ErrorClass::Unclassified,
            },
            Self::Config(_)
            | Self::Yaml(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::FileNotFound(_) => ErrorClass::Environment,
        }
    }

    /// Whether the instance that produced this error can be handed out again.
    ///
    /// Contract violations are detected before an instance touches its scratch
    /// state. Everything else is treated as possibly corrupting.
    pub fn preserves_instance(&self) -> bool {
        self.class() == ErrorClass::ContractViolation
    }

    /// Status code reported at the C boundary.
    pub fn status(&self) -> i32 {
        match self {
            Self::Status { code, .. } => *code,
            _ => match self.class() {
                ErrorClass::ContractViolation => crate::ffi::AOTI_RUNTIME_CONTRACT_VIOLATION,
                ErrorClass::DelegatedExecution => crate::ffi::AOTI_RUNTIME_DELEGATED_FAILURE,
                ErrorClass::Exhausted => crate::ffi::AOTI_RUNTIME_EXHAUSTED,
                ErrorClass::Initialization
                | ErrorClass::Execution
                | ErrorClass::Environment
                | ErrorClass::Unclassified => crate::ffi::AOTI_RUNTIME_FAILURE,
            },
        }
    }
}

/// Error raised by a proxy executor while servicing a delegated operator.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProxyError(pub String);

impl ProxyError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ContainerError::init("missing artifact");
        assert_eq!(format!("{}", err), "Initialization failed: missing artifact");

        let err = ContainerError::Arity {
            kind: IoKind::Input,
            expected: 1,
            actual: 2,
        };
        assert_eq!(format!("{}", err), "Expected 1 inputs, got 2");

        let err = ContainerError::ShapeOutOfBounds {
            kind: IoKind::Input,
            index: 0,
            actual: Shape::from_slice(&[5, 4]),
            max: Shape::from_slice(&[4, 4]),
        };
        assert_eq!(
            format!("{}", err),
            "input 0 has shape [5, 4], which exceeds maximum [4, 4]"
        );

        let err = ContainerError::FileNotFound(PathBuf::from("/path/to/kernels"));
        assert_eq!(format!("{}", err), "File not found: /path/to/kernels");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ContainerError::init("x").status(), 1);
        assert_eq!(ContainerError::MissingProxy.status(), 2);
        assert_eq!(
            ContainerError::Delegated {
                node: 0,
                message: "boom".into()
            }
            .status(),
            3
        );
        assert_eq!(ContainerError::Exhausted(2).status(), 4);
        assert_eq!(ContainerError::config("bad").status(), 1);
    }

    #[test]
    fn test_status_round_trip_classes() {
        let status = |code| ContainerError::Status {
            code,
            message: String::new(),
        };
        assert_eq!(status(1).class(), ErrorClass::Unclassified);
        assert_eq!(status(2).class(), ErrorClass::ContractViolation);
        assert_eq!(status(3).class(), ErrorClass::DelegatedExecution);
        assert_eq!(status(4).class(), ErrorClass::Exhausted);
        assert_eq!(status(1).status(), 1);
        assert!(!status(1).preserves_instance());
    }

    #[test]
    fn test_only_contract_violations_preserve_instance() {
        assert!(ContainerError::invalid_handle("null").preserves_instance());
        assert!(!ContainerError::execution("nan").preserves_instance());
        assert!(!ContainerError::Delegated {
            node: 3,
            message: "kernel crashed".into()
        }
        .preserves_instance());
    }
}
