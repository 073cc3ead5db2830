//! Error taxonomy for class-model reconstruction.
//!
//! Three scopes of failure exist. A [`ModelError`] breaks one class (cyclic
//! inheritance, a base that was never described), a [`HostError`] breaks one
//! function or call site, and an [`AnalysisError`] ends the whole run. The
//! "cannot attribute" outcome is not an error at all: it is a [`Rejection`]
//! value returned from the attributor.

use std::fmt;

use cxxray_types::LayoutError;
use serde::Serialize;
use thiserror::Error;

use crate::model::ClassId;

/// Structural-invariant violations, scoped to a single class.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("class {0} is not in the model")]
    UnknownClass(ClassId),

    #[error("cyclic inheritance through class {0}")]
    CyclicInheritance(ClassId),

    #[error("malformed type descriptor at {address:#x}: {reason}")]
    MalformedDescriptor { address: u64, reason: String },

    #[error("offset arithmetic overflowed while laying out class {0}")]
    OffsetOverflow(ClassId),

    #[error("layout of class {class} is inconsistent: {source}")]
    Layout {
        class: ClassId,
        #[source]
        source: LayoutError,
    },
}

/// Failures reported by an external collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum HostError {
    #[error("no function at {0:#x}")]
    NoFunction(u64),

    #[error("decompilation of function {function:#x} failed: {reason}")]
    Decompile { function: u64, reason: String },

    #[error("dataflow query at {address:#x} failed: {reason}")]
    Dataflow { address: u64, reason: String },

    #[error("signature override at {address:#x} was not applied: {reason}")]
    Signature { address: u64, reason: String },
}

/// Failures that abort a whole analysis run.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("ABI mismatch: {entry_point} has prototype `{found}`, expected `{expected}`")]
    AbiMismatch {
        entry_point: String,
        expected: String,
        found: String,
    },

    #[error("runtime entry point {name} is defined {count} times")]
    AmbiguousEntryPoint { name: String, count: usize },

    #[error("parameter {index} of {entry_point} is not passed in a register")]
    UnsupportedParameterStorage { entry_point: String, index: usize },

    #[error("analysis cancelled")]
    Cancelled,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Core(#[from] cxxray_core::Error),

    #[error("invalid program snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Result type for class-model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Result type for run-level operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Why a candidate function could not be attributed.
///
/// Rejections are expected and frequent; they carry enough detail to log but
/// never trigger a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// The class has no direct bases.
    NoBases,
    /// The class owns no valid vtable.
    NoVtable,
    /// More direct bases than distinct known parent classes.
    AmbiguousParents { bases: usize, parents: usize },
    /// The candidate is a thunk; only its target is analysed.
    Thunk { function: u64 },
    /// The decompiled function has no `this` parameter.
    NoThisParameter { function: u64 },
    /// The call window does not hold exactly one call per direct base.
    CallWindow { expected: usize, found: usize },
    /// A call in the window is indirect.
    IndirectCall { call: u64 },
    /// A call in the window passes no first argument.
    MissingThisArgument { call: u64 },
    /// A call's first argument is not derived from the function's own `this`.
    ForeignThisArgument { call: u64 },
    /// A call's `this` offset matches no direct base.
    OffsetNotInTable { call: u64, offset: i64 },
    /// Two calls resolved to the same direct base.
    DuplicateBase { call: u64, base: ClassId },
    /// Calls matched every base, but not in construction order.
    OrderViolation {
        call: u64,
        expected: ClassId,
        found: ClassId,
    },
    /// A structural violation in the class model.
    Structural { message: String },
    /// The decompiler failed on this function.
    Host(HostError),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoBases => write!(f, "class has no direct bases"),
            Rejection::NoVtable => write!(f, "class owns no valid vtable"),
            Rejection::AmbiguousParents { bases, parents } => write!(
                f,
                "{} direct bases but only {} distinct parents",
                bases, parents
            ),
            Rejection::Thunk { function } => write!(f, "function {:#x} is a thunk", function),
            Rejection::NoThisParameter { function } => {
                write!(f, "function {:#x} has no this parameter", function)
            }
            Rejection::CallWindow { expected, found } => {
                write!(f, "expected {} base calls, found {}", expected, found)
            }
            Rejection::IndirectCall { call } => write!(f, "call at {:#x} is indirect", call),
            Rejection::MissingThisArgument { call } => {
                write!(f, "call at {:#x} passes no this argument", call)
            }
            Rejection::ForeignThisArgument { call } => {
                write!(f, "call at {:#x} does not pass the caller's this", call)
            }
            Rejection::OffsetNotInTable { call, offset } => write!(
                f,
                "call at {:#x} passes this+{:#x}, which is not a direct base",
                call, offset
            ),
            Rejection::DuplicateBase { call, base } => {
                write!(f, "call at {:#x} targets base {} a second time", call, base)
            }
            Rejection::OrderViolation {
                call,
                expected,
                found,
            } => write!(
                f,
                "call at {:#x} targets base {} where {} was expected",
                call, found, expected
            ),
            Rejection::Structural { message } => write!(f, "{}", message),
            Rejection::Host(err) => write!(f, "{}", err),
        }
    }
}

impl From<HostError> for Rejection {
    fn from(err: HostError) -> Self {
        Rejection::Host(err)
    }
}

impl From<ModelError> for Rejection {
    fn from(err: ModelError) -> Self {
        Rejection::Structural {
            message: err.to_string(),
        }
    }
}
