//! Error types for cxxray-core.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Pointer width the readers do not understand.
    #[error("unsupported pointer size: {0} bytes")]
    UnsupportedPointerSize(usize),

    /// Register name that does not exist on the architecture.
    #[error("unknown register {name:?} for {arch}")]
    UnknownRegister { arch: &'static str, name: String },
}
