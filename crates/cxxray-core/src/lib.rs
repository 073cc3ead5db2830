//! # cxxray-core
//!
//! Core vocabulary shared by the cxxray crates: target architectures, byte
//! order, argument registers and a small pointer reader used by the RTTI and
//! vtable parsers.

pub mod arch;
pub mod error;
pub mod reader;
pub mod register;

pub use arch::{Architecture, Endianness};
pub use error::Error;
pub use reader::PointerReader;
pub use register::Register;
