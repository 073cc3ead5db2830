//! # cxxray-types
//!
//! C type library for cxxray.
//!
//! This crate provides:
//! - C type representation (integers, pointers, arrays, named references)
//! - Class memory layouts with offset-addressed fields
//! - Function prototypes used for call-site signature overrides
//! - A type database acting as the type-storage backend
//!
//! # Example
//!
//! ```ignore
//! use cxxray_types::{Layout, LayoutField, TypeDatabase};
//!
//! let mut layout = Layout::new("Shape", 16, 8);
//! layout.replace_at_offset(LayoutField::vptr("_vptr", 0, 8, None))?;
//!
//! let mut db = TypeDatabase::new();
//! db.register_layout(layout);
//! println!("{}", db.format_layout("Shape").unwrap());
//! ```

pub mod database;
pub mod layout;
pub mod types;

pub use database::TypeDatabase;
pub use layout::{FieldKind, Layout, LayoutError, LayoutField, SUPER_PREFIX};
pub use types::*;
