//! Class memory layouts.
//!
//! A [`Layout`] is an ordered list of fields addressed by byte offset. The
//! only way to mutate it is [`Layout::replace_at_offset`], which evicts every
//! field overlapping the new one before inserting it, so a layout never holds
//! overlapping definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CType;

/// Name prefix marking a field as an embedded base-class sub-object.
pub const SUPER_PREFIX: &str = "super_";

/// Errors raised by layout mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("field {name:?} has zero size")]
    ZeroSized { name: String },

    #[error("field {name:?} at offset {offset:#x} overflows the address space")]
    Overflow { name: String, offset: usize },
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Placeholder bytes with no known type.
    Undefined,
    /// Pointer to the class's virtual function table.
    VirtualPointer {
        /// Name of the vtable type, when one is known.
        table: Option<String>,
    },
    /// Pointer to the virtual-base displacement table.
    VirtualBasePointer,
    /// Embedded base-class sub-object.
    Base {
        /// Name of the base class layout.
        class: String,
    },
    /// Ordinary data member.
    Member {
        /// Member type.
        ty: CType,
    },
}

/// A field at a fixed offset within a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutField {
    /// Field name.
    pub name: String,
    /// Byte offset from the start of the layout.
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
    /// Field contents.
    pub kind: FieldKind,
}

impl LayoutField {
    pub fn new(name: impl Into<String>, offset: usize, size: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            kind,
        }
    }

    /// An untyped placeholder.
    pub fn undefined(offset: usize, size: usize) -> Self {
        Self::new(format!("field_0x{:x}", offset), offset, size, FieldKind::Undefined)
    }

    /// A virtual-pointer field.
    pub fn vptr(
        name: impl Into<String>,
        offset: usize,
        pointer_size: usize,
        table: Option<String>,
    ) -> Self {
        Self::new(name, offset, pointer_size, FieldKind::VirtualPointer { table })
    }

    /// A virtual-base-pointer field.
    pub fn vbptr(name: impl Into<String>, offset: usize, pointer_size: usize) -> Self {
        Self::new(name, offset, pointer_size, FieldKind::VirtualBasePointer)
    }

    /// An embedded base sub-object, named with [`SUPER_PREFIX`].
    pub fn base(class: &str, offset: usize, size: usize) -> Self {
        Self::base_as(class, class, offset, size)
    }

    /// An embedded base sub-object of `class` typed as `layout` (for example
    /// the base's non-virtual part).
    pub fn base_as(class: &str, layout: &str, offset: usize, size: usize) -> Self {
        Self::new(
            format!("{}{}", SUPER_PREFIX, sanitize(class)),
            offset,
            size,
            FieldKind::Base {
                class: layout.to_string(),
            },
        )
    }

    /// A typed data member. Named references default to one byte.
    pub fn member(name: impl Into<String>, offset: usize, ty: CType, pointer_size: usize) -> Self {
        let size = ty.size(pointer_size).unwrap_or(1).max(1);
        Self::new(name, offset, size, FieldKind::Member { ty })
    }

    /// One past the last byte of this field.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }

    /// Whether this field shares any byte with `[start, end)`.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.offset < end && start < self.end()
    }

    /// Whether this field is an inherited base sub-object.
    pub fn is_inherited(&self) -> bool {
        self.name.starts_with(SUPER_PREFIX)
    }

    /// Whether this field is an untyped placeholder.
    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, FieldKind::Undefined)
    }

    /// Renders the field's C type.
    pub fn c_type(&self) -> String {
        match &self.kind {
            FieldKind::Undefined => format!("unsigned char[{}]", self.size),
            FieldKind::VirtualPointer { table: Some(t) } => format!("{} *", t),
            FieldKind::VirtualPointer { table: None } => "void * *".to_string(),
            FieldKind::VirtualBasePointer => "int *".to_string(),
            FieldKind::Base { class } => class.clone(),
            FieldKind::Member { ty } => ty.to_c_string(None),
        }
    }
}

/// The memory layout of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Type name the layout is registered under.
    pub name: String,
    /// Fields sorted by offset, never overlapping.
    pub fields: Vec<LayoutField>,
    /// Total size in bytes.
    pub size: usize,
    /// Alignment requirement.
    pub alignment: usize,
}

impl Layout {
    pub fn new(name: impl Into<String>, size: usize, alignment: usize) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            size,
            alignment: alignment.max(1),
        }
    }

    /// Get the field containing the byte at `offset`.
    pub fn field_at(&self, offset: usize) -> Option<&LayoutField> {
        self.fields
            .iter()
            .find(|f| offset >= f.offset && offset < f.end())
    }

    /// Get field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&LayoutField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Replaces whatever occupies the new field's byte range with `field`.
    ///
    /// Returns the evicted fields. The layout grows if the field ends past
    /// its current size.
    pub fn replace_at_offset(&mut self, field: LayoutField) -> Result<Vec<LayoutField>, LayoutError> {
        if field.size == 0 {
            return Err(LayoutError::ZeroSized { name: field.name });
        }
        let end = field
            .offset
            .checked_add(field.size)
            .ok_or_else(|| LayoutError::Overflow {
                name: field.name.clone(),
                offset: field.offset,
            })?;

        let (evicted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fields)
            .into_iter()
            .partition(|f| f.overlaps(field.offset, end));
        self.fields = kept;

        let index = self.fields.partition_point(|f| f.offset < field.offset);
        self.fields.insert(index, field);
        self.size = self.size.max(end);
        Ok(evicted)
    }

    /// Grows the layout to at least `size` bytes.
    pub fn grow_to(&mut self, size: usize) {
        self.size = self.size.max(size);
    }

    /// Whether any two fields overlap.
    pub fn has_overlaps(&self) -> bool {
        self.fields
            .windows(2)
            .any(|pair| pair[0].end() > pair[1].offset)
    }

    /// Fields that are embedded base sub-objects.
    pub fn base_fields(&self) -> impl Iterator<Item = &LayoutField> {
        self.fields.iter().filter(|f| matches!(f.kind, FieldKind::Base { .. }))
    }

    /// Format as a C struct definition.
    pub fn to_c_string(&self) -> String {
        let mut result = format!("struct {} {{\n", self.name);
        for field in &self.fields {
            result.push_str(&format!(
                "    {} {}; // offset {:#x}\n",
                field.c_type(),
                field.name,
                field.offset
            ));
        }
        result.push_str(&format!("}}; // size: {} bytes", self.size));
        result
    }
}

/// Turns a qualified class name into an identifier fragment.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}
