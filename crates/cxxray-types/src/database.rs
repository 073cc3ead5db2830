//! Type database for storing and looking up synthesized types.
//!
//! The TypeDatabase is the type-storage backend for reconstructed classes:
//! class layouts are registered here under their type name, and a complete
//! database can be saved as JSON next to the analysis report.

use crate::layout::Layout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A database of class layouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDatabase {
    /// Class layouts by type name.
    layouts: BTreeMap<String, Layout>,
}

impl TypeDatabase {
    /// Create a new empty type database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `layout` as the official layout for its name, returning the
    /// layout it replaced.
    pub fn register_layout(&mut self, layout: Layout) -> Option<Layout> {
        self.layouts.insert(layout.name.clone(), layout)
    }

    /// Get a layout by type name.
    pub fn get_layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.get(name)
    }

    /// Whether a layout is registered under `name`.
    pub fn has_layout(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    /// All layouts, ordered by name.
    pub fn layouts(&self) -> impl Iterator<Item = &Layout> {
        self.layouts.values()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Format a registered layout as a C struct definition.
    pub fn format_layout(&self, name: &str) -> Option<String> {
        self.get_layout(name).map(Layout::to_c_string)
    }

    /// Save database to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load database from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutField;

    fn shape() -> Layout {
        let mut layout = Layout::new("Shape", 8, 8);
        layout
            .replace_at_offset(LayoutField::vptr("_vptr", 0, 8, None))
            .unwrap();
        layout
    }

    #[test]
    fn test_register_replaces_previous() {
        let mut db = TypeDatabase::new();
        assert!(db.register_layout(shape()).is_none());
        let previous = db.register_layout(shape());
        assert_eq!(previous, Some(shape()));
        assert_eq!(db.len(), 1);
        assert!(db.has_layout("Shape"));
    }

    #[test]
    fn test_format_layout() {
        let mut db = TypeDatabase::new();
        db.register_layout(shape());
        let text = db.format_layout("Shape").unwrap();
        assert!(text.contains("void * * _vptr; // offset 0x0"));
        assert!(db.format_layout("Missing").is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let mut db = TypeDatabase::new();
        db.register_layout(shape());
        let json = db.to_json().unwrap();
        let loaded = TypeDatabase::from_json(&json).unwrap();
        assert_eq!(loaded, db);
    }
}
