//! Virtual function table (vtable) detection and queries.
//!
//! Vtables are arrays of function pointers used for polymorphism:
//!
//! - Located in read-only data sections (.rodata, __const, .rdata)
//! - Contain consecutive valid function pointers
//! - Referenced by constructors and destructors (to set the vtable pointer)
//! - Carry an RTTI header before the first slot (Itanium C++ ABI):
//!   offset-to-top at -2*ptr, typeinfo pointer at -ptr
//!
//! # Example
//!
//! ```ignore
//! use cxxray_analysis::vtable::VtableDetector;
//!
//! let detector = VtableDetector::new(reader).with_known_functions(functions);
//! for vtable in detector.scan_section(&data, base_addr) {
//!     println!("Vtable at 0x{:x} with {} entries", vtable.address, vtable.entries.len());
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use cxxray_core::PointerReader;
use serde::{Deserialize, Serialize};

use crate::model::ClassId;

/// Information about a virtual function thunk.
///
/// Thunks are generated for multiple inheritance when a virtual call through
/// a secondary base pointer needs to adjust `this` before calling the actual
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThunkInfo {
    /// The `this` pointer adjustment (typically negative for secondary bases).
    pub this_adjustment: i64,
    /// The address of the actual implementation function.
    pub target_function: u64,
}

impl ThunkInfo {
    pub fn new(this_adjustment: i64, target_function: u64) -> Self {
        Self {
            this_adjustment,
            target_function,
        }
    }
}

/// A virtual function table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtableEntry {
    /// Offset within the vtable (in bytes).
    pub offset: usize,
    /// Target function address.
    pub target: u64,
    /// Demangled method name, if available.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether this is a pure virtual placeholder (e.g., __cxa_pure_virtual).
    #[serde(default)]
    pub is_pure_virtual: bool,
    /// Thunk information if this entry points to a thunk rather than direct impl.
    #[serde(default)]
    pub thunk: Option<ThunkInfo>,
}

impl VtableEntry {
    /// Creates a new vtable entry.
    pub fn new(offset: usize, target: u64) -> Self {
        Self {
            offset,
            target,
            name: None,
            is_pure_virtual: false,
            thunk: None,
        }
    }

    /// Sets the method name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks this entry as a pure virtual function.
    pub fn with_pure_virtual(mut self, is_pure: bool) -> Self {
        self.is_pure_virtual = is_pure;
        self
    }

    /// Sets thunk information for this entry.
    pub fn with_thunk(mut self, thunk: ThunkInfo) -> Self {
        self.thunk = Some(thunk);
        self
    }

    /// Returns the actual implementation address (resolving through thunk if present).
    pub fn resolved_target(&self) -> u64 {
        self.thunk
            .as_ref()
            .map(|t| t.target_function)
            .unwrap_or(self.target)
    }
}

/// A virtual function table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vtable {
    /// Address of the first function slot.
    pub address: u64,
    /// Class owning this table, once known.
    #[serde(default)]
    pub owner: Option<ClassId>,
    /// Address of the typeinfo structure (RTTI), if present.
    #[serde(default)]
    pub typeinfo_addr: Option<u64>,
    /// Offset-to-top value (0 for primary, negative for secondary vtables).
    #[serde(default)]
    pub offset_to_top: Option<i64>,
    /// Function pointer entries in the vtable.
    pub entries: Vec<VtableEntry>,
    /// Whether this appears to be a primary vtable (vs. secondary for MI).
    #[serde(default = "default_primary")]
    pub is_primary: bool,
    /// Confidence score (0.0 - 1.0) for this detection.
    #[serde(default)]
    pub confidence: f64,
}

fn default_primary() -> bool {
    true
}

impl Vtable {
    /// Creates a new vtable.
    pub fn new(address: u64) -> Self {
        Self {
            address,
            owner: None,
            typeinfo_addr: None,
            offset_to_top: None,
            entries: Vec::new(),
            is_primary: true,
            confidence: 0.0,
        }
    }

    /// Builds a table from consecutive slot targets.
    pub fn from_targets(
        address: u64,
        typeinfo_addr: u64,
        pointer_size: usize,
        targets: impl IntoIterator<Item = u64>,
    ) -> Self {
        let mut vtable = Self::new(address);
        vtable.typeinfo_addr = Some(typeinfo_addr);
        vtable.offset_to_top = Some(0);
        vtable.entries = targets
            .into_iter()
            .enumerate()
            .map(|(i, target)| VtableEntry::new(i * pointer_size, target))
            .collect();
        vtable
    }

    /// Returns the size of the function array in bytes.
    pub fn size(&self, pointer_size: usize) -> usize {
        self.entries.len() * pointer_size
    }

    /// Returns whether this vtable has RTTI information.
    pub fn has_rtti(&self) -> bool {
        self.typeinfo_addr.is_some()
    }

    /// Whether this is a real function-pointer array behind an
    /// RTTI-compatible header.
    pub fn is_valid(&self) -> bool {
        self.has_rtti() && self.entries.iter().any(|e| e.target != 0)
    }

    /// Whether a slot of this table declares or overrides `function`,
    /// directly or through a thunk.
    pub fn contains_function(&self, function: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.target == function || e.resolved_target() == function)
    }

    /// Addresses of the function slots.
    pub fn slot_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries
            .iter()
            .map(|e| self.address.wrapping_add(e.offset as u64))
    }

    /// The backing storage of the table: its RTTI header followed by the slots.
    pub fn table_addresses(&self, pointer_size: usize) -> Range<u64> {
        let header = match (self.offset_to_top, self.typeinfo_addr) {
            (Some(_), _) => 2 * pointer_size,
            (None, Some(_)) => pointer_size,
            (None, None) => 0,
        } as u64;
        let start = self.address.saturating_sub(header);
        let end = self.address.saturating_add(self.size(pointer_size) as u64);
        start..end
    }
}

/// Configuration for vtable detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VtableConfig {
    /// Minimum number of entries to consider a valid vtable.
    pub min_entries: usize,
    /// Maximum number of entries (to avoid false positives).
    pub max_entries: usize,
    /// Whether to require pointer alignment.
    pub require_alignment: bool,
    /// Whether to look for RTTI markers.
    pub detect_rtti: bool,
    /// Whether to allow gaps (null pointers) in vtables.
    pub allow_gaps: bool,
    /// Maximum gap size allowed (in entries).
    pub max_gap_size: usize,
    /// Minimum confidence threshold for reporting.
    pub min_confidence: f64,
}

impl Default for VtableConfig {
    fn default() -> Self {
        Self {
            min_entries: 1,
            max_entries: 1000,
            require_alignment: true,
            detect_rtti: true,
            allow_gaps: false,
            max_gap_size: 1,
            min_confidence: 0.3,
        }
    }
}

/// Virtual function table detector.
///
/// Scans read-only data sections for vtable candidates and validates them
/// against executable code regions.
pub struct VtableDetector {
    reader: PointerReader,
    config: VtableConfig,
    /// Known function addresses (for validation).
    known_functions: HashSet<u64>,
    /// Executable address ranges [(start, end), ...].
    executable_ranges: Vec<(u64, u64)>,
    /// Symbol lookup table (address -> name).
    symbols: HashMap<u64, String>,
    /// Pure virtual function addresses.
    pure_virtual_addrs: HashSet<u64>,
    /// Thunks by entry address.
    thunks: HashMap<u64, ThunkInfo>,
}

impl VtableDetector {
    /// Creates a new vtable detector.
    pub fn new(reader: PointerReader) -> Self {
        Self {
            reader,
            config: VtableConfig::default(),
            known_functions: HashSet::new(),
            executable_ranges: Vec::new(),
            symbols: HashMap::new(),
            pure_virtual_addrs: HashSet::new(),
            thunks: HashMap::new(),
        }
    }

    /// Sets the detection configuration.
    pub fn with_config(mut self, config: VtableConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds known function addresses for validation.
    pub fn with_known_functions(mut self, functions: impl IntoIterator<Item = u64>) -> Self {
        self.known_functions.extend(functions);
        self
    }

    /// Adds executable memory ranges.
    pub fn with_executable_ranges(mut self, ranges: impl IntoIterator<Item = (u64, u64)>) -> Self {
        self.executable_ranges.extend(ranges);
        self
    }

    /// Adds symbol lookup information.
    pub fn with_symbols(mut self, symbols: impl IntoIterator<Item = (u64, String)>) -> Self {
        self.symbols.extend(symbols);
        self
    }

    /// Adds pure virtual function addresses (like __cxa_pure_virtual).
    pub fn with_pure_virtual_addrs(mut self, addrs: impl IntoIterator<Item = u64>) -> Self {
        self.pure_virtual_addrs.extend(addrs);
        self
    }

    /// Adds known thunks, attached to the slots that point at them.
    pub fn with_thunks(mut self, thunks: impl IntoIterator<Item = (u64, ThunkInfo)>) -> Self {
        self.thunks.extend(thunks);
        self
    }

    /// Returns the pointer size.
    pub fn pointer_size(&self) -> usize {
        self.reader.pointer_size()
    }

    /// Checks if an address is within an executable region.
    fn is_executable(&self, addr: u64) -> bool {
        // Without explicit ranges, accept anything outside the null page
        if self.executable_ranges.is_empty() {
            return addr >= 0x1000;
        }

        self.executable_ranges
            .iter()
            .any(|(start, end)| addr >= *start && addr < *end)
    }

    /// Checks if an address looks like a valid function pointer.
    fn is_valid_function_pointer(&self, addr: u64) -> bool {
        self.known_functions.contains(&addr)
            || self.pure_virtual_addrs.contains(&addr)
            || self.is_executable(addr)
    }

    /// Scans a data section for vtable candidates.
    ///
    /// # Arguments
    /// * `data` - The section data bytes
    /// * `base_addr` - Virtual address of the start of the section
    pub fn scan_section(&self, data: &[u8], base_addr: u64) -> Vec<Vtable> {
        let ptr = self.pointer_size();
        let mut vtables = Vec::new();
        let mut i = 0;

        // Align to pointer boundary
        if self.config.require_alignment {
            let align_offset = (base_addr % ptr as u64) as usize;
            if align_offset != 0 {
                i = ptr - align_offset;
            }
        }

        while i + ptr <= data.len() {
            if let Some(vtable) = self.try_detect_vtable_at(data, base_addr, i) {
                if vtable.confidence >= self.config.min_confidence {
                    // Skip past this vtable
                    i += vtable.size(ptr).max(ptr);
                    vtables.push(vtable);
                    continue;
                }
            }
            i += ptr;
        }

        vtables
    }

    /// Tries to detect a vtable starting at a specific offset.
    fn try_detect_vtable_at(&self, data: &[u8], base_addr: u64, offset: usize) -> Option<Vtable> {
        let ptr = self.pointer_size();
        let vtable_addr = base_addr + offset as u64;
        let mut entries = Vec::new();
        let mut current_offset = offset;
        let mut gap_count = 0;

        let typeinfo_addr = if self.config.detect_rtti && offset >= ptr {
            self.reader
                .read_pointer(data, offset - ptr)
                .filter(|&p| p != 0 && !self.is_executable(p))
        } else {
            None
        };

        let offset_to_top = if offset >= 2 * ptr {
            self.reader.read_signed_pointer(data, offset - 2 * ptr)
        } else {
            None
        };

        while let Some(target) = self.reader.read_pointer(data, current_offset) {
            if target == 0 {
                if self.config.allow_gaps && gap_count < self.config.max_gap_size {
                    gap_count += 1;
                    entries.push(VtableEntry::new(current_offset - offset, target));
                    current_offset += ptr;
                    continue;
                }
                break;
            }
            if !self.is_valid_function_pointer(target) {
                break;
            }
            gap_count = 0;

            let mut entry = VtableEntry::new(current_offset - offset, target);
            if self.pure_virtual_addrs.contains(&target) {
                entry = entry.with_pure_virtual(true);
            }
            if let Some(name) = self.symbols.get(&target) {
                entry = entry.with_name(name.clone());
            }
            if let Some(thunk) = self.thunks.get(&target) {
                entry = entry.with_thunk(thunk.clone());
            }
            entries.push(entry);
            current_offset += ptr;

            if entries.len() >= self.config.max_entries {
                break;
            }
        }

        // Trailing gaps belong to whatever follows the table
        while entries.last().map_or(false, |e| e.target == 0) {
            entries.pop();
        }

        if entries.len() < self.config.min_entries.max(1) {
            return None;
        }

        let confidence = self.calculate_confidence(&entries, typeinfo_addr.is_some());

        let mut vtable = Vtable::new(vtable_addr);
        vtable.entries = entries;
        vtable.typeinfo_addr = typeinfo_addr;
        vtable.confidence = confidence;
        vtable.offset_to_top = offset_to_top;
        if let Some(ott) = offset_to_top {
            vtable.is_primary = ott == 0;
        }

        Some(vtable)
    }

    /// Calculates a confidence score for a vtable candidate.
    fn calculate_confidence(&self, entries: &[VtableEntry], has_rtti: bool) -> f64 {
        let mut score = 0.0;

        let entry_count = entries.len();
        if entry_count >= 2 {
            score += 0.2;
        }
        if entry_count >= 4 {
            score += 0.1;
        }
        if entry_count >= 8 {
            score += 0.1;
        }

        if has_rtti {
            score += 0.3;
        }

        let known_count = entries
            .iter()
            .filter(|e| self.known_functions.contains(&e.target))
            .count();
        if known_count > 0 {
            score += 0.2 * (known_count as f64 / entry_count as f64);
        }

        let named_count = entries.iter().filter(|e| e.name.is_some()).count();
        if named_count > 0 {
            score += 0.1 * (named_count as f64 / entry_count as f64);
        }

        // Abstract classes are less common
        let pure_count = entries.iter().filter(|e| e.is_pure_virtual).count();
        if pure_count == entry_count && entry_count > 0 {
            score -= 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    /// Detects vtables in the read-only data sections among `sections`.
    pub fn detect_in_sections<S: AsRef<[u8]>>(&self, sections: &[(String, u64, S)]) -> Vec<Vtable> {
        let rodata_names = [
            ".rodata",
            ".rdata",
            "__const",
            ".data.rel.ro",
        ];

        let mut vtables: Vec<Vtable> = sections
            .iter()
            .filter(|(name, _, _)| rodata_names.iter().any(|n| name.contains(n)))
            .flat_map(|(_, addr, data)| self.scan_section(data.as_ref(), *addr))
            .collect();
        vtables.sort_by_key(|v| v.address);
        vtables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxxray_core::Endianness;

    fn make_test_detector() -> VtableDetector {
        let reader = PointerReader::new(8, Endianness::Little).unwrap();
        VtableDetector::new(reader)
            .with_executable_ranges([(0x1000, 0x10000)])
            .with_config(VtableConfig {
                min_entries: 2,
                min_confidence: 0.0,
                ..Default::default()
            })
    }

    fn words(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_detect_simple_vtable() {
        let detector = make_test_detector();
        let data = words(&[0x2000, 0x3000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        assert_eq!(vtables.len(), 1);
        assert_eq!(vtables[0].address, 0x100000);
        assert_eq!(vtables[0].entries.len(), 2);
        assert_eq!(vtables[0].entries[1].target, 0x3000);
        assert!(!vtables[0].is_valid());
    }

    #[test]
    fn test_detect_vtable_with_rtti_header() {
        let detector = make_test_detector();
        // offset-to-top, typeinfo pointer (not executable), two slots
        let data = words(&[0, 0x200000, 0x2000, 0x3000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        let vtable = vtables
            .iter()
            .find(|v| v.address == 0x100010)
            .expect("table after header");
        assert_eq!(vtable.typeinfo_addr, Some(0x200000));
        assert_eq!(vtable.offset_to_top, Some(0));
        assert!(vtable.is_primary);
        assert!(vtable.is_valid());
        assert_eq!(vtable.table_addresses(8), 0x100000..0x100020);
    }

    #[test]
    fn test_vtable_with_known_functions() {
        let detector = make_test_detector().with_known_functions([0x2000, 0x3000, 0x4000]);
        let data = words(&[0x2000, 0x3000, 0x4000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        assert_eq!(vtables.len(), 1);
        assert_eq!(vtables[0].entries.len(), 3);
        assert!(vtables[0].confidence > 0.3);
    }

    #[test]
    fn test_vtable_with_symbols() {
        let detector = make_test_detector().with_symbols([
            (0x2000, "MyClass::method1".to_string()),
            (0x3000, "MyClass::method2".to_string()),
        ]);
        let data = words(&[0x2000, 0x3000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        assert_eq!(
            vtables[0].entries[0].name.as_deref(),
            Some("MyClass::method1")
        );
    }

    #[test]
    fn test_min_entries_filter() {
        let reader = PointerReader::new(8, Endianness::Little).unwrap();
        let detector = VtableDetector::new(reader)
            .with_executable_ranges([(0x1000, 0x10000)])
            .with_config(VtableConfig {
                min_entries: 3,
                min_confidence: 0.0,
                ..Default::default()
            });
        let data = words(&[0x2000, 0x3000, 0]);
        assert!(detector.scan_section(&data, 0x100000).is_empty());
    }

    #[test]
    fn test_multiple_vtables_in_section() {
        let detector = make_test_detector();
        let data = words(&[0x2000, 0x3000, 0, 0x4000, 0x5000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        assert_eq!(vtables.len(), 2);
        assert_eq!(vtables[1].address, 0x100018);
    }

    #[test]
    fn test_pure_virtual_detection() {
        let detector = make_test_detector().with_pure_virtual_addrs([0x9000]);
        let data = words(&[0x2000, 0x9000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        assert!(!vtables[0].entries[0].is_pure_virtual);
        assert!(vtables[0].entries[1].is_pure_virtual);
    }

    #[test]
    fn test_thunk_slots_resolve_to_target() {
        let detector = make_test_detector().with_thunks([(0x3000, ThunkInfo::new(-16, 0x2400))]);
        let data = words(&[0x2000, 0x3000, 0]);

        let vtables = detector.scan_section(&data, 0x100000);
        let vtable = &vtables[0];
        assert_eq!(vtable.entries[1].resolved_target(), 0x2400);
        assert!(vtable.contains_function(0x3000));
        assert!(vtable.contains_function(0x2400));
        assert!(!vtable.contains_function(0x5000));
    }

    #[test]
    fn test_from_targets() {
        let vtable = Vtable::from_targets(0x5010, 0x7000, 8, [0x1100, 0x1200]);
        assert_eq!(vtable.size(8), 16);
        let slots: Vec<_> = vtable.slot_addresses().collect();
        assert_eq!(slots, vec![0x5010, 0x5018]);
        assert_eq!(vtable.table_addresses(8), 0x5000..0x5020);
        assert!(vtable.is_valid());
    }

    #[test]
    fn test_detect_in_sections_filters_by_name() {
        let detector = make_test_detector();
        let sections = vec![
            (".rodata".to_string(), 0x100000u64, words(&[0x2000, 0x3000, 0])),
            (".text".to_string(), 0x200000u64, words(&[0x2000, 0x3000, 0])),
        ];
        let vtables = detector.detect_in_sections(&sections);
        assert_eq!(vtables.len(), 1);
        assert_eq!(vtables[0].address, 0x100000);
    }
}
