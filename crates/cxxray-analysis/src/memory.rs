//! In-memory collaborators.
//!
//! A [`ProgramSnapshot`] is a JSON-serializable dump of everything the
//! analyses ask a host for: functions, references, decompiled call
//! sequences, constant register values, raw data sections and explicitly
//! described classes. [`InMemoryProgram`] answers the host queries from a
//! snapshot, and [`InMemorySignatureSink`] collects call-site overrides.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use cxxray_core::Register;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error::{AnalysisResult, HostError};
use crate::host::{
    CallSiteOverride, DataflowResolver, DecompilerReader, FunctionInfo, HighFunction,
    ProgramDatabase, Reference, SignatureSink,
};
use crate::model::{ClassModel, ClassType};
use crate::rtti::{RttiParser, TypeDescriptor, TypeInfoVtableKind};
use crate::vtable::{ThunkInfo, VtableDetector};

/// Largest address span flattened into one image for descriptor parsing.
const MAX_IMAGE_SPAN: u64 = 256 * 1024 * 1024;

/// Runtime handlers filling the slots of pure virtual functions.
const PURE_VIRTUAL_NAMES: [&str; 2] = ["__cxa_pure_virtual", "_purecall"];

/// Raw bytes of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionData {
    pub name: String,
    pub address: u64,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl SectionData {
    pub fn new(name: impl Into<String>, address: u64, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            address,
            bytes,
        }
    }

    fn end(&self) -> u64 {
        self.address.saturating_add(self.bytes.len() as u64)
    }
}

/// A constant proven to sit in a register before an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConstant {
    pub address: u64,
    pub register: String,
    pub value: u64,
}

/// The instruction following a branch's delay slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelaySlot {
    pub address: u64,
    pub next: u64,
}

/// Address of a typeinfo class's vtable, as stored in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfoVtable {
    pub address: u64,
    pub kind: TypeInfoVtableKind,
}

/// Everything the analyses need from a host, in one serializable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramSnapshot {
    /// Configuration recorded with the snapshot.
    pub config: Option<AnalysisConfig>,
    pub functions: Vec<FunctionInfo>,
    pub references: Vec<Reference>,
    pub high_functions: Vec<HighFunction>,
    pub register_constants: Vec<RegisterConstant>,
    pub delay_slots: Vec<DelaySlot>,
    /// Functions the decompiler fails on.
    pub decompile_failures: Vec<u64>,
    /// Raw data sections scanned for vtables and RTTI.
    pub sections: Vec<SectionData>,
    pub typeinfo_vtables: Vec<TypeInfoVtable>,
    /// Classes described directly, replacing any discovered ones.
    pub classes: Vec<ClassType>,
}

impl ProgramSnapshot {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Host collaborators backed by plain maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgram {
    functions: BTreeMap<u64, FunctionInfo>,
    references: HashMap<u64, Vec<Reference>>,
    high_functions: HashMap<u64, HighFunction>,
    constants: HashMap<(u64, String), u64>,
    delay_slots: HashMap<u64, u64>,
    decompile_failures: HashSet<u64>,
    sections: Vec<SectionData>,
    typeinfo_vtables: Vec<TypeInfoVtable>,
    classes: Vec<ClassType>,
}

impl InMemoryProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot. Its `config` is left to the caller.
    pub fn from_snapshot(snapshot: ProgramSnapshot) -> Self {
        let mut program = Self {
            sections: snapshot.sections,
            typeinfo_vtables: snapshot.typeinfo_vtables,
            classes: snapshot.classes,
            decompile_failures: snapshot.decompile_failures.into_iter().collect(),
            ..Self::default()
        };
        for function in snapshot.functions {
            program = program.with_function(function);
        }
        for reference in snapshot.references {
            program = program.with_reference(reference);
        }
        for high in snapshot.high_functions {
            program = program.with_high_function(high);
        }
        for constant in snapshot.register_constants {
            program = program.with_constant(constant.address, &constant.register, constant.value);
        }
        for slot in snapshot.delay_slots {
            program = program.with_delay_slot(slot.address, slot.next);
        }
        program
    }

    pub fn with_function(mut self, function: FunctionInfo) -> Self {
        self.functions.insert(function.entry, function);
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.entry(reference.to).or_default().push(reference);
        self
    }

    pub fn with_high_function(mut self, high: HighFunction) -> Self {
        self.high_functions.insert(high.entry, high);
        self
    }

    /// Records that `register` holds `value` just before `address`.
    pub fn with_constant(mut self, address: u64, register: &str, value: u64) -> Self {
        self.constants
            .insert((address, register.to_ascii_lowercase()), value);
        self
    }

    pub fn with_delay_slot(mut self, address: u64, next: u64) -> Self {
        self.delay_slots.insert(address, next);
        self
    }

    /// Makes the decompiler fail on `entry`.
    pub fn with_decompile_failure(mut self, entry: u64) -> Self {
        self.decompile_failures.insert(entry);
        self
    }

    pub fn with_section(mut self, section: SectionData) -> Self {
        self.sections.push(section);
        self
    }

    pub fn with_typeinfo_vtable(mut self, address: u64, kind: TypeInfoVtableKind) -> Self {
        self.typeinfo_vtables.push(TypeInfoVtable { address, kind });
        self
    }

    pub fn with_class(mut self, class: ClassType) -> Self {
        self.classes.push(class);
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values()
    }

    /// Builds the class model: vtables detected in the sections, the
    /// descriptors they point at (and those descriptors' bases), then the
    /// explicitly described classes on top.
    pub fn discover_classes(&self, config: &AnalysisConfig) -> AnalysisResult<ClassModel> {
        let reader = config.reader()?;
        let thunks = self
            .functions
            .values()
            .filter_map(|f| f.thunk_target.map(|t| (f.entry, ThunkInfo::new(0, t))));
        let detector = VtableDetector::new(reader)
            .with_config(config.vtable.clone())
            .with_known_functions(self.functions.keys().copied())
            .with_executable_ranges(
                self.functions
                    .values()
                    .map(|f| (f.entry, f.entry.saturating_add(f.size.max(1)))),
            )
            .with_symbols(self.functions.values().map(|f| (f.entry, f.name.clone())))
            .with_pure_virtual_addrs(
                self.functions
                    .values()
                    .filter(|f| PURE_VIRTUAL_NAMES.contains(&f.name.as_str()))
                    .map(|f| f.entry),
            )
            .with_thunks(thunks);

        let sections: Vec<_> = self
            .sections
            .iter()
            .map(|s| (s.name.clone(), s.address, s.bytes.as_slice()))
            .collect();
        let vtables = detector.detect_in_sections(&sections);

        let mut parser = RttiParser::new(reader)
            .with_typeinfo_vtables(self.typeinfo_vtables.iter().map(|t| (t.address, t.kind)));
        let roots: BTreeSet<u64> = vtables.iter().filter_map(|v| v.typeinfo_addr).collect();
        let descriptors = self.parse_descriptors(&mut parser, roots);
        debug!(
            vtables = vtables.len(),
            descriptors = descriptors.len(),
            "scanned sections"
        );

        let mut model =
            ClassModel::from_descriptors(config.abi, config.pointer_size, descriptors, vtables);
        for class in &self.classes {
            model.insert(class.clone());
        }
        info!(classes = model.len(), "class model ready");
        Ok(model)
    }

    fn parse_descriptors(
        &self,
        parser: &mut RttiParser,
        roots: BTreeSet<u64>,
    ) -> Vec<TypeDescriptor> {
        let image = self.image();
        let mut pending: Vec<u64> = roots.into_iter().rev().collect();
        let mut seen = HashSet::new();
        let mut descriptors = Vec::new();
        while let Some(address) = pending.pop() {
            if !seen.insert(address) {
                continue;
            }
            let parsed = match &image {
                Some((base, bytes)) => parser.parse_typeinfo(bytes, *base, address),
                None => self
                    .sections
                    .iter()
                    .find(|s| address >= s.address && address < s.end())
                    .and_then(|s| parser.parse_typeinfo(&s.bytes, s.address, address)),
            };
            let Some(descriptor) = parsed else {
                debug!(address = format_args!("{:#x}", address), "unreadable type descriptor");
                continue;
            };
            pending.extend(descriptor.bases().iter().map(|b| b.typeinfo_addr));
            descriptors.push(descriptor);
        }
        descriptors.sort_by_key(|d| d.address);
        descriptors
    }

    /// All sections laid into one zero-filled buffer, so descriptors can
    /// point at names in other sections.
    fn image(&self) -> Option<(u64, Vec<u8>)> {
        let start = self.sections.iter().map(|s| s.address).min()?;
        let end = self.sections.iter().map(SectionData::end).max()?;
        if end - start > MAX_IMAGE_SPAN {
            warn!(
                span = end - start,
                "sections too far apart to flatten, parsing descriptors per section"
            );
            return None;
        }
        let mut bytes = vec![0u8; usize::try_from(end - start).ok()?];
        for section in &self.sections {
            let offset = usize::try_from(section.address - start).ok()?;
            bytes[offset..offset + section.bytes.len()].copy_from_slice(&section.bytes);
        }
        Some((start, bytes))
    }
}

impl ProgramDatabase for InMemoryProgram {
    fn function_at(&self, address: u64) -> Option<FunctionInfo> {
        self.functions.get(&address).cloned()
    }

    fn function_containing(&self, address: u64) -> Option<FunctionInfo> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(address))
            .cloned()
    }

    fn functions_named(&self, name: &str) -> Vec<FunctionInfo> {
        self.functions
            .values()
            .filter(|f| f.name == name)
            .cloned()
            .collect()
    }

    fn references_to(&self, address: u64) -> Vec<Reference> {
        self.references.get(&address).cloned().unwrap_or_default()
    }

    fn instruction_after_delay_slots(&self, address: u64) -> Option<u64> {
        self.delay_slots.get(&address).copied()
    }
}

impl DecompilerReader for InMemoryProgram {
    fn high_function(&self, entry: u64) -> Result<HighFunction, HostError> {
        if self.decompile_failures.contains(&entry) {
            return Err(HostError::Decompile {
                function: entry,
                reason: "decompiler reported a failure".to_string(),
            });
        }
        self.high_functions
            .get(&entry)
            .cloned()
            .ok_or_else(|| HostError::Decompile {
                function: entry,
                reason: "no decompiled body".to_string(),
            })
    }
}

impl DataflowResolver for InMemoryProgram {
    fn constant_in_register_at(
        &self,
        address: u64,
        register: &Register,
    ) -> Result<Option<u64>, HostError> {
        Ok(self
            .constants
            .get(&(address, register.name().to_string()))
            .copied())
    }
}

/// Collects overrides by call site.
#[derive(Debug, Clone, Default)]
pub struct InMemorySignatureSink {
    overrides: BTreeMap<u64, CallSiteOverride>,
    failures: HashSet<u64>,
}

impl InMemorySignatureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes applying an override at `call_site` fail.
    pub fn with_failure(mut self, call_site: u64) -> Self {
        self.failures.insert(call_site);
        self
    }

    pub fn get(&self, call_site: u64) -> Option<&CallSiteOverride> {
        self.overrides.get(&call_site)
    }

    pub fn overrides(&self) -> impl Iterator<Item = &CallSiteOverride> {
        self.overrides.values()
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

impl SignatureSink for InMemorySignatureSink {
    fn has_override(&self, call_site: u64) -> bool {
        self.overrides.contains_key(&call_site)
    }

    fn apply_override(&mut self, override_: CallSiteOverride) -> Result<(), HostError> {
        let address = override_.call_site;
        if self.failures.contains(&address) {
            return Err(HostError::Signature {
                address,
                reason: "signature store rejected the override".to_string(),
            });
        }
        if self.overrides.contains_key(&address) {
            return Err(HostError::Signature {
                address,
                reason: "call site already carries an override".to_string(),
            });
        }
        self.overrides.insert(address, override_);
        Ok(())
    }
}
