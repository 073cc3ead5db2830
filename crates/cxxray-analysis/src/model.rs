//! The class arena.
//!
//! Every [`ClassType`] lives in a [`ClassModel`] keyed by [`ClassId`]; base
//! relations, offset tables and layouts refer to classes by id only. The
//! model doubles as the class-model store: it memoizes base-offset tables,
//! holds registered layouts and records attributed constructors and
//! destructors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use cxxray_types::{Layout, TypeDatabase};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Abi;
use crate::error::{ModelError, ModelResult};
use crate::host::{ClassModelStore, TypeDescriptorReader};
use crate::offsets::{BaseOffsetTable, OffsetResolver};
use crate::rtti::TypeDescriptor;
use crate::vtable::Vtable;

/// Stable identity of a class: its type descriptor address or archive id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a base class is inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inheritance {
    #[default]
    NonVirtual,
    Virtual,
}

/// One direct base of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSpec {
    /// The base class.
    pub class: ClassId,
    /// Virtual or non-virtual.
    #[serde(default)]
    pub inheritance: Inheritance,
    /// Public inheritance.
    #[serde(default = "default_public")]
    pub is_public: bool,
    /// Offset of a non-virtual base as recorded by the type descriptor.
    /// Overrides the computed placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

fn default_public() -> bool {
    true
}

impl BaseSpec {
    pub fn new(class: ClassId, inheritance: Inheritance) -> Self {
        Self {
            class,
            inheritance,
            is_public: true,
            offset: None,
        }
    }

    /// Pins a non-virtual base at `offset`.
    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_virtual(&self) -> bool {
        self.inheritance == Inheritance::Virtual
    }
}

/// A reconstructed class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassType {
    /// Identity.
    pub id: ClassId,
    /// Display name.
    pub name: String,
    /// Direct bases in declaration order.
    #[serde(default)]
    pub bases: Vec<BaseSpec>,
    /// The class's own primary vtable.
    #[serde(default)]
    pub vtable: Option<Vtable>,
    /// Bytes of the class's own data members.
    #[serde(default)]
    pub member_size: usize,
    /// Alignment of the class's own data members.
    #[serde(default = "default_align")]
    pub member_align: usize,
    /// Name of the raw type-descriptor data type.
    #[serde(default)]
    pub descriptor_type: Option<String>,
}

fn default_align() -> usize {
    1
}

impl ClassType {
    pub fn new(id: ClassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            bases: Vec::new(),
            vtable: None,
            member_size: 0,
            member_align: 1,
            descriptor_type: None,
        }
    }

    /// Adds a non-virtual base.
    pub fn with_base(mut self, class: ClassId) -> Self {
        self.bases.push(BaseSpec::new(class, Inheritance::NonVirtual));
        self
    }

    /// Adds a non-virtual base at a known offset.
    pub fn with_base_at(mut self, class: ClassId, offset: usize) -> Self {
        self.bases
            .push(BaseSpec::new(class, Inheritance::NonVirtual).at_offset(offset));
        self
    }

    /// Adds a virtual base.
    pub fn with_virtual_base(mut self, class: ClassId) -> Self {
        self.bases.push(BaseSpec::new(class, Inheritance::Virtual));
        self
    }

    /// Sets the class's own vtable.
    pub fn with_vtable(mut self, vtable: Vtable) -> Self {
        self.vtable = Some(vtable);
        self
    }

    /// Sets the size and alignment of the class's own data members.
    pub fn with_members(mut self, size: usize, align: usize) -> Self {
        self.member_size = size;
        self.member_align = align.max(1);
        self
    }

    /// Whether the class owns a valid vtable.
    pub fn is_polymorphic(&self) -> bool {
        self.vtable.as_ref().map_or(false, Vtable::is_valid)
    }

    /// The class's valid vtable, if any.
    pub fn valid_vtable(&self) -> Option<&Vtable> {
        self.vtable.as_ref().filter(|v| v.is_valid())
    }

    /// Whether any direct base is virtual.
    pub fn has_virtual_bases(&self) -> bool {
        self.bases.iter().any(BaseSpec::is_virtual)
    }

    /// Data type name of the class's type descriptor.
    pub fn descriptor_type_name(&self, abi: Abi) -> &str {
        self.descriptor_type
            .as_deref()
            .unwrap_or_else(|| abi.default_descriptor_type())
    }
}

/// Progress of constructor/destructor attribution for one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionState {
    #[default]
    NotAnalyzed,
    Analyzing,
    AttributedOk,
    Rejected,
}

/// A function committed as a class's constructor or destructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedFunction {
    pub function: u64,
    pub class: ClassId,
    pub is_destructor: bool,
}

/// Arena of classes plus the memoized data derived from them.
#[derive(Debug, Clone)]
pub struct ClassModel {
    abi: Abi,
    pointer_size: usize,
    classes: BTreeMap<ClassId, ClassType>,
    type_names: HashMap<ClassId, String>,
    by_name: HashMap<String, ClassId>,
    offsets: HashMap<ClassId, BaseOffsetTable>,
    types: TypeDatabase,
    attributed: BTreeMap<u64, AttributedFunction>,
    states: HashMap<ClassId, AttributionState>,
    /// Candidates already matched or rejected in an interrupted attribution.
    analyzed: HashMap<ClassId, BTreeSet<u64>>,
    interrupted: BTreeSet<ClassId>,
}

impl ClassModel {
    pub fn new(abi: Abi, pointer_size: usize) -> Self {
        Self {
            abi,
            pointer_size,
            classes: BTreeMap::new(),
            type_names: HashMap::new(),
            by_name: HashMap::new(),
            offsets: HashMap::new(),
            types: TypeDatabase::new(),
            attributed: BTreeMap::new(),
            states: HashMap::new(),
            analyzed: HashMap::new(),
            interrupted: BTreeSet::new(),
        }
    }

    /// Builds a model from parsed Itanium descriptors and detected vtables.
    ///
    /// A primary vtable is owned by the descriptor its typeinfo pointer names;
    /// when several primaries name the same descriptor the lowest address wins.
    pub fn from_descriptors(
        abi: Abi,
        pointer_size: usize,
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
        vtables: impl IntoIterator<Item = Vtable>,
    ) -> Self {
        let mut primaries: HashMap<u64, Vtable> = HashMap::new();
        for vtable in vtables.into_iter().filter(|v| v.is_primary) {
            let Some(typeinfo) = vtable.typeinfo_addr else {
                continue;
            };
            match primaries.get(&typeinfo) {
                Some(existing) if existing.address <= vtable.address => {}
                _ => {
                    primaries.insert(typeinfo, vtable);
                }
            }
        }

        let mut model = Self::new(abi, pointer_size);
        for descriptor in descriptors {
            let mut class = ClassType::new(ClassId(descriptor.address), descriptor.name.clone());
            class.descriptor_type = Some(descriptor.descriptor_type_name().to_string());
            for base in descriptor.bases() {
                let inheritance = if base.flags.is_virtual {
                    Inheritance::Virtual
                } else {
                    Inheritance::NonVirtual
                };
                // Virtual base offsets index the vtable, not the object
                let offset = match inheritance {
                    Inheritance::NonVirtual => usize::try_from(base.offset).ok(),
                    Inheritance::Virtual => None,
                };
                class.bases.push(BaseSpec {
                    class: ClassId(base.typeinfo_addr),
                    inheritance,
                    is_public: base.flags.is_public,
                    offset,
                });
            }
            class.vtable = primaries.remove(&descriptor.address);
            model.insert(class);
        }
        model
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Inserts or replaces a class, returning the previous definition.
    ///
    /// Replacing a class drops every memoized offset table, since any
    /// descendant's table may depend on it.
    pub fn insert(&mut self, mut class: ClassType) -> Option<ClassType> {
        if let Some(vtable) = class.vtable.as_mut() {
            vtable.owner = Some(class.id);
        }
        let id = class.id;
        let type_name = self.unique_type_name(id, &class.name);
        if let Some(old) = self.type_names.insert(id, type_name.clone()) {
            if old != type_name {
                self.by_name.remove(&old);
            }
        }
        self.by_name.insert(type_name, id);
        let previous = self.classes.insert(id, class);
        if previous.is_some() {
            self.offsets.clear();
        }
        previous
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassType> {
        self.classes.get(&id)
    }

    /// Looks a class up by type name.
    pub fn by_name(&self, name: &str) -> Option<&ClassType> {
        self.by_name.get(name).and_then(|id| self.classes.get(id))
    }

    /// Name the layouts of `id` are registered under. This is the display
    /// name, suffixed with the id when another class already holds it.
    pub fn type_name(&self, id: ClassId) -> Option<&str> {
        self.type_names.get(&id).map(String::as_str)
    }

    fn unique_type_name(&self, id: ClassId, name: &str) -> String {
        let taken = |candidate: &str| {
            self.by_name
                .get(candidate)
                .map_or(false, |&owner| owner != id)
        };
        if !taken(name) {
            return name.to_string();
        }
        let mut candidate = format!("{}_{:x}", name, id.0);
        while taken(&candidate) {
            candidate.push('_');
        }
        debug!(class = %id, name, type_name = %candidate, "disambiguated class name");
        candidate
    }

    /// Class ids in ascending order.
    pub fn ids(&self) -> Vec<ClassId> {
        self.classes.keys().copied().collect()
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassType> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// The class owning the vtable at `address`.
    pub fn class_for_vtable(&self, address: u64) -> Option<&ClassType> {
        self.classes
            .values()
            .find(|c| c.vtable.as_ref().map_or(false, |v| v.address == address))
    }

    /// Number of distinct direct parents of `id` known to the model.
    pub fn distinct_known_parents(&self, id: ClassId) -> usize {
        self.classes.get(&id).map_or(0, |class| {
            class
                .bases
                .iter()
                .map(|b| b.class)
                .filter(|b| self.classes.contains_key(b))
                .collect::<BTreeSet<_>>()
                .len()
        })
    }

    /// The memoized offset table of `id`, if it was resolved already.
    pub fn cached_offsets(&self, id: ClassId) -> Option<&BaseOffsetTable> {
        self.offsets.get(&id)
    }

    /// The registered layout of `id`.
    pub fn layout_of(&self, id: ClassId) -> Option<&Layout> {
        self.types.get_layout(self.type_name(id)?)
    }

    /// The type store holding registered layouts.
    pub fn types(&self) -> &TypeDatabase {
        &self.types
    }

    pub fn state(&self, id: ClassId) -> AttributionState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    pub fn set_state(&mut self, id: ClassId, state: AttributionState) {
        debug!(class = %id, ?state, "attribution state");
        self.states.insert(id, state);
    }

    /// Whether attribution of `id` has not run, or stopped before finishing.
    pub fn needs_attribution(&self, id: ClassId) -> bool {
        match self.state(id) {
            AttributionState::NotAnalyzed | AttributionState::Analyzing => true,
            AttributionState::AttributedOk => self.interrupted.contains(&id),
            AttributionState::Rejected => false,
        }
    }

    /// Whether attribution of `id` was cancelled after committing something.
    pub fn is_interrupted(&self, id: ClassId) -> bool {
        self.interrupted.contains(&id)
    }

    /// Marks attribution of `id` as stopped part way (or as finished).
    pub fn set_interrupted(&mut self, id: ClassId, interrupted: bool) {
        if interrupted {
            self.interrupted.insert(id);
        } else {
            self.interrupted.remove(&id);
            self.analyzed.remove(&id);
        }
    }

    /// Records that `function` was matched or rejected as a candidate of `id`.
    pub fn mark_analyzed(&mut self, id: ClassId, function: u64) {
        self.analyzed.entry(id).or_default().insert(function);
    }

    pub fn is_analyzed(&self, id: ClassId, function: u64) -> bool {
        self.analyzed
            .get(&id)
            .map_or(false, |functions| functions.contains(&function))
    }

    /// Every committed constructor/destructor, by function address.
    pub fn attributed_functions(&self) -> impl Iterator<Item = &AttributedFunction> {
        self.attributed.values()
    }

    /// The attribution committed for `function`.
    pub fn attributed(&self, function: u64) -> Option<&AttributedFunction> {
        self.attributed.get(&function)
    }
}

impl ClassModelStore for ClassModel {
    fn set_attributed_function(&mut self, class: ClassId, function: u64, is_destructor: bool) {
        let entry = AttributedFunction {
            function,
            class,
            is_destructor,
        };
        if let Some(previous) = self.attributed.insert(function, entry) {
            if previous.class != class || previous.is_destructor != is_destructor {
                warn!(
                    function = format_args!("{:#x}", function),
                    previous = %previous.class,
                    class = %class,
                    "function re-attributed"
                );
            }
        }
        let name = self.classes.get(&class).map_or("?", |c| c.name.as_str());
        let role = if is_destructor { "destructor" } else { "constructor" };
        info!(
            function = format_args!("{:#x}", function),
            class = name,
            role,
            "attributed function"
        );
    }

    fn base_offset_table(&mut self, class: ClassId) -> ModelResult<&BaseOffsetTable> {
        if !self.offsets.contains_key(&class) {
            OffsetResolver::new(&self.classes, self.abi, self.pointer_size)
                .resolve(class, &mut self.offsets)?;
        }
        self.offsets
            .get(&class)
            .ok_or(ModelError::UnknownClass(class))
    }

    fn register_layout(&mut self, class: ClassId, layout: Layout) {
        debug!(class = %class, name = %layout.name, size = layout.size, "registered layout");
        self.types.register_layout(layout);
    }
}

impl TypeDescriptorReader for ClassModel {
    fn is_type_descriptor_at(&self, address: u64) -> bool {
        self.classes.contains_key(&ClassId(address))
    }

    fn type_at(&self, address: u64) -> Option<&ClassType> {
        self.classes.get(&ClassId(address))
    }
}
