//! Collaborator interfaces.
//!
//! The analyses never disassemble or decompile anything themselves. They
//! consume a program database, a decompiler and a dataflow engine through the
//! traits below, and write results back through [`ClassModelStore`] and
//! [`SignatureSink`].

use cxxray_core::Register;
use cxxray_types::{FunctionPrototype, Layout};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, ModelResult};
use crate::model::{ClassId, ClassType};
use crate::offsets::BaseOffsetTable;

/// Where a formal parameter is passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStorage {
    /// In the named register.
    Register(String),
    /// On the stack at the given offset.
    Stack(i64),
}

/// A function known to the program database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    /// Entry address.
    pub entry: u64,
    /// Symbol name.
    pub name: String,
    /// Body length in bytes.
    #[serde(default)]
    pub size: u64,
    /// The function a thunk forwards to.
    #[serde(default)]
    pub thunk_target: Option<u64>,
    /// The function has a user-assigned signature that must not be touched.
    #[serde(default)]
    pub user_defined: bool,
    /// Formal prototype, as C text.
    #[serde(default)]
    pub prototype: Option<String>,
    /// Storage of each formal parameter, in order.
    #[serde(default)]
    pub parameters: Vec<ParameterStorage>,
}

impl FunctionInfo {
    pub fn new(entry: u64, name: impl Into<String>) -> Self {
        Self {
            entry,
            name: name.into(),
            size: 0,
            thunk_target: None,
            user_defined: false,
            prototype: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_thunk_target(mut self, target: u64) -> Self {
        self.thunk_target = Some(target);
        self
    }

    pub fn with_user_defined(mut self, user_defined: bool) -> Self {
        self.user_defined = user_defined;
        self
    }

    /// Sets the formal prototype text and parameter storage.
    pub fn with_prototype(
        mut self,
        prototype: impl Into<String>,
        parameters: Vec<ParameterStorage>,
    ) -> Self {
        self.prototype = Some(prototype.into());
        self.parameters = parameters;
        self
    }

    pub fn is_thunk(&self) -> bool {
        self.thunk_target.is_some()
    }

    /// Whether `address` lies inside the body. A zero-sized function covers
    /// only its entry.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.entry && address - self.entry < self.size.max(1)
    }
}

/// Kind of a reference between two addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Data,
    Read,
    Write,
    Call,
    ComputedCall,
    IndirectCall,
}

impl ReferenceKind {
    /// Data-flavoured references: plain data, reads and writes.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Data | Self::Read | Self::Write)
    }

    /// Only an unconditional direct call qualifies.
    pub fn is_direct_call(self) -> bool {
        self == Self::Call
    }
}

/// A reference from one address to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub from: u64,
    pub to: u64,
    pub kind: ReferenceKind,
}

/// A variable in decompiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

/// The first argument passed at a call site, as a (variable, offset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThisArgument {
    /// The variable the pointer derives from, if it derives from one.
    #[serde(default)]
    pub variable: Option<VarId>,
    /// Constant added to the variable.
    #[serde(default)]
    pub offset: i64,
    /// A further field offset when the argument is the address of a field.
    #[serde(default)]
    pub field_offset: Option<i64>,
}

impl ThisArgument {
    pub fn new(variable: VarId, offset: i64) -> Self {
        Self {
            variable: Some(variable),
            offset,
            field_offset: None,
        }
    }

    /// The byte offset relative to the variable.
    pub fn total_offset(&self) -> Option<i64> {
        self.offset.checked_add(self.field_offset.unwrap_or(0))
    }
}

/// A call inside decompiled code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Address of the call instruction.
    pub address: u64,
    /// Direct callee; `None` for indirect calls.
    #[serde(default)]
    pub target: Option<u64>,
    /// First argument.
    #[serde(default)]
    pub this_arg: Option<ThisArgument>,
}

/// Decompiled form of one function, reduced to what attribution needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighFunction {
    pub entry: u64,
    /// The variable holding the incoming `this`.
    #[serde(default)]
    pub this_param: Option<VarId>,
    /// Calls in program order.
    #[serde(default)]
    pub calls: Vec<CallSite>,
}

/// A call-site prototype override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSiteOverride {
    /// The call instruction it applies to.
    pub call_site: u64,
    /// Override name.
    pub name: String,
    /// Category the override is filed under.
    pub category: String,
    /// The replacement prototype.
    pub prototype: FunctionPrototype,
}

/// Read access to functions and references.
pub trait ProgramDatabase {
    /// The function whose entry is `address`.
    fn function_at(&self, address: u64) -> Option<FunctionInfo>;

    /// The function whose body contains `address`.
    fn function_containing(&self, address: u64) -> Option<FunctionInfo>;

    /// Every function named `name`.
    fn functions_named(&self, name: &str) -> Vec<FunctionInfo>;

    /// All references whose target is `address`.
    fn references_to(&self, address: u64) -> Vec<Reference>;

    /// The first instruction after the delay slots of the instruction at
    /// `address`. Returns `None` on architectures without delay slots.
    fn instruction_after_delay_slots(&self, address: u64) -> Option<u64>;
}

/// Produces decompiled functions.
pub trait DecompilerReader {
    fn high_function(&self, entry: u64) -> Result<HighFunction, HostError>;
}

/// Answers constant-propagation queries.
pub trait DataflowResolver {
    /// The constant held by `register` just before the instruction at
    /// `address` executes, if dataflow proves one.
    fn constant_in_register_at(
        &self,
        address: u64,
        register: &Register,
    ) -> Result<Option<u64>, HostError>;
}

/// Maps addresses to class type descriptors.
pub trait TypeDescriptorReader {
    fn is_type_descriptor_at(&self, address: u64) -> bool;

    /// The class whose type descriptor is at `address`.
    fn type_at(&self, address: u64) -> Option<&ClassType>;
}

/// Write access to reconstructed class data.
pub trait ClassModelStore {
    /// Records `function` as a constructor or destructor of `class`.
    fn set_attributed_function(&mut self, class: ClassId, function: u64, is_destructor: bool);

    /// The memoized base-offset table of `class`, resolved on first use.
    fn base_offset_table(&mut self, class: ClassId) -> ModelResult<&BaseOffsetTable>;

    /// Stores a layout, replacing any layout of the same name.
    fn register_layout(&mut self, class: ClassId, layout: Layout);
}

/// Applies call-site prototype overrides.
pub trait SignatureSink {
    /// Whether the call site already carries an override.
    fn has_override(&self, call_site: u64) -> bool;

    /// Applies an override. Either the whole override is applied or nothing is.
    fn apply_override(&mut self, override_: CallSiteOverride) -> Result<(), HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_kinds() {
        assert!(ReferenceKind::Data.is_data());
        assert!(ReferenceKind::Read.is_data());
        assert!(!ReferenceKind::Call.is_data());
        assert!(ReferenceKind::Call.is_direct_call());
        assert!(!ReferenceKind::ComputedCall.is_direct_call());
        assert!(!ReferenceKind::IndirectCall.is_direct_call());
    }

    #[test]
    fn test_this_argument_offset() {
        let arg = ThisArgument {
            variable: Some(VarId(1)),
            offset: 0x10,
            field_offset: Some(8),
        };
        assert_eq!(arg.total_offset(), Some(0x18));
        assert_eq!(ThisArgument::new(VarId(1), 4).total_offset(), Some(4));
    }

    #[test]
    fn test_function_info_from_json() {
        let f: FunctionInfo =
            serde_json::from_str(r#"{"entry": 4096, "name": "f", "thunk_target": 8192}"#).unwrap();
        assert!(f.is_thunk());
        assert!(!f.user_defined);
        assert!(f.parameters.is_empty());

        let f = FunctionInfo::new(0x1000, "g").with_size(0x10);
        assert!(f.contains(0x100f));
        assert!(!f.contains(0x1010));
        assert!(FunctionInfo::new(0x2000, "h").contains(0x2000));
    }
}
