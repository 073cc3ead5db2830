//! C++ RTTI (Run-Time Type Information) parsing.
//!
//! This module parses Itanium C++ ABI type descriptors out of raw section
//! bytes. The ABI defines three typeinfo class types:
//!
//! 1. `__class_type_info` - Classes with no bases
//!    ```text
//!    +0: vtable pointer (points to __class_type_info vtable)
//!    +8: name pointer (null-terminated mangled name like "5Shape")
//!    ```
//!
//! 2. `__si_class_type_info` - Single inheritance (one non-virtual public base)
//!    ```text
//!    +0:  vtable pointer (points to __si_class_type_info vtable)
//!    +8:  name pointer
//!    +16: base type pointer (pointer to base class typeinfo)
//!    ```
//!
//! 3. `__vmi_class_type_info` - Virtual/multiple inheritance
//!    ```text
//!    +0:  vtable pointer (points to __vmi_class_type_info vtable)
//!    +8:  name pointer
//!    +16: flags (4 bytes)
//!    +20: base_count (4 bytes)
//!    +24: base_info[] (typeinfo pointer + offset_flags, pointer-sized each)
//!    ```
//!
//! MSVC descriptors are not parsed here; hosts that understand them insert
//! [`ClassType`](crate::model::ClassType)s into the model directly.

use std::collections::HashMap;

use cxxray_core::PointerReader;
use serde::{Deserialize, Serialize};

/// A parsed type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Address of the typeinfo structure.
    pub address: u64,
    /// Demangled class name.
    pub name: String,
    /// Raw mangled name (e.g., "5Shape" or "N9namespace5ClassE").
    pub mangled_name: String,
    /// Kind of type info (determines inheritance structure).
    pub kind: DescriptorKind,
    /// Address of the typeinfo's own vtable.
    pub vtable_addr: u64,
}

impl TypeDescriptor {
    /// The direct bases named by this descriptor, in declaration order.
    pub fn bases(&self) -> &[BaseClassInfo] {
        match &self.kind {
            DescriptorKind::SingleInheritance { base } => std::slice::from_ref(base),
            DescriptorKind::VirtualMultipleInheritance { bases, .. } => bases,
            DescriptorKind::NoBase | DescriptorKind::Unknown => &[],
        }
    }

    /// Name of the raw descriptor data type.
    pub fn descriptor_type_name(&self) -> &'static str {
        self.kind.descriptor_type_name()
    }
}

/// The kind of RTTI type info structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DescriptorKind {
    /// `__class_type_info` - Class with no bases.
    NoBase,

    /// `__si_class_type_info` - Single public non-virtual base at offset 0.
    SingleInheritance { base: BaseClassInfo },

    /// `__vmi_class_type_info` - Virtual/multiple inheritance.
    VirtualMultipleInheritance {
        /// Flags describing the inheritance.
        flags: VmiFlags,
        /// Base class information.
        bases: Vec<BaseClassInfo>,
    },

    /// Unknown typeinfo format.
    Unknown,
}

impl DescriptorKind {
    /// Name of the raw descriptor data type for this kind.
    pub fn descriptor_type_name(&self) -> &'static str {
        match self {
            DescriptorKind::NoBase | DescriptorKind::Unknown => "__class_type_info",
            DescriptorKind::SingleInheritance { .. } => "__si_class_type_info",
            DescriptorKind::VirtualMultipleInheritance { .. } => "__vmi_class_type_info",
        }
    }
}

/// Flags for `__vmi_class_type_info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmiFlags {
    /// Class has non-diamond repeated inheritance.
    pub non_diamond_repeat_mask: bool,
    /// Class is diamond-shaped (base repeated via virtual).
    pub diamond_shaped_mask: bool,
    /// Raw flags value.
    pub raw: u32,
}

impl VmiFlags {
    /// Non-diamond repeat inheritance flag.
    pub const NON_DIAMOND_REPEAT: u32 = 0x1;
    /// Diamond-shaped inheritance flag.
    pub const DIAMOND_SHAPED: u32 = 0x2;

    /// Parse flags from raw value.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            non_diamond_repeat_mask: (raw & Self::NON_DIAMOND_REPEAT) != 0,
            diamond_shaped_mask: (raw & Self::DIAMOND_SHAPED) != 0,
            raw,
        }
    }
}

/// Information about one base class of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseClassInfo {
    /// Address of base class typeinfo.
    pub typeinfo_addr: u64,
    /// Name of the base class (if resolved).
    pub type_name: Option<String>,
    /// Offset to base within derived class. For virtual bases this is the
    /// vtable offset of the virtual-base offset, not a position.
    pub offset: i64,
    /// Flags for this base class.
    pub flags: BaseClassFlags,
}

/// Flags for a base class in VMI inheritance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseClassFlags {
    /// Base class is virtual.
    pub is_virtual: bool,
    /// Base class is public.
    pub is_public: bool,
    /// Raw flags value.
    pub raw: u64,
}

impl BaseClassFlags {
    /// Virtual base class flag (low bit of offset_flags).
    pub const VIRTUAL: u64 = 0x1;
    /// Public base class flag.
    pub const PUBLIC: u64 = 0x2;
    /// Shift of the offset portion of offset_flags.
    pub const OFFSET_SHIFT: u32 = 8;

    /// Flags of a single-inheritance base.
    pub fn public() -> Self {
        Self {
            is_virtual: false,
            is_public: true,
            raw: Self::PUBLIC,
        }
    }

    /// Parse flags from raw offset_flags value.
    pub fn from_offset_flags(offset_flags: i64) -> (Self, i64) {
        let raw = offset_flags as u64;
        let flags = Self {
            is_virtual: (raw & Self::VIRTUAL) != 0,
            is_public: (raw & Self::PUBLIC) != 0,
            raw,
        };
        // Offset is stored in upper bits, signed
        let offset = offset_flags >> Self::OFFSET_SHIFT;
        (flags, offset)
    }
}

/// The kind of typeinfo vtable (identifies the RTTI class type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeInfoVtableKind {
    /// `__class_type_info` vtable.
    Class,
    /// `__si_class_type_info` vtable.
    SingleInheritance,
    /// `__vmi_class_type_info` vtable.
    VirtualMultipleInheritance,
}

/// RTTI parser for the Itanium C++ ABI.
pub struct RttiParser {
    reader: PointerReader,
    /// Known typeinfo vtable addresses (for identifying typeinfo kind).
    known_typeinfo_vtables: HashMap<u64, TypeInfoVtableKind>,
    /// Cache of parsed descriptors.
    cache: HashMap<u64, TypeDescriptor>,
}

impl RttiParser {
    /// Maximum base count accepted by the VMI heuristic.
    const MAX_HEURISTIC_BASES: u32 = 100;

    /// Creates a new RTTI parser.
    pub fn new(reader: PointerReader) -> Self {
        Self {
            reader,
            known_typeinfo_vtables: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Register known typeinfo vtable addresses.
    ///
    /// This helps identify the kind of typeinfo structure based on its vtable.
    pub fn with_typeinfo_vtables(
        mut self,
        vtables: impl IntoIterator<Item = (u64, TypeInfoVtableKind)>,
    ) -> Self {
        self.known_typeinfo_vtables.extend(vtables);
        self
    }

    fn ptr(&self) -> usize {
        self.reader.pointer_size()
    }

    /// Parses a typeinfo structure.
    ///
    /// # Arguments
    /// * `data` - The section data containing the typeinfo
    /// * `base_addr` - Virtual address of the section start
    /// * `typeinfo_addr` - Virtual address of the typeinfo structure
    pub fn parse_typeinfo(
        &mut self,
        data: &[u8],
        base_addr: u64,
        typeinfo_addr: u64,
    ) -> Option<TypeDescriptor> {
        self.parse_guarded(data, base_addr, typeinfo_addr, &mut Vec::new())
    }

    fn parse_guarded(
        &mut self,
        data: &[u8],
        base_addr: u64,
        typeinfo_addr: u64,
        in_progress: &mut Vec<u64>,
    ) -> Option<TypeDescriptor> {
        if let Some(cached) = self.cache.get(&typeinfo_addr) {
            return Some(cached.clone());
        }
        // A descriptor naming itself as a base would otherwise recurse forever.
        if in_progress.contains(&typeinfo_addr) {
            return None;
        }

        let offset = usize::try_from(typeinfo_addr.checked_sub(base_addr)?).ok()?;
        let vtable_addr = self.reader.read_pointer(data, offset)?;
        let name_ptr = self.reader.read_pointer(data, offset + self.ptr())?;
        let name_offset = usize::try_from(name_ptr.checked_sub(base_addr)?).ok()?;
        let mangled_name = self.reader.read_c_str(data, name_offset)?.to_string();
        let name = demangle_type_name(&mangled_name);

        in_progress.push(typeinfo_addr);
        let kind = self.determine_kind(data, base_addr, offset, vtable_addr, in_progress);
        in_progress.pop();

        let descriptor = TypeDescriptor {
            address: typeinfo_addr,
            name,
            mangled_name,
            kind,
            vtable_addr,
        };
        self.cache.insert(typeinfo_addr, descriptor.clone());
        Some(descriptor)
    }

    /// Determines the kind of typeinfo based on vtable or heuristics.
    fn determine_kind(
        &mut self,
        data: &[u8],
        base_addr: u64,
        offset: usize,
        vtable_addr: u64,
        in_progress: &mut Vec<u64>,
    ) -> DescriptorKind {
        if let Some(&kind) = self.known_typeinfo_vtables.get(&vtable_addr) {
            return match kind {
                TypeInfoVtableKind::Class => DescriptorKind::NoBase,
                TypeInfoVtableKind::SingleInheritance => {
                    self.parse_si(data, base_addr, offset, in_progress)
                }
                TypeInfoVtableKind::VirtualMultipleInheritance => {
                    self.parse_vmi(data, base_addr, offset, in_progress)
                }
            };
        }

        // Heuristic: a third pointer that looks like a typeinfo means SI,
        // a plausible flags/count pair means VMI.
        let third_offset = offset + 2 * self.ptr();

        if let Some(potential_base) = self.reader.read_pointer(data, third_offset) {
            if self.looks_like_typeinfo(data, base_addr, potential_base) {
                return self.parse_si(data, base_addr, offset, in_progress);
            }
        }

        if let (Some(flags), Some(base_count)) = (
            self.reader.read_u32(data, third_offset),
            self.reader.read_u32(data, third_offset + 4),
        ) {
            if base_count > 0 && base_count <= Self::MAX_HEURISTIC_BASES && flags <= 3 {
                return self.parse_vmi(data, base_addr, offset, in_progress);
            }
        }

        DescriptorKind::NoBase
    }

    /// Checks if an address looks like a typeinfo structure.
    fn looks_like_typeinfo(&self, data: &[u8], base_addr: u64, addr: u64) -> bool {
        let Some(offset) = addr
            .checked_sub(base_addr)
            .and_then(|o| usize::try_from(o).ok())
        else {
            return false;
        };

        match self.reader.read_pointer(data, offset) {
            Some(p) if p != 0 => {}
            _ => return false,
        }
        let name_ptr = match self.reader.read_pointer(data, offset + self.ptr()) {
            Some(p) if p != 0 => p,
            _ => return false,
        };

        // Name should start with a digit (length prefix) or 'N' (namespace)
        name_ptr
            .checked_sub(base_addr)
            .and_then(|o| usize::try_from(o).ok())
            .and_then(|o| data.get(o))
            .map_or(false, |&c| c.is_ascii_digit() || c == b'N')
    }

    /// Parses single-inheritance typeinfo.
    fn parse_si(
        &mut self,
        data: &[u8],
        base_addr: u64,
        offset: usize,
        in_progress: &mut Vec<u64>,
    ) -> DescriptorKind {
        let Some(typeinfo_addr) = self.reader.read_pointer(data, offset + 2 * self.ptr()) else {
            return DescriptorKind::Unknown;
        };
        let type_name = self
            .parse_guarded(data, base_addr, typeinfo_addr, in_progress)
            .map(|d| d.name);

        DescriptorKind::SingleInheritance {
            base: BaseClassInfo {
                typeinfo_addr,
                type_name,
                offset: 0,
                flags: BaseClassFlags::public(),
            },
        }
    }

    /// Parses virtual/multiple inheritance typeinfo.
    fn parse_vmi(
        &mut self,
        data: &[u8],
        base_addr: u64,
        offset: usize,
        in_progress: &mut Vec<u64>,
    ) -> DescriptorKind {
        let flags_offset = offset + 2 * self.ptr();
        let count_offset = flags_offset + 4;
        let bases_offset = count_offset + 4;

        let (Some(raw_flags), Some(base_count)) = (
            self.reader.read_u32(data, flags_offset),
            self.reader.read_u32(data, count_offset),
        ) else {
            return DescriptorKind::Unknown;
        };

        let flags = VmiFlags::from_raw(raw_flags);
        let mut bases = Vec::new();
        let entry_size = 2 * self.ptr();

        for i in 0..base_count as usize {
            let entry_offset = bases_offset + i * entry_size;
            let Some(typeinfo_addr) = self.reader.read_pointer(data, entry_offset) else {
                break;
            };
            let Some(offset_flags) = self
                .reader
                .read_signed_pointer(data, entry_offset + self.ptr())
            else {
                break;
            };
            let (base_flags, offset) = BaseClassFlags::from_offset_flags(offset_flags);
            let type_name = self
                .parse_guarded(data, base_addr, typeinfo_addr, in_progress)
                .map(|d| d.name);

            bases.push(BaseClassInfo {
                typeinfo_addr,
                type_name,
                offset,
                flags: base_flags,
            });
        }

        if bases.len() != base_count as usize {
            return DescriptorKind::Unknown;
        }

        DescriptorKind::VirtualMultipleInheritance { flags, bases }
    }
}

/// Demangles a type name from Itanium encoding.
///
/// Format: `<length><name>` for simple names, `N...E` for nested names, each
/// optionally followed by `I...E` template arguments. An optional `_ZTS`
/// prefix is accepted. Names that do not parse are returned unchanged.
pub fn demangle_type_name(mangled: &str) -> String {
    let body = mangled.strip_prefix("_ZTS").unwrap_or(mangled);
    match parse_name(body) {
        Some((name, _)) => name,
        None => mangled.to_string(),
    }
}

/// Parses a `<nested-name>` or an `<unqualified-name>`, with template args.
fn parse_name(input: &str) -> Option<(String, &str)> {
    let Some(mut rest) = input.strip_prefix('N') else {
        let (component, rest) = parse_name_component(input)?;
        return with_template_args(component.to_string(), rest);
    };
    let mut components = Vec::new();
    while !rest.is_empty() && !rest.starts_with('E') {
        let Some((component, tail)) = parse_name_component(rest)
            .and_then(|(component, tail)| with_template_args(component.to_string(), tail))
        else {
            break;
        };
        components.push(component);
        rest = tail;
    }
    if components.is_empty() {
        return None;
    }
    let rest = rest.strip_prefix('E').unwrap_or(rest);
    Some((components.join("::"), rest))
}

fn with_template_args(name: String, input: &str) -> Option<(String, &str)> {
    let Some(mut rest) = input.strip_prefix('I') else {
        return Some((name, input));
    };
    let mut args = Vec::new();
    loop {
        if let Some(tail) = rest.strip_prefix('E') {
            rest = tail;
            break;
        }
        let (arg, tail) = parse_type(rest)?;
        args.push(arg);
        rest = tail;
    }
    Some((format!("{}<{}>", name, args.join(", ")), rest))
}

/// Parses one template argument type.
fn parse_type(input: &str) -> Option<(String, &str)> {
    let mut chars = input.chars();
    let code = chars.next()?;
    let rest = chars.as_str();
    if let Some(builtin) = builtin_type(code) {
        return Some((builtin.to_string(), rest));
    }
    match code {
        'P' => parse_type(rest).map(|(ty, tail)| (format!("{}*", ty), tail)),
        'R' => parse_type(rest).map(|(ty, tail)| (format!("{}&", ty), tail)),
        'K' => parse_type(rest).map(|(ty, tail)| (format!("const {}", ty), tail)),
        // Integer literal: L <type> [n] <digits> E
        'L' => {
            let (_, tail) = parse_type(rest)?;
            let end = tail.find('E')?;
            let value = match tail[..end].strip_prefix('n') {
                Some(digits) => format!("-{}", digits),
                None => tail[..end].to_string(),
            };
            Some((value, &tail[end + 1..]))
        }
        _ if code == 'N' || code.is_ascii_digit() => parse_name(input),
        _ => None,
    }
}

fn builtin_type(code: char) -> Option<&'static str> {
    Some(match code {
        'v' => "void",
        'b' => "bool",
        'c' => "char",
        'a' => "signed char",
        'h' => "unsigned char",
        's' => "short",
        't' => "unsigned short",
        'i' => "int",
        'j' => "unsigned int",
        'l' => "long",
        'm' => "unsigned long",
        'x' => "long long",
        'y' => "unsigned long long",
        'w' => "wchar_t",
        'f' => "float",
        'd' => "double",
        'e' => "long double",
        _ => return None,
    })
}

/// Parses a single name component (length + chars).
fn parse_name_component(input: &str) -> Option<(&str, &str)> {
    let digits = input.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let length: usize = input[..digits].parse().ok()?;
    let tail = &input[digits..];
    let name = tail.get(..length)?;
    Some((name, &tail[length..]))
}
