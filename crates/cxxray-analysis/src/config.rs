//! Analysis configuration.

use std::str::FromStr;

use cxxray_core::{Architecture, Endianness, PointerReader};
use cxxray_types::{CType, FunctionPrototype, TypedefType};
use serde::{Deserialize, Serialize};

use crate::vtable::VtableConfig;

/// The C++ ABI variant the binary was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Abi {
    /// Itanium C++ ABI (GCC, Clang).
    #[default]
    Itanium,
    /// Microsoft Visual C++.
    Msvc,
}

impl Abi {
    /// Name of the virtual-pointer field.
    pub fn vptr_name(self) -> &'static str {
        match self {
            Abi::Itanium => "_vptr",
            Abi::Msvc => "_vfptr",
        }
    }

    /// Name of the virtual-base-pointer field.
    pub fn vbptr_name(self) -> &'static str {
        "_vbptr"
    }

    /// Whether classes with virtual bases carry a virtual-base pointer.
    pub fn uses_vbptr(self) -> bool {
        matches!(self, Abi::Msvc)
    }

    /// Default name of the runtime dynamic-cast routine.
    pub fn dynamic_cast_entry(self) -> &'static str {
        match self {
            Abi::Itanium => "__dynamic_cast",
            Abi::Msvc => "__RTDynamicCast",
        }
    }

    /// Parameter indices of the source and destination type descriptors.
    pub fn type_parameter_indices(self) -> (usize, usize) {
        match self {
            Abi::Itanium => (1, 2),
            Abi::Msvc => (2, 3),
        }
    }

    /// The formal prototype of the dynamic-cast routine, under `name`.
    pub fn dynamic_cast_prototype(self, name: &str, pointer_size: usize) -> FunctionPrototype {
        match self {
            Abi::Itanium => {
                let type_info = CType::named("__class_type_info").pointer_to();
                FunctionPrototype::new(name, CType::void_ptr())
                    .param("src_ptr", CType::void_ptr())
                    .param("src_type", type_info.clone())
                    .param("dst_type", type_info)
                    .param("src2dst", CType::ptrdiff_t(pointer_size))
            }
            Abi::Msvc => FunctionPrototype::new(name, CType::void_ptr())
                .param("inptr", CType::void_ptr())
                .param("VfDelta", CType::Typedef(TypedefType::new("long", CType::int())))
                .param("SrcType", CType::void_ptr())
                .param("TargetType", CType::void_ptr())
                .param("isReference", CType::int()),
        }
    }

    /// Data type name of a type descriptor that carries no RTTI kind.
    pub fn default_descriptor_type(self) -> &'static str {
        match self {
            Abi::Itanium => "__class_type_info",
            Abi::Msvc => "TypeDescriptor",
        }
    }
}

impl FromStr for Abi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "itanium" | "gcc" | "clang" => Ok(Abi::Itanium),
            "msvc" | "microsoft" => Ok(Abi::Msvc),
            other => Err(format!("unknown ABI: {}", other)),
        }
    }
}

/// Constructor/destructor attribution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Require base calls to follow construction (or reverse) order.
    pub enforce_order: bool,
    /// Also record the analysed function as its own class's constructor/destructor.
    pub commit_candidate: bool,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            enforce_order: true,
            commit_candidate: true,
        }
    }
}

/// Dynamic-cast signature recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicCastConfig {
    /// Run the pass at all.
    pub enabled: bool,
    /// Override the entry point name (defaults per ABI).
    pub entry_point: Option<String>,
    /// Repeat an empty constant query after the call's delay slots.
    pub retry_after_delay_slot: bool,
}

impl Default for DynamicCastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_point: None,
            retry_after_delay_slot: true,
        }
    }
}

/// Top-level configuration for an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// C++ ABI variant.
    pub abi: Abi,
    /// Target architecture (register names, delay slots).
    pub arch: Architecture,
    /// Pointer size in bytes.
    pub pointer_size: usize,
    /// Byte order of raw section data.
    pub endianness: Endianness,
    /// Attribution settings.
    pub attribution: AttributionConfig,
    /// Dynamic-cast settings.
    pub dynamic_cast: DynamicCastConfig,
    /// Vtable detection thresholds.
    pub vtable: VtableConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::for_arch(Architecture::X86_64)
    }
}

impl AnalysisConfig {
    /// Defaults for `arch`, taking the pointer size from it.
    pub fn for_arch(arch: Architecture) -> Self {
        Self {
            abi: Abi::default(),
            arch,
            pointer_size: arch.pointer_size(),
            endianness: Endianness::default(),
            attribution: AttributionConfig::default(),
            dynamic_cast: DynamicCastConfig::default(),
            vtable: VtableConfig::default(),
        }
    }

    /// Sets the ABI.
    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    /// Sets the pointer size.
    pub fn with_pointer_size(mut self, pointer_size: usize) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    /// Sets the byte order.
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Sets the attribution settings.
    pub fn with_attribution(mut self, attribution: AttributionConfig) -> Self {
        self.attribution = attribution;
        self
    }

    /// Sets the dynamic-cast settings.
    pub fn with_dynamic_cast(mut self, dynamic_cast: DynamicCastConfig) -> Self {
        self.dynamic_cast = dynamic_cast;
        self
    }

    /// Sets the vtable detection thresholds.
    pub fn with_vtable(mut self, vtable: VtableConfig) -> Self {
        self.vtable = vtable;
        self
    }

    /// A pointer reader for this configuration, validating the pointer size.
    pub fn reader(&self) -> Result<PointerReader, cxxray_core::Error> {
        PointerReader::new(self.pointer_size, self.endianness)
    }

    /// The dynamic-cast entry point name in effect.
    pub fn dynamic_cast_entry(&self) -> &str {
        self.dynamic_cast
            .entry_point
            .as_deref()
            .unwrap_or_else(|| self.abi.dynamic_cast_entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itanium_dynamic_cast_prototype() {
        let proto = Abi::Itanium.dynamic_cast_prototype("__dynamic_cast", 8);
        assert_eq!(
            proto.to_c_string(),
            "void * __dynamic_cast(void * src_ptr, __class_type_info * src_type, \
             __class_type_info * dst_type, ptrdiff_t src2dst)"
        );
    }

    #[test]
    fn test_msvc_dynamic_cast_prototype() {
        let proto = Abi::Msvc.dynamic_cast_prototype("__RTDynamicCast", 8);
        assert_eq!(
            proto.to_c_string(),
            "void * __RTDynamicCast(void * inptr, long VfDelta, void * SrcType, \
             void * TargetType, int isReference)"
        );
        assert_eq!(Abi::Msvc.type_parameter_indices(), (2, 3));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"abi": "msvc", "pointer_size": 4}"#).unwrap();
        assert_eq!(config.abi, Abi::Msvc);
        assert_eq!(config.pointer_size, 4);
        assert!(config.attribution.enforce_order);
        assert_eq!(config.dynamic_cast_entry(), "__RTDynamicCast");
    }

    #[test]
    fn test_invalid_pointer_size() {
        let config = AnalysisConfig::default().with_pointer_size(3);
        assert!(config.reader().is_err());
    }

    #[test]
    fn test_abi_from_str() {
        assert_eq!("MSVC".parse::<Abi>(), Ok(Abi::Msvc));
        assert_eq!("itanium".parse::<Abi>(), Ok(Abi::Itanium));
        assert!("borland".parse::<Abi>().is_err());
    }
}
