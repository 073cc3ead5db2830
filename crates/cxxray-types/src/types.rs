//! C type representation.
//!
//! Just enough of the C type system to describe class layout members and the
//! pointer-typed parameters of synthesized call signatures.

use serde::{Deserialize, Serialize};

/// A C type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CType {
    /// void type
    Void,

    /// Integer type (char, short, int, long, etc.)
    Int(IntType),

    /// Pointer to another type
    Pointer(Box<CType>),

    /// Array of elements
    Array(ArrayType),

    /// Typedef (alias to another type)
    Typedef(TypedefType),

    /// Named reference to a type stored elsewhere (a class layout, an RTTI record)
    Named(String),
}

impl CType {
    /// Get the size of this type in bytes for the given pointer width.
    /// Returns None for incomplete types (void, unsized arrays, named references).
    pub fn size(&self, pointer_size: usize) -> Option<usize> {
        match self {
            CType::Void => None,
            CType::Int(i) => Some(i.size),
            CType::Pointer(_) => Some(pointer_size),
            CType::Array(a) => Some(a.element.size(pointer_size)? * a.length?),
            CType::Typedef(t) => t.target.size(pointer_size),
            CType::Named(_) => None,
        }
    }

    /// Get the alignment of this type in bytes.
    pub fn alignment(&self, pointer_size: usize) -> Option<usize> {
        match self {
            CType::Void => None,
            CType::Int(i) => Some(i.size.min(8)),
            CType::Pointer(_) => Some(pointer_size),
            CType::Array(a) => a.element.alignment(pointer_size),
            CType::Typedef(t) => t.target.alignment(pointer_size),
            CType::Named(_) => None,
        }
    }

    /// Creates a pointer to this type.
    pub fn pointer_to(self) -> Self {
        CType::Pointer(Box::new(self))
    }

    /// Creates a named type reference.
    pub fn named(name: impl Into<String>) -> Self {
        CType::Named(name.into())
    }

    /// Format this type as a C declaration.
    pub fn to_c_string(&self, name: Option<&str>) -> String {
        let suffix = name.map(|n| format!(" {}", n)).unwrap_or_default();
        match self {
            CType::Void => format!("void{}", suffix),
            CType::Int(i) => format!("{}{}", i.c_name(), suffix),
            CType::Pointer(inner) => match name {
                Some(n) => format!("{} * {}", inner.to_c_string(None), n),
                None => format!("{} *", inner.to_c_string(None)),
            },
            CType::Array(a) => {
                let elem_str = a.element.to_c_string(name);
                match a.length {
                    Some(len) => format!("{}[{}]", elem_str, len),
                    None => format!("{}[]", elem_str),
                }
            }
            CType::Typedef(t) => format!("{}{}", t.name, suffix),
            CType::Named(n) => format!("{}{}", n, suffix),
        }
    }
}

/// Integer type details.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntType {
    /// Size in bytes.
    pub size: usize,
    /// Whether the type is signed.
    pub signed: bool,
}

impl IntType {
    pub fn new(size: usize, signed: bool) -> Self {
        Self { size, signed }
    }

    fn c_name(&self) -> &'static str {
        match (self.signed, self.size) {
            (true, 1) => "char",
            (false, 1) => "unsigned char",
            (true, 2) => "short",
            (false, 2) => "unsigned short",
            (true, 4) => "int",
            (false, 4) => "unsigned int",
            (true, 8) => "long long",
            (false, 8) => "unsigned long long",
            _ => "int",
        }
    }
}

/// Array type details.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayType {
    /// Element type.
    pub element: Box<CType>,
    /// Array length (None for incomplete arrays).
    pub length: Option<usize>,
}

impl ArrayType {
    pub fn new(element: CType, length: Option<usize>) -> Self {
        Self {
            element: Box::new(element),
            length,
        }
    }
}

/// Typedef details.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedefType {
    /// Typedef name.
    pub name: String,
    /// Aliased type.
    pub target: Box<CType>,
}

impl TypedefType {
    pub fn new(name: impl Into<String>, target: CType) -> Self {
        Self {
            name: name.into(),
            target: Box::new(target),
        }
    }
}

/// A function prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPrototype {
    /// Function name.
    pub name: String,
    /// Return type.
    pub return_type: CType,
    /// Parameters (name may be empty).
    pub parameters: Vec<(String, CType)>,
    /// Whether variadic.
    pub variadic: bool,
}

impl FunctionPrototype {
    pub fn new(name: impl Into<String>, return_type: CType) -> Self {
        Self {
            name: name.into(),
            return_type,
            parameters: Vec::new(),
            variadic: false,
        }
    }

    pub fn param(mut self, name: impl Into<String>, param_type: CType) -> Self {
        self.parameters.push((name.into(), param_type));
        self
    }

    /// Convert to C declaration string.
    ///
    /// Pointer declarators are rendered as `T * name`, matching the way
    /// disassembler hosts print prototypes.
    pub fn to_c_string(&self) -> String {
        let ret = self.return_type.to_c_string(None);
        let params: Vec<_> = self
            .parameters
            .iter()
            .map(|(name, ty)| {
                if name.is_empty() {
                    ty.to_c_string(None)
                } else {
                    ty.to_c_string(Some(name))
                }
            })
            .map(|p| p.trim_end().to_string())
            .collect();
        let params_str = if params.is_empty() {
            "void".to_string()
        } else if self.variadic {
            format!("{}, ...", params.join(", "))
        } else {
            params.join(", ")
        };
        format!("{} {}({})", ret.trim_end(), self.name, params_str)
    }
}

// Common type constructors for convenience
impl CType {
    pub fn void() -> Self {
        CType::Void
    }
    pub fn int() -> Self {
        CType::Int(IntType::new(4, true))
    }
    pub fn uint() -> Self {
        CType::Int(IntType::new(4, false))
    }
    pub fn long(pointer_size: usize) -> Self {
        CType::Int(IntType::new(pointer_size, true))
    }
    pub fn ptrdiff_t(pointer_size: usize) -> Self {
        CType::Typedef(TypedefType::new("ptrdiff_t", Self::long(pointer_size)))
    }
    pub fn void_ptr() -> Self {
        CType::Void.pointer_to()
    }
}
