//! # cxxray-analysis
//!
//! Reconstruction of C++ class models from compiled binaries.
//!
//! This crate provides:
//! - Itanium RTTI type descriptor parsing
//! - Virtual function table detection and membership queries
//! - A class arena with memoized base-offset tables
//! - Base-offset resolution for single, multiple and virtual inheritance
//! - Class memory layout synthesis
//! - Constructor/destructor call attribution
//! - Call-site signature recovery for the runtime dynamic-cast routine
//!
//! The host disassembler, decompiler and dataflow engine are consumed through
//! the traits in [`host`]; [`memory`] provides in-memory implementations fed
//! from a JSON program snapshot.
//!
//! # Example
//!
//! ```ignore
//! use cxxray_analysis::{AnalysisConfig, AnalysisSession, CancellationToken, ProgramSnapshot};
//!
//! let snapshot = ProgramSnapshot::from_json(&text)?;
//! let mut session = AnalysisSession::from_snapshot(snapshot, AnalysisConfig::default())?;
//! let report = session.run(&CancellationToken::new())?;
//! println!("{} classes laid out", report.classes_laid_out);
//! ```

pub mod attribution;
pub mod cancel;
pub mod config;
pub mod dynamic_cast;
pub mod error;
pub mod host;
pub mod layout;
pub mod memory;
pub mod model;
pub mod offsets;
pub mod rtti;
pub mod session;
pub mod vtable;

pub use attribution::{
    AttributedCall, Attribution, Attributor, CandidateFunction, ClassAttribution, FunctionRole,
};
pub use cancel::CancellationToken;
pub use config::{Abi, AnalysisConfig, AttributionConfig, DynamicCastConfig};
pub use dynamic_cast::{DynamicCastReport, DynamicCastResolver, OVERRIDE_CATEGORY, OVERRIDE_PREFIX};
pub use error::{AnalysisError, AnalysisResult, HostError, ModelError, ModelResult, Rejection};
pub use host::{
    CallSite, CallSiteOverride, ClassModelStore, DataflowResolver, DecompilerReader,
    FunctionInfo, HighFunction, ParameterStorage, ProgramDatabase, Reference, ReferenceKind,
    SignatureSink, ThisArgument, TypeDescriptorReader, VarId,
};
pub use layout::{non_virtual_name, LayoutBuilder};
pub use memory::{
    DelaySlot, InMemoryProgram, InMemorySignatureSink, ProgramSnapshot, RegisterConstant,
    SectionData, TypeInfoVtable,
};
pub use model::{
    AttributedFunction, AttributionState, BaseSpec, ClassId, ClassModel, ClassType, Inheritance,
};
pub use offsets::{BaseOffsetTable, BaseSubobject, OffsetResolver};
pub use rtti::{
    BaseClassFlags, BaseClassInfo, DescriptorKind, RttiParser, TypeDescriptor, TypeInfoVtableKind,
    VmiFlags,
};
pub use session::{AnalysisReport, AnalysisSession};
pub use vtable::{ThunkInfo, Vtable, VtableConfig, VtableDetector, VtableEntry};
