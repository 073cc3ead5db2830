//! Call-site signature recovery for the runtime dynamic-cast routine.
//!
//! Every direct call to the dynamic-cast entry point passes the source and
//! destination type descriptors as constants. Once dataflow proves which
//! descriptors they are, the call site gets its own prototype: the object
//! pointer typed as the source class, the descriptor parameters typed as the
//! raw descriptor records and the result typed as the destination class.
//! The entry point's own prototype is never touched.

use cxxray_core::Register;
use cxxray_types::{CType, FunctionPrototype};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult, HostError};
use crate::host::{
    CallSiteOverride, DataflowResolver, FunctionInfo, ParameterStorage, ProgramDatabase,
    SignatureSink, TypeDescriptorReader,
};
use crate::model::ClassType;

/// Name prefix of generated overrides.
pub const OVERRIDE_PREFIX: &str = "prt";

/// Category generated overrides are filed under.
pub const OVERRIDE_CATEGORY: &str = "/auto_proto";

/// Outcome of one dynamic-cast pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DynamicCastReport {
    /// The entry point, when one was found.
    pub entry_point: Option<u64>,
    /// Overrides applied.
    pub overridden: Vec<CallSiteOverride>,
    /// Call sites whose type arguments did not resolve to known classes.
    pub unresolved: Vec<u64>,
    /// Call sites where a collaborator failed.
    pub failed: Vec<(u64, HostError)>,
    /// Call sites left alone: already overridden, or not a direct call.
    pub skipped: Vec<u64>,
    /// The pass stopped early.
    pub cancelled: bool,
}

/// Resolves dynamic-cast call sites and emits per-call-site prototypes.
pub struct DynamicCastResolver<'a, P: ?Sized, F: ?Sized, T: ?Sized> {
    program: &'a P,
    dataflow: &'a F,
    types: &'a T,
    config: &'a AnalysisConfig,
}

impl<'a, P, F, T> DynamicCastResolver<'a, P, F, T>
where
    P: ProgramDatabase + ?Sized,
    F: DataflowResolver + ?Sized,
    T: TypeDescriptorReader + ?Sized,
{
    pub fn new(program: &'a P, dataflow: &'a F, types: &'a T, config: &'a AnalysisConfig) -> Self {
        Self {
            program,
            dataflow,
            types,
            config,
        }
    }

    /// Runs the pass over every call to the entry point.
    ///
    /// A missing entry point yields an empty report. A duplicated entry
    /// point, a prototype that does not match the ABI, or type parameters
    /// passed outside registers abort the run.
    pub fn run<S: SignatureSink + ?Sized>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> AnalysisResult<DynamicCastReport> {
        let mut report = DynamicCastReport::default();
        let name = self.config.dynamic_cast_entry();
        let mut entries = self.program.functions_named(name);
        if entries.len() > 1 {
            return Err(AnalysisError::AmbiguousEntryPoint {
                name: name.to_string(),
                count: entries.len(),
            });
        }
        let Some(entry) = entries.pop() else {
            info!(entry_point = name, "runtime entry point not found");
            return Ok(report);
        };
        report.entry_point = Some(entry.entry);

        let formal = self.verify_prototype(&entry)?;
        let (src_index, dst_index) = self.config.abi.type_parameter_indices();
        let src_register = self.register_parameter(&entry, src_index)?;
        let dst_register = self.register_parameter(&entry, dst_index)?;

        let mut references = self.program.references_to(entry.entry);
        references.sort_by_key(|r| r.from);
        for reference in references {
            if reference.kind.is_data() {
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let call_site = reference.from;
            if !reference.kind.is_direct_call() || sink.has_override(call_site) {
                report.skipped.push(call_site);
                continue;
            }

            let resolved = self
                .class_in_register(call_site, &src_register)
                .and_then(|src| Ok((src, self.class_in_register(call_site, &dst_register)?)));
            let (src, dst) = match resolved {
                Ok((Some(src), Some(dst))) => (src, dst),
                Ok(_) => {
                    debug!(call_site = format_args!("{:#x}", call_site), "type arguments unresolved");
                    report.unresolved.push(call_site);
                    continue;
                }
                Err(err) => {
                    warn!(call_site = format_args!("{:#x}", call_site), error = %err, "dataflow query failed");
                    report.failed.push((call_site, err));
                    continue;
                }
            };

            let override_ = CallSiteOverride {
                call_site,
                name: format!("{}{:x}", OVERRIDE_PREFIX, call_site),
                category: OVERRIDE_CATEGORY.to_string(),
                prototype: self.call_site_prototype(&formal, src, dst),
            };
            match sink.apply_override(override_.clone()) {
                Ok(()) => {
                    info!(
                        call_site = format_args!("{:#x}", call_site),
                        src = %src.name,
                        dst = %dst.name,
                        "applied dynamic-cast override"
                    );
                    report.overridden.push(override_);
                }
                Err(err) => {
                    warn!(call_site = format_args!("{:#x}", call_site), error = %err, "override not applied");
                    report.failed.push((call_site, err));
                }
            }
        }
        Ok(report)
    }

    /// Checks the entry point's prototype text against the ABI form.
    fn verify_prototype(&self, entry: &FunctionInfo) -> AnalysisResult<FunctionPrototype> {
        let formal = self
            .config
            .abi
            .dynamic_cast_prototype(&entry.name, self.config.pointer_size);
        let expected = formal.to_c_string();
        let found = entry.prototype.as_deref().unwrap_or("");
        if normalize(found) != normalize(&expected) {
            error!(
                entry_point = format_args!("{:#x}", entry.entry),
                expected = %expected,
                found,
                "runtime entry point does not match the ABI"
            );
            return Err(AnalysisError::AbiMismatch {
                entry_point: entry.name.clone(),
                expected,
                found: found.to_string(),
            });
        }
        Ok(formal)
    }

    fn register_parameter(&self, entry: &FunctionInfo, index: usize) -> AnalysisResult<Register> {
        match entry.parameters.get(index) {
            Some(ParameterStorage::Register(name)) => Ok(Register::parse(self.config.arch, name)?),
            _ => Err(AnalysisError::UnsupportedParameterStorage {
                entry_point: entry.name.clone(),
                index,
            }),
        }
    }

    /// The class whose descriptor `register` holds at `call_site`, retrying
    /// past the call's delay slots when the first answer is not a descriptor.
    fn class_in_register(
        &self,
        call_site: u64,
        register: &Register,
    ) -> Result<Option<&'a ClassType>, HostError> {
        if let Some(class) = self.class_at(call_site, register)? {
            return Ok(Some(class));
        }
        if !self.config.dynamic_cast.retry_after_delay_slot {
            return Ok(None);
        }
        match self.program.instruction_after_delay_slots(call_site) {
            Some(next) if next != call_site => self.class_at(next, register),
            _ => Ok(None),
        }
    }

    fn class_at(&self, address: u64, register: &Register) -> Result<Option<&'a ClassType>, HostError> {
        let types: &'a T = self.types;
        Ok(self
            .dataflow
            .constant_in_register_at(address, register)?
            .filter(|&value| types.is_type_descriptor_at(value))
            .and_then(|value| types.type_at(value)))
    }

    fn call_site_prototype(
        &self,
        formal: &FunctionPrototype,
        src: &ClassType,
        dst: &ClassType,
    ) -> FunctionPrototype {
        let abi = self.config.abi;
        let (src_index, dst_index) = abi.type_parameter_indices();
        let mut prototype = formal.clone();
        let replacements = [
            (0, CType::named(src.name.clone())),
            (src_index, CType::named(src.descriptor_type_name(abi))),
            (dst_index, CType::named(dst.descriptor_type_name(abi))),
        ];
        for (index, ty) in replacements {
            if let Some(parameter) = prototype.parameters.get_mut(index) {
                *parameter = (String::new(), ty.pointer_to());
            }
        }
        prototype.return_type = CType::named(dst.name.clone()).pointer_to();
        prototype
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
