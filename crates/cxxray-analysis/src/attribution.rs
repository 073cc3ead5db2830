//! Constructor and destructor call attribution.
//!
//! A constructor of a class with N direct bases calls the N base
//! constructors first, each on `this` plus the base's offset. A destructor
//! calls the N base destructors last, in reverse construction order, just
//! before a final trailing call. Matching those windows against the
//! [`BaseOffsetTable`] tells which function constructs or destroys which base.
//!
//! A candidate is either fully attributed or rejected. Nothing is written to
//! the class-model store for a rejected candidate.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::AttributionConfig;
use crate::error::{AnalysisResult, HostError, Rejection};
use crate::host::{ClassModelStore, DecompilerReader, FunctionInfo, ProgramDatabase};
use crate::model::{AttributionState, ClassId, ClassModel, ClassType};
use crate::offsets::BaseOffsetTable;

/// Whether a candidate builds or tears down its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionRole {
    Constructor,
    Destructor,
}

impl FunctionRole {
    pub fn is_destructor(self) -> bool {
        self == FunctionRole::Destructor
    }
}

/// A function that may construct or destroy a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandidateFunction {
    pub function: u64,
    pub role: FunctionRole,
}

/// One base call matched to a direct base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttributedCall {
    /// Address of the call instruction.
    pub call_site: u64,
    /// The matched direct base.
    pub base: ClassId,
    /// The base's offset in the analysed class.
    pub offset: usize,
    /// The callee, with thunks resolved.
    pub function: u64,
}

/// A fully matched candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribution {
    pub class: ClassId,
    pub function: u64,
    pub role: FunctionRole,
    /// Matched calls in program order.
    pub calls: Vec<AttributedCall>,
}

/// Outcome of attributing every candidate of one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAttribution {
    pub class: ClassId,
    pub state: AttributionState,
    pub attributions: Vec<Attribution>,
    /// Rejected candidates, by function address.
    pub rejections: Vec<(u64, Rejection)>,
    /// Set when the class was not analysed at all.
    pub skipped: Option<Rejection>,
}

impl ClassAttribution {
    fn new(class: ClassId) -> Self {
        Self {
            class,
            state: AttributionState::NotAnalyzed,
            attributions: Vec::new(),
            rejections: Vec::new(),
            skipped: None,
        }
    }
}

/// Matches candidate functions against base-offset tables.
pub struct Attributor<'a, P: ?Sized, D: ?Sized> {
    program: &'a P,
    decompiler: &'a D,
    config: &'a AttributionConfig,
    pointer_size: usize,
}

impl<'a, P, D> Attributor<'a, P, D>
where
    P: ProgramDatabase + ?Sized,
    D: DecompilerReader + ?Sized,
{
    pub fn new(
        program: &'a P,
        decompiler: &'a D,
        config: &'a AttributionConfig,
        pointer_size: usize,
    ) -> Self {
        Self {
            program,
            decompiler,
            config,
            pointer_size,
        }
    }

    /// Checks that `class` can be analysed at all.
    pub fn check_preconditions(&self, model: &ClassModel, class: ClassId) -> Result<(), Rejection> {
        let ty = model.get(class).ok_or_else(|| Rejection::Structural {
            message: format!("class {} is not in the model", class),
        })?;
        if ty.bases.is_empty() {
            return Err(Rejection::NoBases);
        }
        if ty.valid_vtable().is_none() {
            return Err(Rejection::NoVtable);
        }
        let parents = model.distinct_known_parents(class);
        if ty.bases.len() > parents {
            return Err(Rejection::AmbiguousParents {
                bases: ty.bases.len(),
                parents,
            });
        }
        Ok(())
    }

    /// Functions referencing the class's vtable storage, thunks resolved.
    ///
    /// Functions with a user-defined signature are left alone. A function
    /// that a vtable slot declares is a destructor candidate, any other
    /// referencing function a constructor candidate.
    pub fn discover_candidates(&self, class: &ClassType) -> Vec<CandidateFunction> {
        let Some(vtable) = class.valid_vtable() else {
            return Vec::new();
        };

        let mut found = BTreeMap::new();
        let step = self.pointer_size.max(1);
        for address in vtable.table_addresses(self.pointer_size).step_by(step) {
            for reference in self.program.references_to(address) {
                if !reference.kind.is_data() {
                    continue;
                }
                let Some(function) = self
                    .program
                    .function_containing(reference.from)
                    .and_then(|f| self.follow_thunks(f))
                else {
                    continue;
                };
                if function.user_defined {
                    continue;
                }
                let role = if vtable.contains_function(function.entry) {
                    FunctionRole::Destructor
                } else {
                    FunctionRole::Constructor
                };
                found.entry(function.entry).or_insert(CandidateFunction {
                    function: function.entry,
                    role,
                });
            }
        }
        found.into_values().collect()
    }

    /// Matches one candidate against `table`.
    pub fn attribute_function(
        &self,
        class: ClassId,
        table: &BaseOffsetTable,
        candidate: &CandidateFunction,
    ) -> Result<Attribution, Rejection> {
        let info = self
            .program
            .function_at(candidate.function)
            .ok_or(HostError::NoFunction(candidate.function))?;
        if info.is_thunk() {
            return Err(Rejection::Thunk {
                function: info.entry,
            });
        }

        let high = self.decompiler.high_function(info.entry)?;
        let this = high.this_param.ok_or(Rejection::NoThisParameter {
            function: info.entry,
        })?;

        let expected = table.direct().count();
        let len = high.calls.len();
        let window = match candidate.role {
            FunctionRole::Constructor => high.calls.get(..expected),
            FunctionRole::Destructor => len
                .checked_sub(expected + 1)
                .and_then(|start| high.calls.get(start..len - 1)),
        };
        let window = match window {
            Some(window) if window.len() == expected => window,
            _ => {
                let found = match candidate.role {
                    FunctionRole::Constructor => len.min(expected),
                    FunctionRole::Destructor => len.saturating_sub(1).min(expected),
                };
                return Err(Rejection::CallWindow { expected, found });
            }
        };

        let mut seen = HashSet::new();
        let mut calls = Vec::with_capacity(expected);
        for call in window {
            let target = call.target.ok_or(Rejection::IndirectCall { call: call.address })?;
            let argument = call
                .this_arg
                .ok_or(Rejection::MissingThisArgument { call: call.address })?;
            if argument.variable != Some(this) {
                return Err(Rejection::ForeignThisArgument { call: call.address });
            }
            let offset = argument.total_offset().unwrap_or(i64::MIN);
            let base = usize::try_from(offset)
                .ok()
                .and_then(|o| table.direct_base_at(o))
                .ok_or(Rejection::OffsetNotInTable {
                    call: call.address,
                    offset,
                })?;
            if !seen.insert(base.class) {
                return Err(Rejection::DuplicateBase {
                    call: call.address,
                    base: base.class,
                });
            }
            calls.push(AttributedCall {
                call_site: call.address,
                base: base.class,
                offset: base.offset,
                function: self.resolve_thunk(target),
            });
        }

        if self.config.enforce_order {
            check_order(table, candidate.role, &calls)?;
        }

        Ok(Attribution {
            class,
            function: info.entry,
            role: candidate.role,
            calls,
        })
    }

    /// Writes a successful attribution to `store`.
    pub fn commit<S: ClassModelStore + ?Sized>(&self, store: &mut S, attribution: &Attribution) {
        let is_destructor = attribution.role.is_destructor();
        for call in &attribution.calls {
            store.set_attributed_function(call.base, call.function, is_destructor);
        }
        if self.config.commit_candidate {
            store.set_attributed_function(attribution.class, attribution.function, is_destructor);
        }
    }

    /// Attributes every candidate of `class`, committing each success.
    ///
    /// Cancellation is checked before each candidate. A cancelled class goes
    /// back to `NotAnalyzed` unless a candidate was already committed; then
    /// it stays `AttributedOk` but is marked interrupted, and the next call
    /// picks up the candidates not yet matched or rejected.
    pub fn attribute_class(
        &self,
        model: &mut ClassModel,
        class: ClassId,
        cancel: &CancellationToken,
    ) -> AnalysisResult<ClassAttribution> {
        let mut outcome = ClassAttribution::new(class);
        if let Err(rejection) = self.check_preconditions(model, class) {
            debug!(class = %class, %rejection, "class not analysed");
            outcome.skipped = Some(rejection);
            return Ok(outcome);
        }

        let table = match model.base_offset_table(class) {
            Ok(table) => table.clone(),
            Err(err) => {
                warn!(class = %class, error = %err, "skipping class");
                model.set_state(class, AttributionState::Rejected);
                outcome.state = AttributionState::Rejected;
                outcome.skipped = Some(err.into());
                return Ok(outcome);
            }
        };
        let candidates = model
            .get(class)
            .map(|ty| self.discover_candidates(ty))
            .unwrap_or_default();

        let resumed = model.is_interrupted(class);
        model.set_state(class, AttributionState::Analyzing);
        for candidate in candidates {
            if let Err(err) = cancel.check() {
                let committed = resumed || !outcome.attributions.is_empty();
                let state = if committed {
                    AttributionState::AttributedOk
                } else {
                    AttributionState::NotAnalyzed
                };
                model.set_state(class, state);
                model.set_interrupted(class, committed);
                return Err(err);
            }
            if resumed && model.is_analyzed(class, candidate.function) {
                continue;
            }
            model.mark_analyzed(class, candidate.function);
            match self.attribute_function(class, &table, &candidate) {
                Ok(attribution) => {
                    self.commit(model, &attribution);
                    outcome.attributions.push(attribution);
                }
                Err(rejection) => {
                    debug!(
                        class = %class,
                        function = format_args!("{:#x}", candidate.function),
                        %rejection,
                        "candidate rejected"
                    );
                    outcome.rejections.push((candidate.function, rejection));
                }
            }
        }

        outcome.state = if resumed || !outcome.attributions.is_empty() {
            AttributionState::AttributedOk
        } else {
            AttributionState::Rejected
        };
        model.set_interrupted(class, false);
        model.set_state(class, outcome.state);
        Ok(outcome)
    }

    /// Follows a chain of thunks to the function it ends in. `None` when a
    /// link is missing or the chain loops.
    fn follow_thunks(&self, mut function: FunctionInfo) -> Option<FunctionInfo> {
        let mut visited = HashSet::new();
        while let Some(target) = function.thunk_target {
            if !visited.insert(function.entry) {
                return None;
            }
            function = self.program.function_at(target)?;
        }
        Some(function)
    }

    /// The callee behind `function`, through any number of thunks.
    fn resolve_thunk(&self, function: u64) -> u64 {
        let mut current = function;
        let mut visited = HashSet::new();
        while visited.insert(current) {
            match self.program.function_at(current).and_then(|f| f.thunk_target) {
                Some(target) => current = target,
                None => break,
            }
        }
        current
    }
}

/// Direct virtual bases are built first, then non-virtual ones, each group in
/// declaration order. Destruction runs the other way.
fn check_order(
    table: &BaseOffsetTable,
    role: FunctionRole,
    calls: &[AttributedCall],
) -> Result<(), Rejection> {
    let mut order: Vec<ClassId> = table
        .direct()
        .filter(|e| e.is_virtual)
        .chain(table.direct().filter(|e| !e.is_virtual))
        .map(|e| e.class)
        .collect();
    if role.is_destructor() {
        order.reverse();
    }
    for (call, expected) in calls.iter().zip(order) {
        if call.base != expected {
            return Err(Rejection::OrderViolation {
                call: call.call_site,
                expected,
                found: call.base,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Abi;
    use crate::error::AnalysisError;
    use crate::host::{CallSite, FunctionInfo, HighFunction, Reference, ReferenceKind, ThisArgument, VarId};
    use crate::memory::InMemoryProgram;
    use crate::vtable::Vtable;

    const A: ClassId = ClassId(0xa0);
    const B: ClassId = ClassId(0xb0);
    const C: ClassId = ClassId(0xc0);

    const CTOR_C: u64 = 0x3000;
    const DTOR_C: u64 = 0x3100;
    const CTOR_A: u64 = 0x1000;
    const CTOR_B: u64 = 0x1100;
    const DTOR_A: u64 = 0x1200;
    const DTOR_B: u64 = 0x1300;
    const OTHER: u64 = 0x1400;

    fn model() -> ClassModel {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(
            ClassType::new(A, "A")
                .with_members(8, 8)
                .with_vtable(Vtable::from_targets(0x5000, 0xa0, 8, [DTOR_A])),
        );
        model.insert(
            ClassType::new(B, "B")
                .with_members(8, 8)
                .with_vtable(Vtable::from_targets(0x5100, 0xb0, 8, [DTOR_B])),
        );
        model.insert(
            ClassType::new(C, "C")
                .with_base(A)
                .with_base(B)
                .with_vtable(Vtable::from_targets(0x6000, 0xc0, 8, [DTOR_C])),
        );
        model
    }

    fn call(address: u64, target: u64, offset: Option<i64>) -> CallSite {
        CallSite {
            address,
            target: Some(target),
            this_arg: offset.map(|o| ThisArgument::new(VarId(1), o)),
        }
    }

    fn high(entry: u64, calls: Vec<CallSite>) -> HighFunction {
        HighFunction {
            entry,
            this_param: Some(VarId(1)),
            calls,
        }
    }

    fn program(ctor_calls: Vec<CallSite>, dtor_calls: Vec<CallSite>) -> InMemoryProgram {
        let mut program = InMemoryProgram::default();
        for (entry, name) in [
            (CTOR_A, "A::A"),
            (CTOR_B, "B::B"),
            (DTOR_A, "A::~A"),
            (DTOR_B, "B::~B"),
            (OTHER, "operator_delete"),
        ] {
            program = program.with_function(FunctionInfo::new(entry, name).with_size(0x80));
        }
        program
            .with_function(FunctionInfo::new(CTOR_C, "C::C").with_size(0x80))
            .with_function(FunctionInfo::new(DTOR_C, "C::~C").with_size(0x80))
            .with_reference(Reference {
                from: CTOR_C + 0x10,
                to: 0x6000,
                kind: ReferenceKind::Data,
            })
            .with_reference(Reference {
                from: DTOR_C + 0x10,
                to: 0x6000 - 16,
                kind: ReferenceKind::Data,
            })
            .with_high_function(high(CTOR_C, ctor_calls))
            .with_high_function(high(DTOR_C, dtor_calls))
    }

    fn good_ctor() -> Vec<CallSite> {
        vec![
            call(0x3020, CTOR_A, Some(0)),
            call(0x3030, CTOR_B, Some(16)),
            call(0x3040, OTHER, None),
        ]
    }

    fn good_dtor() -> Vec<CallSite> {
        vec![
            call(0x3120, OTHER, None),
            call(0x3130, DTOR_B, Some(16)),
            call(0x3140, DTOR_A, Some(0)),
            call(0x3150, OTHER, Some(0)),
        ]
    }

    fn ctor() -> CandidateFunction {
        CandidateFunction {
            function: CTOR_C,
            role: FunctionRole::Constructor,
        }
    }

    fn dtor() -> CandidateFunction {
        CandidateFunction {
            function: DTOR_C,
            role: FunctionRole::Destructor,
        }
    }

    fn attribute(
        program: &InMemoryProgram,
        config: &AttributionConfig,
        candidate: CandidateFunction,
    ) -> Result<Attribution, Rejection> {
        let mut model = model();
        let table = model.base_offset_table(C).unwrap().clone();
        Attributor::new(program, program, config, 8).attribute_function(C, &table, &candidate)
    }

    #[test]
    fn test_discover_candidates() {
        let program = program(good_ctor(), good_dtor());
        let model = model();
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);

        let candidates = attributor.discover_candidates(model.get(C).unwrap());
        assert_eq!(candidates, vec![ctor(), dtor()]);
    }

    #[test]
    fn test_discover_skips_user_defined_and_resolves_thunks() {
        let program = program(good_ctor(), good_dtor())
            .with_function(FunctionInfo::new(0x3200, "user").with_size(0x10).with_user_defined(true))
            .with_function(FunctionInfo::new(0x3300, "thunk").with_size(0x10).with_thunk_target(CTOR_C))
            .with_reference(Reference {
                from: 0x3204,
                to: 0x6000,
                kind: ReferenceKind::Data,
            })
            .with_reference(Reference {
                from: 0x3304,
                to: 0x6000 - 8,
                kind: ReferenceKind::Read,
            });
        let model = model();
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);

        let candidates = attributor.discover_candidates(model.get(C).unwrap());
        assert_eq!(candidates, vec![ctor(), dtor()]);
    }

    #[test]
    fn test_constructor_attribution() {
        let program = program(good_ctor(), good_dtor());
        let config = AttributionConfig::default();
        let attribution = attribute(&program, &config, ctor()).unwrap();

        let matched: Vec<_> = attribution.calls.iter().map(|c| (c.base, c.function)).collect();
        assert_eq!(matched, vec![(A, CTOR_A), (B, CTOR_B)]);
        assert_eq!(attribution.calls[1].offset, 16);
    }

    #[test]
    fn test_destructor_attribution_uses_tail_window() {
        let program = program(good_ctor(), good_dtor());
        let config = AttributionConfig::default();
        let attribution = attribute(&program, &config, dtor()).unwrap();

        let matched: Vec<_> = attribution.calls.iter().map(|c| (c.base, c.function)).collect();
        assert_eq!(matched, vec![(B, DTOR_B), (A, DTOR_A)]);
    }

    #[test]
    fn test_destructor_window_too_short() {
        let program = program(good_ctor(), vec![call(0x3130, DTOR_B, Some(16))]);
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, dtor()).unwrap_err(),
            Rejection::CallWindow {
                expected: 2,
                found: 0
            }
        );
    }

    #[test]
    fn test_constructor_window_too_short() {
        let program = program(vec![call(0x3020, CTOR_A, Some(0))], good_dtor());
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::CallWindow {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_offset_must_match_exactly() {
        let calls = vec![call(0x3020, CTOR_A, Some(0)), call(0x3030, CTOR_B, Some(8))];
        let program = program(calls, good_dtor());
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::OffsetNotInTable {
                call: 0x3030,
                offset: 8
            }
        );
    }

    #[test]
    fn test_field_offset_is_added() {
        let mut calls = good_ctor();
        calls[1].this_arg = Some(ThisArgument {
            variable: Some(VarId(1)),
            offset: 8,
            field_offset: Some(8),
        });
        let program = program(calls, good_dtor());
        let config = AttributionConfig::default();
        assert!(attribute(&program, &config, ctor()).is_ok());
    }

    #[test]
    fn test_foreign_this_is_rejected() {
        let mut calls = good_ctor();
        calls[0].this_arg = Some(ThisArgument::new(VarId(2), 0));
        let program = program(calls, good_dtor());
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::ForeignThisArgument { call: 0x3020 }
        );
    }

    #[test]
    fn test_duplicate_base_is_rejected() {
        let calls = vec![call(0x3020, CTOR_A, Some(0)), call(0x3030, CTOR_A, Some(0))];
        let program = program(calls, good_dtor());
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::DuplicateBase {
                call: 0x3030,
                base: A
            }
        );
    }

    #[test]
    fn test_indirect_call_is_rejected() {
        let mut calls = good_ctor();
        calls[1].target = None;
        let program = program(calls, good_dtor());
        let config = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::IndirectCall { call: 0x3030 }
        );
    }

    #[test]
    fn test_order_enforcement() {
        let calls = vec![call(0x3020, CTOR_B, Some(16)), call(0x3030, CTOR_A, Some(0))];
        let program = program(calls, good_dtor());

        let strict = AttributionConfig::default();
        assert_eq!(
            attribute(&program, &strict, ctor()).unwrap_err(),
            Rejection::OrderViolation {
                call: 0x3020,
                expected: A,
                found: B
            }
        );

        let relaxed = AttributionConfig {
            enforce_order: false,
            ..AttributionConfig::default()
        };
        assert!(attribute(&program, &relaxed, ctor()).is_ok());
    }

    #[test]
    fn test_thunk_candidate_is_rejected() {
        let program = program(good_ctor(), good_dtor())
            .with_function(FunctionInfo::new(0x3300, "thunk").with_thunk_target(CTOR_C));
        let config = AttributionConfig::default();
        let candidate = CandidateFunction {
            function: 0x3300,
            role: FunctionRole::Constructor,
        };
        assert_eq!(
            attribute(&program, &config, candidate).unwrap_err(),
            Rejection::Thunk { function: 0x3300 }
        );
    }

    #[test]
    fn test_thunk_callee_is_resolved() {
        let mut calls = good_ctor();
        calls[1].target = Some(0x1180);
        let program = program(calls, good_dtor())
            .with_function(FunctionInfo::new(0x1180, "thunk_B").with_thunk_target(CTOR_B));
        let config = AttributionConfig::default();
        let attribution = attribute(&program, &config, ctor()).unwrap();
        assert_eq!(attribution.calls[1].function, CTOR_B);
    }

    #[test]
    fn test_thunk_chain_callee_is_resolved() {
        let mut calls = good_ctor();
        calls[1].target = Some(0x1190);
        let program = program(calls, good_dtor())
            .with_function(FunctionInfo::new(0x1180, "thunk_B").with_thunk_target(CTOR_B))
            .with_function(FunctionInfo::new(0x1190, "thunk_thunk_B").with_thunk_target(0x1180));
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);
        let mut model = model();

        attributor
            .attribute_class(&mut model, C, &CancellationToken::new())
            .unwrap();
        assert_eq!(model.attributed(CTOR_B).unwrap().class, B);
        assert!(model.attributed(0x1190).is_none());
        assert!(model.attributed(0x1180).is_none());
    }

    #[test]
    fn test_looping_thunks_resolve_without_hanging() {
        let mut calls = good_ctor();
        calls[1].target = Some(0x1180);
        let program = program(calls, good_dtor())
            .with_function(FunctionInfo::new(0x1180, "loop_a").with_thunk_target(0x1190))
            .with_function(FunctionInfo::new(0x1190, "loop_b").with_thunk_target(0x1180));
        let config = AttributionConfig::default();
        let attribution = attribute(&program, &config, ctor()).unwrap();
        assert_eq!(attribution.calls[1].function, 0x1180);
    }

    #[test]
    fn test_discover_follows_thunk_chains() {
        let program = program(good_ctor(), good_dtor())
            .with_function(FunctionInfo::new(0x3300, "thunk").with_size(0x10).with_thunk_target(CTOR_C))
            .with_function(FunctionInfo::new(0x3400, "thunk_thunk").with_size(0x10).with_thunk_target(0x3300))
            .with_function(FunctionInfo::new(0x3500, "loop").with_size(0x10).with_thunk_target(0x3500))
            .with_reference(Reference {
                from: 0x3404,
                to: 0x6000,
                kind: ReferenceKind::Data,
            })
            .with_reference(Reference {
                from: 0x3504,
                to: 0x6000,
                kind: ReferenceKind::Data,
            });
        let model = model();
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);

        let candidates = attributor.discover_candidates(model.get(C).unwrap());
        assert_eq!(candidates, vec![ctor(), dtor()]);
    }

    #[test]
    fn test_decompiler_failure_becomes_rejection() {
        let program = program(good_ctor(), good_dtor()).with_decompile_failure(CTOR_C);
        let config = AttributionConfig::default();
        assert!(matches!(
            attribute(&program, &config, ctor()).unwrap_err(),
            Rejection::Host(HostError::Decompile { .. })
        ));
    }

    #[test]
    fn test_preconditions() {
        let program = InMemoryProgram::default();
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);

        let mut model = model();
        assert_eq!(attributor.check_preconditions(&model, C), Ok(()));
        assert_eq!(attributor.check_preconditions(&model, A), Err(Rejection::NoBases));

        model.insert(ClassType::new(ClassId(0xd0), "D").with_base(A));
        assert_eq!(
            attributor.check_preconditions(&model, ClassId(0xd0)),
            Err(Rejection::NoVtable)
        );

        model.insert(
            ClassType::new(ClassId(0xe0), "E")
                .with_base(A)
                .with_base(A)
                .with_vtable(Vtable::from_targets(0x7000, 0xe0, 8, [0x4000])),
        );
        assert_eq!(
            attributor.check_preconditions(&model, ClassId(0xe0)),
            Err(Rejection::AmbiguousParents {
                bases: 2,
                parents: 1
            })
        );
    }

    #[test]
    fn test_attribute_class_commits_everything() {
        let program = program(good_ctor(), good_dtor());
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);
        let mut model = model();

        let outcome = attributor
            .attribute_class(&mut model, C, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.state, AttributionState::AttributedOk);
        assert_eq!(outcome.attributions.len(), 2);
        assert_eq!(model.state(C), AttributionState::AttributedOk);

        assert_eq!(model.attributed(CTOR_A).unwrap().class, A);
        assert!(!model.attributed(CTOR_B).unwrap().is_destructor);
        assert!(model.attributed(DTOR_A).unwrap().is_destructor);
        assert_eq!(model.attributed(CTOR_C).unwrap().class, C);
        assert!(model.attributed(DTOR_C).unwrap().is_destructor);
        assert!(model.attributed(OTHER).is_none());
    }

    #[test]
    fn test_rejected_class_commits_nothing() {
        let calls = vec![call(0x3020, CTOR_A, Some(0)), call(0x3030, CTOR_B, Some(24))];
        let program = program(calls, vec![]);
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);
        let mut model = model();

        let outcome = attributor
            .attribute_class(&mut model, C, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.state, AttributionState::Rejected);
        assert_eq!(outcome.rejections.len(), 2);
        assert_eq!(model.attributed_functions().count(), 0);
    }

    #[test]
    fn test_interrupted_class_resumes_remaining_candidates() {
        let program = program(good_ctor(), good_dtor());
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);
        let mut model = model();

        // Left over from a run cancelled after the constructor was committed
        let table = model.base_offset_table(C).unwrap().clone();
        let first = attributor.attribute_function(C, &table, &ctor()).unwrap();
        attributor.commit(&mut model, &first);
        model.mark_analyzed(C, CTOR_C);
        model.set_state(C, AttributionState::AttributedOk);
        model.set_interrupted(C, true);
        assert!(model.needs_attribution(C));

        let outcome = attributor
            .attribute_class(&mut model, C, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.state, AttributionState::AttributedOk);
        assert_eq!(outcome.attributions.len(), 1);
        assert_eq!(outcome.attributions[0].function, DTOR_C);
        assert!(model.attributed(DTOR_C).unwrap().is_destructor);
        assert!(!model.needs_attribution(C));
    }

    #[test]
    fn test_cancelled_class_returns_to_not_analyzed() {
        let program = program(good_ctor(), good_dtor());
        let config = AttributionConfig::default();
        let attributor = Attributor::new(&program, &program, &config, 8);
        let mut model = model();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = attributor.attribute_class(&mut model, C, &cancel).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
        assert_eq!(model.state(C), AttributionState::NotAnalyzed);
        assert!(!model.is_interrupted(C));
        assert!(model.needs_attribution(C));
        assert_eq!(model.attributed_functions().count(), 0);
    }
}
