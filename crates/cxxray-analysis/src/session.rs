//! End-to-end analysis over a program snapshot.
//!
//! A session discovers the class model, lays out every class, attributes
//! constructors and destructors, then recovers dynamic-cast call-site
//! signatures. Cancellation stops the run between steps and still returns
//! what was finished.

use cxxray_types::Layout;
use serde::Serialize;
use tracing::{info, warn};

use crate::attribution::{Attributor, ClassAttribution};
use crate::cancel::CancellationToken;
use crate::config::AnalysisConfig;
use crate::dynamic_cast::{DynamicCastReport, DynamicCastResolver};
use crate::error::{AnalysisError, AnalysisResult};
use crate::layout::LayoutBuilder;
use crate::memory::{InMemoryProgram, InMemorySignatureSink, ProgramSnapshot};
use crate::model::{AttributionState, ClassId, ClassModel};

/// Summary of one [`AnalysisSession::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    /// Classes in the model.
    pub classes: usize,
    pub classes_laid_out: usize,
    /// Classes whose layout could not be built, with the reason.
    pub layout_failures: Vec<(ClassId, String)>,
    pub classes_attributed: usize,
    pub classes_rejected: usize,
    /// Classes that did not meet the attribution preconditions.
    pub classes_skipped: usize,
    /// Constructors and destructors recorded, including base functions.
    pub functions_committed: usize,
    /// Per-class attribution outcomes, in class order.
    pub attributions: Vec<ClassAttribution>,
    /// Dynamic-cast pass outcome, when the pass ran.
    pub dynamic_cast: Option<DynamicCastReport>,
    /// The run stopped early.
    pub cancelled: bool,
}

impl AnalysisReport {
    /// Number of call-site overrides applied.
    pub fn cast_overrides(&self) -> usize {
        self.dynamic_cast.as_ref().map_or(0, |r| r.overridden.len())
    }
}

/// Holds the collaborators and the class model across passes.
pub struct AnalysisSession {
    config: AnalysisConfig,
    program: InMemoryProgram,
    model: ClassModel,
    sink: InMemorySignatureSink,
}

impl AnalysisSession {
    pub fn new(config: AnalysisConfig, program: InMemoryProgram, model: ClassModel) -> Self {
        Self {
            config,
            program,
            model,
            sink: InMemorySignatureSink::new(),
        }
    }

    /// Loads a snapshot and discovers its class model.
    ///
    /// A configuration recorded in the snapshot takes precedence over
    /// `config`.
    pub fn from_snapshot(
        mut snapshot: ProgramSnapshot,
        config: AnalysisConfig,
    ) -> AnalysisResult<Self> {
        let config = snapshot.config.take().unwrap_or(config);
        let program = InMemoryProgram::from_snapshot(snapshot);
        let model = program.discover_classes(&config)?;
        Ok(Self::new(config, program, model))
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn model(&self) -> &ClassModel {
        &self.model
    }

    pub fn sink(&self) -> &InMemorySignatureSink {
        &self.sink
    }

    /// The registered layout of the class named `name`.
    pub fn layout(&self, name: &str) -> Option<&Layout> {
        self.model.types().get_layout(name)
    }

    /// Runs every pass.
    ///
    /// A class that fails to resolve is reported and skipped. Classes already
    /// attributed or rejected by an earlier run are left alone, except one
    /// whose attribution was cancelled part way. Only errors that make the
    /// whole run meaningless are returned.
    pub fn run(&mut self, cancel: &CancellationToken) -> AnalysisResult<AnalysisReport> {
        let mut report = AnalysisReport {
            classes: self.model.len(),
            ..AnalysisReport::default()
        };
        let ids = self.model.ids();

        for &id in &ids {
            if cancel.is_cancelled() {
                return Ok(self.stopped(report));
            }
            match LayoutBuilder::new(&mut self.model).build(id) {
                Ok(_) => report.classes_laid_out += 1,
                Err(err) => {
                    warn!(class = %id, error = %err, "layout failed");
                    report.layout_failures.push((id, err.to_string()));
                }
            }
        }

        let attributor = Attributor::new(
            &self.program,
            &self.program,
            &self.config.attribution,
            self.config.pointer_size,
        );
        for &id in &ids {
            if cancel.is_cancelled() {
                return Ok(self.stopped(report));
            }
            if !self.model.needs_attribution(id) {
                continue;
            }
            let outcome = match attributor.attribute_class(&mut self.model, id, cancel) {
                Ok(outcome) => outcome,
                Err(AnalysisError::Cancelled) => return Ok(self.stopped(report)),
                Err(err) => return Err(err),
            };
            match outcome.state {
                AttributionState::AttributedOk => report.classes_attributed += 1,
                AttributionState::Rejected => report.classes_rejected += 1,
                _ if outcome.skipped.is_some() => report.classes_skipped += 1,
                _ => {}
            }
            report.attributions.push(outcome);
        }
        report.functions_committed = self.model.attributed_functions().count();

        if self.config.dynamic_cast.enabled {
            let resolver =
                DynamicCastResolver::new(&self.program, &self.program, &self.model, &self.config);
            let cast = resolver.run(&mut self.sink, cancel)?;
            report.cancelled = cast.cancelled;
            report.dynamic_cast = Some(cast);
        }

        info!(
            classes = report.classes,
            laid_out = report.classes_laid_out,
            attributed = report.classes_attributed,
            rejected = report.classes_rejected,
            overrides = report.cast_overrides(),
            cancelled = report.cancelled,
            "analysis finished"
        );
        Ok(report)
    }

    fn stopped(&self, mut report: AnalysisReport) -> AnalysisReport {
        report.cancelled = true;
        report.functions_committed = self.model.attributed_functions().count();
        info!("analysis cancelled");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Abi;
    use crate::host::{
        CallSite, FunctionInfo, HighFunction, ParameterStorage, Reference, ReferenceKind,
        ThisArgument, VarId,
    };
    use crate::model::ClassType;
    use crate::vtable::Vtable;

    const CAST: u64 = 0x4000;

    fn call(address: u64, target: u64, offset: i64) -> CallSite {
        CallSite {
            address,
            target: Some(target),
            this_arg: Some(ThisArgument::new(VarId(1), offset)),
        }
    }

    fn snapshot() -> ProgramSnapshot {
        let registers = ["rdi", "rsi", "rdx", "rcx"]
            .into_iter()
            .map(|r| ParameterStorage::Register(r.to_string()))
            .collect();
        ProgramSnapshot {
            classes: vec![
                ClassType::new(ClassId(0xa0), "A")
                    .with_members(8, 8)
                    .with_vtable(Vtable::from_targets(0x5000, 0xa0, 8, [0x1200])),
                ClassType::new(ClassId(0xb0), "B")
                    .with_members(4, 4)
                    .with_vtable(Vtable::from_targets(0x5100, 0xb0, 8, [0x1300])),
                ClassType::new(ClassId(0xc0), "C")
                    .with_base(ClassId(0xa0))
                    .with_base(ClassId(0xb0))
                    .with_vtable(Vtable::from_targets(0x6000, 0xc0, 8, [0x3100])),
            ],
            functions: vec![
                FunctionInfo::new(0x1000, "A::A").with_size(0x80),
                FunctionInfo::new(0x1100, "B::B").with_size(0x80),
                FunctionInfo::new(0x1200, "A::~A").with_size(0x80),
                FunctionInfo::new(0x1300, "B::~B").with_size(0x80),
                FunctionInfo::new(0x3000, "C::C").with_size(0x80),
                FunctionInfo::new(0x3100, "C::~C").with_size(0x80),
                FunctionInfo::new(0x3200, "use").with_size(0x80),
                FunctionInfo::new(CAST, "__dynamic_cast").with_prototype(
                    "void * __dynamic_cast(void * src_ptr, __class_type_info * src_type, \
                     __class_type_info * dst_type, ptrdiff_t src2dst)",
                    registers,
                ),
            ],
            references: vec![
                Reference {
                    from: 0x3010,
                    to: 0x6000,
                    kind: ReferenceKind::Data,
                },
                Reference {
                    from: 0x3210,
                    to: CAST,
                    kind: ReferenceKind::Call,
                },
            ],
            high_functions: vec![HighFunction {
                entry: 0x3000,
                this_param: Some(VarId(1)),
                calls: vec![call(0x3020, 0x1000, 0), call(0x3030, 0x1100, 16)],
            }],
            register_constants: vec![
                crate::memory::RegisterConstant {
                    address: 0x3210,
                    register: "rsi".to_string(),
                    value: 0xa0,
                },
                crate::memory::RegisterConstant {
                    address: 0x3210,
                    register: "rdx".to_string(),
                    value: 0xc0,
                },
            ],
            ..ProgramSnapshot::default()
        }
    }

    #[test]
    fn test_full_run() {
        let mut session =
            AnalysisSession::from_snapshot(snapshot(), AnalysisConfig::default()).unwrap();
        let report = session.run(&CancellationToken::new()).unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.classes, 3);
        assert_eq!(report.classes_laid_out, 3);
        assert_eq!(report.classes_attributed, 1);
        assert_eq!(report.classes_skipped, 2);
        // C::C plus the two base constructors.
        assert_eq!(report.functions_committed, 3);
        assert_eq!(report.cast_overrides(), 1);

        let layout = session.layout("C").unwrap();
        assert_eq!(layout.size, 32);
        assert_eq!(layout.field_at(16).unwrap().name, "super_B");

        let cast = session.sink().get(0x3210).unwrap();
        assert_eq!(cast.name, "prt3210");
        assert_eq!(
            cast.prototype.to_c_string(),
            "C * __dynamic_cast(A *, __class_type_info *, __class_type_info *, ptrdiff_t src2dst)"
        );
    }

    #[test]
    fn test_second_run_skips_finished_classes() {
        let mut session =
            AnalysisSession::from_snapshot(snapshot(), AnalysisConfig::default()).unwrap();
        session.run(&CancellationToken::new()).unwrap();
        let report = session.run(&CancellationToken::new()).unwrap();
        assert_eq!(report.classes_attributed, 0);
        assert_eq!(report.functions_committed, 3);
        // The call site already carries an override.
        assert_eq!(report.dynamic_cast.unwrap().skipped, vec![0x3210]);
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut session =
            AnalysisSession::from_snapshot(snapshot(), AnalysisConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = session.run(&cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.classes_laid_out, 0);
        assert!(session.sink().is_empty());
        assert!(session
            .model()
            .ids()
            .into_iter()
            .all(|id| session.model().state(id) != AttributionState::Analyzing));
    }

    #[test]
    fn test_snapshot_config_wins() {
        let mut snapshot = snapshot();
        snapshot.config = Some(AnalysisConfig::default().with_abi(Abi::Msvc));
        let session = AnalysisSession::from_snapshot(snapshot, AnalysisConfig::default()).unwrap();
        assert_eq!(session.config().abi, Abi::Msvc);
        assert_eq!(session.model().abi(), Abi::Msvc);
    }

    #[test]
    fn test_dynamic_cast_disabled() {
        let mut config = AnalysisConfig::default();
        config.dynamic_cast.enabled = false;
        let mut session = AnalysisSession::from_snapshot(snapshot(), config).unwrap();
        let report = session.run(&CancellationToken::new()).unwrap();
        assert!(report.dynamic_cast.is_none());
        assert!(session.sink().is_empty());
    }
}
