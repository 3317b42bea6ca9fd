//! Incremental, dependency-ordered pass scheduling for multi-unit compilers.
//!
//! The scheduler decides which passes have run for each compilation unit, which must run next,
//! and how to satisfy cross-unit dependencies that are only discovered while compiling. Language
//! behavior is plugged in through [`Extension`]; the engine guarantees ordering, termination and
//! partial-failure tolerance even though the dependency graph grows while it is running.

mod drive;
mod fault;
mod goal;
mod pass;
mod pipeline;
mod registry;
mod unit;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
};

use muster_foundation::errors::Diagnostic;

pub use fault::*;
use goal::GoalCache;
pub use goal::{GoalKey, GoalState};
pub use pass::{Extension, InnerFailure, PassContext, PassOutcome};
pub use pipeline::{Pipeline, PipelineSet, Step};
pub use registry::*;
pub use unit::*;

/// Full scheduler state for one compile session.
///
/// All bookkeeping lives here: there are no globals, and dropping the scheduler tears the whole
/// session down. Execution is single-threaded and cooperative; "suspending" a unit is nothing
/// more than call-stack recursion into other units.
pub struct Scheduler<A> {
    pub registry: UnitRegistry<A>,
    pub diagnostics: Vec<Diagnostic>,
    pipelines: PipelineSet,
    pub(crate) goals: GoalCache,
    /// Root units waiting for their turn. Invariant: every queued unit has no parent.
    pub(crate) worklist: VecDeque<UnitId>,
    /// Stack of units that have a pass executing right now. The top attributes newly created
    /// units to their parent; membership detects re-entrant advancement.
    pub(crate) running: Vec<UnitId>,
    /// Goals that could not be satisfied for a unit, exposed to its passes on retry.
    pub(crate) denied: HashMap<UnitId, HashSet<GoalKey>>,
    /// Dependency resolutions currently in flight, for cycle detection.
    pub(crate) resolving: HashSet<(UnitId, GoalKey)>,
    pub(crate) run_counts: HashMap<(UnitId, usize), usize>,
    started: bool,
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self {
            registry: UnitRegistry::new(),
            diagnostics: vec![],
            pipelines: PipelineSet::new(),
            goals: GoalCache::new(),
            worklist: VecDeque::new(),
            running: vec![],
            denied: HashMap::new(),
            resolving: HashSet::new(),
            run_counts: HashMap::new(),
            started: false,
        }
    }

    /// Registers the pass pipeline for one kind of unit. Fails once scheduling has started.
    pub fn register_pipeline(
        &mut self,
        kind: impl Into<Rc<str>>,
        pipeline: Pipeline,
    ) -> Result<(), ScheduleFault> {
        if self.started {
            return Err(ScheduleFault::ConfigurationLocked);
        }
        self.pipelines.register(kind, pipeline)
    }

    pub fn pipelines(&self) -> &PipelineSet {
        &self.pipelines
    }

    /// Registers a unit for compilation.
    ///
    /// When called while no pass is executing (the usual case: seeding the session), the unit is
    /// a root and is queued. When a unit is created while another unit's pass runs, it becomes
    /// that unit's child and is driven through barriers or orphan rescue instead.
    pub fn add_unit(
        &mut self,
        key: UnitKey,
        kind: impl Into<Rc<str>>,
        ast: A,
    ) -> Result<UnitId, ScheduleFault> {
        let parent = self.running.last().copied();
        let (id, created) = self.registry.get_or_create(key, kind.into(), ast, parent)?;
        if created && parent.is_none() {
            self.worklist.push_back(id);
        }
        Ok(id)
    }

    /// Current state of a goal; goals never requested are [`GoalState::Unreached`].
    pub fn goal_state(&self, key: &GoalKey) -> GoalState {
        self.goals
            .get(key)
            .map(|id| self.goals.state(id))
            .unwrap_or_default()
    }

    /// Keys of units currently queued, in order.
    pub fn queued_units(&self) -> Vec<UnitKey> {
        self.worklist
            .iter()
            .map(|&id| self.registry.unit(id).key.clone())
            .collect()
    }

    /// Per-unit outcomes for end-of-compilation reporting.
    pub fn unit_reports(&self) -> Vec<UnitReport> {
        self.registry.reports()
    }
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}
