use std::{collections::HashSet, rc::Rc};

use muster_foundation::errors::{Diagnostic, DiagnosticSink};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    fault::ScheduleFault,
    goal::GoalKey,
    pipeline::PipelineSet,
    registry::UnitRegistry,
    unit::{UnitId, UnitKey},
};

/// How many times a single pass may be attempted before the scheduler concludes that retrying it
/// cannot make progress.
pub(crate) const MAX_PASS_RUNS: usize = 100;

/// Result of executing one pass over one unit.
///
/// Missing dependencies are ordinary data, not unwound exceptions: the scheduler resolves the
/// needed goal and re-runs the pass, so passes must be idempotent or check progress already
/// recorded on the AST.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    Success,
    Failure,
    /// The pass discovered mid-execution that it needs `goal`, which may belong to a unit that is
    /// not even loaded yet. `mandatory` distinguishes a true prerequisite from an advisory want
    /// the pass can do without.
    NeedsGoal { goal: GoalKey, mandatory: bool },
}

/// A language extension: everything the scheduler does not know about the language it is driving.
///
/// Extensions plug in behavior as data and functions; the scheduler core has no subclass
/// hierarchy. Pass identifiers are opaque tokens unique within the extension's pipelines.
pub trait Extension {
    /// The AST root type owned by each unit, mutated in place by passes.
    type Ast;

    /// Executes the pass for `goal` over `ast`. `goal.param` is the key of the unit being
    /// advanced (also available as [`PassContext::unit_key`]).
    fn execute_pass(
        &mut self,
        goal: &GoalKey,
        ast: &mut Self::Ast,
        cx: &mut PassContext<'_, Self::Ast>,
    ) -> PassOutcome;

    /// Maps a goal signaled by [`PassOutcome::NeedsGoal`] to the unit responsible for it, as a
    /// `(key, kind)` pair. `None` means the extension has no idea who could satisfy the goal.
    fn locate_goal(&mut self, goal: &GoalKey) -> Option<(UnitKey, Rc<str>)> {
        let _ = goal;
        None
    }

    /// Loads the AST for a unit that is not registered yet. `None` means the source cannot be
    /// found; the requesting pass will see the goal in its denied set on retry.
    fn load_unit(&mut self, key: &UnitKey, kind: &str) -> Option<Self::Ast> {
        let _ = (key, kind);
        None
    }
}

/// Failure of a synchronous inner run; either a pass over the fragment failed, or the scheduling
/// machinery itself faulted.
#[derive(Debug, Error)]
pub enum InnerFailure {
    #[error("inner pass `{pass}` failed")]
    PassFailed { pass: Rc<str> },
    #[error(transparent)]
    Fault(#[from] ScheduleFault),
}

/// Everything a pass may touch besides its own AST.
///
/// Borrowed from the scheduler for the duration of a single pass execution.
pub struct PassContext<'a, A> {
    pub(crate) registry: &'a mut UnitRegistry<A>,
    pub(crate) pipelines: &'a PipelineSet,
    pub(crate) diagnostics: &'a mut Vec<Diagnostic>,
    pub(crate) denied: &'a HashSet<GoalKey>,
    pub(crate) current: UnitId,
    pub(crate) current_key: UnitKey,
}

impl<'a, A> PassContext<'a, A> {
    /// Key of the unit the current pass belongs to.
    pub fn unit_key(&self) -> &UnitKey {
        &self.current_key
    }

    /// Whether a previously signaled goal turned out to be unsatisfiable. A pass that sees its
    /// mandatory goal here should emit a diagnostic and fail; an advisory goal here means
    /// "continue without".
    pub fn is_denied(&self, goal: &GoalKey) -> bool {
        self.denied.contains(goal)
    }

    pub fn emit(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.emit(diagnostic);
    }

    /// Registers a new unit as a child of the currently running one. The child is not queued; it
    /// is driven by an ancestor's barriers, by dependency resolution, or promoted to the worklist
    /// when its parent completes.
    pub fn spawn_unit(
        &mut self,
        key: UnitKey,
        kind: impl Into<Rc<str>>,
        ast: A,
    ) -> Result<UnitId, ScheduleFault> {
        self.registry
            .get_or_create(key, kind.into(), ast, Some(self.current))
            .map(|(id, _)| id)
    }

    /// Runs the pass range `[begin, end]` (inclusive, by token) of `kind`'s pipeline over a
    /// fragment AST, synchronously and to completion.
    ///
    /// The fragment is never registered: it is invisible to the worklist and to barrier
    /// visitation, so nothing can force it through passes behind the caller's back. Barrier steps
    /// within the range are skipped for the same reason - the global rendezvous is the enclosing
    /// unit's job, not the fragment's. Missing dependencies cannot be resolved inside an inner
    /// run; they are denied and the pass retried.
    pub fn run_inner(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        kind: &str,
        fragment: A,
        begin: &str,
        end: &str,
    ) -> Result<A, InnerFailure> {
        let pipeline = self
            .pipelines
            .get(kind)
            .ok_or_else(|| ScheduleFault::MissingPipeline(kind.to_owned()))?;
        let position = |token: &str| {
            pipeline
                .steps()
                .iter()
                .position(|step| !step.barrier && &*step.token == token)
                .ok_or_else(|| ScheduleFault::PassNotFound {
                    unit: self.current_key.to_string(),
                    goal: token.to_owned(),
                })
        };
        let begin_index = position(begin)?;
        let end_index = position(end)?;
        if end_index < begin_index {
            return Err(InnerFailure::Fault(ScheduleFault::PassNotFound {
                unit: self.current_key.to_string(),
                goal: end.to_owned(),
            }));
        }
        let steps: Vec<_> = pipeline.steps()[begin_index..=end_index].to_vec();

        debug!(
            unit = %self.current_key,
            %kind,
            passes = steps.len(),
            "running inner unit"
        );

        let mut fragment = fragment;
        let mut denied = HashSet::new();
        for step in steps {
            if step.barrier {
                trace!(token = %step.token, "skipping barrier in inner run");
                continue;
            }
            let goal = GoalKey::of(Rc::clone(&step.token), self.current_key.as_rc());
            let mut runs = 0;
            loop {
                runs += 1;
                if runs > MAX_PASS_RUNS {
                    return Err(InnerFailure::Fault(ScheduleFault::CyclicScheduling(
                        format!(
                            "inner pass `{}` of unit `{}` retried {MAX_PASS_RUNS} times \
                             without completing",
                            step.token, self.current_key,
                        ),
                    )));
                }
                let mut inner_cx = PassContext {
                    registry: &mut *self.registry,
                    pipelines: self.pipelines,
                    diagnostics: &mut *self.diagnostics,
                    denied: &denied,
                    current: self.current,
                    current_key: self.current_key.clone(),
                };
                match ext.execute_pass(&goal, &mut fragment, &mut inner_cx) {
                    PassOutcome::Success => break,
                    PassOutcome::Failure => {
                        return Err(InnerFailure::PassFailed {
                            pass: Rc::clone(&step.token),
                        })
                    }
                    PassOutcome::NeedsGoal { goal: needed, .. } => {
                        trace!(
                            needed = %needed,
                            "dependency signaled during inner run; denying"
                        );
                        denied.insert(needed);
                    }
                }
            }
        }
        Ok(fragment)
    }
}

impl<A> DiagnosticSink for PassContext<'_, A> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        PassContext::emit(self, diagnostic);
    }
}
