use std::{fmt, rc::Rc};

use crate::goal::GoalId;

/// ID of a unit within the scheduler's arena.
///
/// Units reference each other exclusively through IDs: a unit's children list owns the edge
/// downward, the parent field is a plain back-reference. There are no reference cycles to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub(crate) u32);

impl UnitId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Unique source identity of a unit, usually the name of the thing being compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey(Rc<str>);

impl UnitKey {
    pub fn new(key: impl Into<Rc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_rc(&self) -> Rc<str> {
        Rc::clone(&self.0)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// One step of a unit's materialized pass list.
#[derive(Debug, Clone)]
pub struct Pass {
    /// Pass identifier, taken from the pipeline step this pass was materialized from.
    pub token: Rc<str>,
    /// The per-unit goal this pass reaches. Barrier passes have no goal of their own; they stand
    /// for every *other* unit reaching `token`.
    pub goal: Option<GoalId>,
    pub barrier: bool,
}

impl Pass {
    /// Human-readable pass name for reports and diagnostics.
    pub fn name(&self) -> String {
        if self.barrier {
            format!("barrier({})", self.token)
        } else {
            self.token.to_string()
        }
    }
}

/// One compilation target: a source file given to the scheduler directly, or a unit drawn in
/// while compiling another.
///
/// The AST root is exclusively owned and handed to each pass in turn; between passes it sits
/// here. The pass list is materialized lazily from the pipeline registered for `kind` and is
/// never reordered afterward.
#[derive(Debug)]
pub struct Unit<A> {
    pub key: UnitKey,
    pub kind: Rc<str>,
    /// `None` only while a pass is executing over the AST, and after completion.
    pub ast: Option<A>,
    pub(crate) passes: Option<Vec<Pass>>,
    pub(crate) next_pass: usize,
    pub(crate) status: bool,
    pub(crate) failed_pass: Option<Rc<str>>,
    pub(crate) parent: Option<UnitId>,
    pub(crate) children: Vec<UnitId>,
    pub(crate) completed: bool,
}

impl<A> Unit<A> {
    pub(crate) fn new(key: UnitKey, kind: Rc<str>, ast: A, parent: Option<UnitId>) -> Self {
        Self {
            key,
            kind,
            ast: Some(ast),
            passes: None,
            next_pass: 0,
            status: true,
            failed_pass: None,
            parent,
            children: vec![],
            completed: false,
        }
    }

    /// Index of the next pass to run. Non-decreasing over the unit's lifetime.
    pub fn next_pass(&self) -> usize {
        self.next_pass
    }

    /// Cumulative AND of the results of all passes run so far.
    pub fn status(&self) -> bool {
        self.status
    }

    pub fn failed_pass(&self) -> Option<&Rc<str>> {
        self.failed_pass.as_ref()
    }

    pub fn parent(&self) -> Option<UnitId> {
        self.parent
    }

    pub fn children(&self) -> &[UnitId] {
        &self.children
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn pass(&self, index: usize) -> &Pass {
        &self.materialized_passes()[index]
    }

    pub(crate) fn pass_count(&self) -> usize {
        self.materialized_passes().len()
    }

    /// Position just past this unit's pass for `token`, i.e. the cursor value at which the goal
    /// has been attempted. `None` if the unit's pipeline has no pass for `token`.
    pub(crate) fn advance_target_for(&self, token: &str) -> Option<usize> {
        self.materialized_passes()
            .iter()
            .position(|pass| !pass.barrier && &*pass.token == token)
            .map(|index| index + 1)
    }

    /// Name of the pass the unit got furthest through: the failing pass for failed units, the
    /// last executed pass otherwise.
    pub(crate) fn furthest_pass(&self) -> Option<Rc<str>> {
        if let Some(failed) = &self.failed_pass {
            return Some(Rc::clone(failed));
        }
        let passes = self.passes.as_deref()?;
        self.next_pass
            .checked_sub(1)
            .and_then(|index| passes.get(index))
            .map(|pass| Rc::clone(&pass.token))
    }

    fn materialized_passes(&self) -> &[Pass] {
        self.passes
            .as_deref()
            .expect("unit's pass list has not been materialized yet")
    }
}
