use std::{collections::HashMap, fmt, rc::Rc};

use tracing::trace;

use crate::fault::ScheduleFault;

/// Identity of a goal: a kind token plus an optional parameter naming its subject.
///
/// The kind is an opaque token unique within one extension's pipeline (say `build-types`); the
/// parameter is usually a unit key or a class name. Two requests for the same `(kind, param)`
/// pair always refer to the same goal, no matter which unit makes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GoalKey {
    pub kind: Rc<str>,
    pub param: Option<Rc<str>>,
}

impl GoalKey {
    pub fn global(kind: impl Into<Rc<str>>) -> Self {
        Self {
            kind: kind.into(),
            param: None,
        }
    }

    pub fn of(kind: impl Into<Rc<str>>, param: impl Into<Rc<str>>) -> Self {
        Self {
            kind: kind.into(),
            param: Some(param.into()),
        }
    }
}

impl fmt::Display for GoalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}({})", self.kind, param),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GoalId(u32);

/// State of a goal. Only ever moves forward; once a goal is [`Reached`][GoalState::Reached] or
/// [`Unreachable`][GoalState::Unreachable] it stays that way for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GoalState {
    #[default]
    Unreached,
    Running,
    Reached,
    Unreachable,
}

impl GoalState {
    fn is_final(self) -> bool {
        matches!(self, GoalState::Reached | GoalState::Unreachable)
    }
}

#[derive(Debug)]
struct Goal {
    key: GoalKey,
    state: GoalState,
    prerequisites: Vec<GoalId>,
}

/// Interning cache for goals.
///
/// Goals are shared, not duplicated: the pass that resolves class `B`'s members and every unit
/// that waits for that fact all hold the same [`GoalId`].
#[derive(Debug, Default)]
pub struct GoalCache {
    goals: Vec<Goal>,
    ids_by_key: HashMap<GoalKey, GoalId>,
}

impl GoalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, key: GoalKey) -> GoalId {
        if let Some(&id) = self.ids_by_key.get(&key) {
            id
        } else {
            let id = GoalId(
                self.goals
                    .len()
                    .try_into()
                    .expect("too many goals interned"),
            );
            trace!(goal = %key, "new goal");
            self.ids_by_key.insert(key.clone(), id);
            self.goals.push(Goal {
                key,
                state: GoalState::Unreached,
                prerequisites: vec![],
            });
            id
        }
    }

    pub fn get(&self, key: &GoalKey) -> Option<GoalId> {
        self.ids_by_key.get(key).copied()
    }

    pub fn key(&self, id: GoalId) -> &GoalKey {
        &self.goal(id).key
    }

    pub fn state(&self, id: GoalId) -> GoalState {
        self.goal(id).state
    }

    /// Moves a goal's state forward. Backward transitions are ignored, as are transitions out of
    /// a final state; returns whether the state actually changed.
    pub fn mark(&mut self, id: GoalId, state: GoalState) -> bool {
        let goal = self
            .goals
            .get_mut(id.0 as usize)
            .expect("invalid goal ID passed to mark");
        if goal.state == state || goal.state.is_final() {
            return false;
        }
        if state == GoalState::Unreached {
            return false;
        }
        trace!(goal = %goal.key, from = ?goal.state, to = ?state, "goal state");
        goal.state = state;
        true
    }

    pub fn prerequisites(&self, id: GoalId) -> &[GoalId] {
        &self.goal(id).prerequisites
    }

    /// Records that `prerequisite` must be reached before `goal` can be. The prerequisite graph
    /// is a DAG; an edge that would close a cycle is a scheduling fault.
    pub fn add_prerequisite(
        &mut self,
        goal: GoalId,
        prerequisite: GoalId,
    ) -> Result<(), ScheduleFault> {
        if self.depends_on(prerequisite, goal) || goal == prerequisite {
            return Err(ScheduleFault::CyclicScheduling(format!(
                "goal `{}` cannot have `{}` as a prerequisite; it already depends on it",
                self.key(goal),
                self.key(prerequisite),
            )));
        }
        let prerequisites = &mut self
            .goals
            .get_mut(goal.0 as usize)
            .expect("invalid goal ID passed to add_prerequisite")
            .prerequisites;
        if !prerequisites.contains(&prerequisite) {
            prerequisites.push(prerequisite);
        }
        Ok(())
    }

    /// Whether `from` transitively depends on `to` through prerequisite edges.
    fn depends_on(&self, from: GoalId, to: GoalId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            stack.extend_from_slice(self.prerequisites(id));
        }
        false
    }

    fn goal(&self, id: GoalId) -> &Goal {
        self.goals
            .get(id.0 as usize)
            .expect("invalid goal ID passed to GoalCache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_goal() {
        let mut cache = GoalCache::new();
        let a = cache.intern(GoalKey::of("build-types", "Actor"));
        let b = cache.intern(GoalKey::of("build-types", "Actor"));
        let c = cache.intern(GoalKey::of("build-types", "Pawn"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.key(a), &GoalKey::of("build-types", "Actor"));
    }

    #[test]
    fn state_only_moves_forward() {
        let mut cache = GoalCache::new();
        let goal = cache.intern(GoalKey::global("parse"));
        assert_eq!(cache.state(goal), GoalState::Unreached);

        assert!(cache.mark(goal, GoalState::Running));
        assert!(cache.mark(goal, GoalState::Reached));

        // Reached is final; neither regression nor a flip to Unreachable may happen.
        assert!(!cache.mark(goal, GoalState::Unreached));
        assert!(!cache.mark(goal, GoalState::Running));
        assert!(!cache.mark(goal, GoalState::Unreachable));
        assert_eq!(cache.state(goal), GoalState::Reached);
    }

    #[test]
    fn unreachable_is_final_too() {
        let mut cache = GoalCache::new();
        let goal = cache.intern(GoalKey::global("check"));
        assert!(cache.mark(goal, GoalState::Unreachable));
        assert!(!cache.mark(goal, GoalState::Reached));
        assert_eq!(cache.state(goal), GoalState::Unreachable);
    }

    #[test]
    fn prerequisite_cycles_are_rejected() {
        let mut cache = GoalCache::new();
        let parse = cache.intern(GoalKey::of("parse", "A"));
        let types = cache.intern(GoalKey::of("build-types", "A"));
        let check = cache.intern(GoalKey::of("check", "A"));

        cache.add_prerequisite(types, parse).unwrap();
        cache.add_prerequisite(check, types).unwrap();
        assert!(matches!(
            cache.add_prerequisite(parse, check),
            Err(ScheduleFault::CyclicScheduling(_))
        ));
        assert!(matches!(
            cache.add_prerequisite(parse, parse),
            Err(ScheduleFault::CyclicScheduling(_))
        ));
    }
}
