use std::rc::Rc;

use indexmap::IndexMap;
use tracing::trace;

use crate::{
    fault::ScheduleFault,
    unit::{Unit, UnitId, UnitKey},
};

/// What the registry knows about a unit key.
#[derive(Debug)]
pub enum UnitEntry {
    Live(UnitId),
    /// The unit previously existed but has finished; its AST and pass list have been discarded to
    /// bound memory, and only the outcome remains. Requesting the key again is a fault.
    Completed(CompletedUnit),
}

#[derive(Debug, Clone)]
pub struct CompletedUnit {
    pub id: UnitId,
    pub success: bool,
    pub furthest_pass: Option<Rc<str>>,
}

/// Per-unit outcome for end-of-compilation reporting.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub key: UnitKey,
    pub completed: bool,
    pub success: bool,
    pub furthest_pass: Option<Rc<str>>,
}

/// Maps unit keys to units.
///
/// Iteration order everywhere follows registration order, so barrier visitation and reports are
/// deterministic for a given compilation.
#[derive(Debug, Default)]
pub struct UnitRegistry<A> {
    entries: IndexMap<UnitKey, UnitEntry>,
    units: Vec<Unit<A>>,
}

impl<A> UnitRegistry<A> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            units: vec![],
        }
    }

    /// Returns the unit for `key`, creating it if needed. The second element of the pair is true
    /// if the unit was created by this call; `ast` is dropped when the unit already exists.
    ///
    /// `parent` is the unit whose pass is currently executing, if any; a freshly created unit
    /// becomes its child. Requesting a key whose unit has already completed is a fault - the
    /// caller is holding a stale handle.
    pub fn get_or_create(
        &mut self,
        key: UnitKey,
        kind: Rc<str>,
        ast: A,
        parent: Option<UnitId>,
    ) -> Result<(UnitId, bool), ScheduleFault> {
        match self.entries.get(&key) {
            Some(UnitEntry::Live(id)) => Ok((*id, false)),
            Some(UnitEntry::Completed(_)) => Err(ScheduleFault::ReuseOfCompletedUnit(key.to_string())),
            None => {
                let id = UnitId(
                    self.units
                        .len()
                        .try_into()
                        .expect("too many units registered"),
                );
                trace!(unit = %key, %kind, ?parent, "new unit");
                self.units.push(Unit::new(key.clone(), kind, ast, parent));
                self.entries.insert(key, UnitEntry::Live(id));
                if let Some(parent) = parent {
                    self.unit_mut(parent).children.push(id);
                }
                Ok((id, true))
            }
        }
    }

    pub fn lookup(&self, key: &UnitKey) -> Option<&UnitEntry> {
        self.entries.get(key)
    }

    pub fn unit(&self, id: UnitId) -> &Unit<A> {
        self.units
            .get(id.index())
            .expect("invalid unit ID passed to unit")
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut Unit<A> {
        self.units
            .get_mut(id.index())
            .expect("invalid unit ID passed to unit_mut")
    }

    /// Snapshot of all live (not yet completed) units, in registration order.
    pub fn live_units(&self) -> Vec<UnitId> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                UnitEntry::Live(id) => Some(*id),
                UnitEntry::Completed(_) => None,
            })
            .collect()
    }

    /// Marks the unit completed, substituting the sentinel for it and freeing its AST and pass
    /// list. Returns the unit's children so the caller can perform orphan rescue.
    pub fn complete(&mut self, id: UnitId) -> Vec<UnitId> {
        let unit = self.unit_mut(id);
        let furthest_pass = unit.furthest_pass();
        let success = unit.status;
        unit.completed = true;
        unit.ast = None;
        unit.passes = None;
        let children = std::mem::take(&mut unit.children);
        let key = unit.key.clone();
        self.entries.insert(
            key,
            UnitEntry::Completed(CompletedUnit {
                id,
                success,
                furthest_pass,
            }),
        );
        children
    }

    /// True if every registered unit has completed successfully.
    pub fn all_succeeded(&self) -> bool {
        self.entries.values().all(|entry| match entry {
            UnitEntry::Live(id) => {
                let unit = self.unit(*id);
                unit.completed && unit.status
            }
            UnitEntry::Completed(completed) => completed.success,
        })
    }

    pub fn reports(&self) -> Vec<UnitReport> {
        self.entries
            .iter()
            .map(|(key, entry)| match entry {
                UnitEntry::Live(id) => {
                    let unit = self.unit(*id);
                    UnitReport {
                        key: key.clone(),
                        completed: unit.completed,
                        success: unit.status,
                        furthest_pass: unit.furthest_pass(),
                    }
                }
                UnitEntry::Completed(completed) => UnitReport {
                    key: key.clone(),
                    completed: true,
                    success: completed.success,
                    furthest_pass: completed.furthest_pass.clone(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> UnitRegistry<()> {
        UnitRegistry::new()
    }

    #[test]
    fn get_or_create_interns_by_key() {
        let mut registry = registry();
        let (a, created) = registry
            .get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None)
            .unwrap();
        assert!(created);
        let (b, created) = registry
            .get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None)
            .unwrap();
        assert!(!created);
        assert_eq!(a, b);
    }

    #[test]
    fn children_are_attributed_to_their_parent() {
        let mut registry = registry();
        let (parent, _) = registry
            .get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None)
            .unwrap();
        let (child, _) = registry
            .get_or_create(UnitKey::new("Pawn"), Rc::from("module"), (), Some(parent))
            .unwrap();
        assert_eq!(registry.unit(parent).children(), &[child]);
        assert_eq!(registry.unit(child).parent(), Some(parent));
    }

    #[test]
    fn completed_units_cannot_be_recreated() {
        let mut registry = registry();
        let (id, _) = registry
            .get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None)
            .unwrap();
        registry.complete(id);
        assert!(matches!(
            registry.lookup(&UnitKey::new("Actor")),
            Some(UnitEntry::Completed(_))
        ));
        assert!(matches!(
            registry.get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None),
            Err(ScheduleFault::ReuseOfCompletedUnit(_))
        ));
    }

    #[test]
    fn completing_detaches_children() {
        let mut registry = registry();
        let (parent, _) = registry
            .get_or_create(UnitKey::new("Actor"), Rc::from("module"), (), None)
            .unwrap();
        let (child, _) = registry
            .get_or_create(UnitKey::new("Pawn"), Rc::from("module"), (), Some(parent))
            .unwrap();
        let children = registry.complete(parent);
        assert_eq!(children, vec![child]);
        assert!(registry.unit(parent).children().is_empty());
    }
}
