use std::rc::Rc;

use indexmap::IndexMap;

use crate::fault::ScheduleFault;

/// One step of a pipeline template.
#[derive(Debug, Clone)]
pub struct Step {
    pub token: Rc<str>,
    /// Barrier steps do not execute extension work; they force every other registered unit up to
    /// its own pass for `token` before the owning unit may proceed.
    pub barrier: bool,
}

/// The ordered pass template for one kind of unit.
///
/// A pipeline is pure data; the behavior of each step is supplied by the extension's
/// [`execute_pass`][crate::Extension::execute_pass]. Pipelines are fixed once scheduling starts.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an executable pass for `token`.
    pub fn then(mut self, token: impl Into<Rc<str>>) -> Self {
        self.steps.push(Step {
            token: token.into(),
            barrier: false,
        });
        self
    }

    /// Appends a barrier: every other unit known to the registry must reach its pass for `token`
    /// before the owning unit continues. Barriers encode soundness and cannot be skipped.
    pub fn barrier(mut self, token: impl Into<Rc<str>>) -> Self {
        self.steps.push(Step {
            token: token.into(),
            barrier: true,
        });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// All pipelines registered for a compile session, keyed by unit kind.
#[derive(Debug, Default)]
pub struct PipelineSet {
    pipelines: IndexMap<Rc<str>, Pipeline>,
    locked: bool,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: impl Into<Rc<str>>,
        pipeline: Pipeline,
    ) -> Result<(), ScheduleFault> {
        if self.locked {
            return Err(ScheduleFault::ConfigurationLocked);
        }
        self.pipelines.insert(kind.into(), pipeline);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Pipeline> {
        self.pipelines.get(kind)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_fails_once_locked() {
        let mut set = PipelineSet::new();
        set.register("module", Pipeline::new().then("parse"))
            .unwrap();
        set.lock();
        assert!(matches!(
            set.register("other", Pipeline::new()),
            Err(ScheduleFault::ConfigurationLocked)
        ));
        assert!(set.get("module").is_some());
    }

    #[test]
    fn steps_keep_their_order() {
        let pipeline = Pipeline::new()
            .then("parse")
            .then("build-types")
            .barrier("build-types")
            .then("disambiguate");
        let tokens: Vec<_> = pipeline
            .steps()
            .iter()
            .map(|step| (&*step.token, step.barrier))
            .collect();
        assert_eq!(
            tokens,
            vec![
                ("parse", false),
                ("build-types", false),
                ("build-types", true),
                ("disambiguate", false),
            ]
        );
    }
}
