use thiserror::Error;

/// An internal-consistency violation in the scheduling machinery.
///
/// Faults are always fatal and never retried: they mean the pipeline definition or registry usage
/// is wrong, not that the program being compiled is wrong. Pass-level failures are recorded on
/// units instead and reported in aggregate.
#[derive(Debug, Error)]
pub enum ScheduleFault {
    #[error("cyclic scheduling detected: {0}")]
    CyclicScheduling(String),

    #[error("unit `{0}` has already completed and been freed; it cannot be requested again")]
    ReuseOfCompletedUnit(String),

    #[error("pipelines cannot be modified once scheduling has started")]
    ConfigurationLocked,

    #[error("unit `{unit}` has no pass for goal `{goal}`")]
    PassNotFound { unit: String, goal: String },

    #[error("no pipeline is registered for unit kind `{0}`")]
    MissingPipeline(String),
}
