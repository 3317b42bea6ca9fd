use std::fmt;

mod sink;

pub use sink::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
    /// An internal inconsistency in the compiler itself, reported to the user so that it can be
    /// filed as a defect rather than silently mangling their program.
    Bug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Bug => "bug",
        })
    }
}

/// A single user-facing message produced while processing a unit.
///
/// Diagnostics carry no source spans; the engine only knows units and passes, and the language
/// extension producing the diagnostic is responsible for putting enough context in the message.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Key of the unit the diagnostic was reported against, if any.
    pub unit: Option<String>,
    /// Name of the pass that reported the diagnostic, if any.
    pub pass: Option<String>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            unit: None,
            pass: None,
            notes: vec![],
        }
    }

    pub fn bug(error: impl ToString) -> Self {
        Self::new(Severity::Bug, error.to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(Severity::Note, message)
    }

    pub fn in_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn during(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.severity)?;
        if let Some(unit) = &self.unit {
            write!(f, "[{unit}]")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(pass) = &self.pass {
            write!(f, " (during {pass})")?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}
