use crate::checker::{EnvError, TypeError};
use crate::clauses::PatternError;
use crate::coverage::CoverageError;
use crate::equations::SolveError;
use crate::termination::TerminationError;
use thiserror::Error;

/// Recoverable errors of one elaboration unit.
#[derive(Debug, Error)]
pub enum ElabError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Termination(#[from] TerminationError),
}

pub trait ErrorReporter {
    fn report(&mut self, error: ElabError);
}

/// Collects everything reported to it, in order.
#[derive(Debug, Default)]
pub struct ListErrorReporter {
    pub errors: Vec<ElabError>,
}

impl ListErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_errors(self) -> Vec<ElabError> {
        self.errors
    }

    /// Rendered messages, one per error.
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

impl ErrorReporter for ListErrorReporter {
    fn report(&mut self, error: ElabError) {
        tracing::debug!(%error, "elaboration error");
        self.errors.push(error);
    }
}
