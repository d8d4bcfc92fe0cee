//! Tri-state result of the retry and wait coordinators.

use crate::error::StepError;

/// Outcome of a coordinated operation.
///
/// `Suppressed` carries the error a `failSilently` policy absorbed, so the
/// caller can log it while carrying on.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    Success(T),
    Failure(StepError),
    Suppressed(StepError),
}

impl<T> StepOutcome<T> {
    /// Failure or suppression depending on the silent flag.
    pub fn from_error(error: StepError, fail_silently: bool) -> Self {
        // Cancellation is never absorbed
        if fail_silently && !error.is_cancelled() {
            Self::Suppressed(error)
        } else {
            Self::Failure(error)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed(_))
    }

    /// Collapses the outcome: suppressed errors become `fallback`.
    pub fn into_result(self, fallback: impl FnOnce() -> T) -> Result<T, StepError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Suppressed(_) => Ok(fallback()),
            Self::Failure(error) => Err(error),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            Self::Success(value) => StepOutcome::Success(f(value)),
            Self::Failure(error) => StepOutcome::Failure(error),
            Self::Suppressed(error) => StepOutcome::Suppressed(error),
        }
    }
}
