//! Shared error types for the services crate.

use thiserror::Error;

use progress_core::model::{LessonId, ModuleId};
use storage::repository::StorageError;

/// Errors emitted by `ProgressService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error("total steps must be at least 1, got {0}")]
    InvalidTotalSteps(u32),

    #[error("time spent delta cannot be negative: {0}")]
    NegativeTimeDelta(i64),

    #[error("module not found: {0}")]
    ModuleNotFound(ModuleId),

    #[error("module {0} has no active lessons")]
    NoActiveLessons(ModuleId),

    #[error("identifier {0} could not be resolved to a lesson")]
    ResolutionFailed(LessonId),

    /// Write conflict persisted after the internal retry. The operation
    /// is idempotent with respect to its final stored state, so the
    /// caller may simply repeat the call.
    #[error("write conflict, retry the operation")]
    Retryable,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
