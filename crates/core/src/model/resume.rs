use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{LessonId, ModuleId};
use crate::model::progress::{LessonProgress, progress_percentage};

/// Outcome of a step-progress or completion write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub lesson_id: LessonId,
    pub current_step_index: u32,
    pub total_steps: u32,
    pub completed: bool,
    pub progress_percentage: u8,
}

impl StepResult {
    /// Builds the result view over a stored lesson record.
    #[must_use]
    pub fn from_progress(progress: &LessonProgress) -> Self {
        Self {
            lesson_id: progress.lesson_id(),
            current_step_index: progress.current_step_index(),
            total_steps: progress.total_steps(),
            completed: progress.is_completed(),
            progress_percentage: progress.percentage(),
        }
    }
}

/// The computed "where should this learner resume?" answer for a module.
///
/// Always derived from current storage and the module's current active
/// lesson set; never a stored pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub module_id: ModuleId,
    pub current_lesson_id: LessonId,
    pub current_step_index: u32,
    pub total_steps_in_lesson: u32,
    /// Floor percentage of completed lessons over total lessons.
    pub module_progress: u8,
    pub total_lessons: u32,
    pub completed_lessons: u32,
    pub is_module_complete: bool,
    pub last_accessed_at: DateTime<Utc>,
}

/// Step-granular detail for one lesson, readable before any progress
/// exists.
///
/// A learner who never opened the lesson gets the zero-valued shape
/// rather than a not-found error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonDetail {
    pub lesson_id: LessonId,
    pub current_step_index: u32,
    pub total_steps: u32,
    pub completed: bool,
    pub progress_percentage: u8,
    pub time_spent_secs: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl LessonDetail {
    /// Detail view over a stored record.
    #[must_use]
    pub fn from_progress(progress: &LessonProgress) -> Self {
        Self {
            lesson_id: progress.lesson_id(),
            current_step_index: progress.current_step_index(),
            total_steps: progress.total_steps(),
            completed: progress.is_completed(),
            progress_percentage: progress.percentage(),
            time_spent_secs: progress.time_spent_secs(),
            last_accessed_at: Some(progress.last_accessed_at()),
        }
    }

    /// Zero-valued detail for a lesson the learner has not opened yet.
    #[must_use]
    pub fn not_yet_started(lesson_id: LessonId, authored_step_count: u32) -> Self {
        let total_steps = authored_step_count.max(1);
        Self {
            lesson_id,
            current_step_index: 0,
            total_steps,
            completed: false,
            progress_percentage: progress_percentage(0, total_steps),
            time_spent_secs: 0,
            last_accessed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn step_result_reflects_stored_position() {
        let mut progress = LessonProgress::start(LessonId::new(1), 5, fixed_now()).unwrap();
        progress.record_step(2, 5, 30, fixed_now()).unwrap();

        let result = StepResult::from_progress(&progress);
        assert_eq!(result.current_step_index, 2);
        assert_eq!(result.total_steps, 5);
        assert!(!result.completed);
        assert_eq!(result.progress_percentage, 60);
    }

    #[test]
    fn not_yet_started_detail_is_zero_valued() {
        let detail = LessonDetail::not_yet_started(LessonId::new(9), 4);
        assert_eq!(detail.current_step_index, 0);
        assert_eq!(detail.total_steps, 4);
        assert!(!detail.completed);
        assert_eq!(detail.time_spent_secs, 0);
        assert_eq!(detail.last_accessed_at, None);
        assert_eq!(detail.progress_percentage, 25);
    }
}
