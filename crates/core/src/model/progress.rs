use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::ids::{LessonId, ModuleId, UserId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("total steps must be at least 1, got {0}")]
    InvalidTotalSteps(u32),
}

//
// ─── DERIVED VALUES ────────────────────────────────────────────────────────────
//

/// Clamps a raw, caller-supplied step index into `[0, total_steps)`.
///
/// Out-of-range positions are normalized rather than rejected; the stored
/// index is always a valid index into the lesson's steps.
#[must_use]
pub fn clamp_step_index(raw: i64, total_steps: u32) -> u32 {
    if raw <= 0 {
        return 0;
    }
    let max = u64::from(total_steps.saturating_sub(1));
    let raw = u64::try_from(raw).unwrap_or(u64::MAX);
    u32::try_from(raw.min(max)).unwrap_or(total_steps.saturating_sub(1))
}

/// Percentage of a lesson covered at the given (clamped) step index.
///
/// Derived, never stored: `floor((index + 1) / total * 100)`.
#[must_use]
pub fn progress_percentage(current_step_index: u32, total_steps: u32) -> u8 {
    if total_steps == 0 {
        return 0;
    }
    let index = u64::from(current_step_index.min(total_steps - 1));
    let pct = (index + 1) * 100 / u64::from(total_steps);
    u8::try_from(pct).unwrap_or(100)
}

/// Result of looking up a progress record that may not exist yet.
///
/// Absence of progress is a valid state, not an error: read paths map
/// `NotYetStarted` to a zero-valued view instead of surfacing not-found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressLookup<T> {
    Found(T),
    NotYetStarted,
}

impl<T> ProgressLookup<T> {
    #[must_use]
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(found) => Self::Found(found),
            None => Self::NotYetStarted,
        }
    }

    #[must_use]
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotYetStarted => None,
        }
    }
}

//
// ─── MODULE PROGRESS ───────────────────────────────────────────────────────────
//

/// A learner's engagement with one module.
///
/// Exactly one exists per (user, module) pair, enforced by a storage
/// uniqueness constraint. Created lazily on first resolved access; by the
/// time any operation returns it is never absent. Time only accumulates,
/// and `completed_at`, once set, is terminal for the enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleProgress {
    user_id: UserId,
    module_id: ModuleId,
    time_spent_secs: u64,
    last_accessed_lesson_id: Option<LessonId>,
    last_accessed_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl ModuleProgress {
    /// Creates a fresh record for a (user, module) pair.
    #[must_use]
    pub fn start(user_id: UserId, module_id: ModuleId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            module_id,
            time_spent_secs: 0,
            last_accessed_lesson_id: None,
            last_accessed_at: now,
            completed_at: None,
        }
    }

    /// Rehydrates a record from persisted storage.
    #[must_use]
    pub fn from_persisted(
        user_id: UserId,
        module_id: ModuleId,
        time_spent_secs: u64,
        last_accessed_lesson_id: Option<LessonId>,
        last_accessed_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            module_id,
            time_spent_secs,
            last_accessed_lesson_id,
            last_accessed_at,
            completed_at,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    #[must_use]
    pub fn time_spent_secs(&self) -> u64 {
        self.time_spent_secs
    }

    #[must_use]
    pub fn last_accessed_lesson_id(&self) -> Option<LessonId> {
        self.last_accessed_lesson_id
    }

    #[must_use]
    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_accessed_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Records an access to a lesson in this module.
    ///
    /// Bumps the last-accessed lesson and timestamp and accumulates the
    /// time delta. Time only increases; the delta is additive.
    pub fn record_access(&mut self, lesson_id: LessonId, delta_secs: u64, now: DateTime<Utc>) {
        self.last_accessed_lesson_id = Some(lesson_id);
        self.last_accessed_at = now;
        self.time_spent_secs = self.time_spent_secs.saturating_add(delta_secs);
    }

    /// Marks the module complete, returning whether this call was the
    /// transition.
    ///
    /// `completed_at` is set exactly once; later calls leave the original
    /// timestamp in place.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.completed_at = Some(now);
        true
    }
}

//
// ─── LESSON PROGRESS ───────────────────────────────────────────────────────────
//

/// The step-granular progress record for one lesson under a module
/// enrollment.
///
/// `total_steps` tracks the last value the caller observed, since content
/// length can change between visits; the stored index is re-clamped
/// against it on every write. The completed flag is sticky: step
/// navigation never flips it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonProgress {
    lesson_id: LessonId,
    current_step_index: u32,
    total_steps: u32,
    completed: bool,
    time_spent_secs: u64,
    last_accessed_at: DateTime<Utc>,
}

impl LessonProgress {
    /// Creates a fresh record at step 0 of the given lesson.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidTotalSteps` if `total_steps` is zero.
    pub fn start(
        lesson_id: LessonId,
        total_steps: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ProgressError> {
        if total_steps == 0 {
            return Err(ProgressError::InvalidTotalSteps(total_steps));
        }
        Ok(Self {
            lesson_id,
            current_step_index: 0,
            total_steps,
            completed: false,
            time_spent_secs: 0,
            last_accessed_at: now,
        })
    }

    /// Rehydrates a record from persisted storage.
    ///
    /// The index is re-clamped so a row persisted against an older,
    /// longer step count can never yield an out-of-range position.
    #[must_use]
    pub fn from_persisted(
        lesson_id: LessonId,
        current_step_index: u32,
        total_steps: u32,
        completed: bool,
        time_spent_secs: u64,
        last_accessed_at: DateTime<Utc>,
    ) -> Self {
        let total_steps = total_steps.max(1);
        Self {
            lesson_id,
            current_step_index: current_step_index.min(total_steps - 1),
            total_steps,
            completed,
            time_spent_secs,
            last_accessed_at,
        }
    }

    #[must_use]
    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    #[must_use]
    pub fn current_step_index(&self) -> u32 {
        self.current_step_index
    }

    #[must_use]
    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn time_spent_secs(&self) -> u64 {
        self.time_spent_secs
    }

    #[must_use]
    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_accessed_at
    }

    /// Percentage covered at the current position.
    #[must_use]
    pub fn percentage(&self) -> u8 {
        progress_percentage(self.current_step_index, self.total_steps)
    }

    /// Records a step navigation.
    ///
    /// The raw index is clamped into `[0, total_steps)`; position follows
    /// last-writer-wins. Time accumulates. The completed flag is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidTotalSteps` if `total_steps` is zero.
    pub fn record_step(
        &mut self,
        raw_index: i64,
        total_steps: u32,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<(), ProgressError> {
        if total_steps == 0 {
            return Err(ProgressError::InvalidTotalSteps(total_steps));
        }
        self.total_steps = total_steps;
        self.current_step_index = clamp_step_index(raw_index, total_steps);
        self.time_spent_secs = self.time_spent_secs.saturating_add(delta_secs);
        self.last_accessed_at = now;
        Ok(())
    }

    /// Marks the lesson complete, snapping the index to the final step.
    ///
    /// Returns whether this call transitioned the flag false→true.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidTotalSteps` if `total_steps` is zero.
    pub fn complete(
        &mut self,
        total_steps: u32,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, ProgressError> {
        if total_steps == 0 {
            return Err(ProgressError::InvalidTotalSteps(total_steps));
        }
        self.total_steps = total_steps;
        self.current_step_index = total_steps - 1;
        self.time_spent_secs = self.time_spent_secs.saturating_add(delta_secs);
        self.last_accessed_at = now;
        let newly = !self.completed;
        self.completed = true;
        Ok(newly)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn clamp_normalizes_out_of_range_indexes() {
        assert_eq!(clamp_step_index(-3, 5), 0);
        assert_eq!(clamp_step_index(0, 5), 0);
        assert_eq!(clamp_step_index(2, 5), 2);
        assert_eq!(clamp_step_index(4, 5), 4);
        assert_eq!(clamp_step_index(5, 5), 4);
        assert_eq!(clamp_step_index(i64::MAX, 5), 4);
        assert_eq!(clamp_step_index(7, 1), 0);
    }

    #[test]
    fn percentage_is_floored() {
        assert_eq!(progress_percentage(0, 5), 20);
        assert_eq!(progress_percentage(2, 5), 60);
        assert_eq!(progress_percentage(4, 5), 100);
        assert_eq!(progress_percentage(0, 3), 33);
        assert_eq!(progress_percentage(1, 3), 66);
        assert_eq!(progress_percentage(0, 1), 100);
    }

    #[test]
    fn module_time_only_accumulates() {
        let mut progress =
            ModuleProgress::start(UserId::new(1), ModuleId::new(1), fixed_now());
        progress.record_access(LessonId::new(10), 30, fixed_now());
        progress.record_access(LessonId::new(11), 0, fixed_now());
        progress.record_access(LessonId::new(11), 15, fixed_now());
        assert_eq!(progress.time_spent_secs(), 45);
        assert_eq!(progress.last_accessed_lesson_id(), Some(LessonId::new(11)));
    }

    #[test]
    fn module_completion_is_terminal() {
        let mut progress =
            ModuleProgress::start(UserId::new(1), ModuleId::new(1), fixed_now());
        assert!(progress.complete(fixed_now()));
        let first = progress.completed_at();

        let later = fixed_now() + chrono::Duration::days(1);
        assert!(!progress.complete(later));
        assert_eq!(progress.completed_at(), first);
    }

    #[test]
    fn lesson_start_rejects_zero_steps() {
        let err = LessonProgress::start(LessonId::new(1), 0, fixed_now()).unwrap_err();
        assert!(matches!(err, ProgressError::InvalidTotalSteps(0)));
    }

    #[test]
    fn record_step_clamps_and_keeps_completed_flag() {
        let mut progress = LessonProgress::start(LessonId::new(1), 5, fixed_now()).unwrap();
        progress.complete(5, 0, fixed_now()).unwrap();
        assert!(progress.is_completed());

        progress.record_step(99, 5, 10, fixed_now()).unwrap();
        assert_eq!(progress.current_step_index(), 4);
        assert!(progress.is_completed(), "step writes never un-complete");

        progress.record_step(-1, 5, 0, fixed_now()).unwrap();
        assert_eq!(progress.current_step_index(), 0);
        assert!(progress.is_completed());
    }

    #[test]
    fn record_step_reclamps_when_content_shrinks() {
        let mut progress = LessonProgress::start(LessonId::new(1), 10, fixed_now()).unwrap();
        progress.record_step(9, 10, 0, fixed_now()).unwrap();
        assert_eq!(progress.current_step_index(), 9);

        // Content now reports fewer steps; index follows the new bound.
        progress.record_step(9, 4, 0, fixed_now()).unwrap();
        assert_eq!(progress.current_step_index(), 3);
        assert_eq!(progress.total_steps(), 4);
    }

    #[test]
    fn complete_reports_transition_once() {
        let mut progress = LessonProgress::start(LessonId::new(1), 3, fixed_now()).unwrap();
        assert!(progress.complete(3, 20, fixed_now()).unwrap());
        assert!(!progress.complete(3, 5, fixed_now()).unwrap());
        assert_eq!(progress.current_step_index(), 2);
        assert_eq!(progress.time_spent_secs(), 25);
    }

    #[test]
    fn from_persisted_reclamps_stale_index() {
        let progress =
            LessonProgress::from_persisted(LessonId::new(1), 8, 4, false, 0, fixed_now());
        assert_eq!(progress.current_step_index(), 3);
    }

    #[test]
    fn lookup_maps_absence_to_not_yet_started() {
        let missing: ProgressLookup<u32> = ProgressLookup::from_option(None);
        assert_eq!(missing, ProgressLookup::NotYetStarted);
        assert_eq!(ProgressLookup::from_option(Some(7)).found(), Some(7));
    }
}
