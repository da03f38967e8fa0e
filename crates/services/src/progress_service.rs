use std::collections::HashMap;

use progress_core::Clock;
use progress_core::model::{
    CompletionEvent, LessonDetail, LessonId, LessonProgress, ModuleId, ProgressLookup,
    ResumeState, StepResult, UserId,
};
use storage::repository::{
    CompletionOutcome, CompletionWrite, StepOutcome, StepWrite, Storage, StorageError,
};

use crate::cache::{ModuleSnapshot, ProgressCache};
use crate::error::ProgressServiceError;
use crate::events::CompletionEventEmitter;
use crate::resolver::{IdentifierResolver, ResolvedLesson};

//
// ─── PROGRESS SERVICE ──────────────────────────────────────────────────────────
//

/// The progress & resume engine: step writes, the completion cascade,
/// and the resume read path, over resolved canonical identifiers.
///
/// Each mutation is one atomic unit of work at the repository; this
/// layer adds validation, identifier resolution, the bounded conflict
/// retry, cache invalidation, and event emission.
pub struct ProgressService {
    storage: Storage,
    resolver: IdentifierResolver,
    cache: ProgressCache,
    events: CompletionEventEmitter,
    clock: Clock,
}

impl ProgressService {
    #[must_use]
    pub fn new(storage: Storage, events: CompletionEventEmitter) -> Self {
        let resolver =
            IdentifierResolver::new(storage.curriculum.clone(), storage.legacy_ids.clone());
        Self {
            storage,
            resolver,
            cache: ProgressCache::with_default_ttl(),
            events,
            clock: Clock::default_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ProgressCache) -> Self {
        self.cache = cache;
        self
    }

    /// Record a step navigation.
    ///
    /// Any integer index is accepted and clamped into
    /// `[0, total_steps)`; the completed flag is untouched. Time deltas
    /// accumulate on both the lesson and module rows.
    ///
    /// # Errors
    ///
    /// `InvalidTotalSteps` / `NegativeTimeDelta` for malformed inputs,
    /// `ResolutionFailed` / `ModuleNotFound` at the metadata boundary,
    /// `Retryable` when a write conflict survives the internal retry.
    pub async fn update_step_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
        current_step_index: i64,
        total_steps: u32,
        time_spent_delta: i64,
    ) -> Result<StepResult, ProgressServiceError> {
        let delta_secs = validate_write(total_steps, time_spent_delta)?;
        let resolved = self.resolve_for_write(module_id, lesson_id).await?;

        let write = StepWrite {
            user_id,
            module_id: resolved.module_id,
            lesson_id: resolved.lesson_id,
            current_step_index,
            total_steps,
            time_spent_delta_secs: delta_secs,
            now: self.clock.now(),
        };
        let outcome = self.record_step_with_retry(&write).await?;

        self.cache.invalidate(user_id);
        Ok(StepResult::from_progress(&outcome.lesson))
    }

    /// Mark a lesson complete and run the module completion cascade.
    ///
    /// The index snaps to the final step and the completed flag becomes
    /// (and stays) true. Within the same unit of work, the module's
    /// active lessons are re-counted; when every one is complete and
    /// `completed_at` is still unset, it is set now. Completion facts go
    /// to the achievement collaborator fire-and-forget.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`update_step_progress`](Self::update_step_progress).
    pub async fn mark_lesson_complete(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
        total_steps: u32,
        time_spent_delta: i64,
    ) -> Result<StepResult, ProgressServiceError> {
        let delta_secs = validate_write(total_steps, time_spent_delta)?;
        let resolved = self.resolve_for_write(module_id, lesson_id).await?;

        let active = self
            .storage
            .curriculum
            .active_lessons(resolved.module_id)
            .await?;
        let active_ids: Vec<LessonId> = active.iter().map(|l| l.lesson_id).collect();

        let write = CompletionWrite {
            user_id,
            module_id: resolved.module_id,
            lesson_id: resolved.lesson_id,
            total_steps,
            time_spent_delta_secs: delta_secs,
            now: self.clock.now(),
        };
        let outcome = self.record_completion_with_retry(&write, &active_ids).await?;

        self.cache.invalidate(user_id);

        if outcome.lesson_newly_completed {
            self.events.emit(CompletionEvent::lesson_completed(
                user_id,
                resolved.lesson_id,
                write.now,
            ));
        }
        if outcome.module_newly_completed {
            self.events.emit(CompletionEvent::module_completed(
                user_id,
                resolved.module_id,
                write.now,
            ));
        }

        Ok(StepResult::from_progress(&outcome.lesson))
    }

    /// Compute where the learner should resume within a module.
    ///
    /// The first active lesson (in authored order) without a completed
    /// progress record is the target; a fully completed module resumes
    /// at its last lesson. Recomputed from current storage on every
    /// call — the lesson list can legitimately change between calls.
    ///
    /// # Errors
    ///
    /// `ModuleNotFound` for an unknown or inactive module,
    /// `NoActiveLessons` when the module has no resumable content.
    pub async fn get_resume_state(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<ResumeState, ProgressServiceError> {
        if !self.storage.curriculum.module_exists(module_id).await? {
            return Err(ProgressServiceError::ModuleNotFound(module_id));
        }
        let active = self.storage.curriculum.active_lessons(module_id).await?;
        if active.is_empty() {
            return Err(ProgressServiceError::NoActiveLessons(module_id));
        }

        let snapshot = self.module_snapshot(user_id, module_id).await?;
        let by_lesson: HashMap<LessonId, &LessonProgress> = snapshot
            .lessons
            .iter()
            .map(|p| (p.lesson_id(), p))
            .collect();

        let is_lesson_complete = |lesson_id: LessonId| {
            by_lesson
                .get(&lesson_id)
                .is_some_and(|p| p.is_completed())
        };

        let completed_lessons = active
            .iter()
            .filter(|l| is_lesson_complete(l.lesson_id))
            .count();

        // First incomplete lesson wins; a finished module still answers
        // deterministically with its last lesson.
        let target = active
            .iter()
            .find(|l| !is_lesson_complete(l.lesson_id))
            .or_else(|| active.last())
            .ok_or(ProgressServiceError::NoActiveLessons(module_id))?;

        let (current_step_index, total_steps_in_lesson) = match by_lesson.get(&target.lesson_id) {
            Some(progress) => (progress.current_step_index(), progress.total_steps()),
            None => (0, target.step_count.max(1)),
        };

        let total_lessons = active.len();
        let module_progress =
            u8::try_from(completed_lessons * 100 / total_lessons).unwrap_or(100);

        Ok(ResumeState {
            module_id,
            current_lesson_id: target.lesson_id,
            current_step_index,
            total_steps_in_lesson,
            module_progress,
            total_lessons: u32::try_from(total_lessons).unwrap_or(u32::MAX),
            completed_lessons: u32::try_from(completed_lessons).unwrap_or(u32::MAX),
            is_module_complete: snapshot.module.is_complete(),
            last_accessed_at: snapshot.module.last_accessed_at(),
        })
    }

    /// Step-granular detail for one lesson.
    ///
    /// A learner who never opened the lesson gets the zero-valued shape;
    /// absence of progress is a valid state, not an error.
    ///
    /// # Errors
    ///
    /// `ResolutionFailed` / `ModuleNotFound` at the metadata boundary.
    pub async fn get_lesson_progress_details(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<LessonDetail, ProgressServiceError> {
        let resolved = self.resolve_for_write(module_id, lesson_id).await?;

        let stored = self
            .storage
            .progress
            .lesson_progress(user_id, resolved.module_id, resolved.lesson_id)
            .await?;

        match ProgressLookup::from_option(stored) {
            ProgressLookup::Found(progress) => Ok(LessonDetail::from_progress(&progress)),
            ProgressLookup::NotYetStarted => {
                let authored_steps = self
                    .storage
                    .curriculum
                    .active_lessons(resolved.module_id)
                    .await?
                    .iter()
                    .find(|l| l.lesson_id == resolved.lesson_id)
                    .map_or(1, |l| l.step_count);
                Ok(LessonDetail::not_yet_started(resolved.lesson_id, authored_steps))
            }
        }
    }

    /// Reconcile a supplied identifier to its canonical address, or
    /// `None` when it cannot be mapped.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying lookups.
    pub async fn resolve_identifier(
        &self,
        supplied: LessonId,
        module_hint: Option<ModuleId>,
    ) -> Result<Option<ResolvedLesson>, ProgressServiceError> {
        self.resolver.try_resolve(supplied, module_hint).await
    }

    //
    // ─── INTERNAL ──────────────────────────────────────────────────────────────
    //

    async fn resolve_for_write(
        &self,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<ResolvedLesson, ProgressServiceError> {
        let resolved = self.resolver.resolve(lesson_id, Some(module_id)).await?;
        if !self
            .storage
            .curriculum
            .module_exists(resolved.module_id)
            .await?
        {
            return Err(ProgressServiceError::ModuleNotFound(resolved.module_id));
        }
        Ok(resolved)
    }

    /// Read-through snapshot of a user's progress in a module, creating
    /// the module row lazily on first access.
    async fn module_snapshot(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<ModuleSnapshot, ProgressServiceError> {
        let now = self.clock.now();
        if let Some(snapshot) = self.cache.get(user_id, module_id, now) {
            return Ok(snapshot);
        }

        let module = self
            .storage
            .progress
            .ensure_module_progress(user_id, module_id, now)
            .await?;
        let lessons = self
            .storage
            .progress
            .lesson_progress_for_module(user_id, module_id)
            .await?;
        let snapshot = ModuleSnapshot { module, lessons };
        self.cache.put(user_id, module_id, snapshot.clone(), now);
        Ok(snapshot)
    }

    async fn record_step_with_retry(
        &self,
        write: &StepWrite,
    ) -> Result<StepOutcome, ProgressServiceError> {
        match self.storage.progress.record_step(write).await {
            Err(StorageError::Conflict) => match self.storage.progress.record_step(write).await {
                Err(StorageError::Conflict) => Err(ProgressServiceError::Retryable),
                other => other.map_err(Into::into),
            },
            other => other.map_err(Into::into),
        }
    }

    async fn record_completion_with_retry(
        &self,
        write: &CompletionWrite,
        active_lessons: &[LessonId],
    ) -> Result<CompletionOutcome, ProgressServiceError> {
        match self
            .storage
            .progress
            .record_completion(write, active_lessons)
            .await
        {
            Err(StorageError::Conflict) => {
                match self
                    .storage
                    .progress
                    .record_completion(write, active_lessons)
                    .await
                {
                    Err(StorageError::Conflict) => Err(ProgressServiceError::Retryable),
                    other => other.map_err(Into::into),
                }
            }
            other => other.map_err(Into::into),
        }
    }
}

fn validate_write(total_steps: u32, time_spent_delta: i64) -> Result<u64, ProgressServiceError> {
    if total_steps == 0 {
        return Err(ProgressServiceError::InvalidTotalSteps(total_steps));
    }
    u64::try_from(time_spent_delta)
        .map_err(|_| ProgressServiceError::NegativeTimeDelta(time_spent_delta))
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
