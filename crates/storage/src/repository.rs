use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::{
    LessonId, LessonProgress, LessonRef, ModuleId, ModuleProgress, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    /// Transient write-write conflict; the operation is safe to repeat.
    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── WRITE SHAPES ──────────────────────────────────────────────────────────────
//

/// Inputs for a step-navigation write.
///
/// `current_step_index` carries the raw caller value; backends clamp it
/// via `progress_core::model::clamp_step_index` so the stored index is
/// always in range. `time_spent_delta_secs` is a delta, never an
/// absolute value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepWrite {
    pub user_id: UserId,
    pub module_id: ModuleId,
    pub lesson_id: LessonId,
    pub current_step_index: i64,
    pub total_steps: u32,
    pub time_spent_delta_secs: u64,
    pub now: DateTime<Utc>,
}

/// Inputs for a lesson-completion write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionWrite {
    pub user_id: UserId,
    pub module_id: ModuleId,
    pub lesson_id: LessonId,
    pub total_steps: u32,
    pub time_spent_delta_secs: u64,
    pub now: DateTime<Utc>,
}

/// Rows touched by a step write, as stored after the transaction.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub module: ModuleProgress,
    pub lesson: LessonProgress,
}

/// Rows touched by a completion write, plus the transition facts the
/// caller needs for event emission.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub module: ModuleProgress,
    pub lesson: LessonProgress,
    /// True when this write flipped the lesson's completed flag
    /// false→true.
    pub lesson_newly_completed: bool,
    /// True when the cascade re-count set `completed_at` in this write.
    pub module_newly_completed: bool,
}

//
// ─── REPOSITORY CONTRACTS ──────────────────────────────────────────────────────
//

/// Repository contract for the two progress aggregates.
///
/// `record_step` and `record_completion` each run as one atomic unit of
/// work spanning the module-level and lesson-level upserts (and, for
/// completion, the cascade re-count); partial application is never
/// observable.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Fetch the module progress row for a (user, module) pair, creating
    /// it if absent. Idempotent; concurrent callers converge on one row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the row cannot be read or created.
    async fn ensure_module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        now: DateTime<Utc>,
    ) -> Result<ModuleProgress, StorageError>;

    /// Fetch the module progress row if it exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures; absence is `None`.
    async fn module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Option<ModuleProgress>, StorageError>;

    /// Fetch one lesson progress row if it exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures; absence is `None`.
    async fn lesson_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError>;

    /// Fetch every lesson progress row under a (user, module) pair.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn lesson_progress_for_module(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Vec<LessonProgress>, StorageError>;

    /// Apply a step-navigation write: upsert the module row (last
    /// accessed, additive time) and the lesson row (clamped index, total
    /// steps, additive time). Never touches the completed flag.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` on a transient write conflict;
    /// the caller may retry.
    async fn record_step(&self, write: &StepWrite) -> Result<StepOutcome, StorageError>;

    /// Apply a completion write: the step upsert with `completed = true`
    /// and the index snapped to the final step, then a live re-count of
    /// completed lessons over `active_lessons`. Sets the module's
    /// `completed_at` exactly when every active lesson is complete and it
    /// was still unset.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` on a transient write conflict;
    /// the caller may retry.
    async fn record_completion(
        &self,
        write: &CompletionWrite,
        active_lessons: &[LessonId],
    ) -> Result<CompletionOutcome, StorageError>;
}

/// Read-only curriculum metadata from the content collaborator.
#[async_trait]
pub trait CurriculumSource: Send + Sync {
    /// Active lessons of a module in authored order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn active_lessons(&self, module_id: ModuleId) -> Result<Vec<LessonRef>, StorageError>;

    /// Whether the module exists and is active.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn module_exists(&self, module_id: ModuleId) -> Result<bool, StorageError>;

    /// Whether the lesson exists and is active.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn lesson_exists(&self, lesson_id: LessonId) -> Result<bool, StorageError>;

    /// The module an active lesson belongs to.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures; absence is `None`.
    async fn lesson_owner(&self, lesson_id: LessonId) -> Result<Option<ModuleId>, StorageError>;
}

/// Lookup table from legacy content ids to canonical (module, lesson)
/// pairs, left over from the content migration.
#[async_trait]
pub trait LegacyIdMap: Send + Sync {
    /// Canonical pair for a legacy id, if mapped.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn canonical_for(
        &self,
        legacy_id: LessonId,
    ) -> Result<Option<(ModuleId, LessonId)>, StorageError>;

    /// Reverse lookup: the module recorded for an id that appears on the
    /// canonical side of the mapping. Some legacy ids map to themselves
    /// because the migration only partially completed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn module_for_canonical(
        &self,
        lesson_id: LessonId,
    ) -> Result<Option<ModuleId>, StorageError>;
}

//
// ─── IN-MEMORY IMPLEMENTATION ──────────────────────────────────────────────────
//

#[derive(Debug, Clone)]
struct LessonRow {
    module_id: ModuleId,
    order: u32,
    step_count: u32,
    active: bool,
}

#[derive(Default)]
struct CurriculumData {
    modules: HashMap<ModuleId, bool>,
    lessons: HashMap<LessonId, LessonRow>,
    legacy: HashMap<LessonId, (ModuleId, LessonId)>,
}

#[derive(Default)]
struct ProgressData {
    modules: HashMap<(UserId, ModuleId), ModuleProgress>,
    lessons: HashMap<(UserId, ModuleId), HashMap<LessonId, LessonProgress>>,
}

/// Simple in-memory repository implementation for testing and
/// prototyping.
///
/// A single mutex guards both progress maps so each write is as atomic
/// as a backend transaction.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    curriculum: Arc<Mutex<CurriculumData>>,
    progress: Arc<Mutex<ProgressData>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a module into the curriculum metadata.
    ///
    /// # Panics
    ///
    /// Panics if the curriculum lock is poisoned.
    pub fn insert_module(&self, module_id: ModuleId, active: bool) {
        let mut guard = self.curriculum.lock().expect("curriculum lock poisoned");
        guard.modules.insert(module_id, active);
    }

    /// Seeds a lesson under a module.
    ///
    /// # Panics
    ///
    /// Panics if the curriculum lock is poisoned.
    pub fn insert_lesson(&self, module_id: ModuleId, lesson: &LessonRef, active: bool) {
        let mut guard = self.curriculum.lock().expect("curriculum lock poisoned");
        guard.lessons.insert(
            lesson.lesson_id,
            LessonRow {
                module_id,
                order: lesson.order,
                step_count: lesson.step_count,
                active,
            },
        );
    }

    /// Seeds a legacy id mapping.
    ///
    /// # Panics
    ///
    /// Panics if the curriculum lock is poisoned.
    pub fn map_legacy_id(&self, legacy_id: LessonId, module_id: ModuleId, lesson_id: LessonId) {
        let mut guard = self.curriculum.lock().expect("curriculum lock poisoned");
        guard.legacy.insert(legacy_id, (module_id, lesson_id));
    }

    fn lock_curriculum(&self) -> Result<std::sync::MutexGuard<'_, CurriculumData>, StorageError> {
        self.curriculum
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn lock_progress(&self) -> Result<std::sync::MutexGuard<'_, ProgressData>, StorageError> {
        self.progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

fn ensure_module_entry<'a>(
    data: &'a mut ProgressData,
    user_id: UserId,
    module_id: ModuleId,
    now: DateTime<Utc>,
) -> &'a mut ModuleProgress {
    data.modules
        .entry((user_id, module_id))
        .or_insert_with(|| ModuleProgress::start(user_id, module_id, now))
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn ensure_module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        now: DateTime<Utc>,
    ) -> Result<ModuleProgress, StorageError> {
        let mut guard = self.lock_progress()?;
        Ok(ensure_module_entry(&mut guard, user_id, module_id, now).clone())
    }

    async fn module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Option<ModuleProgress>, StorageError> {
        let guard = self.lock_progress()?;
        Ok(guard.modules.get(&(user_id, module_id)).cloned())
    }

    async fn lesson_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        let guard = self.lock_progress()?;
        Ok(guard
            .lessons
            .get(&(user_id, module_id))
            .and_then(|lessons| lessons.get(&lesson_id))
            .cloned())
    }

    async fn lesson_progress_for_module(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        let guard = self.lock_progress()?;
        Ok(guard
            .lessons
            .get(&(user_id, module_id))
            .map(|lessons| lessons.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_step(&self, write: &StepWrite) -> Result<StepOutcome, StorageError> {
        let mut guard = self.lock_progress()?;

        let module = ensure_module_entry(&mut guard, write.user_id, write.module_id, write.now);
        module.record_access(write.lesson_id, write.time_spent_delta_secs, write.now);
        let module = module.clone();

        let lessons = guard
            .lessons
            .entry((write.user_id, write.module_id))
            .or_default();
        let lesson = match lessons.get_mut(&write.lesson_id) {
            Some(existing) => {
                existing
                    .record_step(
                        write.current_step_index,
                        write.total_steps,
                        write.time_spent_delta_secs,
                        write.now,
                    )
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                existing.clone()
            }
            None => {
                let mut fresh = LessonProgress::start(write.lesson_id, write.total_steps, write.now)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                fresh
                    .record_step(
                        write.current_step_index,
                        write.total_steps,
                        write.time_spent_delta_secs,
                        write.now,
                    )
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                lessons.insert(write.lesson_id, fresh.clone());
                fresh
            }
        };

        Ok(StepOutcome { module, lesson })
    }

    async fn record_completion(
        &self,
        write: &CompletionWrite,
        active_lessons: &[LessonId],
    ) -> Result<CompletionOutcome, StorageError> {
        let mut guard = self.lock_progress()?;

        {
            let module =
                ensure_module_entry(&mut guard, write.user_id, write.module_id, write.now);
            module.record_access(write.lesson_id, write.time_spent_delta_secs, write.now);
        }

        let lessons = guard
            .lessons
            .entry((write.user_id, write.module_id))
            .or_default();
        let (lesson, lesson_newly_completed) = match lessons.get_mut(&write.lesson_id) {
            Some(existing) => {
                let newly = existing
                    .complete(write.total_steps, write.time_spent_delta_secs, write.now)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                (existing.clone(), newly)
            }
            None => {
                let mut fresh = LessonProgress::start(write.lesson_id, write.total_steps, write.now)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let newly = fresh
                    .complete(write.total_steps, write.time_spent_delta_secs, write.now)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                lessons.insert(write.lesson_id, fresh.clone());
                (fresh, newly)
            }
        };

        // Live re-count against current state, not a drifting counter.
        let completed_count = active_lessons
            .iter()
            .filter(|id| {
                guard
                    .lessons
                    .get(&(write.user_id, write.module_id))
                    .and_then(|m| m.get(*id))
                    .is_some_and(LessonProgress::is_completed)
            })
            .count();
        let all_complete = !active_lessons.is_empty() && completed_count == active_lessons.len();

        let module = guard
            .modules
            .get_mut(&(write.user_id, write.module_id))
            .ok_or(StorageError::NotFound)?;
        let module_newly_completed = all_complete && module.complete(write.now);

        Ok(CompletionOutcome {
            module: module.clone(),
            lesson,
            lesson_newly_completed,
            module_newly_completed,
        })
    }
}

#[async_trait]
impl CurriculumSource for InMemoryRepository {
    async fn active_lessons(&self, module_id: ModuleId) -> Result<Vec<LessonRef>, StorageError> {
        let guard = self.lock_curriculum()?;
        let mut lessons: Vec<LessonRef> = guard
            .lessons
            .iter()
            .filter(|(_, row)| row.module_id == module_id && row.active)
            .map(|(id, row)| LessonRef::new(*id, row.order, row.step_count))
            .collect();
        lessons.sort_by_key(|lesson| (lesson.order, lesson.lesson_id));
        Ok(lessons)
    }

    async fn module_exists(&self, module_id: ModuleId) -> Result<bool, StorageError> {
        let guard = self.lock_curriculum()?;
        Ok(guard.modules.get(&module_id).copied().unwrap_or(false))
    }

    async fn lesson_exists(&self, lesson_id: LessonId) -> Result<bool, StorageError> {
        let guard = self.lock_curriculum()?;
        Ok(guard.lessons.get(&lesson_id).is_some_and(|row| row.active))
    }

    async fn lesson_owner(&self, lesson_id: LessonId) -> Result<Option<ModuleId>, StorageError> {
        let guard = self.lock_curriculum()?;
        Ok(guard
            .lessons
            .get(&lesson_id)
            .filter(|row| row.active)
            .map(|row| row.module_id))
    }
}

#[async_trait]
impl LegacyIdMap for InMemoryRepository {
    async fn canonical_for(
        &self,
        legacy_id: LessonId,
    ) -> Result<Option<(ModuleId, LessonId)>, StorageError> {
        let guard = self.lock_curriculum()?;
        Ok(guard.legacy.get(&legacy_id).copied())
    }

    async fn module_for_canonical(
        &self,
        lesson_id: LessonId,
    ) -> Result<Option<ModuleId>, StorageError> {
        let guard = self.lock_curriculum()?;
        Ok(guard
            .legacy
            .values()
            .find(|(_, canonical)| *canonical == lesson_id)
            .map(|(module_id, _)| *module_id))
    }
}

//
// ─── STORAGE AGGREGATE ─────────────────────────────────────────────────────────
//

/// Aggregates the repositories behind trait objects for easy backend
/// swapping.
#[derive(Clone)]
pub struct Storage {
    pub progress: Arc<dyn ProgressRepository>,
    pub curriculum: Arc<dyn CurriculumSource>,
    pub legacy_ids: Arc<dyn LegacyIdMap>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_in_memory(InMemoryRepository::new())
    }

    /// Build a `Storage` over an existing in-memory repository, so tests
    /// can keep a handle for seeding.
    #[must_use]
    pub fn with_in_memory(repo: InMemoryRepository) -> Self {
        let progress: Arc<dyn ProgressRepository> = Arc::new(repo.clone());
        let curriculum: Arc<dyn CurriculumSource> = Arc::new(repo.clone());
        let legacy_ids: Arc<dyn LegacyIdMap> = Arc::new(repo);
        Self {
            progress,
            curriculum,
            legacy_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::time::fixed_now;

    fn seed_module(repo: &InMemoryRepository, module: u64, lessons: &[(u64, u32)]) {
        let module_id = ModuleId::new(module);
        repo.insert_module(module_id, true);
        for (i, (lesson, steps)) in lessons.iter().enumerate() {
            let order = u32::try_from(i).unwrap();
            repo.insert_lesson(
                module_id,
                &LessonRef::new(LessonId::new(*lesson), order, *steps),
                true,
            );
        }
    }

    fn step_write(user: u64, module: u64, lesson: u64, index: i64, total: u32) -> StepWrite {
        StepWrite {
            user_id: UserId::new(user),
            module_id: ModuleId::new(module),
            lesson_id: LessonId::new(lesson),
            current_step_index: index,
            total_steps: total,
            time_spent_delta_secs: 0,
            now: fixed_now(),
        }
    }

    #[tokio::test]
    async fn ensure_module_progress_is_idempotent() {
        let repo = InMemoryRepository::new();
        let user = UserId::new(1);
        let module = ModuleId::new(2);

        let first = repo
            .ensure_module_progress(user, module, fixed_now())
            .await
            .unwrap();
        let later = fixed_now() + chrono::Duration::hours(1);
        let second = repo.ensure_module_progress(user, module, later).await.unwrap();

        assert_eq!(first.last_accessed_at(), second.last_accessed_at());
        assert_eq!(second.time_spent_secs(), 0);
    }

    #[tokio::test]
    async fn record_step_creates_both_rows_and_accumulates_time() {
        let repo = InMemoryRepository::new();
        let mut write = step_write(1, 2, 3, 2, 5);
        write.time_spent_delta_secs = 30;

        let first = repo.record_step(&write).await.unwrap();
        assert_eq!(first.lesson.current_step_index(), 2);
        assert_eq!(first.lesson.time_spent_secs(), 30);
        assert_eq!(first.module.time_spent_secs(), 30);
        assert_eq!(first.module.last_accessed_lesson_id(), Some(LessonId::new(3)));

        let second = repo.record_step(&write).await.unwrap();
        assert_eq!(second.lesson.current_step_index(), 2, "position is idempotent");
        assert_eq!(second.lesson.time_spent_secs(), 60, "time is additive");
        assert_eq!(second.module.time_spent_secs(), 60);
    }

    #[tokio::test]
    async fn record_step_clamps_out_of_range_index() {
        let repo = InMemoryRepository::new();

        let high = repo.record_step(&step_write(1, 2, 3, 11, 5)).await.unwrap();
        assert_eq!(high.lesson.current_step_index(), 4);

        let low = repo.record_step(&step_write(1, 2, 3, -7, 5)).await.unwrap();
        assert_eq!(low.lesson.current_step_index(), 0);
    }

    #[tokio::test]
    async fn completion_cascade_fires_only_when_all_lessons_complete() {
        let repo = InMemoryRepository::new();
        seed_module(&repo, 1, &[(10, 5), (11, 3)]);
        let active = [LessonId::new(10), LessonId::new(11)];

        let write = CompletionWrite {
            user_id: UserId::new(1),
            module_id: ModuleId::new(1),
            lesson_id: LessonId::new(10),
            total_steps: 5,
            time_spent_delta_secs: 0,
            now: fixed_now(),
        };
        let first = repo.record_completion(&write, &active).await.unwrap();
        assert!(first.lesson_newly_completed);
        assert!(!first.module_newly_completed);
        assert!(first.module.completed_at().is_none());

        let write = CompletionWrite {
            lesson_id: LessonId::new(11),
            total_steps: 3,
            ..write
        };
        let second = repo.record_completion(&write, &active).await.unwrap();
        assert!(second.lesson_newly_completed);
        assert!(second.module_newly_completed);
        assert!(second.module.completed_at().is_some());

        // Completing again reports no transitions and keeps the stamp.
        let third = repo.record_completion(&write, &active).await.unwrap();
        assert!(!third.lesson_newly_completed);
        assert!(!third.module_newly_completed);
        assert_eq!(third.module.completed_at(), second.module.completed_at());
    }

    #[tokio::test]
    async fn legacy_map_supports_both_directions() {
        let repo = InMemoryRepository::new();
        repo.map_legacy_id(LessonId::new(900), ModuleId::new(1), LessonId::new(10));

        let canonical = repo.canonical_for(LessonId::new(900)).await.unwrap();
        assert_eq!(canonical, Some((ModuleId::new(1), LessonId::new(10))));
        assert_eq!(repo.canonical_for(LessonId::new(10)).await.unwrap(), None);

        let owner = repo.module_for_canonical(LessonId::new(10)).await.unwrap();
        assert_eq!(owner, Some(ModuleId::new(1)));
    }

    #[tokio::test]
    async fn active_lessons_come_back_in_authored_order() {
        let repo = InMemoryRepository::new();
        let module_id = ModuleId::new(1);
        repo.insert_module(module_id, true);
        repo.insert_lesson(module_id, &LessonRef::new(LessonId::new(12), 2, 4), true);
        repo.insert_lesson(module_id, &LessonRef::new(LessonId::new(10), 0, 5), true);
        repo.insert_lesson(module_id, &LessonRef::new(LessonId::new(11), 1, 3), true);
        repo.insert_lesson(module_id, &LessonRef::new(LessonId::new(13), 3, 2), false);

        let lessons = repo.active_lessons(module_id).await.unwrap();
        let ids: Vec<u64> = lessons.iter().map(|l| l.lesson_id.value()).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(!repo.lesson_exists(LessonId::new(13)).await.unwrap());
    }
}
