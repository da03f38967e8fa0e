use std::sync::Arc;

use serde::{Deserialize, Serialize};

use progress_core::model::{LessonId, ModuleId};
use storage::repository::{CurriculumSource, LegacyIdMap};

use crate::error::ProgressServiceError;

/// A supplied identifier reconciled to its canonical storage address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLesson {
    pub module_id: ModuleId,
    pub lesson_id: LessonId,
}

/// Reconciles caller-supplied content identifiers against the canonical
/// lesson/module identifiers used for storage.
///
/// Callers may hold ids from either side of the content migration; both
/// read and write paths resolve here first so progress recorded under
/// either generation lands on the same stored record. Resolution is
/// deterministic and performs reads only.
pub struct IdentifierResolver {
    curriculum: Arc<dyn CurriculumSource>,
    legacy_ids: Arc<dyn LegacyIdMap>,
}

impl IdentifierResolver {
    #[must_use]
    pub fn new(curriculum: Arc<dyn CurriculumSource>, legacy_ids: Arc<dyn LegacyIdMap>) -> Self {
        Self {
            curriculum,
            legacy_ids,
        }
    }

    /// Resolve a supplied id, first match wins:
    ///
    /// 1. the id is a canonical, active lesson;
    /// 2. the id appears on the legacy side of the migration mapping;
    /// 3. the id appears on the canonical side of the mapping (some
    ///    legacy ids map to themselves because the migration only
    ///    partially completed);
    /// 4. the module hint names an existing, active module — accept the
    ///    id as canonical under it (not-yet-migrated content).
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ResolutionFailed` when no rule
    /// matches, or a storage error from the underlying lookups.
    pub async fn resolve(
        &self,
        supplied: LessonId,
        module_hint: Option<ModuleId>,
    ) -> Result<ResolvedLesson, ProgressServiceError> {
        if let Some(module_id) = self.curriculum.lesson_owner(supplied).await? {
            return Ok(ResolvedLesson {
                module_id,
                lesson_id: supplied,
            });
        }

        if let Some((module_id, lesson_id)) = self.legacy_ids.canonical_for(supplied).await? {
            return Ok(ResolvedLesson {
                module_id,
                lesson_id,
            });
        }

        if let Some(module_id) = self.legacy_ids.module_for_canonical(supplied).await? {
            return Ok(ResolvedLesson {
                module_id,
                lesson_id: supplied,
            });
        }

        if let Some(hint) = module_hint {
            if self.curriculum.module_exists(hint).await? {
                return Ok(ResolvedLesson {
                    module_id: hint,
                    lesson_id: supplied,
                });
            }
        }

        Err(ProgressServiceError::ResolutionFailed(supplied))
    }

    /// Like [`resolve`](Self::resolve), but maps a failed resolution to
    /// `None` for callers that treat it as an answer rather than an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying lookups.
    pub async fn try_resolve(
        &self,
        supplied: LessonId,
        module_hint: Option<ModuleId>,
    ) -> Result<Option<ResolvedLesson>, ProgressServiceError> {
        match self.resolve(supplied, module_hint).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(ProgressServiceError::ResolutionFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::model::LessonRef;
    use storage::repository::InMemoryRepository;

    fn resolver_over(repo: &InMemoryRepository) -> IdentifierResolver {
        IdentifierResolver::new(Arc::new(repo.clone()), Arc::new(repo.clone()))
    }

    fn seed(repo: &InMemoryRepository) {
        let module = ModuleId::new(1);
        repo.insert_module(module, true);
        repo.insert_lesson(module, &LessonRef::new(LessonId::new(10), 0, 5), true);
        repo.insert_lesson(module, &LessonRef::new(LessonId::new(11), 1, 3), true);
        // 910 was migrated onto 10; 11 kept its id through the migration.
        repo.map_legacy_id(LessonId::new(910), module, LessonId::new(10));
        repo.map_legacy_id(LessonId::new(11), module, LessonId::new(11));
    }

    #[tokio::test]
    async fn canonical_id_resolves_directly() {
        let repo = InMemoryRepository::new();
        seed(&repo);

        let resolved = resolver_over(&repo)
            .resolve(LessonId::new(10), None)
            .await
            .unwrap();
        assert_eq!(resolved.module_id, ModuleId::new(1));
        assert_eq!(resolved.lesson_id, LessonId::new(10));
    }

    #[tokio::test]
    async fn legacy_id_maps_to_canonical_pair() {
        let repo = InMemoryRepository::new();
        seed(&repo);

        let resolved = resolver_over(&repo)
            .resolve(LessonId::new(910), None)
            .await
            .unwrap();
        assert_eq!(resolved.lesson_id, LessonId::new(10));
        assert_eq!(resolved.module_id, ModuleId::new(1));
    }

    #[tokio::test]
    async fn reverse_lookup_accepts_self_mapped_id() {
        let repo = InMemoryRepository::new();
        // Mapping exists, but the lesson was never inserted as canonical
        // content (migration stopped half way).
        repo.map_legacy_id(LessonId::new(42), ModuleId::new(2), LessonId::new(42));

        let resolved = resolver_over(&repo)
            .resolve(LessonId::new(42), None)
            .await
            .unwrap();
        assert_eq!(resolved.module_id, ModuleId::new(2));
        assert_eq!(resolved.lesson_id, LessonId::new(42));
    }

    #[tokio::test]
    async fn module_hint_is_the_last_resort() {
        let repo = InMemoryRepository::new();
        repo.insert_module(ModuleId::new(3), true);

        let resolver = resolver_over(&repo);
        let resolved = resolver
            .resolve(LessonId::new(77), Some(ModuleId::new(3)))
            .await
            .unwrap();
        assert_eq!(resolved.module_id, ModuleId::new(3));
        assert_eq!(resolved.lesson_id, LessonId::new(77));

        // An inactive hint does not rescue the id.
        repo.insert_module(ModuleId::new(4), false);
        let err = resolver
            .resolve(LessonId::new(77), Some(ModuleId::new(4)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressServiceError::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn unresolvable_id_fails_and_try_resolve_returns_none() {
        let repo = InMemoryRepository::new();
        seed(&repo);
        let resolver = resolver_over(&repo);

        let err = resolver.resolve(LessonId::new(777), None).await.unwrap_err();
        assert!(matches!(
            err,
            ProgressServiceError::ResolutionFailed(id) if id == LessonId::new(777)
        ));

        let none = resolver.try_resolve(LessonId::new(777), None).await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn canonical_lookup_wins_over_mapping_and_hint() {
        let repo = InMemoryRepository::new();
        seed(&repo);
        // 11 exists canonically and also appears in the mapping; the
        // direct lookup must win, hint or not.
        let resolved = resolver_over(&repo)
            .resolve(LessonId::new(11), Some(ModuleId::new(9)))
            .await
            .unwrap();
        assert_eq!(resolved.module_id, ModuleId::new(1));
        assert_eq!(resolved.lesson_id, LessonId::new(11));
    }
}
