use progress_core::model::{LessonId, LessonRef, ModuleId};
use sqlx::Row;

use super::{
    SqliteRepository,
    mapping::{id_to_i64, lesson_id_from_i64, map_lesson_ref_row, map_sqlx_err, module_id_from_i64},
};
use crate::repository::{CurriculumSource, LegacyIdMap, StorageError};

#[async_trait::async_trait]
impl CurriculumSource for SqliteRepository {
    async fn active_lessons(&self, module_id: ModuleId) -> Result<Vec<LessonRef>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT l.id, l.position, l.step_count
            FROM lessons l
            JOIN modules m ON m.id = l.module_id
            WHERE l.module_id = ?1 AND l.active = 1 AND m.active = 1
            ORDER BY l.position ASC, l.id ASC
            ",
        )
        .bind(id_to_i64("module_id", module_id.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut lessons = Vec::with_capacity(rows.len());
        for row in &rows {
            lessons.push(map_lesson_ref_row(row)?);
        }
        Ok(lessons)
    }

    async fn module_exists(&self, module_id: ModuleId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM modules WHERE id = ?1 AND active = 1")
            .bind(id_to_i64("module_id", module_id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.is_some())
    }

    async fn lesson_exists(&self, lesson_id: LessonId) -> Result<bool, StorageError> {
        let row = sqlx::query(
            r"
            SELECT 1
            FROM lessons l
            JOIN modules m ON m.id = l.module_id
            WHERE l.id = ?1 AND l.active = 1 AND m.active = 1
            ",
        )
        .bind(id_to_i64("lesson_id", lesson_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.is_some())
    }

    async fn lesson_owner(&self, lesson_id: LessonId) -> Result<Option<ModuleId>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT l.module_id
            FROM lessons l
            JOIN modules m ON m.id = l.module_id
            WHERE l.id = ?1 AND l.active = 1 AND m.active = 1
            ",
        )
        .bind(id_to_i64("lesson_id", lesson_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            let module: i64 = row
                .try_get("module_id")
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            module_id_from_i64(module)
        })
        .transpose()
    }
}

#[async_trait::async_trait]
impl LegacyIdMap for SqliteRepository {
    async fn canonical_for(
        &self,
        legacy_id: LessonId,
    ) -> Result<Option<(ModuleId, LessonId)>, StorageError> {
        let row = sqlx::query(
            "SELECT module_id, lesson_id FROM legacy_lesson_ids WHERE legacy_id = ?1",
        )
        .bind(id_to_i64("legacy_id", legacy_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            let module: i64 = row
                .try_get("module_id")
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let lesson: i64 = row
                .try_get("lesson_id")
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((module_id_from_i64(module)?, lesson_id_from_i64(lesson)?))
        })
        .transpose()
    }

    async fn module_for_canonical(
        &self,
        lesson_id: LessonId,
    ) -> Result<Option<ModuleId>, StorageError> {
        let row = sqlx::query(
            "SELECT module_id FROM legacy_lesson_ids WHERE lesson_id = ?1 LIMIT 1",
        )
        .bind(id_to_i64("lesson_id", lesson_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            let module: i64 = row
                .try_get("module_id")
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            module_id_from_i64(module)
        })
        .transpose()
    }
}

/// Seeding helpers for development databases and integration tests.
///
/// Curriculum authoring proper lives outside this engine; these exist so
/// a local database can be stood up without it.
impl SqliteRepository {
    /// Insert or update a module row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the row cannot be stored.
    pub async fn upsert_module(&self, module_id: ModuleId, active: bool) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO modules (id, active)
            VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET active = excluded.active
            ",
        )
        .bind(id_to_i64("module_id", module_id.value())?)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Insert or update a lesson row under a module.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the row cannot be stored.
    pub async fn upsert_lesson(
        &self,
        module_id: ModuleId,
        lesson: &LessonRef,
        active: bool,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO lessons (id, module_id, position, step_count, active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                module_id = excluded.module_id,
                position = excluded.position,
                step_count = excluded.step_count,
                active = excluded.active
            ",
        )
        .bind(id_to_i64("lesson_id", lesson.lesson_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .bind(i64::from(lesson.order))
        .bind(i64::from(lesson.step_count))
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Record a legacy id → canonical (module, lesson) mapping.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the row cannot be stored.
    pub async fn map_legacy_id(
        &self,
        legacy_id: LessonId,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO legacy_lesson_ids (legacy_id, module_id, lesson_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(legacy_id) DO UPDATE SET
                module_id = excluded.module_id,
                lesson_id = excluded.lesson_id
            ",
        )
        .bind(id_to_i64("legacy_id", legacy_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .bind(id_to_i64("lesson_id", lesson_id.value())?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}
