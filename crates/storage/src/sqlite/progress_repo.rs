use chrono::{DateTime, Utc};
use progress_core::model::{LessonId, LessonProgress, ModuleId, ModuleProgress, UserId, clamp_step_index};
use sqlx::{Row, Sqlite, Transaction};

use super::{
    SqliteRepository,
    mapping::{id_to_i64, map_lesson_progress_row, map_module_progress_row, map_sqlx_err},
};
use crate::repository::{
    CompletionOutcome, CompletionWrite, ProgressRepository, StepOutcome, StepWrite, StorageError,
};

const MODULE_PROGRESS_COLUMNS: &str =
    "id, user_id, module_id, time_spent_seconds, last_accessed_lesson_id, last_accessed_at, completed_at";

const LESSON_PROGRESS_COLUMNS: &str =
    "lesson_id, current_step_index, total_steps, completed, time_spent_seconds, last_accessed_at";

/// Upserts the module row for a write and returns (surrogate id, row).
///
/// `completed_at` is deliberately absent from the update set; module
/// completion is terminal.
async fn upsert_module_row(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: UserId,
    module_id: ModuleId,
    lesson_id: LessonId,
    delta_secs: u64,
    now: DateTime<Utc>,
) -> Result<(i64, ModuleProgress), StorageError> {
    sqlx::query(
        r"
        INSERT INTO module_progress (
            user_id, module_id, time_spent_seconds, last_accessed_lesson_id, last_accessed_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(user_id, module_id) DO UPDATE SET
            time_spent_seconds = module_progress.time_spent_seconds + excluded.time_spent_seconds,
            last_accessed_lesson_id = excluded.last_accessed_lesson_id,
            last_accessed_at = excluded.last_accessed_at
        ",
    )
    .bind(id_to_i64("user_id", user_id.value())?)
    .bind(id_to_i64("module_id", module_id.value())?)
    .bind(id_to_i64("time_spent_delta", delta_secs)?)
    .bind(id_to_i64("lesson_id", lesson_id.value())?)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;

    let row = sqlx::query(&format!(
        "SELECT {MODULE_PROGRESS_COLUMNS} FROM module_progress WHERE user_id = ?1 AND module_id = ?2"
    ))
    .bind(id_to_i64("user_id", user_id.value())?)
    .bind(id_to_i64("module_id", module_id.value())?)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;

    let owner_id: i64 = row
        .try_get("id")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok((owner_id, map_module_progress_row(&row)?))
}

async fn fetch_lesson_row(
    tx: &mut Transaction<'_, Sqlite>,
    owner_id: i64,
    lesson_id: LessonId,
) -> Result<LessonProgress, StorageError> {
    let row = sqlx::query(&format!(
        "SELECT {LESSON_PROGRESS_COLUMNS} FROM lesson_progress \
         WHERE module_progress_id = ?1 AND lesson_id = ?2"
    ))
    .bind(owner_id)
    .bind(id_to_i64("lesson_id", lesson_id.value())?)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    map_lesson_progress_row(&row)
}

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn ensure_module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        now: DateTime<Utc>,
    ) -> Result<ModuleProgress, StorageError> {
        sqlx::query(
            r"
            INSERT INTO module_progress (user_id, module_id, time_spent_seconds, last_accessed_at)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT(user_id, module_id) DO NOTHING
            ",
        )
        .bind(id_to_i64("user_id", user_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let row = sqlx::query(&format!(
            "SELECT {MODULE_PROGRESS_COLUMNS} FROM module_progress \
             WHERE user_id = ?1 AND module_id = ?2"
        ))
        .bind(id_to_i64("user_id", user_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        map_module_progress_row(&row)
    }

    async fn module_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Option<ModuleProgress>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {MODULE_PROGRESS_COLUMNS} FROM module_progress \
             WHERE user_id = ?1 AND module_id = ?2"
        ))
        .bind(id_to_i64("user_id", user_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(map_module_progress_row).transpose()
    }

    async fn lesson_progress(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT lp.lesson_id, lp.current_step_index, lp.total_steps, lp.completed,
                   lp.time_spent_seconds, lp.last_accessed_at
            FROM lesson_progress lp
            JOIN module_progress mp ON mp.id = lp.module_progress_id
            WHERE mp.user_id = ?1 AND mp.module_id = ?2 AND lp.lesson_id = ?3
            ",
        )
        .bind(id_to_i64("user_id", user_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .bind(id_to_i64("lesson_id", lesson_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(map_lesson_progress_row).transpose()
    }

    async fn lesson_progress_for_module(
        &self,
        user_id: UserId,
        module_id: ModuleId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT lp.lesson_id, lp.current_step_index, lp.total_steps, lp.completed,
                   lp.time_spent_seconds, lp.last_accessed_at
            FROM lesson_progress lp
            JOIN module_progress mp ON mp.id = lp.module_progress_id
            WHERE mp.user_id = ?1 AND mp.module_id = ?2
            ORDER BY lp.lesson_id ASC
            ",
        )
        .bind(id_to_i64("user_id", user_id.value())?)
        .bind(id_to_i64("module_id", module_id.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut lessons = Vec::with_capacity(rows.len());
        for row in &rows {
            lessons.push(map_lesson_progress_row(row)?);
        }
        Ok(lessons)
    }

    async fn record_step(&self, write: &StepWrite) -> Result<StepOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let (owner_id, module) = upsert_module_row(
            &mut tx,
            write.user_id,
            write.module_id,
            write.lesson_id,
            write.time_spent_delta_secs,
            write.now,
        )
        .await?;

        let clamped = clamp_step_index(write.current_step_index, write.total_steps);
        sqlx::query(
            r"
            INSERT INTO lesson_progress (
                module_progress_id, lesson_id, current_step_index, total_steps,
                completed, time_spent_seconds, last_accessed_at
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
            ON CONFLICT(module_progress_id, lesson_id) DO UPDATE SET
                -- completed is sticky; step navigation never touches it
                current_step_index = excluded.current_step_index,
                total_steps = excluded.total_steps,
                time_spent_seconds = lesson_progress.time_spent_seconds + excluded.time_spent_seconds,
                last_accessed_at = excluded.last_accessed_at
            ",
        )
        .bind(owner_id)
        .bind(id_to_i64("lesson_id", write.lesson_id.value())?)
        .bind(i64::from(clamped))
        .bind(i64::from(write.total_steps))
        .bind(id_to_i64("time_spent_delta", write.time_spent_delta_secs)?)
        .bind(write.now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let lesson = fetch_lesson_row(&mut tx, owner_id, write.lesson_id).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(StepOutcome { module, lesson })
    }

    async fn record_completion(
        &self,
        write: &CompletionWrite,
        active_lessons: &[LessonId],
    ) -> Result<CompletionOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let (owner_id, _) = upsert_module_row(
            &mut tx,
            write.user_id,
            write.module_id,
            write.lesson_id,
            write.time_spent_delta_secs,
            write.now,
        )
        .await?;

        let was_completed: Option<bool> = sqlx::query(
            "SELECT completed FROM lesson_progress \
             WHERE module_progress_id = ?1 AND lesson_id = ?2",
        )
        .bind(owner_id)
        .bind(id_to_i64("lesson_id", write.lesson_id.value())?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .map(|row| {
            row.try_get::<bool, _>("completed")
                .map_err(|e| StorageError::Serialization(e.to_string()))
        })
        .transpose()?;

        let final_step = i64::from(write.total_steps.saturating_sub(1));
        sqlx::query(
            r"
            INSERT INTO lesson_progress (
                module_progress_id, lesson_id, current_step_index, total_steps,
                completed, time_spent_seconds, last_accessed_at
            )
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
            ON CONFLICT(module_progress_id, lesson_id) DO UPDATE SET
                current_step_index = excluded.current_step_index,
                total_steps = excluded.total_steps,
                completed = MAX(lesson_progress.completed, excluded.completed),
                time_spent_seconds = lesson_progress.time_spent_seconds + excluded.time_spent_seconds,
                last_accessed_at = excluded.last_accessed_at
            ",
        )
        .bind(owner_id)
        .bind(id_to_i64("lesson_id", write.lesson_id.value())?)
        .bind(final_step)
        .bind(i64::from(write.total_steps))
        .bind(id_to_i64("time_spent_delta", write.time_spent_delta_secs)?)
        .bind(write.now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let lesson = fetch_lesson_row(&mut tx, owner_id, write.lesson_id).await?;
        let lesson_newly_completed = was_completed != Some(true);

        // Live re-count over the module's current active lesson set; a
        // drifting counter could never be trusted here.
        let mut module_newly_completed = false;
        if !active_lessons.is_empty() {
            let mut sql = String::from(
                "SELECT COUNT(*) AS n FROM lesson_progress \
                 WHERE module_progress_id = ?1 AND completed = 1 AND lesson_id IN (",
            );
            for i in 0..active_lessons.len() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
                sql.push_str(&(i + 2).to_string());
            }
            sql.push(')');

            let mut q = sqlx::query(&sql).bind(owner_id);
            for id in active_lessons {
                q = q.bind(id_to_i64("lesson_id", id.value())?);
            }
            let row = q.fetch_one(&mut *tx).await.map_err(map_sqlx_err)?;
            let completed_count: i64 = row
                .try_get("n")
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            if completed_count == i64::try_from(active_lessons.len()).unwrap_or(i64::MAX) {
                let updated = sqlx::query(
                    "UPDATE module_progress SET completed_at = ?1 \
                     WHERE id = ?2 AND completed_at IS NULL",
                )
                .bind(write.now)
                .bind(owner_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                module_newly_completed = updated.rows_affected() > 0;
            }
        }

        let row = sqlx::query(&format!(
            "SELECT {MODULE_PROGRESS_COLUMNS} FROM module_progress WHERE id = ?1"
        ))
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let module = map_module_progress_row(&row)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(CompletionOutcome {
            module,
            lesson,
            lesson_newly_completed,
            module_newly_completed,
        })
    }
}
