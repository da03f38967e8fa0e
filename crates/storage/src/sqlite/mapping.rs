use progress_core::model::{LessonId, LessonProgress, LessonRef, ModuleId, ModuleProgress, UserId};
use sqlx::Row;

use crate::repository::StorageError;

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn i64_to_u32(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} out of range: {v}")))
}

pub(crate) fn user_id_from_i64(v: i64) -> Result<UserId, StorageError> {
    Ok(UserId::new(i64_to_u64("user_id", v)?))
}

pub(crate) fn module_id_from_i64(v: i64) -> Result<ModuleId, StorageError> {
    Ok(ModuleId::new(i64_to_u64("module_id", v)?))
}

pub(crate) fn lesson_id_from_i64(v: i64) -> Result<LessonId, StorageError> {
    Ok(LessonId::new(i64_to_u64("lesson_id", v)?))
}

pub(crate) fn id_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

/// Maps an error from sqlx, picking out the transient lock/uniqueness
/// failures that a caller may safely retry.
pub(crate) fn map_sqlx_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) => {
            let message = db.message();
            if db.is_unique_violation()
                || message.contains("database is locked")
                || message.contains("database table is locked")
            {
                StorageError::Conflict
            } else {
                StorageError::Connection(e.to_string())
            }
        }
        sqlx::Error::RowNotFound => StorageError::NotFound,
        _ => StorageError::Connection(e.to_string()),
    }
}

pub(crate) fn map_module_progress_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ModuleProgress, StorageError> {
    let time_spent: i64 = row.try_get("time_spent_seconds").map_err(ser)?;
    let last_accessed_lesson_id = row
        .try_get::<Option<i64>, _>("last_accessed_lesson_id")
        .map_err(ser)?
        .map(lesson_id_from_i64)
        .transpose()?;

    Ok(ModuleProgress::from_persisted(
        user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        module_id_from_i64(row.try_get::<i64, _>("module_id").map_err(ser)?)?,
        i64_to_u64("time_spent_seconds", time_spent)?,
        last_accessed_lesson_id,
        row.try_get("last_accessed_at").map_err(ser)?,
        row.try_get("completed_at").map_err(ser)?,
    ))
}

pub(crate) fn map_lesson_progress_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<LessonProgress, StorageError> {
    let index: i64 = row.try_get("current_step_index").map_err(ser)?;
    let total: i64 = row.try_get("total_steps").map_err(ser)?;
    let time_spent: i64 = row.try_get("time_spent_seconds").map_err(ser)?;

    Ok(LessonProgress::from_persisted(
        lesson_id_from_i64(row.try_get::<i64, _>("lesson_id").map_err(ser)?)?,
        i64_to_u32("current_step_index", index)?,
        i64_to_u32("total_steps", total)?,
        row.try_get::<bool, _>("completed").map_err(ser)?,
        i64_to_u64("time_spent_seconds", time_spent)?,
        row.try_get("last_accessed_at").map_err(ser)?,
    ))
}

pub(crate) fn map_lesson_ref_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<LessonRef, StorageError> {
    let position: i64 = row.try_get("position").map_err(ser)?;
    let step_count: i64 = row.try_get("step_count").map_err(ser)?;

    Ok(LessonRef::new(
        lesson_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        i64_to_u32("position", position)?,
        i64_to_u32("step_count", step_count)?,
    ))
}
