use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the full schema (curriculum metadata, the legacy id mapping,
/// module/lesson progress with their uniqueness constraints, and
/// indexes).
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS modules (
                    id INTEGER PRIMARY KEY,
                    active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1))
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lessons (
                    id INTEGER PRIMARY KEY,
                    module_id INTEGER NOT NULL,
                    position INTEGER NOT NULL CHECK (position >= 0),
                    step_count INTEGER NOT NULL CHECK (step_count >= 1),
                    active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
                    FOREIGN KEY (module_id) REFERENCES modules(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        // No FKs here: the mapping was imported mid-migration and may
        // reference canonical content that has not landed yet.
        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS legacy_lesson_ids (
                    legacy_id INTEGER PRIMARY KEY,
                    module_id INTEGER NOT NULL,
                    lesson_id INTEGER NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS module_progress (
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    module_id INTEGER NOT NULL,
                    time_spent_seconds INTEGER NOT NULL DEFAULT 0
                        CHECK (time_spent_seconds >= 0),
                    last_accessed_lesson_id INTEGER,
                    last_accessed_at TEXT NOT NULL,
                    completed_at TEXT,
                    UNIQUE (user_id, module_id),
                    FOREIGN KEY (module_id) REFERENCES modules(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lesson_progress (
                    id INTEGER PRIMARY KEY,
                    module_progress_id INTEGER NOT NULL,
                    lesson_id INTEGER NOT NULL,
                    current_step_index INTEGER NOT NULL CHECK (current_step_index >= 0),
                    total_steps INTEGER NOT NULL CHECK (total_steps >= 1),
                    completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
                    time_spent_seconds INTEGER NOT NULL DEFAULT 0
                        CHECK (time_spent_seconds >= 0),
                    last_accessed_at TEXT NOT NULL,
                    UNIQUE (module_progress_id, lesson_id),
                    CHECK (current_step_index < total_steps),
                    FOREIGN KEY (module_progress_id)
                        REFERENCES module_progress(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_lessons_module_position
                    ON lessons (module_id, active, position);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_legacy_lesson_ids_lesson
                    ON legacy_lesson_ids (lesson_id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_lesson_progress_owner_completed
                    ON lesson_progress (module_progress_id, completed);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
