use progress_core::model::{LessonId, LessonRef, ModuleId, UserId};
use progress_core::time::fixed_now;
use storage::repository::{
    CompletionWrite, CurriculumSource, LegacyIdMap, ProgressRepository, StepWrite,
};
use storage::sqlite::SqliteRepository;

async fn connect(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

async fn seed_module(repo: &SqliteRepository, module: u64, lessons: &[(u64, u32)]) {
    let module_id = ModuleId::new(module);
    repo.upsert_module(module_id, true).await.unwrap();
    for (i, (lesson, steps)) in lessons.iter().enumerate() {
        let order = u32::try_from(i).unwrap();
        repo.upsert_lesson(
            module_id,
            &LessonRef::new(LessonId::new(*lesson), order, *steps),
            true,
        )
        .await
        .unwrap();
    }
}

fn step_write(user: u64, module: u64, lesson: u64, index: i64, total: u32, delta: u64) -> StepWrite {
    StepWrite {
        user_id: UserId::new(user),
        module_id: ModuleId::new(module),
        lesson_id: LessonId::new(lesson),
        current_step_index: index,
        total_steps: total,
        time_spent_delta_secs: delta,
        now: fixed_now(),
    }
}

fn completion_write(user: u64, module: u64, lesson: u64, total: u32) -> CompletionWrite {
    CompletionWrite {
        user_id: UserId::new(user),
        module_id: ModuleId::new(module),
        lesson_id: LessonId::new(lesson),
        total_steps: total,
        time_spent_delta_secs: 0,
        now: fixed_now(),
    }
}

#[tokio::test]
async fn sqlite_step_write_upserts_both_rows() {
    let repo = connect("memdb_step_upsert").await;
    seed_module(&repo, 1, &[(10, 5)]).await;

    let outcome = repo
        .record_step(&step_write(1, 1, 10, 2, 5, 30))
        .await
        .expect("record step");
    assert_eq!(outcome.lesson.current_step_index(), 2);
    assert_eq!(outcome.lesson.total_steps(), 5);
    assert!(!outcome.lesson.is_completed());
    assert_eq!(outcome.module.time_spent_secs(), 30);
    assert_eq!(
        outcome.module.last_accessed_lesson_id(),
        Some(LessonId::new(10))
    );

    // Same position again: index idempotent, time additive.
    let again = repo
        .record_step(&step_write(1, 1, 10, 2, 5, 15))
        .await
        .unwrap();
    assert_eq!(again.lesson.current_step_index(), 2);
    assert_eq!(again.lesson.time_spent_secs(), 45);
    assert_eq!(again.module.time_spent_secs(), 45);
}

#[tokio::test]
async fn sqlite_clamps_indexes_before_storing() {
    let repo = connect("memdb_clamp").await;
    seed_module(&repo, 1, &[(10, 5)]).await;

    let high = repo
        .record_step(&step_write(1, 1, 10, 42, 5, 0))
        .await
        .unwrap();
    assert_eq!(high.lesson.current_step_index(), 4);

    let low = repo
        .record_step(&step_write(1, 1, 10, -9, 5, 0))
        .await
        .unwrap();
    assert_eq!(low.lesson.current_step_index(), 0);

    let stored = repo
        .lesson_progress(UserId::new(1), ModuleId::new(1), LessonId::new(10))
        .await
        .unwrap()
        .expect("row exists");
    assert_eq!(stored.current_step_index(), 0);
}

#[tokio::test]
async fn sqlite_completion_is_sticky_across_step_writes() {
    let repo = connect("memdb_sticky").await;
    seed_module(&repo, 1, &[(10, 5), (11, 3)]).await;
    let active = [LessonId::new(10), LessonId::new(11)];

    let completed = repo
        .record_completion(&completion_write(1, 1, 10, 5), &active)
        .await
        .unwrap();
    assert!(completed.lesson.is_completed());
    assert!(completed.lesson_newly_completed);
    assert_eq!(completed.lesson.current_step_index(), 4);

    // A later step navigation moves the index but not the flag.
    let stepped = repo
        .record_step(&step_write(1, 1, 10, 1, 5, 0))
        .await
        .unwrap();
    assert_eq!(stepped.lesson.current_step_index(), 1);
    assert!(stepped.lesson.is_completed());
}

#[tokio::test]
async fn sqlite_cascade_completes_module_exactly_once() {
    let repo = connect("memdb_cascade").await;
    seed_module(&repo, 1, &[(10, 5), (11, 3), (12, 4)]).await;
    let active = [LessonId::new(10), LessonId::new(11), LessonId::new(12)];

    let first = repo
        .record_completion(&completion_write(1, 1, 10, 5), &active)
        .await
        .unwrap();
    assert!(!first.module_newly_completed);
    assert!(first.module.completed_at().is_none());

    let second = repo
        .record_completion(&completion_write(1, 1, 11, 3), &active)
        .await
        .unwrap();
    assert!(!second.module_newly_completed);

    let third = repo
        .record_completion(&completion_write(1, 1, 12, 4), &active)
        .await
        .unwrap();
    assert!(third.module_newly_completed);
    let stamp = third.module.completed_at().expect("module completed");

    // Re-completing a lesson afterwards keeps the original stamp.
    let repeat = repo
        .record_completion(&completion_write(1, 1, 11, 3), &active)
        .await
        .unwrap();
    assert!(!repeat.module_newly_completed);
    assert_eq!(repeat.module.completed_at(), Some(stamp));
}

#[tokio::test]
async fn sqlite_ensure_module_progress_is_lazy_and_idempotent() {
    let repo = connect("memdb_ensure").await;
    seed_module(&repo, 1, &[(10, 5)]).await;
    let user = UserId::new(7);
    let module = ModuleId::new(1);

    assert!(repo.module_progress(user, module).await.unwrap().is_none());

    let created = repo
        .ensure_module_progress(user, module, fixed_now())
        .await
        .unwrap();
    assert_eq!(created.time_spent_secs(), 0);
    assert!(created.completed_at().is_none());

    let later = fixed_now() + chrono::Duration::hours(2);
    let unchanged = repo.ensure_module_progress(user, module, later).await.unwrap();
    assert_eq!(unchanged.last_accessed_at(), created.last_accessed_at());
}

#[tokio::test]
async fn sqlite_curriculum_returns_active_lessons_in_order() {
    let repo = connect("memdb_curriculum").await;
    let module_id = ModuleId::new(1);
    repo.upsert_module(module_id, true).await.unwrap();
    repo.upsert_lesson(module_id, &LessonRef::new(LessonId::new(12), 2, 4), true)
        .await
        .unwrap();
    repo.upsert_lesson(module_id, &LessonRef::new(LessonId::new(10), 0, 5), true)
        .await
        .unwrap();
    repo.upsert_lesson(module_id, &LessonRef::new(LessonId::new(11), 1, 3), false)
        .await
        .unwrap();

    let lessons = repo.active_lessons(module_id).await.unwrap();
    let ids: Vec<u64> = lessons.iter().map(|l| l.lesson_id.value()).collect();
    assert_eq!(ids, vec![10, 12]);

    assert!(repo.module_exists(module_id).await.unwrap());
    assert!(!repo.module_exists(ModuleId::new(99)).await.unwrap());
    assert!(repo.lesson_exists(LessonId::new(10)).await.unwrap());
    assert!(!repo.lesson_exists(LessonId::new(11)).await.unwrap());
    assert_eq!(
        repo.lesson_owner(LessonId::new(12)).await.unwrap(),
        Some(module_id)
    );
}

#[tokio::test]
async fn sqlite_legacy_map_round_trips() {
    let repo = connect("memdb_legacy").await;
    seed_module(&repo, 1, &[(10, 5)]).await;
    repo.map_legacy_id(LessonId::new(910), ModuleId::new(1), LessonId::new(10))
        .await
        .unwrap();

    assert_eq!(
        repo.canonical_for(LessonId::new(910)).await.unwrap(),
        Some((ModuleId::new(1), LessonId::new(10)))
    );
    assert_eq!(repo.canonical_for(LessonId::new(10)).await.unwrap(), None);
    assert_eq!(
        repo.module_for_canonical(LessonId::new(10)).await.unwrap(),
        Some(ModuleId::new(1))
    );
}

#[tokio::test]
async fn sqlite_progress_for_module_lists_all_children() {
    let repo = connect("memdb_children").await;
    seed_module(&repo, 1, &[(10, 5), (11, 3)]).await;

    repo.record_step(&step_write(1, 1, 10, 1, 5, 10))
        .await
        .unwrap();
    repo.record_step(&step_write(1, 1, 11, 0, 3, 5))
        .await
        .unwrap();
    // Another user's rows stay invisible.
    repo.record_step(&step_write(2, 1, 10, 4, 5, 99))
        .await
        .unwrap();

    let children = repo
        .lesson_progress_for_module(UserId::new(1), ModuleId::new(1))
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    let ids: Vec<u64> = children.iter().map(|l| l.lesson_id().value()).collect();
    assert_eq!(ids, vec![10, 11]);
}
