use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{LessonId, ModuleId, UserId};

/// What kind of completion a fact describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionKind {
    LessonCompleted,
    ModuleCompleted,
}

/// A completion fact emitted toward the achievement collaborator.
///
/// Advisory and fire-and-forget: a dropped or failed emission never rolls
/// back the progress write that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub user_id: UserId,
    pub kind: CompletionKind,
    pub entity_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    #[must_use]
    pub fn lesson_completed(user_id: UserId, lesson_id: LessonId, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            kind: CompletionKind::LessonCompleted,
            entity_id: lesson_id.value(),
            timestamp: at,
        }
    }

    #[must_use]
    pub fn module_completed(user_id: UserId, module_id: ModuleId, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            kind: CompletionKind::ModuleCompleted,
            entity_id: module_id.value(),
            timestamp: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn constructors_tag_the_entity() {
        let lesson = CompletionEvent::lesson_completed(UserId::new(1), LessonId::new(7), fixed_now());
        assert_eq!(lesson.kind, CompletionKind::LessonCompleted);
        assert_eq!(lesson.entity_id, 7);

        let module = CompletionEvent::module_completed(UserId::new(1), ModuleId::new(3), fixed_now());
        assert_eq!(module.kind, CompletionKind::ModuleCompleted);
        assert_eq!(module.entity_id, 3);
    }
}
