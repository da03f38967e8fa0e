use serde::{Deserialize, Serialize};

use crate::model::ids::LessonId;

/// Ordered lesson metadata as supplied by the content collaborator.
///
/// The engine never authors this data; it only consumes the active lesson
/// set of a module in authored order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRef {
    pub lesson_id: LessonId,
    /// Position within the module's authored ordering.
    pub order: u32,
    /// Authored number of steps; used as the default when no progress
    /// record exists yet.
    pub step_count: u32,
}

impl LessonRef {
    #[must_use]
    pub fn new(lesson_id: LessonId, order: u32, step_count: u32) -> Self {
        Self {
            lesson_id,
            order,
            step_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lesson_ref_carries_authored_order() {
        let lesson = LessonRef::new(LessonId::new(5), 2, 7);
        assert_eq!(lesson.order, 2);
        assert_eq!(lesson.step_count, 7);
    }
}
