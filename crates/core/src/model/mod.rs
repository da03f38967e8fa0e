mod curriculum;
mod events;
mod ids;
mod progress;
mod resume;

pub use ids::{LessonId, ModuleId, ParseIdError, UserId};

pub use curriculum::LessonRef;
pub use events::{CompletionEvent, CompletionKind};
pub use progress::{
    LessonProgress, ModuleProgress, ProgressError, ProgressLookup, clamp_step_index,
    progress_percentage,
};
pub use resume::{LessonDetail, ResumeState, StepResult};
