#![forbid(unsafe_code)]

pub mod cache;
pub mod error;
pub mod events;
pub mod progress_service;
pub mod resolver;

pub use progress_core::Clock;

pub use cache::{ModuleSnapshot, ProgressCache};
pub use error::ProgressServiceError;
pub use events::{AchievementSink, CompletionEventEmitter, PublishError, RecordingSink};
pub use progress_service::ProgressService;
pub use resolver::{IdentifierResolver, ResolvedLesson};
