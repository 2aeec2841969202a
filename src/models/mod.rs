//! # Data Models
//!
//! SeaORM entities persisted by the feedback pipeline.

pub mod feedback;
pub mod feedback_log;
pub mod sync_job;

pub use feedback::Entity as Feedback;
pub use feedback_log::Entity as FeedbackLog;
pub use sync_job::Entity as SyncJob;
