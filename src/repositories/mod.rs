//! # Repository Layer
//!
//! SeaORM-backed stores for feedbacks, their action log and sync jobs.

pub mod feedback;
pub mod feedback_log;
pub mod sync_job;

pub use feedback::{FeedbackStore, NormalizedReview, UpsertOutcome};
pub use feedback_log::NewFeedbackLog;
pub use sync_job::{JobPosition, NewFullSyncJob, ProgressUpdate, SyncJobRepository};
