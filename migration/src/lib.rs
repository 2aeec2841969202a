//! Database migrations for the feedback sync pipeline.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000100_create_feedbacks;
mod m2025_11_10_000200_create_feedback_logs;
mod m2025_11_10_000300_create_feedback_sync_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000100_create_feedbacks::Migration),
            Box::new(m2025_11_10_000200_create_feedback_logs::Migration),
            Box::new(m2025_11_10_000300_create_feedback_sync_jobs::Migration),
        ]
    }
}
