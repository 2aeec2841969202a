//! # Feedback Sync Library
//!
//! Ingests buyer reviews from the seller portal of each configured shop,
//! stores them idempotently, links them to ERP orders and variants, and
//! tracks every run as a resumable sync job.

pub mod clients;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod jobs;
pub mod linker;
pub mod models;
pub mod normalization;
pub mod repositories;
pub mod shops;
pub mod sync;
pub mod telemetry;
pub mod variant_index;
pub use migration;
