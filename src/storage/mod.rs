//! Datastore Layer — PostgreSQL persistence with row-level locking
//!
//! Incidents, hypotheses, actions, pattern counters, outcome records and
//! the analysis work queue all live here. Every shared-state mutation that
//! is not idempotent goes through `SELECT … FOR UPDATE`; the queue claim
//! uses `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the
//! same job.

pub mod actions;
pub mod db;
pub mod hypotheses;
pub mod incidents;
pub mod outcomes;
pub mod patterns;
pub mod queue;

pub use db::create_pool;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}
