//! Durable job queue for long-running listing generation work.
//!
//! Web handlers enqueue jobs into a SQLite-backed store; one or more worker
//! processes claim them oldest-first, run the handler registered for the job
//! type and record the outcome. Jobs abandoned by a crashed worker are swept
//! back into the queue after a timeout.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
