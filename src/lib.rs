//! # eventops
//!
//! Durable, at-least-once job dispatch and execution engine.
//!
//! Jobs are submitted against registered handlers, persisted in a SQLite
//! store, and queued with visibility-timeout lease semantics. A dispatcher
//! and worker pool execute them with bounded timeouts, exponential-backoff
//! retries, cooperative cancellation, and crash recovery via lease expiry.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod retry;
pub mod store;
