//! # workpool
//!
//! Durable multi-tenant work queue on SQLite.
//!
//! Work is submitted to named queues and executed by registered handlers.
//! A single leased scanner finds queues with due work, per-queue managers
//! claim batches in vesting or FIFO order, and workers run handlers under
//! item leases. Failures retry with exponential backoff; outcomes are
//! persisted before completion callbacks run, so delivery survives crashes.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use engine::{Engine, EngineBuilder, WakeGate, Watchdog};
pub use error::{Error, Result};
