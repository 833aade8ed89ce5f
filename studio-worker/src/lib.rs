//! studio-worker library crate.
//!
//! A background job worker: polls a persistent queue, runs handlers under a
//! concurrency limit, and keeps content entities consistent with job outcomes.

pub mod config;
pub mod content;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod queue;
pub mod worker;

pub use error::{Error, Result};
