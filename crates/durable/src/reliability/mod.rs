//! Reliability patterns for the queue
//!
//! This module provides:
//! - [`Backoff`] - Exponential backoff with jitter, used for poll sleeps and retry delays

mod backoff;

pub use backoff::{Backoff, BackoffFn};
