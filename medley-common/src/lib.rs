//! # Medley Common Library
//!
//! Shared code for Medley services:
//! - Common error type
//! - TOML configuration resolution and loading
//! - Logging initialization
//! - Injectable wall clock

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
pub use time::{Clock, ManualClock, SystemClock};
