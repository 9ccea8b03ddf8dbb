//! Shared foundation for Radiowatch services
//!
//! Error taxonomy, event bus, retry policy and configuration helpers used by
//! the monitor pipeline and its collaborators.

pub mod config;
pub mod error;
pub mod events;
pub mod retry;

pub use error::{Error, Result};
