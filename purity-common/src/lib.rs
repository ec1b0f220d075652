//! # Purity Common Library
//!
//! Shared code for the Purity image filter services:
//! - Database initialization and persisted models
//! - Bootstrap configuration loading
//! - Content fingerprinting for cache keys
//! - Database lock retry helper

pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod retry;

pub use error::{Error, Result};
pub use fingerprint::fingerprint;
