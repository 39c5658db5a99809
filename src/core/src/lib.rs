//! Shared types for the stratum just-in-time image server.
//!
//! This crate holds the pieces every other crate needs: the error type,
//! the configuration schema and loader, atomic file writing, and image
//! reference parsing.

pub mod atomic;
pub mod config;
pub mod error;
pub mod reference;

pub use error::{Error, Result};
