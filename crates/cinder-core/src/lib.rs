//! Cinder Core - Shared types for the Cinder asset system
//!
//! This crate provides the pieces every other Cinder crate depends on:
//! - `CinderError` and the `Result` alias
//! - `ContentHash` - SHA-256 digests used for asset content and cache integrity

mod error;
mod hash;

pub use error::{CinderError, Result};
pub use hash::ContentHash;
