//! Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup and content digests for the harvest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber initialisation driven by [`logging::LogConfig`]
//! - **Digests**: SHA-256 content digests used to compare canonical documents
//!
//! # Example
//!
//! ```no_run
//! use harvest_common::digest::ContentDigest;
//!
//! let digest = ContentDigest::of(b"{\"a\":1}");
//! println!("digest: {}", digest);
//! ```

pub mod digest;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
