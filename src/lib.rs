#![forbid(unsafe_code)]

//! Video resource service for the tutorial backend.
//!
//! The binary in `src/bin/backend.rs` wires these modules together; they are
//! exposed as a library so the pieces can be tested in isolation.

pub mod api;
pub mod config;
pub mod frames;
pub mod storage;
pub mod store;
pub mod upload;
