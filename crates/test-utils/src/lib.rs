//! Shared test utilities for the arbor workspace.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`corruption`] - In-place damage of storage files
//! - [`strategies`] - Proptest strategies for operation sequences

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

pub mod corruption;
pub mod strategies;
