// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice,
    dead_code
)]

//! Common test utilities and fixtures shared across all test targets
//!
//! Builders for the operator's custom resources, an in-memory cluster
//! (`TestCluster`) implementing both the cache and the store boundaries, and
//! a `Context` wired to it with a fixed clock.
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod memory_store;

pub use fixtures::*;
pub use memory_store::*;
