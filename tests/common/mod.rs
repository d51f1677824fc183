//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - In-memory relay fixtures and polling helpers

pub mod containers;
pub mod fixtures;

#[allow(unused_imports)]
pub use containers::*;
#[allow(unused_imports)]
pub use fixtures::*;
