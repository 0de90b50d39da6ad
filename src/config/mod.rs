//! # modelstore Configuration Module
//!
//! This module centralizes all configuration constants for modelstore.
//! Constants are grouped by functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The on-disk layout constants (`FILE_HEADER_SIZE`, `CHUNK_HEADER_SIZE`),
//! the cache sharding, and the memory budget reservations all constrain each
//! other; keeping them in one place with compile-time checks prevents the
//! class of bug where one side of an invariant is changed and the other is
//! not.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
