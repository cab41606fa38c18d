//! Shared types and utilities for the active quoting engine.
//!
//! This crate contains:
//! - Common types (Side, PriceLevel)
//! - Persisted-state row definitions
//! - ClickHouse state store wrapper

pub mod store;
pub mod types;

pub use store::{StateStore, StoreConfig, StoreError};
pub use types::*;
