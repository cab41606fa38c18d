//! Exchange integration for the active quoting engine.
//!
//! This crate contains:
//! - Wire types for the public market channel and the authenticated
//!   user channel
//! - In-memory orderbook state
//! - REST client (fee rates, positions, open orders, placement,
//!   cancellation)

pub mod orderbook;
pub mod rest;
pub mod types;

pub use orderbook::{OrderBookState, TopOfBook};
pub use rest::{ApiCredentials, ExchangeClient, ExchangeConfig, ExchangeError};
pub use types::*;
