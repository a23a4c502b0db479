//! Core types and shared utilities for the Pensieve relay pool.
//!
//! This crate provides:
//! - The Nostr event value type and query filters exchanged with relays
//! - Well-known kind labels
//! - Fixed-capacity time series ring buffers for relay health history
//! - NIP-11 relay information documents
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
mod filter;
pub mod metrics;
pub mod nip11;
pub mod timeseries;

pub use error::{Error, Result};
pub use event::{Event, kind_label, kind_name};
pub use filter::EventFilter;
pub use nip11::{Fee, Fees, Limitation, RelayInformationDocument};
pub use timeseries::{RingBuffer, TimeSeriesPoint};
