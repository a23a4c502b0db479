//! Pensieve relay pool.
//!
//! This crate manages concurrent connections to many Nostr relays and fans
//! queries out across them.
//!
//! # Modules
//!
//! - [`pool`] - Connection pool, fan-out queries, lookups, aggregation, publish, subscriptions
//! - [`relay`] - Health monitor, scoring, relay URL validation
//! - [`cache`] - TTL cache of NIP-11 relay information documents
//! - [`transport`] - Relay connection and info-fetch seam (nostr-sdk, reqwest)
//! - [`config`] - Pool configuration
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────┐
//!    add/remove → │    RelayPool    │ → status / relay-info callbacks
//!                 └────────┬────────┘
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//! ┌─────────────────┐ ┌──────────┐ ┌─────────────────┐
//! │  Fan-out query  │ │InfoCache │ │  HealthMonitor  │
//! │ one leg / relay │ │ NIP-11   │ │ probes, scoring │
//! └────────┬────────┘ └────┬─────┘ └────────┬────────┘
//!          └───────────────┼────────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │    Transport    │  RelayConnector / InfoFetcher
//!                 └─────────────────┘
//! ```
//!
//! No relay is authoritative: every query is sent to each connected relay
//! concurrently, legs fail independently, and results are merged and
//! deduplicated by event ID.

pub mod cache;
pub mod config;
mod error;
pub mod pool;
pub mod relay;
pub mod transport;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use cache::{CacheEntry, InfoCache};
pub use config::PoolConfig;

pub use pool::{
    AdvancedQuery, AggregationResult, BatchLookupEntry, BroadcastLookup, PoolStats,
    PublishResult, RelayEvent, RelayLookup, RelayPool, RelayStatus, RelayTiming,
    SubscriptionHandle, TimedQueryResult,
};

pub use relay::{HealthMonitor, HealthScore, MonitoringData, RelayHealth};

pub use transport::{HttpInfoFetcher, InfoFetcher, NostrConnector, RelayConnector, RelayHandle};
