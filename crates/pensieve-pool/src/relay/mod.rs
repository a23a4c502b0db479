//! Relay health tracking.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HealthMonitor                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  - Probes every pooled relay each interval (connect + REQ)      │
//! │  - Tracks latency, event rate, success/error counts per URL     │
//! │  - Keeps latency and event-rate history in ring buffers         │
//! │  - Computes a 0-100 weighted health score on read               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pensieve_pool::relay::HealthMonitor;
//!
//! let monitor = Arc::new(HealthMonitor::new(connector, Duration::from_secs(10), 60));
//!
//! // Record events as they arrive
//! monitor.record_event("wss://relay.example.com");
//!
//! // Periodically probe
//! monitor.check_all(&["wss://relay.example.com".to_string()]).await;
//!
//! let health = monitor.relay_health("wss://relay.example.com", true);
//! println!("score: {:.1}", health.health.score);
//! ```

mod monitor;
mod scoring;
mod url;

pub use monitor::{HealthMonitor, MonitoringData, RelayHealth, RelayMetrics};
pub use scoring::{HealthInputs, HealthScore, compute_health};
pub use url::{info_document_url, validate_relay_url};
