//! The relay connection pool.
//!
//! [`RelayPool`] owns the set of relay connections keyed by URL. Adding a
//! relay registers it immediately and connects in the background; every
//! query, publish, and subscription then works against a point-in-time
//! snapshot of the connected relays.
//!
//! # Locking
//!
//! The connection table, the monitor's metrics, and the info cache each have
//! their own lock. The pool never holds its table lock while calling into
//! the monitor, the cache, a transport, or a user callback.
//!
//! # Callbacks
//!
//! Status and relay-info notifications go to single-slot callbacks. Setting
//! one replaces the previous; there is no way to unregister.

mod aggregate;
mod lookup;
mod publish;
mod query;
mod subscribe;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use pensieve_core::RelayInformationDocument;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, InfoCache};
use crate::config::PoolConfig;
use crate::relay::{
    HealthMonitor, HealthScore, MonitoringData, RelayHealth, validate_relay_url,
};
use crate::transport::{InfoFetcher, RelayConnector, RelayHandle};
use crate::{Error, Result};

pub use aggregate::{
    AggregationResult, ContentStats, KeyCount, KindCount, TimeBucket, aggregate,
};
pub use lookup::{BatchLookupEntry, BroadcastLookup, RelayLookup};
pub use publish::PublishResult;
pub use query::{AdvancedQuery, RelayEvent, RelayTiming, TimedQueryResult};
pub use subscribe::SubscriptionHandle;

/// Status-change callback: `(url, connected, error)`.
pub type StatusCallback = Arc<dyn Fn(&str, bool, &str) + Send + Sync>;

/// Called when a pooled relay's information document has been fetched.
pub type RelayInfoCallback = Arc<dyn Fn(&str, &RelayInformationDocument) + Send + Sync>;

/// Connection state of one tracked relay.
struct RelayConnection {
    handle: Option<Arc<dyn RelayHandle>>,
    connected: bool,
    connecting: bool,
    last_error: Option<String>,
    added_at: DateTime<Utc>,
    info: Option<RelayInformationDocument>,
    /// Identifies the connect attempt allowed to update this entry.
    generation: u64,
}

impl RelayConnection {
    fn new(generation: u64) -> Self {
        Self {
            handle: None,
            connected: false,
            connecting: true,
            last_error: None,
            added_at: Utc::now(),
            info: None,
            generation,
        }
    }
}

/// A tracked relay merged with its latest health, for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub info: Option<RelayInformationDocument>,
    pub health: HealthScore,
    pub latency_ms: f64,
    pub event_count: u64,
    pub events_per_second: f64,
    pub check_count: u64,
    pub error_count: u64,
}

/// Pool-wide summary statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_relays: usize,
    pub connected_relays: usize,
    pub total_events: u64,
    pub events_per_second: f64,
    pub cached_info_documents: usize,
    /// Mean health score over tracked relays (0 when empty).
    pub average_health: f64,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn RelayConnector>,
    fetcher: Arc<dyn InfoFetcher>,
    relays: RwLock<HashMap<String, RelayConnection>>,
    monitor: Arc<HealthMonitor>,
    info_cache: InfoCache,
    status_callback: RwLock<Option<StatusCallback>>,
    info_callback: RwLock<Option<RelayInfoCallback>>,
    cancel: CancellationToken,
    next_generation: AtomicU64,
}

/// Concurrent pool of relay connections.
///
/// Cheap to clone; clones share the same pool. Must be used from within a
/// tokio runtime.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create an empty pool.
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn RelayConnector>,
        fetcher: Arc<dyn InfoFetcher>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let monitor = Arc::new(
            HealthMonitor::new(
                Arc::clone(&connector),
                config.probe_timeout,
                config.history_capacity,
            )
            .with_cancellation(cancel.child_token()),
        );
        let info_cache = InfoCache::new(config.info_cache_ttl);

        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                fetcher,
                relays: RwLock::new(HashMap::new()),
                monitor,
                info_cache,
                status_callback: RwLock::new(None),
                info_callback: RwLock::new(None),
                cancel,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The health monitor tracking this pool's relays.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.inner.monitor
    }

    /// The relay information cache.
    pub fn info_cache(&self) -> &InfoCache {
        &self.inner.info_cache
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Track a relay and start connecting to it in the background.
    ///
    /// The relay is listed (disconnected) as soon as this returns. Adding a
    /// URL that is already tracked does nothing.
    pub fn add(&self, url: &str) -> Result<()> {
        let url = validate_relay_url(url)?;
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let generation = {
            let mut relays = self.inner.relays.write();
            if relays.contains_key(&url) {
                return Ok(());
            }
            let generation = self.next_generation();
            relays.insert(url.clone(), RelayConnection::new(generation));
            gauge!("pool_relays_total").set(relays.len() as f64);
            generation
        };

        tracing::debug!(relay = %url, "Relay added");
        self.spawn_connect(url, generation);
        Ok(())
    }

    /// Close a relay's connection, then stop tracking it.
    ///
    /// Fires `(url, false, "removed")` only if the relay was connected.
    pub async fn remove(&self, url: &str) {
        // A fresh generation discards any connect still in flight.
        let generation = self.next_generation();
        let (was_connected, handle) = {
            let mut relays = self.inner.relays.write();
            let Some(conn) = relays.get_mut(url) else {
                return;
            };
            let was_connected = conn.connected;
            conn.generation = generation;
            conn.connected = false;
            conn.connecting = false;
            (was_connected, conn.handle.take())
        };

        if let Some(handle) = handle {
            handle.close().await;
        }

        {
            let mut relays = self.inner.relays.write();
            if relays.get(url).is_some_and(|conn| conn.generation == generation) {
                relays.remove(url);
            }
            gauge!("pool_relays_total").set(relays.len() as f64);
        }
        counter!("pool_relays_removed_total").increment(1);
        self.update_connected_gauge();
        tracing::info!(relay = %url, "Relay removed");

        if was_connected {
            self.notify_status(url, false, "removed");
        }
    }

    /// Drop the current connection (if any) and connect again.
    ///
    /// Returns the outcome of the new attempt. A relay that is already
    /// connecting is left alone.
    pub async fn reconnect(&self, url: &str) -> Result<()> {
        let Some((generation, old)) = self.begin_reconnect(url)? else {
            return Ok(());
        };
        if let Some(handle) = old {
            handle.close().await;
        }
        self.connect_relay(url, generation).await
    }

    /// Cancel all in-flight work and close every connection.
    ///
    /// Tracked relays stay listed as disconnected. Further `add` calls fail.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let handles: Vec<_> = {
            let mut relays = self.inner.relays.write();
            relays
                .values_mut()
                .filter_map(|conn| {
                    conn.connected = false;
                    conn.connecting = false;
                    conn.handle.take()
                })
                .collect()
        };
        for handle in handles {
            handle.close().await;
        }

        self.update_connected_gauge();
        tracing::info!("Relay pool shut down");
    }

    /// Whether [`RelayPool::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Spawn the health monitoring loop.
    ///
    /// Every `health_check_interval` the loop probes all tracked relays and,
    /// with `auto_reconnect`, re-attempts those that are disconnected. The
    /// loop holds only a weak reference to the pool and stops when the pool
    /// is dropped or shut down.
    pub fn start_monitoring(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let monitor = Arc::clone(&self.inner.monitor);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.health_check_interval;

        tokio::spawn(async move {
            tracing::info!("Health monitor started (interval {:?})", period);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let urls = {
                    let Some(inner) = weak.upgrade() else { break };
                    let pool = RelayPool { inner };
                    if pool.inner.config.auto_reconnect {
                        pool.reconnect_disconnected();
                    }
                    pool.urls()
                };

                // Probes watch the pool's token and close their connections.
                monitor.check_all(&urls).await;
            }

            tracing::info!("Health monitor stopped");
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Every tracked relay with its connection state and latest health.
    pub fn list(&self) -> Vec<RelayStatus> {
        let snapshot: Vec<_> = {
            let relays = self.inner.relays.read();
            relays
                .iter()
                .map(|(url, conn)| {
                    (
                        url.clone(),
                        conn.connected,
                        conn.connecting,
                        conn.last_error.clone(),
                        conn.added_at,
                        conn.info.clone(),
                    )
                })
                .collect()
        };

        let mut statuses: Vec<RelayStatus> = snapshot
            .into_iter()
            .map(|(url, connected, connecting, last_error, added_at, info)| {
                let health = self.inner.monitor.relay_health(&url, connected);
                RelayStatus {
                    url,
                    connected,
                    connecting,
                    last_error,
                    added_at,
                    info,
                    health: health.health,
                    latency_ms: health.latency_ms,
                    event_count: health.event_count,
                    events_per_second: health.events_per_second,
                    check_count: health.check_count,
                    error_count: health.error_count,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.url.cmp(&b.url));
        statuses
    }

    /// Number of tracked relays, connected or not.
    pub fn count(&self) -> usize {
        self.inner.relays.read().len()
    }

    /// URLs of the relays connected right now.
    pub fn get_connected(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .inner
            .relays
            .read()
            .iter()
            .filter(|(_, conn)| conn.connected)
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Whether `url` is tracked by the pool.
    pub fn contains(&self, url: &str) -> bool {
        self.inner.relays.read().contains_key(url)
    }

    /// Health of one relay as seen by the monitor.
    pub fn relay_health(&self, url: &str) -> RelayHealth {
        let connected = self.is_connected(url);
        self.inner.monitor.relay_health(url, connected)
    }

    /// Health of every tracked relay plus pool-wide totals.
    pub fn monitoring_data(&self) -> MonitoringData {
        let relays: Vec<(String, bool)> = self
            .inner
            .relays
            .read()
            .iter()
            .map(|(url, conn)| (url.clone(), conn.connected))
            .collect();
        self.inner.monitor.monitoring_data(&relays)
    }

    /// Summary statistics for presentation.
    pub fn stats(&self) -> PoolStats {
        let data = self.monitoring_data();
        let average_health = if data.relays.is_empty() {
            0.0
        } else {
            data.relays.iter().map(|r| r.health.score).sum::<f64>() / data.relays.len() as f64
        };

        PoolStats {
            total_relays: data.total_relays,
            connected_relays: data.connected_relays,
            total_events: data.total_events,
            events_per_second: data.events_per_second,
            cached_info_documents: self.inner.info_cache.size(),
            average_health,
        }
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Register the status-change callback, replacing any previous one.
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(&str, bool, &str) + Send + Sync + 'static,
    {
        *self.inner.status_callback.write() = Some(Arc::new(callback));
    }

    /// Register the relay-info callback, replacing any previous one.
    pub fn set_on_relay_info<F>(&self, callback: F)
    where
        F: Fn(&str, &RelayInformationDocument) + Send + Sync + 'static,
    {
        *self.inner.info_callback.write() = Some(Arc::new(callback));
    }

    fn notify_status(&self, url: &str, connected: bool, error: &str) {
        let callback = self.inner.status_callback.read().clone();
        if let Some(callback) = callback {
            callback(url, connected, error);
        }
    }

    fn notify_info(&self, url: &str, document: &RelayInformationDocument) {
        let callback = self.inner.info_callback.read().clone();
        if let Some(callback) = callback {
            callback(url, document);
        }
    }

    // =========================================================================
    // Relay information documents
    // =========================================================================

    /// Information document for `url`, pooled or not.
    ///
    /// Uses the copy held by a pooled connection, then the cache, and only
    /// then fetches.
    pub async fn get_relay_info(&self, url: &str) -> Result<RelayInformationDocument> {
        let pooled = self
            .inner
            .relays
            .read()
            .get(url)
            .and_then(|conn| conn.info.clone());
        if let Some(document) = pooled {
            return Ok(document);
        }
        self.fetch_relay_info_cached(url, false).await
    }

    /// Fetch a fresh document for `url`, updating the cache and, for a pooled
    /// relay, its connection and the relay-info callback.
    pub async fn refresh_relay_info(&self, url: &str) -> Result<RelayInformationDocument> {
        let document = self.fetch_relay_info_cached(url, true).await?;

        let pooled = {
            let mut relays = self.inner.relays.write();
            match relays.get_mut(url) {
                Some(conn) => {
                    conn.info = Some(document.clone());
                    true
                }
                None => false,
            }
        };
        if pooled {
            self.notify_info(url, &document);
        }
        Ok(document)
    }

    /// Cached document for `url`, if present and not expired.
    pub fn get_cached_relay_info(&self, url: &str) -> Option<RelayInformationDocument> {
        self.inner.info_cache.get(url)
    }

    /// Cached entry for `url` with its timestamps, expired or not.
    pub fn get_cached_relay_info_with_metadata(&self, url: &str) -> Option<CacheEntry> {
        self.inner.info_cache.get_with_metadata(url)
    }

    /// Document for `url` from the cache, fetching (and caching) on a miss or
    /// when `force_refresh` is set.
    pub async fn fetch_relay_info_cached(
        &self,
        url: &str,
        force_refresh: bool,
    ) -> Result<RelayInformationDocument> {
        let url = validate_relay_url(url)?;
        if !force_refresh && let Some(document) = self.inner.info_cache.get(&url) {
            return Ok(document);
        }

        let document = self.fetch_info(&url).await?;
        self.inner.info_cache.set(&url, document.clone());
        Ok(document)
    }

    async fn fetch_info(&self, url: &str) -> Result<RelayInformationDocument> {
        let result = tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Shutdown),
            r = self.inner.fetcher.fetch(url) => r,
        };
        match &result {
            Ok(_) => counter!("info_fetch_total", "result" => "ok").increment(1),
            Err(e) => {
                counter!("info_fetch_total", "result" => "error").increment(1);
                tracing::warn!(relay = %url, "Relay info fetch failed: {}", e);
            }
        }
        result
    }

    // =========================================================================
    // Connect routine
    // =========================================================================

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_connect(&self, url: String, generation: u64) {
        let pool = self.clone();
        tokio::spawn(async move {
            let _ = pool.connect_relay(&url, generation).await;
        });
    }

    /// Connect `url` and apply the outcome if `generation` is still current.
    async fn connect_relay(&self, url: &str, generation: u64) -> Result<()> {
        let timeout = self.inner.config.connect_timeout;
        let result = tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Shutdown),
            r = tokio::time::timeout(timeout, self.inner.connector.connect(url, timeout)) => {
                r.unwrap_or(Err(Error::Timeout(timeout)))
            }
        };

        // Apply under the lock; act on the outcome after releasing it.
        let (applied, stale_handle) = {
            let mut relays = self.inner.relays.write();
            match relays.get_mut(url) {
                Some(conn) if conn.generation == generation => {
                    conn.connecting = false;
                    match &result {
                        Ok(handle) => {
                            conn.handle = Some(Arc::clone(handle));
                            conn.connected = true;
                            conn.last_error = None;
                        }
                        Err(e) => {
                            conn.handle = None;
                            conn.connected = false;
                            conn.last_error = Some(e.to_string());
                        }
                    }
                    (true, None)
                }
                _ => (false, result.as_ref().ok().cloned()),
            }
        };

        if let Some(handle) = stale_handle {
            // Removed or superseded while connecting.
            handle.close().await;
        }
        if !applied {
            tracing::debug!(relay = %url, "Discarding stale connect attempt");
            return Err(Error::NotTracked(url.to_string()));
        }

        self.update_connected_gauge();

        match result {
            Ok(_) => {
                counter!("pool_connects_total", "result" => "ok").increment(1);
                tracing::info!(relay = %url, "Connected");
                self.notify_status(url, true, "");
                self.load_relay_info(url, generation).await;
                Ok(())
            }
            Err(e) => {
                counter!("pool_connects_total", "result" => "error").increment(1);
                tracing::warn!(relay = %url, "Connect failed: {}", e);
                self.notify_status(url, false, &e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch the document for a freshly connected relay. Failures are logged
    /// and otherwise ignored.
    async fn load_relay_info(&self, url: &str, generation: u64) {
        let Ok(document) = self.fetch_info(url).await else {
            return;
        };
        self.inner.info_cache.set(url, document.clone());

        let current = {
            let mut relays = self.inner.relays.write();
            match relays.get_mut(url) {
                Some(conn) if conn.generation == generation => {
                    conn.info = Some(document.clone());
                    true
                }
                _ => false,
            }
        };
        if current {
            self.notify_info(url, &document);
        }
    }

    /// Mark `url` as connecting under a new generation, returning it with the
    /// handle to close. `None` if a connect is already in flight.
    fn begin_reconnect(&self, url: &str) -> Result<Option<(u64, Option<Arc<dyn RelayHandle>>)>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let generation = self.next_generation();
        let mut relays = self.inner.relays.write();
        let conn = relays
            .get_mut(url)
            .ok_or_else(|| Error::NotTracked(url.to_string()))?;
        if conn.connecting {
            return Ok(None);
        }
        conn.connecting = true;
        conn.connected = false;
        conn.generation = generation;
        Ok(Some((generation, conn.handle.take())))
    }

    /// Start a background reconnect for every idle, disconnected relay.
    fn reconnect_disconnected(&self) {
        let idle: Vec<String> = self
            .inner
            .relays
            .read()
            .iter()
            .filter(|(_, conn)| !conn.connected && !conn.connecting)
            .map(|(url, _)| url.clone())
            .collect();

        for url in idle {
            if let Ok(Some((generation, _))) = self.begin_reconnect(&url) {
                tracing::debug!(relay = %url, "Auto-reconnecting");
                self.spawn_connect(url, generation);
            }
        }
    }

    // =========================================================================
    // Snapshots used by the query engine
    // =========================================================================

    fn urls(&self) -> Vec<String> {
        self.inner.relays.read().keys().cloned().collect()
    }

    fn is_connected(&self, url: &str) -> bool {
        self.inner
            .relays
            .read()
            .get(url)
            .is_some_and(|conn| conn.connected)
    }

    /// Connected relays, optionally narrowed to `selection`, sorted by URL.
    ///
    /// An empty selection means every connected relay.
    fn connected_handles(
        &self,
        selection: Option<&[String]>,
    ) -> Result<Vec<(String, Arc<dyn RelayHandle>)>> {
        let mut connected: Vec<(String, Arc<dyn RelayHandle>)> = {
            let relays = self.inner.relays.read();
            relays
                .iter()
                .filter(|(_, conn)| conn.connected)
                .filter_map(|(url, conn)| conn.handle.clone().map(|h| (url.clone(), h)))
                .collect()
        };
        if connected.is_empty() {
            return Err(Error::NoConnectedRelays);
        }

        if let Some(selection) = selection.filter(|s| !s.is_empty()) {
            connected.retain(|(url, _)| selection.iter().any(|s| s.trim() == url));
            if connected.is_empty() {
                return Err(Error::NoRelaysMatched);
            }
        }

        connected.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(connected)
    }

    fn update_connected_gauge(&self) {
        let connected = self
            .inner
            .relays
            .read()
            .values()
            .filter(|conn| conn.connected)
            .count();
        gauge!("pool_relays_connected").set(connected as f64);
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.count())
            .field("connected", &self.get_connected().len())
            .finish()
    }
}
