//! Relay health score computation.
//!
//! The health score is a 0-100 weighted sum of four independent 0-100
//! sub-scores:
//! - Connectivity (currently connected or not)
//! - Latency quality (piecewise linear in probe latency)
//! - Uptime (probe success ratio)
//! - Error-free (piecewise linear in probe error count)

/// Weight for connectivity in the composite score.
const CONNECTIVITY_WEIGHT: f64 = 0.30;

/// Weight for latency quality in the composite score.
const LATENCY_WEIGHT: f64 = 0.30;

/// Weight for uptime ratio in the composite score.
const UPTIME_WEIGHT: f64 = 0.20;

/// Weight for the error-free sub-score in the composite score.
const ERROR_FREE_WEIGHT: f64 = 0.20;

/// Inputs for score computation.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    /// Whether the pool currently holds a live connection.
    pub connected: bool,
    /// Most recent probe latency in milliseconds (0 = no data yet).
    pub latency_ms: f64,
    /// Probes run so far.
    pub check_count: u64,
    /// Probes that succeeded.
    pub success_count: u64,
    /// Probes that failed.
    pub error_count: u64,
}

/// Computed score with its components, for presentation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct HealthScore {
    /// Composite score (0-100).
    pub score: f64,
    pub connectivity: f64,
    pub latency: f64,
    pub uptime: f64,
    pub error_free: f64,
}

/// Compute the composite health score for a relay.
///
/// A connected relay that has never been probed scores exactly 50: full
/// connectivity and error-free credit, nothing for latency or uptime.
pub fn compute_health(inputs: &HealthInputs) -> HealthScore {
    let connectivity = if inputs.connected { 100.0 } else { 0.0 };
    let latency = latency_score(inputs.latency_ms);
    let uptime = uptime_score(inputs.success_count, inputs.check_count);
    let error_free = error_free_score(inputs.error_count);

    let score = connectivity * CONNECTIVITY_WEIGHT
        + latency * LATENCY_WEIGHT
        + uptime * UPTIME_WEIGHT
        + error_free * ERROR_FREE_WEIGHT;

    HealthScore {
        score: score.clamp(0.0, 100.0),
        connectivity,
        latency,
        uptime,
        error_free,
    }
}

/// Latency quality: full marks up to 100ms, linear down to 50 at 500ms,
/// linear down to 0 at 2000ms.
pub fn latency_score(latency_ms: f64) -> f64 {
    if latency_ms <= 0.0 {
        0.0
    } else if latency_ms <= 100.0 {
        100.0
    } else if latency_ms <= 500.0 {
        100.0 - (latency_ms - 100.0) * 0.125
    } else if latency_ms <= 2000.0 {
        50.0 - (latency_ms - 500.0) * (50.0 / 1500.0)
    } else {
        0.0
    }
}

/// Uptime ratio as a percentage; 0 before the first check.
pub fn uptime_score(success_count: u64, check_count: u64) -> f64 {
    if check_count == 0 {
        return 0.0;
    }
    (100.0 * success_count as f64 / check_count as f64).min(100.0)
}

/// Error-free score: -10 per error up to 5, then linear to 0 at 20.
pub fn error_free_score(error_count: u64) -> f64 {
    let e = error_count as f64;
    if error_count == 0 {
        100.0
    } else if error_count <= 5 {
        100.0 - 10.0 * e
    } else if error_count < 20 {
        50.0 - (10.0 / 3.0) * (e - 5.0)
    } else {
        0.0
    }
}
