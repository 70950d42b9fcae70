//! Logging setup and health reporting for the sync agent.

use std::io;

use classy_sync::engine::{Availability, SyncSnapshot};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for development.
    Pretty,
    /// One JSON object per line for log aggregation.
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`; anything other than `json` selects pretty output.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") { Self::Json } else { Self::Pretty }
    }
}

/// Installs the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` filters events (default `info`). Span close events are logged
/// so every backend call reports its duration.
pub fn init_observability(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
    }
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Status is fresh.
    Healthy,
    /// Serving last-known-good or nothing yet.
    Degraded,
    /// The backend rejected the latest refresh.
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckStatus {
    /// Check passed.
    Pass,
    /// Degraded but operational.
    Warn,
    /// Check failed.
    Fail,
}

impl HealthCheckStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

/// One named check.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Check name.
    pub name: &'static str,
    /// Check result.
    pub status: HealthCheckStatus,
    /// Details.
    pub message: String,
}

impl HealthCheck {
    fn new(name: &'static str, status: HealthCheckStatus, message: impl Into<String>) -> Self {
        Self { name, status, message: message.into() }
    }
}

/// Health of the agent derived from the engine's snapshot.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status across the checks.
    pub status: HealthStatus,
    /// Agent version.
    pub version: &'static str,
    /// Push-routing id of this install.
    pub instance_id: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Builds a report from the current snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &SyncSnapshot, instance_id: &str, uptime_secs: u64) -> Self {
        let account = match &snapshot.account {
            Some(account) => HealthCheck::new("account", HealthCheckStatus::Pass, account.as_str()),
            None => HealthCheck::new("account", HealthCheckStatus::Warn, "signed out"),
        };

        let refreshed = snapshot
            .last_refreshed
            .map_or_else(|| "never refreshed".to_owned(), |at| format!("last refreshed {}", at.to_rfc3339()));
        let status = match snapshot.availability {
            Availability::Fresh => HealthCheckStatus::Pass,
            Availability::Stale | Availability::Unknown => HealthCheckStatus::Warn,
            Availability::Unavailable => HealthCheckStatus::Fail,
        };
        let availability = HealthCheck::new("subscription_status", status, refreshed);

        let payment = if snapshot.needs_attention() {
            HealthCheck::new("payment", HealthCheckStatus::Warn, "grace period or account hold")
        } else {
            HealthCheck::new("payment", HealthCheckStatus::Pass, "ok")
        };

        let checks = vec![account, availability, payment];
        Self {
            status: Self::compute_status(&checks),
            version: env!("CARGO_PKG_VERSION"),
            instance_id: instance_id.to_owned(),
            uptime_secs,
            checks,
        }
    }

    /// Worst status across `checks`.
    #[must_use]
    pub fn compute_status(checks: &[HealthCheck]) -> HealthStatus {
        if checks.iter().any(|c| c.status == HealthCheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthCheckStatus::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Serializes the report to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::json!({
            "status": self.status.as_str(),
            "version": self.version,
            "instance_id": self.instance_id,
            "uptime_secs": self.uptime_secs,
            "checks": self.checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status.as_str(),
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&json)
    }
}
