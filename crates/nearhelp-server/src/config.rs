//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use nearhelp_core::constants::{DEFAULT_DURATION_MINUTES, DEFAULT_RADIUS_METERS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.  When unset the store picks
    /// the platform-appropriate data directory.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Matching radius for the nearby query and creation fanout, meters.
    /// Env: `NEARBY_RADIUS_METERS`
    /// Default: `5000`
    pub nearby_radius_meters: f64,

    /// How far back the nearby feed looks, minutes.
    /// Env: `MATCHING_WINDOW_MINUTES`
    /// Default: `30`
    pub matching_window_minutes: i64,

    /// Window for the extended "all requests" read, hours.
    /// Env: `EXTENDED_WINDOW_HOURS`
    /// Default: `24`
    pub extended_window_hours: i64,

    /// Interval between expiry sweeps, seconds.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `60`
    pub sweep_interval_secs: u64,

    /// Requests older than this are purged by the retention sweep, days.
    /// Env: `RETENTION_DAYS`
    /// Default: `180`
    pub retention_days: i64,

    /// Request lifetime applied when the creator does not pick one, minutes.
    /// Env: `DEFAULT_DURATION_MINUTES`
    /// Default: `30`
    pub default_duration_minutes: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            nearby_radius_meters: DEFAULT_RADIUS_METERS,
            matching_window_minutes: 30,
            extended_window_hours: 24,
            sweep_interval_secs: 60,
            retention_days: 180,
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("NEARBY_RADIUS_METERS") {
            match val.parse::<f64>() {
                Ok(radius) if radius > 0.0 => config.nearby_radius_meters = radius,
                _ => {
                    tracing::warn!(value = %val, "Invalid NEARBY_RADIUS_METERS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("MATCHING_WINDOW_MINUTES") {
            if let Ok(n) = val.parse::<i64>() {
                config.matching_window_minutes = n;
            }
        }

        if let Ok(val) = std::env::var("EXTENDED_WINDOW_HOURS") {
            if let Ok(n) = val.parse::<i64>() {
                config.extended_window_hours = n;
            }
        }

        if let Ok(val) = std::env::var("SWEEP_INTERVAL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.sweep_interval_secs = n.max(1);
            }
        }

        if let Ok(val) = std::env::var("RETENTION_DAYS") {
            if let Ok(n) = val.parse::<i64>() {
                config.retention_days = n;
            }
        }

        if let Ok(val) = std::env::var("DEFAULT_DURATION_MINUTES") {
            match val.parse::<i64>() {
                Ok(n) if n > 0 => config.default_duration_minutes = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid DEFAULT_DURATION_MINUTES, using default"
                ),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn matching_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.matching_window_minutes)
    }

    pub fn extended_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.extended_window_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.nearby_radius_meters, 5_000.0);
        assert_eq!(config.matching_window_minutes, 30);
        assert_eq!(config.extended_window_hours, 24);
    }

    #[test]
    fn windows_convert_to_durations() {
        let config = ServerConfig::default();
        assert_eq!(config.matching_window(), chrono::Duration::minutes(30));
        assert_eq!(config.extended_window(), chrono::Duration::hours(24));
    }
}
