//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_REQUESTS`: Requests per window per client key on the S3 surface (default: 100, 0 = off)
//! - `RATE_LIMIT_WINDOW_SECS`: Window length; refill rate is requests / window (default: 1)
//! - `RATE_LIMIT_KEY_STRATEGY`: `ip`, `ip_path`, `ip_method`, `ip_operation` (default: `ip_operation`)
//! - `RATE_LIMIT_SKIP_PATHS`: Paths never throttled (default: `/health,/ready,/metrics`)
//! - `INTERNAL_RATE_LIMIT_REQUESTS`: Per-node budget on cluster RPC (default: 1000, 0 = off)
//! - `RATE_LIMIT_EVICTION_INTERVAL_SECS` / `RATE_LIMIT_IDLE_RETENTION_SECS`: Bucket sweep (600 / 3600)
//!
//! # Trust and Cluster Authentication
//!
//! - `TRUSTED_PROXIES`: Extra trusted proxy addresses or CIDRs; private ranges are always trusted
//! - `CLUSTER_AUTH_MAX_SKEW_SECS`: Accepted clock skew for signed requests (default: 300)
//! - `CLUSTER_REGISTRY_TIMEOUT_MS`: Node registry lookup deadline (default: 2000)
//! - `CLUSTER_NODES_FILE`: JSON file seeding the node registry (optional)

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::KeyExtractor;

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 9000)
    pub port: u16,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests per window per client key on the S3 surface.
    /// Set to 0 to disable rate limiting there
    pub rate_limit_requests: u32,

    /// Rate limit window (default: 1 second)
    pub rate_limit_window: Duration,

    /// Key strategy for the S3 surface
    pub rate_limit_key_strategy: KeyExtractor,

    /// Exact paths that bypass rate limiting
    pub rate_limit_skip_paths: Vec<String>,

    /// Requests per window per authenticated node on cluster RPC (0 = disabled)
    pub internal_rate_limit_requests: u32,

    /// How often idle buckets are swept (default: 10 minutes)
    pub eviction_interval: Duration,

    /// Idle time after which a bucket is evicted (default: 1 hour)
    pub idle_retention: Duration,

    // =========================================================================
    // Trust Configuration
    // =========================================================================
    /// Additional trusted proxy addresses or CIDR ranges.
    ///
    /// Loopback, RFC 1918 and IPv6 unique-local peers are always trusted. List
    /// public reverse proxies or CDN ranges here.
    ///
    /// Format: Comma-separated (e.g., "203.0.113.10,198.51.100.0/24")
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Cluster Authentication Configuration
    // =========================================================================
    /// Largest accepted clock skew for signed peer requests (default: 5 minutes)
    pub cluster_auth_max_skew: Duration,

    /// Node registry lookup deadline; expiry rejects the request (default: 2 seconds)
    pub registry_timeout: Duration,

    /// JSON file seeding the in-memory node registry
    pub cluster_nodes_file: Option<PathBuf>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, unknown key strategy).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 9000)?,

            // Rate limiting
            rate_limit_requests: Self::parse_env("RATE_LIMIT_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 1)?),
            rate_limit_key_strategy: Self::parse_key_strategy()?,
            rate_limit_skip_paths: Self::parse_skip_paths(),
            internal_rate_limit_requests: Self::parse_env("INTERNAL_RATE_LIMIT_REQUESTS", 1000)?,
            eviction_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_EVICTION_INTERVAL_SECS",
                600,
            )?),
            idle_retention: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_IDLE_RETENTION_SECS",
                3600,
            )?),

            // Trust
            trusted_proxies: Self::parse_trusted_proxies(),

            // Cluster authentication
            cluster_auth_max_skew: Duration::from_secs(Self::parse_env(
                "CLUSTER_AUTH_MAX_SKEW_SECS",
                300,
            )?),
            registry_timeout: Duration::from_millis(Self::parse_env(
                "CLUSTER_REGISTRY_TIMEOUT_MS",
                2000,
            )?),
            cluster_nodes_file: env::var("CLUSTER_NODES_FILE")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),

            // Observability
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.eviction_interval.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_EVICTION_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        // A bucket evicted before its window ends would hand out fresh credit early
        if self.idle_retention < self.rate_limit_window {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_IDLE_RETENTION_SECS ({:?}) must be >= RATE_LIMIT_WINDOW_SECS ({:?})",
                self.idle_retention, self.rate_limit_window
            )));
        }

        // Nothing in front of the S3 surface overwrites client-supplied identity headers
        if self.rate_limit_key_strategy.is_client_controlled() {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_KEY_STRATEGY {:?} is keyed by a client-supplied header; use ip, ip_path, ip_method or ip_operation",
                self.rate_limit_key_strategy
            )));
        }

        if self.cluster_auth_max_skew.is_zero() {
            return Err(AppError::ConfigError(
                "CLUSTER_AUTH_MAX_SKEW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.registry_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "CLUSTER_REGISTRY_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the S3 surface is rate limited.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_requests > 0
    }

    /// Check if cluster RPC is rate limited per node.
    pub fn internal_rate_limiting_enabled(&self) -> bool {
        self.internal_rate_limit_requests > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Re-read `.env` (overriding the process environment) and return the
    /// current `TRUSTED_PROXIES` list. Used by the reload signal handler.
    pub fn reload_trusted_proxies() -> Vec<String> {
        let _ = dotenvy::dotenv_override();
        Self::parse_trusted_proxies()
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_key_strategy() -> AppResult<KeyExtractor> {
        match env::var("RATE_LIMIT_KEY_STRATEGY") {
            Ok(name) => KeyExtractor::from_name(&name).ok_or_else(|| {
                AppError::ConfigError(format!(
                    "Invalid RATE_LIMIT_KEY_STRATEGY '{name}': expected ip, ip_path, ip_method or ip_operation"
                ))
            }),
            Err(_) => Ok(KeyExtractor::IpOperation),
        }
    }

    /// Parse rate limit skip paths. Entries not starting with `/` are dropped.
    fn parse_skip_paths() -> Vec<String> {
        split_list(
            &env::var("RATE_LIMIT_SKIP_PATHS").unwrap_or_else(|_| "/health,/ready,/metrics".to_string()),
        )
        .into_iter()
        .filter(|s| s.starts_with('/'))
        .collect()
    }

    /// Parse trusted proxy addresses / CIDR ranges from environment variable.
    ///
    /// Format: Comma-separated (e.g., "203.0.113.10,198.51.100.0/24")
    /// Default: Empty (only private and loopback peers are trusted)
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .map(|s| split_list(&s))
            .unwrap_or_default()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 9000,
            // Rate limiting
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_key_strategy: KeyExtractor::IpOperation,
            rate_limit_skip_paths: vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/metrics".to_string(),
            ],
            internal_rate_limit_requests: 1000,
            eviction_interval: Duration::from_secs(600),
            idle_retention: Duration::from_secs(3600),
            // Trust
            trusted_proxies: vec![],
            // Cluster authentication
            cluster_auth_max_skew: Duration::from_secs(300),
            registry_timeout: Duration::from_millis(2000),
            cluster_nodes_file: None,
            // Observability
            metrics_port: 9090,
        }
    }
}
