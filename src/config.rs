//! Tracker configuration.
//!
//! Configuration is injected into the [`Tracker`](crate::tracer::Tracker) when it is
//! built. [`TrackerConfig::from_env`] is a convenience loader; nothing in the crate
//! reads the environment on its own.

use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.runtrace.dev";
pub const DEFAULT_RUNTIME: &str = "runtrace-rs";

/// Configuration shared by the tracker, the consumer and the HTTP transport
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Default scope token (project/app id), used when an event carries no override
    pub app_id: Option<String>,
    /// Base URL of the ingestion API
    pub api_url: String,
    /// Dump every queued event and every send attempt at `info` level
    pub verbose: bool,
    /// Verify TLS certificates when talking to the ingestion API
    pub ssl_verify: bool,
    /// Interval between two consumer drains
    pub flush_interval: Duration,
    /// Upper bound on the final flush performed at shutdown
    pub shutdown_timeout: Duration,
    /// Value of the `runtime` field stamped on every event
    pub runtime: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_url: DEFAULT_API_URL.to_string(),
            verbose: false,
            ssl_verify: true,
            flush_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }
}

impl TrackerConfig {
    /// Build a configuration from `RUNTRACE_*` environment variables
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let app_id = non_empty("RUNTRACE_PRIVATE_KEY")
            .or_else(|| non_empty("RUNTRACE_PUBLIC_KEY"))
            .or_else(|| non_empty("RUNTRACE_APP_ID"));

        Self {
            app_id,
            api_url: non_empty("RUNTRACE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            verbose: lookup("RUNTRACE_VERBOSE").is_some(),
            ssl_verify: lookup("RUNTRACE_DISABLE_SSL_VERIFY").as_deref() != Some("true"),
            ..Default::default()
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_ssl_verify(mut self, ssl_verify: bool) -> Self {
        self.ssl_verify = ssl_verify;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Scope used for id derivation when an event has no app id override
    pub fn default_scope(&self) -> &str {
        self.app_id.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();

        assert_eq!(config.app_id, None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(!config.verbose);
        assert!(config.ssl_verify);
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.default_scope(), "");
    }

    #[test]
    fn test_private_key_takes_precedence() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("RUNTRACE_PRIVATE_KEY", "private"),
            ("RUNTRACE_PUBLIC_KEY", "public"),
            ("RUNTRACE_APP_ID", "app"),
        ]));

        assert_eq!(config.app_id, Some("private".to_string()));
    }

    #[test]
    fn test_empty_values_fall_through() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("RUNTRACE_PRIVATE_KEY", ""),
            ("RUNTRACE_APP_ID", "app"),
            ("RUNTRACE_API_URL", ""),
        ]));

        assert_eq!(config.app_id, Some("app".to_string()));
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_verbose_and_ssl_flags() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("RUNTRACE_VERBOSE", ""),
            ("RUNTRACE_DISABLE_SSL_VERIFY", "true"),
            ("RUNTRACE_API_URL", "http://localhost:3333"),
        ]));

        assert!(config.verbose);
        assert!(!config.ssl_verify);
        assert_eq!(config.api_url, "http://localhost:3333");
    }

    #[test]
    fn test_builder_setters() {
        let config = TrackerConfig::default()
            .with_app_id("abc")
            .with_verbose(true)
            .with_flush_interval(Duration::from_millis(10));

        assert_eq!(config.default_scope(), "abc");
        assert!(config.verbose);
        assert_eq!(config.flush_interval, Duration::from_millis(10));
    }
}
