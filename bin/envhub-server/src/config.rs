//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// Runtime configuration for envhub-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:6789"`).
    pub bind_address: String,

    /// Path prefix all routes are mounted under, always with a trailing `/`.
    pub service_prefix: String,

    /// SQLite database URL (default: `"sqlite://envhub.sqlite"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Image used to run repo2docker in direct mode.
    pub builder_image: String,

    /// Extra `--build-arg` values handed to every direct build.
    pub extra_build_args: Vec<String>,

    /// When set, builds are delegated to this BinderHub instance.
    pub binderhub_url: Option<String>,

    /// Bearer token sent to the BinderHub instance.
    pub binderhub_token: Option<String>,

    /// Interval between record reads while tailing a build log.
    pub log_poll_interval: Duration,

    /// Upper bound on how long a single log stream stays open.
    pub log_stream_timeout: Duration,

    /// Fail a build whose event stream stays silent for this long.
    /// Disabled when unset.
    pub build_idle_timeout: Option<Duration>,

    /// When set, `/api` routes require `Authorization: token <value>` or
    /// `Bearer <value>`.
    pub api_token: Option<String>,

    /// Comma-separated list of allowed CORS origins. `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `<prefix>api-docs/openapi.json`.
    pub enable_api_docs: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let prefix = std::env::var("ENVHUB_SERVICE_PREFIX")
            .or_else(|_| std::env::var("JUPYTERHUB_SERVICE_PREFIX"))
            .unwrap_or_else(|_| "/".to_owned());
        Self {
            bind_address: env_or("ENVHUB_BIND", "0.0.0.0:6789"),
            service_prefix: normalize_prefix(&prefix),
            database_url: env_or("ENVHUB_DATABASE_URL", "sqlite://envhub.sqlite"),
            log_level: env_or("ENVHUB_LOG", "info"),
            log_json: parse_bool("ENVHUB_LOG_JSON", false),
            builder_image: env_or(
                "ENVHUB_BUILDER_IMAGE",
                envhub_core::launcher::DEFAULT_BUILDER_IMAGE,
            ),
            extra_build_args: env_opt("ENVHUB_EXTRA_BUILD_ARGS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            binderhub_url: env_opt("ENVHUB_BINDERHUB_URL"),
            binderhub_token: env_opt("ENVHUB_BINDERHUB_TOKEN"),
            log_poll_interval: Duration::from_millis(parse_env("ENVHUB_LOG_POLL_INTERVAL_MS", 1000)),
            log_stream_timeout: Duration::from_secs(parse_env("ENVHUB_LOG_STREAM_TIMEOUT_SECS", 3600)),
            build_idle_timeout: env_opt("ENVHUB_BUILD_IDLE_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            api_token: env_opt("ENVHUB_API_TOKEN"),
            cors_allowed_origins: env_opt("ENVHUB_CORS_ORIGINS"),
            enable_api_docs: parse_bool("ENVHUB_ENABLE_API_DOCS", true),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6789".to_owned(),
            service_prefix: "/".to_owned(),
            database_url: "sqlite::memory:".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            builder_image: envhub_core::launcher::DEFAULT_BUILDER_IMAGE.to_owned(),
            extra_build_args: Vec::new(),
            binderhub_url: None,
            binderhub_token: None,
            log_poll_interval: Duration::from_secs(1),
            log_stream_timeout: Duration::from_secs(3600),
            build_idle_timeout: None,
            api_token: None,
            cors_allowed_origins: None,
            enable_api_docs: true,
        }
    }
}

/// `services/envhub` -> `/services/envhub/`
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}/")
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
