use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ORCHESTRATOR_URL: &str = "http://127.0.0.1:4200/api";
const DEFAULT_DEPLOYMENT: &str = "seo_content_pipeline_light";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub orchestrator_url: String,
    pub deployment_name: String,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    pub request_timeout: Duration,
    pub auto_delete_runs: bool,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

/// Raw string values as they come from the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawConfig<'a> {
    pub port: Option<&'a str>,
    pub orchestrator_url: Option<&'a str>,
    pub deployment_name: Option<&'a str>,
    pub cache_dir: Option<&'a str>,
    pub state_dir: Option<&'a str>,
    pub request_timeout_secs: Option<&'a str>,
    pub auto_delete_runs: Option<&'a str>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
}

impl Config {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let (port, url, deployment, cache, state, timeout, auto_delete, dsn, env) = (
            var("PORT"),
            var("ORCHESTRATOR_API_URL"),
            var("DEPLOYMENT_NAME"),
            var("CACHE_DIR"),
            var("STATE_DIR"),
            var("REQUEST_TIMEOUT_SECS"),
            var("AUTO_DELETE_RUNS"),
            var("SENTRY_DSN"),
            var("ENVIRONMENT"),
        );

        Self::from_raw_values(RawConfig {
            port: port.as_deref(),
            orchestrator_url: url.as_deref(),
            deployment_name: deployment.as_deref(),
            cache_dir: cache.as_deref(),
            state_dir: state.as_deref(),
            request_timeout_secs: timeout.as_deref(),
            auto_delete_runs: auto_delete.as_deref(),
            sentry_dsn: dsn.as_deref(),
            environment: env.as_deref(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawConfig<'_>) -> Self {
        let non_empty = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).map(String::from);

        let port = raw.port.and_then(|v| v.parse().ok()).unwrap_or(8081);

        let orchestrator_url = non_empty(raw.orchestrator_url)
            .unwrap_or_else(|| DEFAULT_ORCHESTRATOR_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let deployment_name =
            non_empty(raw.deployment_name).unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string());

        let cache_dir = non_empty(raw.cache_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pipeline_cache"));

        let state_dir = non_empty(raw.state_dir).map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".flowrun-panel")
        });

        let request_timeout = raw
            .request_timeout_secs
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(20));

        let auto_delete_runs = raw
            .auto_delete_runs
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let sentry_dsn = non_empty(raw.sentry_dsn);

        let environment = non_empty(raw.environment).unwrap_or_else(|| "local".to_string());

        Config {
            port,
            orchestrator_url,
            deployment_name,
            cache_dir,
            state_dir,
            request_timeout,
            auto_delete_runs,
            sentry_dsn,
            environment,
        }
    }
}
