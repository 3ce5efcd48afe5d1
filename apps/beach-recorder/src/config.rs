use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub api_base: String,
    pub persistent_store_path: PathBuf,
    /// Unset means the session-scoped area lives in memory only.
    pub session_store_path: Option<PathBuf>,
    pub engine: EngineSettings,
}

/// Timing and sizing knobs the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub autosave_debounce: Duration,
    pub autosave_max_age: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub retry_ceiling: Duration,
    pub callout_poll_interval: Duration,
    pub max_pending_events: usize,
    pub stop_flush_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_millis(2_000),
            autosave_max_age: Duration::from_millis(10_000),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(1_000),
            retry_ceiling: Duration::from_millis(30_000),
            callout_poll_interval: Duration::from_millis(5_000),
            max_pending_events: 5_000,
            stop_flush_timeout: Duration::from_millis(5_000),
        }
    }
}

impl RecorderConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = std::env::var("BEACH_RECORDER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,beach_recorder=debug".into());
        let api_base = std::env::var("BEACH_RECORDER_API_BASE")
            .unwrap_or_else(|_| "http://localhost:3000/api".into());
        let persistent_store_path = std::env::var("BEACH_RECORDER_STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".beach-recorder/persistent.json"));
        let session_store_path = std::env::var("BEACH_RECORDER_SESSION_STORE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            autosave_debounce: env_millis("BEACH_RECORDER_AUTOSAVE_DEBOUNCE_MS")
                .unwrap_or(defaults.autosave_debounce),
            autosave_max_age: env_millis("BEACH_RECORDER_AUTOSAVE_MAX_AGE_MS")
                .unwrap_or(defaults.autosave_max_age),
            max_retries: std::env::var("BEACH_RECORDER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_retry_delay: env_millis("BEACH_RECORDER_RETRY_BASE_MS")
                .unwrap_or(defaults.base_retry_delay),
            retry_ceiling: env_millis("BEACH_RECORDER_RETRY_CEILING_MS")
                .unwrap_or(defaults.retry_ceiling),
            callout_poll_interval: env_millis("BEACH_RECORDER_CALLOUT_POLL_MS")
                .unwrap_or(defaults.callout_poll_interval),
            max_pending_events: std::env::var("BEACH_RECORDER_MAX_PENDING_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.max_pending_events),
            stop_flush_timeout: env_millis("BEACH_RECORDER_STOP_FLUSH_TIMEOUT_MS")
                .unwrap_or(defaults.stop_flush_timeout),
        };

        Self {
            bind_addr,
            log_filter,
            api_base,
            persistent_store_path,
            session_store_path,
            engine,
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
