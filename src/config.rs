use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETTLE_MS: u64 = 500;
const DEFAULT_POLL_MS: u64 = 1000;

/// Runtime settings, read from the environment once at start.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// JSON file listing the entity descriptors (`DELTA_ENTITIES`).
    pub entities_file: Option<PathBuf>,
    pub store_url: String,
    pub store_token: String,
    /// Time between the end of initialisation and the first processed notification.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    /// Seed running totals from the persisted slots on initialisation.
    pub restore_totals: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entities_file: None,
            store_url: String::new(),
            store_token: String::new(),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            restore_totals: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            entities_file: env::var("DELTA_ENTITIES")
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            store_url: env::var("HA_URL").unwrap_or_default(),
            store_token: env::var("HA_TOKEN").unwrap_or_default(),
            settle_delay: parse_millis(env::var("DELTA_SETTLE_MS").ok(), DEFAULT_SETTLE_MS),
            poll_interval: parse_millis(env::var("DELTA_POLL_MS").ok(), DEFAULT_POLL_MS),
            restore_totals: parse_bool_safe(env::var("DELTA_RESTORE").ok()),
        }
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

fn parse_millis(val: Option<String>, default: u64) -> Duration {
    let millis = val
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_millis(millis)
}
