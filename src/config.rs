use std::path::PathBuf;
use std::time::Duration;

use crate::types::Currency;

/// Runtime configuration, passed explicitly into each component at
/// construction. Defaults mirror the source site's tolerances: a slow page is
/// retried a few times with exponential backoff, and notification ticks run
/// once a minute.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    /// City segment of the target URL; rates are quoted per city.
    pub city: String,
    pub currencies: Vec<Currency>,

    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_concurrency: usize,

    pub scrape_interval: Duration,
    pub tick_interval: Duration,
    pub dispatch_retries: u32,
    /// Window around a subscriber's preferred time within which a
    /// notification counts as on schedule.
    pub due_tolerance: chrono::Duration,

    /// Number of snapshot cycles kept on disk.
    pub retention: usize,
    pub data_dir: PathBuf,
    pub debug_dir: PathBuf,
    pub debug_mode: bool,
    pub subscriptions_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: crate::BASE_URL.to_string(),
            city: "kiev".to_string(),
            currencies: vec![Currency::Usd, Currency::Eur],
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            max_concurrency: 4,
            scrape_interval: Duration::from_secs(15 * 60),
            tick_interval: Duration::from_secs(60),
            dispatch_retries: 3,
            due_tolerance: chrono::Duration::minutes(5),
            retention: 30,
            data_dir: PathBuf::from("data"),
            debug_dir: PathBuf::from("debug"),
            debug_mode: false,
            subscriptions_file: PathBuf::from("subscriptions.json"),
        }
    }
}
