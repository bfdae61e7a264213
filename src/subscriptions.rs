use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::{fmt::Display, fs};

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::store::write_atomic;
use crate::types::Currency;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Subscriber {0} is not registered")]
    NotFound(i64),
    #[error("Subscription store write failed: {0}")]
    Io(#[from] io::Error),
    #[error("Subscription store encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid frequency '{0}'. Accepted values: 'daily', 'weekly'")]
pub struct FrequencyParseError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    fn period(&self) -> Duration {
        match self {
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::days(7),
        }
    }
}

impl FromStr for Frequency {
    type Err = FrequencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            _ => Err(FrequencyParseError(s.to_string())),
        }
    }
}

impl Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub currencies: Vec<Currency>,
    pub frequency: Frequency,
    pub preferred_time: NaiveTime,
    #[serde(default)]
    pub last_notified_at: Option<NaiveDateTime>,
}

impl Subscriber {
    /// Due when the clock is within `tolerance` of the preferred time, the
    /// last notification is at least one period (minus tolerance) old, and
    /// for weekly subscribers the day is Sunday.
    pub fn is_due(&self, now: NaiveDateTime, tolerance: Duration) -> bool {
        if self.frequency == Frequency::Weekly && now.weekday() != Weekday::Sun {
            return false;
        }
        if time_distance(now.time(), self.preferred_time) > tolerance {
            return false;
        }
        match self.last_notified_at {
            None => true,
            Some(last) => now - last >= self.frequency.period() - tolerance,
        }
    }
}

impl Display for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let currencies: Vec<&str> = self.currencies.iter().map(|c| c.code()).collect();
        write!(
            f,
            "{} — {} at {} [{}]",
            self.id,
            self.frequency,
            self.preferred_time.format("%H:%M"),
            currencies.join(", ")
        )
    }
}

/// Shortest distance between two times of day, wrapping around midnight.
fn time_distance(a: NaiveTime, b: NaiveTime) -> Duration {
    let direct = (a - b).abs();
    std::cmp::min(direct, Duration::hours(24) - direct)
}

#[derive(Debug, Default, Clone)]
pub struct PreferenceUpdate {
    pub currencies: Option<Vec<Currency>>,
    pub frequency: Option<Frequency>,
    pub preferred_time: Option<NaiveTime>,
}

/// Durable subscriber registry backed by a JSON file. Every mutation goes
/// through one lock and rewrites the file atomically, so a scheduler pass
/// and a preference change cannot lose each other's updates.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    path: PathBuf,
    inner: Mutex<HashMap<i64, Subscriber>>,
}

impl SubscriptionRegistry {
    /// Load the registry from disk; a missing file starts empty, an
    /// unreadable one is logged and treated as empty rather than crashing
    /// the process.
    pub fn open(path: &Path) -> Self {
        let subscribers = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HashMap<i64, Subscriber>>(&raw) {
                Ok(map) => {
                    log::info!("Loaded {} subscription(s)", map.len());
                    map
                }
                Err(e) => {
                    log::error!("Could not decode {}: {e}; starting empty", path.display());
                    HashMap::new()
                }
            },
            Err(_) => {
                log::info!("No subscriptions file found, starting empty");
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(subscribers),
        }
    }

    pub fn add(&self, subscriber: Subscriber) -> Result<(), RegistryError> {
        let mut map = self.lock();
        log::info!("Registering subscriber {}", subscriber);
        map.insert(subscriber.id, subscriber);
        self.save(&map)
    }

    pub fn remove(&self, id: i64) -> Result<bool, RegistryError> {
        let mut map = self.lock();
        let removed = map.remove(&id).is_some();
        if removed {
            log::info!("Removed subscriber {}", id);
            self.save(&map)?;
        }
        Ok(removed)
    }

    pub fn update_preferences(
        &self,
        id: i64,
        update: PreferenceUpdate,
    ) -> Result<(), RegistryError> {
        let mut map = self.lock();
        let subscriber = map.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if let Some(currencies) = update.currencies {
            subscriber.currencies = currencies;
        }
        if let Some(frequency) = update.frequency {
            subscriber.frequency = frequency;
        }
        if let Some(preferred_time) = update.preferred_time {
            subscriber.preferred_time = preferred_time;
        }
        log::info!("Updated preferences for {}", subscriber);
        self.save(&map)
    }

    pub fn list_due(&self, now: NaiveDateTime, tolerance: Duration) -> Vec<Subscriber> {
        let map = self.lock();
        let mut due: Vec<Subscriber> = map
            .values()
            .filter(|s| s.is_due(now, tolerance))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.id);
        due
    }

    /// Record a confirmed dispatch. Only ever called after the transport
    /// acknowledged the send; this is the sole guard against duplicates.
    pub fn mark_notified(&self, id: i64, at: NaiveDateTime) -> Result<(), RegistryError> {
        let mut map = self.lock();
        let subscriber = map.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        subscriber.last_notified_at = Some(at);
        self.save(&map)
    }

    pub fn get(&self, id: i64) -> Option<Subscriber> {
        self.lock().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Subscriber>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, map: &HashMap<i64, Subscriber>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(map)?)?;
        Ok(())
    }
}
