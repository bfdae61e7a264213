use std::fmt::Display;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::config::Config;
use crate::fetcher::backoff_delay;
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{Currency, Snapshot};

const BANKS_PER_CURRENCY: usize = 15;

#[derive(Debug, thiserror::Error)]
#[error("Delivery to subscriber {subscriber_id} failed: {reason}")]
pub struct TransportError {
    pub subscriber_id: i64,
    pub reason: String,
}

/// The external messaging capability. The scheduler depends on this contract
/// only, never on a concrete messaging protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, subscriber_id: i64, text: &str) -> Result<(), TransportError>;
}

/// Writes messages to the log instead of a real messenger. Used by the CLI
/// watch loop when no transport is wired up.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, subscriber_id: i64, text: &str) -> Result<(), TransportError> {
        log::info!("[{}] {}", subscriber_id, text);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    /// Due subscribers whose currencies had no data in the snapshot.
    pub skipped_no_data: usize,
    pub failed: usize,
}

impl Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} due, {} sent, {} skipped (no data), {} failed",
            self.due, self.sent, self.skipped_no_data, self.failed
        )
    }
}

/// Decides, per subscriber, when a notification is due, builds the message
/// from the current snapshot and dispatches it at most once per due period.
pub struct Scheduler {
    registry: Arc<SubscriptionRegistry>,
    transport: Box<dyn Transport>,
    dispatch_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    due_tolerance: chrono::Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        transport: Box<dyn Transport>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            transport,
            dispatch_retries: config.dispatch_retries.max(1),
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            due_tolerance: config.due_tolerance,
        }
    }

    /// One notification pass: collect due subscribers, build their messages,
    /// dispatch, and record each confirmed send before moving on. A failed
    /// dispatch leaves `last_notified_at` untouched so the subscriber is
    /// retried on the next due check.
    pub async fn run_tick(&self, snapshot: &Snapshot, now: NaiveDateTime) -> TickReport {
        let due = self.registry.list_due(now, self.due_tolerance);
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            log::debug!("No subscribers due at {}", now.format("%H:%M"));
            return report;
        }
        log::info!("{} subscriber(s) due", due.len());

        for subscriber in due {
            let Some(text) = build_message(snapshot, &subscriber.currencies) else {
                log::warn!(
                    "Snapshot has no rates for subscriber {}'s currencies; skipping",
                    subscriber.id
                );
                report.skipped_no_data += 1;
                continue;
            };
            match self.dispatch(subscriber.id, &text).await {
                Ok(()) => {
                    // Record immediately, before the next subscriber, so the
                    // duplicate window is at most one in-flight message.
                    if let Err(e) = self.registry.mark_notified(subscriber.id, now) {
                        log::error!("Could not record notification for {}: {e}", subscriber.id);
                    }
                    report.sent += 1;
                }
                Err(e) => {
                    log::error!("{e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn dispatch(&self, subscriber_id: i64, text: &str) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.send(subscriber_id, text).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.dispatch_retries => return Err(e),
                Err(e) => {
                    let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt - 1);
                    log::warn!("{e}. Retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Format the snapshot for one subscriber, restricted to their currencies.
/// `None` when the snapshot covers none of them — an empty message is never
/// sent.
pub fn build_message(snapshot: &Snapshot, currencies: &[Currency]) -> Option<String> {
    let mut text = String::new();
    let mut any = false;
    for &currency in currencies {
        let records: Vec<_> = snapshot
            .for_currency(currency)
            .take(BANKS_PER_CURRENCY)
            .collect();
        if records.is_empty() {
            continue;
        }
        any = true;
        let _ = writeln!(text, "🏦 Exchange rates for {}", currency);
        let _ = writeln!(
            text,
            "As of {}",
            snapshot.cycle_at.format("%Y-%m-%d %H:%M")
        );
        for record in records {
            let _ = writeln!(text, "\n{}", record.bank);
            if let (Some(buy), Some(sell)) = (&record.cash_buy, &record.cash_sell) {
                let _ = writeln!(text, "💵 Cash: buy {} / sell {}", buy, sell);
            }
            if let (Some(buy), Some(sell)) = (&record.card_buy, &record.card_sell) {
                let _ = writeln!(text, "💳 Card: buy {} / sell {}", buy, sell);
            }
        }
        let _ = writeln!(text);
    }
    if !any {
        return None;
    }
    text.push_str("Data from minfin.com.ua");
    Some(text)
}
