use std::fmt::Display;

use chrono::NaiveDateTime;

use crate::config::Config;
use crate::debug_sink::DebugSink;
use crate::fetcher::{FetchError, Fetcher};
use crate::parser::{self, ParseError};
use crate::store::{self, MergeStats, RateStore, StoreError};
use crate::types::{Currency, RateRecord, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("No usable rate records this cycle; previous snapshot retained")]
    NoUsableRecords,
    #[error("Snapshot persistence failed; previous snapshot retained: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// Targets fetched and parsed into at least a table.
    pub parsed_targets: usize,
    pub fetch_failures: usize,
    /// Targets whose page no longer carried a recognizable rate table.
    pub structure_misses: usize,
    pub skipped_rows: usize,
    pub merge: MergeStats,
    pub records: usize,
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} record(s) from {} target(s) ({} fetch failure(s), {} structure miss(es), \
             {} row(s) skipped, {} invalid, {} carried forward)",
            self.records,
            self.parsed_targets,
            self.fetch_failures,
            self.structure_misses,
            self.skipped_rows,
            self.merge.invalid,
            self.merge.carried_forward
        )
    }
}

/// Drives one scrape cycle: fetch every configured currency, parse the
/// successful bodies, merge against the current snapshot, persist, publish.
/// The current snapshot only ever advances to a fully merged, persisted one.
pub struct Orchestrator {
    config: Config,
    fetcher: Fetcher,
    store: RateStore,
    sink: DebugSink,
    current: Option<Snapshot>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self, CycleError> {
        let fetcher = Fetcher::new(&config)?;
        let store = RateStore::new(&config.data_dir);
        let sink = DebugSink::new(&config.debug_dir, config.debug_mode);
        let current = store.load_latest();
        match &current {
            Some(snapshot) => log::info!(
                "Resuming from snapshot {} with {} record(s)",
                snapshot.cycle_at,
                snapshot.records.len()
            ),
            None => log::info!("No previous snapshot found; starting cold"),
        }
        Ok(Self {
            config,
            fetcher,
            store,
            sink,
            current,
        })
    }

    /// Last fully committed snapshot; readers never see a partial merge.
    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub async fn run_cycle(&mut self, now: NaiveDateTime) -> Result<CycleReport, CycleError> {
        log::info!(
            "Starting scrape cycle for {} currency target(s)",
            self.config.currencies.len()
        );
        // All fetches complete (or exhaust retries) before any merging.
        let fetched = self
            .fetcher
            .fetch_all(&self.config.currencies, &self.sink)
            .await;
        self.ingest(fetched, now)
    }

    fn ingest(
        &mut self,
        fetched: Vec<(Currency, Result<String, FetchError>)>,
        now: NaiveDateTime,
    ) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();
        let mut incoming: Vec<RateRecord> = Vec::new();

        for (currency, result) in fetched {
            match result {
                Ok(body) => match parser::parse_rate_table(&body, currency, now) {
                    Ok(parsed) => {
                        report.parsed_targets += 1;
                        report.skipped_rows += parsed.skipped_rows;
                        incoming.extend(parsed.records);
                    }
                    Err(ParseError::StructureNotFound) => {
                        log::warn!(
                            "Rate table not found for {}; saving page for inspection",
                            currency
                        );
                        self.sink
                            .write(&format!("{}_structure_miss.html", currency.slug()), &body);
                        report.structure_misses += 1;
                    }
                },
                Err(e) => {
                    log::error!("{e}");
                    report.fetch_failures += 1;
                }
            }
        }

        let (snapshot, stats) = store::merge(self.current.as_ref(), &incoming, now);
        if stats.incoming == stats.invalid {
            // Nothing usable arrived; never overwrite the prior snapshot
            // with an empty or stale-only result.
            return Err(CycleError::NoUsableRecords);
        }
        self.store.persist(&snapshot)?;
        self.store.prune(self.config.retention);

        report.merge = stats;
        report.records = snapshot.records.len();
        self.current = Some(snapshot);
        log::info!("Cycle complete: {}", report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn usd_page(rows: &str) -> String {
        format!(
            r#"<html><body><table id="smTable">
            <thead><tr><th>Bank</th><th>Buy</th><th></th><th>Sell</th><th>Buy</th><th></th><th>Sell</th><th></th></tr></thead>
            <tbody>{rows}</tbody></table></body></html>"#
        )
    }

    fn orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            debug_dir: dir.path().join("debug"),
            currencies: vec![Currency::Usd, Currency::Eur],
            ..Config::default()
        };
        (Orchestrator::new(config).unwrap(), dir)
    }

    #[test]
    fn cycle_merges_and_persists_partial_fetch_results() {
        let (mut orch, _dir) = orchestrator();
        let body = usd_page(
            "<tr><td>PrivatBank</td><td>27,10</td><td></td><td>27,45</td><td>-</td><td></td><td>-</td><td></td></tr>",
        );
        let fetched = vec![
            (Currency::Usd, Ok(body)),
            (
                Currency::Eur,
                Err(FetchError::Http {
                    currency: Currency::Eur,
                    source: reqwest_error(),
                }),
            ),
        ];

        // One target failing never aborts the cycle.
        let report = orch.ingest(fetched, at(9)).expect("cycle should succeed");
        assert_eq!(report.parsed_targets, 1);
        assert_eq!(report.fetch_failures, 1);
        assert_eq!(report.records, 1);

        let current = orch.current().expect("snapshot should be published");
        assert_eq!(current.cycle_at, at(9));
        assert_eq!(current.records[0].cash_buy, Some(dec!(27.10)));

        // And it is durable.
        let store = RateStore::new(&orch.config.data_dir);
        assert_eq!(store.load_latest().unwrap(), *current);
    }

    #[test]
    fn zero_usable_records_keeps_prior_snapshot() {
        let (mut orch, _dir) = orchestrator();
        let body = usd_page(
            "<tr><td>PrivatBank</td><td>27,10</td><td></td><td>27,45</td><td>-</td><td></td><td>-</td><td></td></tr>",
        );
        orch.ingest(vec![(Currency::Usd, Ok(body))], at(9)).unwrap();

        let err = orch
            .ingest(
                vec![(Currency::Usd, Ok("<html><p>outage</p></html>".to_string()))],
                at(10),
            )
            .unwrap_err();
        assert!(matches!(err, CycleError::NoUsableRecords));

        // Prior snapshot stays current, in memory and on disk.
        assert_eq!(orch.current().unwrap().cycle_at, at(9));
        let store = RateStore::new(&orch.config.data_dir);
        assert_eq!(store.load_latest().unwrap().cycle_at, at(9));
    }

    #[test]
    fn all_invalid_records_is_a_cycle_failure() {
        let (mut orch, _dir) = orchestrator();
        // Buy above sell on every row.
        let body = usd_page(
            "<tr><td>Bad Bank</td><td>28,00</td><td></td><td>27,00</td><td>-</td><td></td><td>-</td><td></td></tr>",
        );
        let err = orch
            .ingest(vec![(Currency::Usd, Ok(body))], at(9))
            .unwrap_err();
        assert!(matches!(err, CycleError::NoUsableRecords));
        assert!(orch.current().is_none());
    }

    #[test]
    fn second_cycle_replaces_updated_banks_and_carries_the_rest() {
        let (mut orch, _dir) = orchestrator();
        let first = usd_page(
            "<tr><td>Bank A</td><td>27,00</td><td></td><td>27,30</td><td>-</td><td></td><td>-</td><td></td></tr>\
             <tr><td>Bank B</td><td>27,10</td><td></td><td>27,60</td><td>-</td><td></td><td>-</td><td></td></tr>",
        );
        orch.ingest(vec![(Currency::Usd, Ok(first))], at(9)).unwrap();

        let second = usd_page(
            "<tr><td>Bank A</td><td>27,10</td><td></td><td>27,40</td><td>-</td><td></td><td>-</td><td></td></tr>",
        );
        let report = orch.ingest(vec![(Currency::Usd, Ok(second))], at(10)).unwrap();

        assert_eq!(report.records, 2);
        assert_eq!(report.merge.carried_forward, 1);
        let current = orch.current().unwrap();
        let bank_a = current.records.iter().find(|r| r.bank == "Bank A").unwrap();
        assert_eq!(bank_a.cash_sell, Some(dec!(27.40)));
    }

    #[test]
    fn cold_start_resumes_from_persisted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            debug_dir: dir.path().join("debug"),
            ..Config::default()
        };

        {
            let mut orch = Orchestrator::new(config.clone()).unwrap();
            let body = usd_page(
                "<tr><td>PrivatBank</td><td>27,10</td><td></td><td>27,45</td><td>-</td><td></td><td>-</td><td></td></tr>",
            );
            orch.ingest(vec![(Currency::Usd, Ok(body))], at(9)).unwrap();
        }

        let restarted = Orchestrator::new(config).unwrap();
        assert_eq!(restarted.current().unwrap().cycle_at, at(9));
    }

    fn reqwest_error() -> reqwest::Error {
        // An unparseable URL fails at request build time without touching
        // the network, which is all these tests need.
        reqwest::Client::new().get("http://[").build().unwrap_err()
    }
}
