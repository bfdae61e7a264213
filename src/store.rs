use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::types::{Currency, RateRecord, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Snapshot write failed: {0}")]
    Io(#[from] io::Error),
    #[error("Snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot table encoding failed: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub incoming: usize,
    /// Incoming records discarded for violating buy <= sell.
    pub invalid: usize,
    /// Keys where an incoming record overrode an earlier one.
    pub replaced: usize,
    /// Keys present only in the previous snapshot, kept as-is.
    pub carried_forward: usize,
}

/// Merge a fetched batch into the last-known snapshot. Keyed by
/// (bank, currency): valid incoming records win, last write wins within the
/// batch, previous records without a fresh quote are carried forward, and
/// invariant-violating records are dropped and counted. Idempotent.
pub fn merge(
    existing: Option<&Snapshot>,
    incoming: &[RateRecord],
    cycle_at: NaiveDateTime,
) -> (Snapshot, MergeStats) {
    let mut stats = MergeStats {
        incoming: incoming.len(),
        ..MergeStats::default()
    };

    let mut merged: HashMap<(String, Currency), RateRecord> = HashMap::new();
    if let Some(prev) = existing {
        for record in &prev.records {
            merged.insert((record.bank.clone(), record.currency), record.clone());
        }
    }

    let mut fresh_keys: HashSet<(String, Currency)> = HashSet::new();
    for record in incoming {
        if !record.is_valid() {
            stats.invalid += 1;
            log::warn!(
                "Discarding invalid quote from {} for {}: buy exceeds sell",
                record.bank,
                record.currency
            );
            continue;
        }
        let key = (record.bank.clone(), record.currency);
        if merged.insert(key.clone(), record.clone()).is_some() {
            stats.replaced += 1;
        }
        fresh_keys.insert(key);
    }
    stats.carried_forward = merged
        .keys()
        .filter(|key| !fresh_keys.contains(*key))
        .count();

    let mut records: Vec<RateRecord> = merged.into_values().collect();
    // The site orders banks by their sell rate; keep that order per currency,
    // with missing quotes first.
    records.sort_by(|a, b| {
        a.currency
            .cmp(&b.currency)
            .then(a.cash_sell.cmp(&b.cash_sell))
            .then(a.bank.cmp(&b.bank))
    });

    (Snapshot { cycle_at, records }, stats)
}

#[derive(Debug, Clone)]
pub struct RateStore {
    data_dir: PathBuf,
}

impl RateStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Persist a snapshot in tabular and structured form. Both files are
    /// written to a temp path and renamed into place, so a crash mid-write
    /// never leaves a truncated file behind the current name.
    pub fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        fs::create_dir_all(&self.data_dir)?;
        let stamp = snapshot.stamp();

        let json_path = self.data_dir.join(format!("{stamp}_rates.json"));
        write_atomic(&json_path, &serde_json::to_vec_pretty(snapshot)?)?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &snapshot.records {
            writer.serialize(record)?;
        }
        let table = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        let csv_path = self.data_dir.join(format!("{stamp}_rates.csv"));
        write_atomic(&csv_path, &table)?;

        log::info!(
            "Persisted snapshot {} ({} records) to {}",
            stamp,
            snapshot.records.len(),
            self.data_dir.display()
        );
        Ok(())
    }

    /// Newest complete snapshot on disk, if any. Temp leftovers and
    /// unreadable files are skipped, not fatal.
    pub fn load_latest(&self) -> Option<Snapshot> {
        let mut paths = self.snapshot_paths();
        paths.sort();
        for path in paths.iter().rev() {
            match read_snapshot(path) {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => log::warn!("Skipping unreadable snapshot {}: {e}", path.display()),
            }
        }
        None
    }

    /// Drop all but the newest `keep` snapshot cycles.
    pub fn prune(&self, keep: usize) {
        let mut paths = self.snapshot_paths();
        paths.sort();
        if paths.len() <= keep {
            return;
        }
        let cutoff = paths.len() - keep;
        for path in &paths[..cutoff] {
            for stale in [path.clone(), path.with_extension("csv")] {
                if let Err(e) = fs::remove_file(&stale) {
                    log::warn!("Could not prune {}: {e}", stale.display());
                }
            }
        }
        log::debug!("Pruned {} old snapshot cycle(s)", cutoff);
    }

    fn snapshot_paths(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.data_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with("_rates.json"))
            })
            .collect()
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Write-then-rename so readers only ever observe complete files.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
