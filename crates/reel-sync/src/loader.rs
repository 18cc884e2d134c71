use std::collections::{HashMap, HashSet};
use std::path::Path;

use reel_core::{CatalogRecord, Keyed, ResolvedRecord};
use reel_storage::{read_jsonl, CatalogError, CheckpointError, CheckpointStore, JsonlCheckpointStore};
use tokio::fs;
use tracing::{info, warn};

/// Work left for one stage run, already split into batches.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan<T> {
    pub batches: Vec<Vec<T>>,
    /// Records already present in the stage checkpoint.
    pub skipped: usize,
    /// Repeated `uuid`s dropped after their first occurrence.
    pub duplicates: usize,
}

impl<T> BatchPlan<T> {
    pub fn pending(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Reads stage inputs and partitions them into ordered batches.
#[derive(Debug, Clone, Copy)]
pub struct CatalogLoader {
    batch_size: usize,
}

impl CatalogLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Drops records whose key is in `done` (and repeated keys), preserving
    /// catalog order. Every batch but the last has exactly `batch_size` items.
    pub fn plan<T: Keyed>(&self, records: Vec<T>, done: &HashSet<String>) -> BatchPlan<T> {
        let mut seen = HashSet::new();
        let mut skipped = 0;
        let mut duplicates = 0;
        let mut pending = Vec::new();

        for record in records {
            if !seen.insert(record.uuid().to_string()) {
                warn!(uuid = record.uuid(), "duplicate catalog uuid dropped");
                duplicates += 1;
                continue;
            }
            if done.contains(record.uuid()) {
                skipped += 1;
                continue;
            }
            pending.push(record);
        }

        let mut batches = Vec::with_capacity(pending.len().div_ceil(self.batch_size));
        let mut rest = pending.into_iter().peekable();
        while rest.peek().is_some() {
            batches.push(rest.by_ref().take(self.batch_size).collect());
        }

        BatchPlan {
            batches,
            skipped,
            duplicates,
        }
    }

    pub async fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<CatalogRecord>, CatalogError> {
        let records: Vec<CatalogRecord> = read_jsonl(path.as_ref()).await?;
        info!(path = %path.as_ref().display(), records = records.len(), "catalog loaded");
        Ok(records)
    }

    /// Enrichment input: the resolution checkpoint, last entry per `uuid`,
    /// restricted to records that carry an external id. Read through the
    /// checkpoint store so a torn final line is skipped rather than fatal.
    pub async fn load_resolved(path: impl AsRef<Path>) -> Result<Vec<ResolvedRecord>, CheckpointError> {
        let path = path.as_ref();
        // an absent file means the resolve stage never ran
        fs::metadata(path).await.map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let entries = JsonlCheckpointStore::new(path)
            .load_values()
            .await?
            .into_iter()
            .map(|value| {
                serde_json::from_value::<ResolvedRecord>(value).map_err(|source| CheckpointError::Shape {
                    path: path.to_path_buf(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total = entries.len();
        let resolved: Vec<ResolvedRecord> = latest_per_key(entries)
            .into_iter()
            .filter(ResolvedRecord::is_resolved)
            .collect();
        info!(
            path = %path.display(),
            entries = total,
            resolved = resolved.len(),
            "resolution checkpoint loaded"
        );
        Ok(resolved)
    }
}

/// Keeps the last record for each key, in order of the key's first appearance.
pub fn latest_per_key<T: Keyed>(records: Vec<T>) -> Vec<T> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<T> = Vec::new();
    for record in records {
        match slots.get(record.uuid()) {
            Some(&slot) => latest[slot] = record,
            None => {
                slots.insert(record.uuid().to_string(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}
