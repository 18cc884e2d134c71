use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reel_core::Keyed;
use reel_storage::{uuid_of, CheckpointEntry, CheckpointError, CheckpointStore, RandomSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::StageSettings;
use crate::loader::CatalogLoader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolution,
    Enrichment,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Resolution => "resolution",
            Stage::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    /// No external id; checkpointed with a null `externalId`.
    Unresolved,
    /// Written with one or more sub-fetches replaced by empty defaults.
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Processed<O> {
    pub record: O,
    pub status: ItemStatus,
}

/// Per-item work of one pipeline stage. Implementations never fail: a problem
/// with one item is reported through [`ItemStatus`].
#[async_trait]
pub trait StageWorker: Send + Sync {
    type Input: Keyed + Send + 'static;
    type Output: Keyed + Serialize + Send + 'static;

    fn stage(&self) -> Stage;

    /// Whether a checkpoint entry excludes its `uuid` from this run.
    fn counts_as_done(&self, _entry: &JsonValue) -> bool {
        true
    }

    async fn process(&self, input: Self::Input) -> Processed<Self::Output>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    LoadingBatches,
    ProcessingBatch { index: usize },
    Delaying { index: usize },
    Done,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub run_id: Uuid,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skipped: usize,
    pub duplicates: usize,
    pub batches: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub unresolved: usize,
    pub degraded: usize,
}

impl StageSummary {
    fn record(&mut self, status: ItemStatus) {
        self.attempted += 1;
        match status {
            ItemStatus::Succeeded => self.succeeded += 1,
            ItemStatus::Unresolved => self.unresolved += 1,
            ItemStatus::Degraded => self.degraded += 1,
        }
    }
}

/// Drives one stage: skip what the checkpoint already holds, process the rest
/// in batches with bounded concurrency, checkpoint each batch, then pause.
pub struct BatchScheduler<W> {
    worker: W,
    checkpoint: Arc<dyn CheckpointStore>,
    settings: StageSettings,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
}

impl<W: StageWorker> BatchScheduler<W> {
    pub fn new(
        worker: W,
        checkpoint: Arc<dyn CheckpointStore>,
        settings: StageSettings,
        sleeper: Arc<dyn Sleeper>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            worker,
            checkpoint,
            settings: settings.normalized(),
            sleeper,
            random,
        }
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Runs the stage to completion. Only checkpoint I/O aborts a run; the
    /// batches already appended stay valid for the next run.
    pub async fn run(&self, inputs: Vec<W::Input>) -> Result<StageSummary, SchedulerError> {
        let stage = self.worker.stage();
        let run_id = Uuid::new_v4();
        let mut state = SchedulerState::Idle;
        let mut summary = StageSummary {
            run_id,
            stage,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            skipped: 0,
            duplicates: 0,
            batches: 0,
            attempted: 0,
            succeeded: 0,
            unresolved: 0,
            degraded: 0,
        };

        transition(&mut state, SchedulerState::LoadingBatches, stage);
        let done = self.completed_keys().await?;
        let plan = CatalogLoader::new(self.settings.batch_size).plan(inputs, &done);
        summary.skipped = plan.skipped;
        summary.duplicates = plan.duplicates;
        summary.batches = plan.batches.len();
        info!(
            %run_id,
            %stage,
            pending = plan.pending(),
            skipped = plan.skipped,
            batches = plan.batches.len(),
            "stage planned"
        );

        let total = plan.batches.len();
        for (index, batch) in plan.batches.into_iter().enumerate() {
            if index > 0 {
                transition(&mut state, SchedulerState::Delaying { index: index - 1 }, stage);
                let delay = self.jittered_delay();
                debug!(%stage, delay_ms = delay.as_millis() as u64, "pausing between batches");
                self.sleeper.sleep(delay).await;
            }

            transition(&mut state, SchedulerState::ProcessingBatch { index }, stage);
            let span = info_span!("batch", %run_id, %stage, batch = index + 1, of = total);
            let processed: Vec<Processed<W::Output>> = stream::iter(batch)
                .map(|item| self.worker.process(item))
                .buffered(self.settings.concurrency)
                .collect::<Vec<_>>()
                .instrument(span)
                .await;

            let entries = processed
                .iter()
                .map(|item| CheckpointEntry::from_record(&item.record))
                .collect::<Result<Vec<_>, _>>()?;
            self.checkpoint.append_batch(&entries).await?;

            for item in &processed {
                summary.record(item.status);
            }
            info!(
                %stage,
                batch = index + 1,
                of = total,
                written = entries.len(),
                attempted = summary.attempted,
                "batch checkpointed"
            );
        }

        transition(&mut state, SchedulerState::Done, stage);
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            %stage,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            unresolved = summary.unresolved,
            degraded = summary.degraded,
            "stage finished"
        );
        Ok(summary)
    }

    async fn completed_keys(&self) -> Result<HashSet<String>, CheckpointError> {
        Ok(self
            .checkpoint
            .load_values()
            .await?
            .iter()
            .filter(|entry| self.worker.counts_as_done(entry))
            .filter_map(uuid_of)
            .map(str::to_string)
            .collect())
    }

    fn jittered_delay(&self) -> Duration {
        let min = self.settings.delay_min.as_millis() as u64;
        let max = self.settings.delay_max.as_millis() as u64;
        Duration::from_millis(self.random.range_inclusive(min, max))
    }
}

fn transition(state: &mut SchedulerState, next: SchedulerState, stage: Stage) {
    debug!(%stage, from = ?*state, to = ?next, "scheduler state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, EventLog, RecordingCheckpoint, RecordingSleeper};
    use reel_storage::{MemoryCheckpointStore, SequenceRandom};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize)]
    struct Item {
        uuid: String,
        ok: bool,
    }

    impl Keyed for Item {
        fn uuid(&self) -> &str {
            &self.uuid
        }
    }

    /// Echoes its input and tracks how many items run at once.
    #[derive(Default)]
    struct EchoWorker {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StageWorker for EchoWorker {
        type Input = Item;
        type Output = Item;

        fn stage(&self) -> Stage {
            Stage::Resolution
        }

        async fn process(&self, input: Item) -> Processed<Item> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let status = if input.ok {
                ItemStatus::Succeeded
            } else {
                ItemStatus::Unresolved
            };
            Processed { record: input, status }
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                uuid: format!("u{i}"),
                ok: i % 3 != 0,
            })
            .collect()
    }

    fn settings(batch_size: usize, concurrency: usize) -> StageSettings {
        StageSettings {
            batch_size,
            concurrency,
            delay_min: Duration::from_millis(3000),
            delay_max: Duration::from_millis(5000),
        }
    }

    #[tokio::test]
    async fn checkpoints_each_batch_before_pausing() {
        let log = EventLog::default();
        let checkpoint = Arc::new(RecordingCheckpoint::new(log.clone()));
        let scheduler = BatchScheduler::new(
            EchoWorker::default(),
            checkpoint.clone(),
            settings(2, 2),
            Arc::new(RecordingSleeper::new(log.clone())),
            Arc::new(SequenceRandom::new(vec![3500, 9000])),
        );

        let summary = scheduler.run(items(5)).await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.unresolved, 2);
        assert_eq!(summary.succeeded, 3);

        assert_eq!(
            log.events(),
            vec![
                Event::Append(vec!["u0".into(), "u1".into()]),
                Event::Sleep(Duration::from_millis(3500)),
                Event::Append(vec!["u2".into(), "u3".into()]),
                Event::Sleep(Duration::from_millis(5000)),
                Event::Append(vec!["u4".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_order_preserved() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = BatchScheduler::new(
            EchoWorker::default(),
            store.clone(),
            settings(6, 3),
            Arc::new(RecordingSleeper::new(EventLog::default())),
            Arc::new(SequenceRandom::new(vec![0])),
        );
        scheduler.run(items(6)).await.unwrap();

        assert!(scheduler.worker().peak.load(Ordering::SeqCst) <= 3);
        let uuids: Vec<String> = store.entries().await.into_iter().map(|e| e.uuid).collect();
        assert_eq!(uuids, vec!["u0", "u1", "u2", "u3", "u4", "u5"]);
    }

    #[tokio::test]
    async fn rerun_skips_everything_already_checkpointed() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let log = EventLog::default();
        let scheduler = BatchScheduler::new(
            EchoWorker::default(),
            store.clone(),
            settings(4, 1),
            Arc::new(RecordingSleeper::new(log.clone())),
            Arc::new(SequenceRandom::new(vec![4000])),
        );
        scheduler.run(items(3)).await.unwrap();
        let second = scheduler.run(items(3)).await.unwrap();

        assert_eq!(second.attempted, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(second.batches, 0);
        assert_eq!(store.entries().await.len(), 3);
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn failed_append_aborts_the_run() {
        let log = EventLog::default();
        let checkpoint = Arc::new(RecordingCheckpoint::failing_after(log.clone(), 1));
        let scheduler = BatchScheduler::new(
            EchoWorker::default(),
            checkpoint,
            settings(1, 1),
            Arc::new(RecordingSleeper::new(log.clone())),
            Arc::new(SequenceRandom::new(vec![3000])),
        );
        let err = scheduler.run(items(3)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Checkpoint(CheckpointError::Io { .. })));
        assert_eq!(
            log.events(),
            vec![
                Event::Append(vec!["u0".into()]),
                Event::Sleep(Duration::from_millis(3000)),
            ]
        );
    }
}
