//! Two-stage catalog pipeline: resolve external ids, then enrich resolved records.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use reel_storage::{
    uuid_of, CatalogError, CheckpointStore, HttpFetcher, JsonlCheckpointStore, PageFetcher, RandomSource,
    ThreadRandom,
};
use serde::Serialize;
use tracing::info;

pub mod config;
pub mod enrichment;
pub mod loader;
pub mod resolver;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{MatchThresholds, PipelineConfig, StageSettings, UnresolvedPolicy};
pub use enrichment::{EnrichmentAggregator, EnrichmentReport, EnrichmentWorker, SubFetchOutcome};
pub use loader::{BatchPlan, CatalogLoader};
pub use resolver::{
    runtime_relative_difference, title_similarity, IdentityResolver, MatchAssessment, RejectReason,
    ResolutionWorker, ResolveOutcome,
};
pub use scheduler::{
    BatchScheduler, ItemStatus, Processed, SchedulerError, SchedulerState, Sleeper, Stage, StageSummary,
    StageWorker, TokioSleeper,
};

pub const CRATE_NAME: &str = "reel-sync";

/// Checkpoint progress of both stages without fetching anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub catalog_records: usize,
    pub resolution_entries: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub enriched: usize,
}

/// The configured pipeline with its capabilities wired in.
pub struct Pipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn PageFetcher>,
    random: Arc<dyn RandomSource>,
    sleeper: Arc<dyn Sleeper>,
}

impl Pipeline {
    /// Production wiring: HTTP fetcher with rotating user agents, thread RNG, tokio timers.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let random: Arc<dyn RandomSource> = Arc::new(ThreadRandom);
        let fetcher = HttpFetcher::new(config.http_client_config(), random.clone())
            .context("building http fetcher")?;
        Ok(Self::with_capabilities(
            config,
            Arc::new(fetcher),
            random,
            Arc::new(TokioSleeper),
        ))
    }

    pub fn with_capabilities(
        config: PipelineConfig,
        fetcher: Arc<dyn PageFetcher>,
        random: Arc<dyn RandomSource>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            fetcher,
            random,
            sleeper,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_resolution(&self) -> Result<StageSummary> {
        let catalog = CatalogLoader::load_catalog(&self.config.catalog_path)
            .await
            .context("loading catalog")?;
        let resolver = IdentityResolver::new(
            self.fetcher.clone(),
            self.config.endpoints.clone(),
            self.config.thresholds,
        );
        let worker = ResolutionWorker::new(resolver, self.config.unresolved_policy);
        let checkpoint = Arc::new(JsonlCheckpointStore::new(&self.config.resolved_path));
        let scheduler = BatchScheduler::new(
            worker,
            checkpoint,
            self.config.resolution,
            self.sleeper.clone(),
            self.random.clone(),
        );
        scheduler
            .run(catalog)
            .await
            .with_context(|| format!("resolution checkpoint {}", self.config.resolved_path.display()))
    }

    pub async fn run_enrichment(&self) -> Result<StageSummary> {
        let resolved = CatalogLoader::load_resolved(&self.config.resolved_path)
            .await
            .context("loading resolution checkpoint; run the resolve stage first")?;
        let aggregator = EnrichmentAggregator::new(self.fetcher.clone(), self.config.endpoints.clone());
        let checkpoint = Arc::new(JsonlCheckpointStore::new(&self.config.enriched_path));
        let scheduler = BatchScheduler::new(
            EnrichmentWorker::new(aggregator),
            checkpoint,
            self.config.enrichment,
            self.sleeper.clone(),
            self.random.clone(),
        );
        scheduler
            .run(resolved)
            .await
            .with_context(|| format!("enrichment checkpoint {}", self.config.enriched_path.display()))
    }

    /// Resolution followed by enrichment.
    pub async fn run_all(&self) -> Result<Vec<StageSummary>> {
        let resolution = self.run_resolution().await?;
        let enrichment = self.run_enrichment().await?;
        info!(
            resolved = resolution.succeeded,
            enriched = enrichment.attempted,
            "pipeline run complete"
        );
        Ok(vec![resolution, enrichment])
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let catalog_records = match CatalogLoader::load_catalog(&self.config.catalog_path).await {
            Ok(records) => records.len(),
            Err(CatalogError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                0
            }
            Err(err) => return Err(err).context("loading catalog"),
        };

        // last entry per uuid decides whether it is resolved
        let mut latest: HashMap<String, bool> = HashMap::new();
        for entry in JsonlCheckpointStore::new(&self.config.resolved_path)
            .load_values()
            .await
            .context("reading resolution checkpoint")?
        {
            if let Some(uuid) = uuid_of(&entry) {
                let resolved = entry.get("externalId").is_some_and(|id| !id.is_null());
                latest.insert(uuid.to_string(), resolved);
            }
        }
        let resolved = latest.values().filter(|resolved| **resolved).count();
        let enriched = JsonlCheckpointStore::new(&self.config.enriched_path)
            .load_keys()
            .await
            .context("reading enrichment checkpoint")?
            .len();

        Ok(PipelineStatus {
            catalog_records,
            resolution_entries: latest.len(),
            resolved,
            unresolved: latest.len() - resolved,
            enriched,
        })
    }
}

/// Pipeline configured from `REEL_*` environment variables.
pub fn pipeline_from_env() -> Result<Pipeline> {
    Pipeline::new(PipelineConfig::from_env())
}
