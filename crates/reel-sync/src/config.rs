use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reel_adapters::SourceEndpoints;
use reel_storage::{HttpClientConfig, DEFAULT_USER_AGENTS};
use serde::{Deserialize, Serialize};

/// What a rerun does with catalog entries whose earlier search found no match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Attempted entries are never searched again, matched or not.
    #[default]
    SkipPermanently,
    /// Entries checkpointed without an `externalId` are searched again. The
    /// resolution checkpoint may then hold several lines for one `uuid`;
    /// readers keep the last.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub min_title_similarity: f64,
    pub max_runtime_difference: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            min_title_similarity: 0.8,
            max_runtime_difference: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub delay_min: Duration,
    pub delay_max: Duration,
}

impl StageSettings {
    pub fn resolution_defaults() -> Self {
        Self {
            batch_size: 50,
            concurrency: 5,
            delay_min: Duration::from_millis(3000),
            delay_max: Duration::from_millis(5000),
        }
    }

    pub fn enrichment_defaults() -> Self {
        Self {
            batch_size: 10,
            concurrency: 1,
            ..Self::resolution_defaults()
        }
    }

    /// Zero sizes become 1 and an inverted delay range collapses onto `delay_min`.
    pub fn normalized(self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            concurrency: self.concurrency.max(1),
            delay_min: self.delay_min,
            delay_max: self.delay_max.max(self.delay_min),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub catalog_path: PathBuf,
    pub resolved_path: PathBuf,
    pub enriched_path: PathBuf,
    pub user_agents: Vec<String>,
    pub http_timeout: Duration,
    pub max_in_flight: usize,
    pub endpoints: SourceEndpoints,
    pub thresholds: MatchThresholds,
    pub resolution: StageSettings,
    pub enrichment: StageSettings,
    pub unresolved_policy: UnresolvedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl PipelineConfig {
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            catalog_path: data_dir.join("rawfilms.jsonl"),
            resolved_path: data_dir.join("processedFilms.jsonl"),
            enriched_path: data_dir.join("scrapedfilms.jsonl"),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            http_timeout: Duration::from_secs(20),
            max_in_flight: 16,
            endpoints: SourceEndpoints::default(),
            thresholds: MatchThresholds::default(),
            resolution: StageSettings::resolution_defaults(),
            enrichment: StageSettings::enrichment_defaults(),
            unresolved_policy: UnresolvedPolicy::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let data_dir = lookup("REEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let mut config = Self::with_data_dir(&data_dir);

        if let Some(path) = lookup("REEL_CATALOG_PATH") {
            config.catalog_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("REEL_RESOLVED_PATH") {
            config.resolved_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("REEL_ENRICHED_PATH") {
            config.enriched_path = PathBuf::from(path);
        }
        if let Some(secs) = parsed("REEL_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parsed("REEL_RESOLVE_BATCH_SIZE") {
            config.resolution.batch_size = n as usize;
        }
        if let Some(n) = parsed("REEL_RESOLVE_CONCURRENCY") {
            config.resolution.concurrency = n as usize;
        }
        if let Some(n) = parsed("REEL_ENRICH_BATCH_SIZE") {
            config.enrichment.batch_size = n as usize;
        }
        if let Some(n) = parsed("REEL_ENRICH_CONCURRENCY") {
            config.enrichment.concurrency = n as usize;
        }
        if let Some(ms) = parsed("REEL_DELAY_MIN_MS") {
            config.resolution.delay_min = Duration::from_millis(ms);
            config.enrichment.delay_min = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("REEL_DELAY_MAX_MS") {
            config.resolution.delay_max = Duration::from_millis(ms);
            config.enrichment.delay_max = Duration::from_millis(ms);
        }
        if let Some(retry) = lookup("REEL_RETRY_UNRESOLVED") {
            if matches!(retry.as_str(), "1" | "true" | "TRUE" | "True") {
                config.unresolved_policy = UnresolvedPolicy::Retry;
            }
        }
        config.normalized()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text).context("decoding pipeline config yaml")?;
        Ok(file.into_config())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agents: self.user_agents.clone(),
            max_in_flight: self.max_in_flight,
        }
    }

    fn normalized(mut self) -> Self {
        self.resolution = self.resolution.normalized();
        self.enrichment = self.enrichment.normalized();
        self.max_in_flight = self.max_in_flight.max(1);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    resolved_path: Option<PathBuf>,
    enriched_path: Option<PathBuf>,
    user_agents: Option<Vec<String>>,
    http_timeout_secs: Option<u64>,
    max_in_flight: Option<usize>,
    endpoints: Option<SourceEndpoints>,
    min_title_similarity: Option<f64>,
    max_runtime_difference: Option<f64>,
    resolution: Option<StageFile>,
    enrichment: Option<StageFile>,
    unresolved_policy: Option<UnresolvedPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StageFile {
    batch_size: Option<usize>,
    concurrency: Option<usize>,
    delay_min_ms: Option<u64>,
    delay_max_ms: Option<u64>,
}

impl StageFile {
    fn apply(self, base: StageSettings) -> StageSettings {
        StageSettings {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            concurrency: self.concurrency.unwrap_or(base.concurrency),
            delay_min: self.delay_min_ms.map(Duration::from_millis).unwrap_or(base.delay_min),
            delay_max: self.delay_max_ms.map(Duration::from_millis).unwrap_or(base.delay_max),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> PipelineConfig {
        let mut config = match &self.data_dir {
            Some(dir) => PipelineConfig::with_data_dir(dir),
            None => PipelineConfig::default(),
        };
        override_with(&mut config.catalog_path, self.catalog_path);
        override_with(&mut config.resolved_path, self.resolved_path);
        override_with(&mut config.enriched_path, self.enriched_path);
        override_with(&mut config.user_agents, self.user_agents.filter(|pool| !pool.is_empty()));
        override_with(&mut config.http_timeout, self.http_timeout_secs.map(Duration::from_secs));
        override_with(&mut config.max_in_flight, self.max_in_flight);
        override_with(&mut config.endpoints, self.endpoints);
        override_with(&mut config.thresholds.min_title_similarity, self.min_title_similarity);
        override_with(&mut config.thresholds.max_runtime_difference, self.max_runtime_difference);
        override_with(&mut config.unresolved_policy, self.unresolved_policy);
        if let Some(stage) = self.resolution {
            config.resolution = stage.apply(config.resolution);
        }
        if let Some(stage) = self.enrichment {
            config.enrichment = stage.apply(config.enrichment);
        }
        config.normalized()
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}
