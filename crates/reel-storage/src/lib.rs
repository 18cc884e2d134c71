//! Checkpoint logs, catalog reading and HTTP fetch utilities.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reel_core::Keyed;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "reel-storage";

/// Browser strings rotated across requests.
pub const DEFAULT_USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; WOW64; Trident/7.0; rv:11.0) like Gecko",
    "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/86.0.4240.198 Mobile Safari/537.36",
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint line {line} in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint entry in {path} has an unexpected shape: {source}")]
    Shape {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing checkpoint entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One serialized line destined for a stage checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub uuid: String,
    pub line: String,
}

impl CheckpointEntry {
    pub fn from_record<R: Serialize + Keyed>(record: &R) -> Result<Self, CheckpointError> {
        Ok(Self {
            uuid: record.uuid().to_string(),
            line: serde_json::to_string(record)?,
        })
    }
}

/// Append-only record of the items a stage has attempted.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Every parsed entry in append order. A store that does not exist yet is empty.
    async fn load_values(&self) -> Result<Vec<JsonValue>, CheckpointError>;

    async fn append_batch(&self, entries: &[CheckpointEntry]) -> Result<(), CheckpointError>;

    /// The resume-dedup set: `uuid` of every entry.
    async fn load_keys(&self) -> Result<HashSet<String>, CheckpointError> {
        Ok(self
            .load_values()
            .await?
            .iter()
            .filter_map(uuid_of)
            .map(str::to_string)
            .collect())
    }
}

pub fn uuid_of(value: &JsonValue) -> Option<&str> {
    value.get("uuid").and_then(JsonValue::as_str)
}

/// JSON-lines checkpoint file. Lines are only ever appended.
#[derive(Debug)]
pub struct JsonlCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Drop a partial final line left by a process killed mid-write, so the
    /// next append starts on a line boundary.
    async fn trim_torn_tail(&self) -> Result<(), CheckpointError> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_err(err)),
        };
        let len = file.metadata().await.map_err(|e| self.io_err(e))?.len();
        if len == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::End(-1))
            .await
            .map_err(|e| self.io_err(e))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)
            .await
            .map_err(|e| self.io_err(e))?;
        if last[0] == b'\n' {
            return Ok(());
        }
        drop(file);

        let bytes = fs::read(&self.path).await.map_err(|e| self.io_err(e))?;
        let keep = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        if serde_json::from_slice::<JsonValue>(&bytes[keep..]).is_ok() {
            // Complete entry that only lacks its newline.
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.io_err(e))?;
            file.write_all(b"\n").await.map_err(|e| self.io_err(e))?;
            return Ok(());
        }
        warn!(
            path = %self.path.display(),
            dropped_bytes = bytes.len() - keep,
            "truncating torn checkpoint tail before append"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.set_len(keep as u64)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn load_values(&self) -> Result<Vec<JsonValue>, CheckpointError> {
        // Raw bytes: a torn write may split a multi-byte character, which only
        // the final line is allowed to contain.
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet; starting from zero");
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.io_err(err)),
        };

        let lines: Vec<(usize, &[u8])> = bytes
            .split(|b| *b == b'\n')
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_ascii()))
            .filter(|(_, line)| !line.is_empty())
            .collect();
        let last_line_no = lines.last().map(|(no, _)| *no);

        let mut values = Vec::with_capacity(lines.len());
        for (line_no, line) in lines {
            match serde_json::from_slice::<JsonValue>(line) {
                Ok(value) => values.push(value),
                Err(source) if Some(line_no) == last_line_no => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no,
                        error = %source,
                        "skipping torn trailing checkpoint line"
                    );
                }
                Err(source) => {
                    return Err(CheckpointError::Corrupt {
                        path: self.path.clone(),
                        line: line_no,
                        source,
                    })
                }
            }
        }
        Ok(values)
    }

    async fn append_batch(&self, entries: &[CheckpointEntry]) -> Result<(), CheckpointError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        self.trim_torn_tail().await?;

        let mut payload = String::new();
        for entry in entries {
            payload.push_str(&entry.line);
            payload.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(payload.as_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;
        file.sync_data().await.map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// In-process checkpoint used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<Vec<CheckpointEntry>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<CheckpointEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub async fn entries(&self) -> Vec<CheckpointEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_values(&self) -> Result<Vec<JsonValue>, CheckpointError> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|entry| serde_json::from_str(&entry.line).map_err(CheckpointError::from))
            .collect()
    }

    async fn append_batch(&self, entries: &[CheckpointEntry]) -> Result<(), CheckpointError> {
        self.entries.lock().await.extend_from_slice(entries);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog {path} line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Read a JSON-lines file, ignoring blank lines.
pub async fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, CatalogError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_jsonl(path, &text)
}

fn parse_jsonl<T: DeserializeOwned>(path: &Path, text: &str) -> Result<Vec<T>, CatalogError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// Source of the randomness used for user-agent rotation and batch jitter.
pub trait RandomSource: Send + Sync {
    /// Uniform index in `0..len`; `len` is never zero.
    fn pick_index(&self, len: usize) -> usize;
    /// Uniform value in `low..=high`.
    fn range_inclusive(&self, low: u64, high: u64) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick_index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len.max(1))
    }

    fn range_inclusive(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }
}

/// Replays a fixed cycle of values; results are clamped into the requested range.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<u64>,
    cursor: StdMutex<usize>,
}

impl SequenceRandom {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            cursor: StdMutex::new(0),
        }
    }

    fn next_value(&self) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let value = self.values[*cursor % self.values.len()];
        *cursor += 1;
        value
    }
}

impl RandomSource for SequenceRandom {
    fn pick_index(&self, len: usize) -> usize {
        (self.next_value() as usize) % len.max(1)
    }

    fn range_inclusive(&self, low: u64, high: u64) -> u64 {
        self.next_value().clamp(low, high.max(low))
    }
}

pub fn pick_user_agent<'a>(pool: &'a [String], random: &dyn RandomSource) -> Option<&'a str> {
    if pool.is_empty() {
        return None;
    }
    pool.get(random.pick_index(pool.len())).map(String::as_str)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

/// The fetch capability the resolver and aggregator depend on.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            max_in_flight: 16,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    user_agents: Vec<String>,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("user_agents", &self.user_agents.len())
            .field("available_permits", &self.in_flight.available_permits())
            .finish()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, random: Arc<dyn RandomSource>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            user_agents: config.user_agents,
            random,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut request = self.client.get(url);
        if let Some(user_agent) = pick_user_agent(&self.user_agents, self.random.as_ref()) {
            request = request.header(USER_AGENT, user_agent);
        }

        let span = info_span!("http_fetch", url);
        async move {
            let resp = request.send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            resp.text().await.map_err(|err| classify(err, url))
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}
