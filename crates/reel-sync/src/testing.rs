//! Test doubles for the fetch, checkpoint and sleep capabilities.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reel_storage::{
    CheckpointEntry, CheckpointError, CheckpointStore, FetchError, MemoryCheckpointStore, PageFetcher,
};
use serde_json::Value as JsonValue;

use crate::scheduler::Sleeper;

/// Serves canned HTML by exact URL; anything else is a 404.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    pages: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: impl Into<String>, html: &str) -> Self {
        self.pages.insert(url.into(), html.to_string());
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Append(Vec<String>),
    Sleep(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

pub struct RecordingSleeper {
    log: EventLog,
}

impl RecordingSleeper {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.log.push(Event::Sleep(duration));
    }
}

/// Memory checkpoint that logs appends and can start failing after `n` of them.
pub struct RecordingCheckpoint {
    inner: MemoryCheckpointStore,
    log: EventLog,
    fail_after: Option<usize>,
    appends: Mutex<usize>,
}

impl RecordingCheckpoint {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            log,
            fail_after: None,
            appends: Mutex::new(0),
        }
    }

    pub fn failing_after(log: EventLog, appends: usize) -> Self {
        Self {
            fail_after: Some(appends),
            ..Self::new(log)
        }
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpoint {
    async fn load_values(&self) -> Result<Vec<JsonValue>, CheckpointError> {
        self.inner.load_values().await
    }

    async fn append_batch(&self, entries: &[CheckpointEntry]) -> Result<(), CheckpointError> {
        {
            let mut appends = self.appends.lock().unwrap();
            if self.fail_after.is_some_and(|limit| *appends >= limit) {
                return Err(CheckpointError::Io {
                    path: PathBuf::from("memory"),
                    source: std::io::Error::other("disk full"),
                });
            }
            *appends += 1;
        }
        self.log
            .push(Event::Append(entries.iter().map(|e| e.uuid.clone()).collect()));
        self.inner.append_batch(entries).await
    }
}
