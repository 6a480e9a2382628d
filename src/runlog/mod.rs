//! Durable, append-only log of evaluated candidates.
//!
//! The orchestrator appends one [`CandidateRecord`] per collected candidate
//! through an injected [`RunLogger`]. [`JsonlRunLogger`] writes one JSON
//! object per line; [`MemoryRunLogger`] keeps records for tests and for the
//! CLI's `--json` summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::error::RunLogError;

/// One completed candidate as written to the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub env_id: String,
    pub model_id: String,
    pub idx: usize,
    pub lineage: Vec<usize>,
    pub source: String,
    pub source_sha256: String,
    /// Per-episode training returns.
    pub reward_trace: Vec<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Identifiers shared by every record of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub env_id: String,
    pub model_id: String,
}

impl RunContext {
    pub fn new(env_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            env_id: env_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl CandidateRecord {
    /// Builds a record from a candidate that has recorded performances.
    pub fn from_candidate(
        context: &RunContext,
        candidate: &Candidate,
        reward_trace: Vec<f64>,
    ) -> Self {
        let source = candidate.reward_func_str().unwrap_or_default().to_string();
        let performances = candidate.performances().cloned().unwrap_or_default();
        Self {
            timestamp: Utc::now(),
            run_id: context.run_id,
            env_id: context.env_id.clone(),
            model_id: context.model_id.clone(),
            idx: candidate.idx,
            lineage: candidate.lineage.clone(),
            source_sha256: source_fingerprint(&source),
            source,
            reward_trace,
            metrics: performances.metrics,
            success_rate: performances.success_rate,
            failure: performances.failure,
        }
    }
}

/// Hex SHA-256 of a reward function's source.
pub fn source_fingerprint(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Sink for completed candidates.
#[async_trait]
pub trait RunLogger: Send + Sync {
    async fn append(&self, record: &CandidateRecord) -> Result<(), RunLogError>;
}

/// Appends JSON lines to a file, creating parent directories as needed.
#[derive(Debug, Clone)]
pub struct JsonlRunLogger {
    path: PathBuf,
}

impl JsonlRunLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every record in the file.
    pub fn read_all(path: &Path) -> Result<Vec<CandidateRecord>, RunLogError> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(RunLogError::from))
            .collect()
    }
}

#[async_trait]
impl RunLogger for JsonlRunLogger {
    async fn append(&self, record: &CandidateRecord) -> Result<(), RunLogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryRunLogger {
    records: Mutex<Vec<CandidateRecord>>,
}

impl MemoryRunLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CandidateRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunLogger for MemoryRunLogger {
    async fn append(&self, record: &CandidateRecord) -> Result<(), RunLogError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}
