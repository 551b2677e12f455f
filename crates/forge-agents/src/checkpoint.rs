//! Checkpoints: restorable snapshots of build progress.
//!
//! A checkpoint is immutable once created. The store capability is
//! pluggable; reads by id are idempotent and strongly consistent within a
//! build. Two backends ship here: an in-memory store for tests and
//! single-process runs, and a JSON-file store (one pretty-printed file per
//! checkpoint) for crash-safe resume.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::AgentState;

/// A restorable snapshot of FSM progress. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub build_id: String,
    pub state: AgentState,
    pub step_index: u32,
    pub created_at: DateTime<Utc>,
    pub description: String,
    /// Opaque serialized workspace state; the FSM never looks inside.
    pub snapshot: serde_json::Value,
    pub can_restore: bool,
}

/// Pluggable checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
    async fn get_checkpoint(&self, build_id: &str, id: &str)
        -> anyhow::Result<Option<Checkpoint>>;
    async fn list_checkpoints(&self, build_id: &str) -> anyhow::Result<Vec<Checkpoint>>;
    async fn delete_checkpoint(&self, build_id: &str, id: &str) -> anyhow::Result<()>;
}

/// In-memory store keyed by build id.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(checkpoint.build_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        build_id: &str,
        id: &str,
    ) -> anyhow::Result<Option<Checkpoint>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(build_id)
            .and_then(|cps| cps.iter().find(|cp| cp.id == id))
            .cloned())
    }

    async fn list_checkpoints(&self, build_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(build_id).cloned().unwrap_or_default())
    }

    async fn delete_checkpoint(&self, build_id: &str, id: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cps) = entries.get_mut(build_id) {
            cps.retain(|cp| cp.id != id);
        }
        Ok(())
    }
}

/// One JSON file per checkpoint under `root/<build_id>/<id>.json`.
pub struct JsonCheckpointStore {
    root: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_dir(&self, build_id: &str) -> PathBuf {
        self.root.join(build_id)
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let dir = self.build_dir(&checkpoint.build_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", checkpoint.id));
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&path, json).await?;
        info!(
            path = %path.display(),
            state = %checkpoint.state,
            step_index = checkpoint.step_index,
            "saved checkpoint"
        );
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        build_id: &str,
        id: &str,
    ) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.build_dir(build_id).join(format!("{id}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint file");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_checkpoints(&self, build_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let dir = self.build_dir(build_id);
        let mut checkpoints = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let contents = tokio::fs::read_to_string(entry.path()).await?;
                checkpoints.push(serde_json::from_str(&contents)?);
            }
        }
        checkpoints.sort_by_key(|cp: &Checkpoint| cp.created_at);
        Ok(checkpoints)
    }

    async fn delete_checkpoint(&self, build_id: &str, id: &str) -> anyhow::Result<()> {
        let path = self.build_dir(build_id).join(format!("{id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
