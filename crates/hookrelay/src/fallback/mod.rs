//! Fallback file store.
//!
//! Last-resort durable storage for events that neither the broker nor the
//! store accepted. Each event is one pretty-printed JSON file named after its
//! id. The file's directory is its state:
//!
//! ```text
//! {root}/pending/webhook-<id>.json    waiting for the reconciler
//! {root}/processed/webhook-<id>.json  re-delivered
//! {root}/failed/webhook-<id>.json     could not be re-delivered or parsed
//! ```
//!
//! Files are written to a dot-prefixed temp file and renamed into place, and
//! every state change is a rename between sibling directories, so a file is
//! never observed half-written or in two states.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use hookrelay_core::emit;

use crate::error::{
    CreateDirSnafu, FallbackError, InvalidFileNameSnafu, ListDirSnafu, MoveFileSnafu,
    ParseRecordSnafu, ReadFileSnafu, SerializeRecordSnafu, WriteFileSnafu,
};
use crate::event::{Event, EventId};
use crate::metrics::events::FallbackTransition;

const FILE_PREFIX: &str = "webhook-";
const FILE_SUFFIX: &str = ".json";

/// Lifecycle state of a fallback file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Processed,
    Failed,
}

impl FileState {
    pub const ALL: [FileState; 3] = [FileState::Pending, FileState::Processed, FileState::Failed];

    pub fn dir_name(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Processed => "processed",
            FileState::Failed => "failed",
        }
    }
}

/// What is written to disk: the event plus why it ended up here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRecord {
    #[serde(flatten)]
    pub event: Event,
    pub saved_at: DateTime<Utc>,
    pub fallback_reason: String,
}

/// File name for an event id.
pub fn file_name(id: &EventId) -> String {
    format!("{FILE_PREFIX}{id}{FILE_SUFFIX}")
}

fn is_fallback_name(name: &str) -> bool {
    name.len() > FILE_PREFIX.len() + FILE_SUFFIX.len()
        && name.starts_with(FILE_PREFIX)
        && name.ends_with(FILE_SUFFIX)
        && !name.contains(['/', '\\'])
}

/// Directory-backed store of fallback records.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    root: PathBuf,
}

impl FallbackStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: FileState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    async fn ensure_dir(&self, state: FileState) -> Result<PathBuf, FallbackError> {
        let dir = self.dir(state);
        fs::create_dir_all(&dir)
            .await
            .context(CreateDirSnafu { path: &dir })?;
        Ok(dir)
    }

    /// Write `event` to `pending`. Saving the same event again replaces the
    /// earlier file and clears any copy left in another state.
    pub async fn save(&self, event: &Event, reason: &str) -> Result<PathBuf, FallbackError> {
        self.write(FileState::Pending, event, reason).await
    }

    /// Write `event` straight to `failed`, for events whose last recovery
    /// attempt already failed.
    pub async fn park_failed(&self, event: &Event, reason: &str) -> Result<PathBuf, FallbackError> {
        self.write(FileState::Failed, event, reason).await
    }

    async fn write(
        &self,
        state: FileState,
        event: &Event,
        reason: &str,
    ) -> Result<PathBuf, FallbackError> {
        let record = FallbackRecord {
            event: event.clone(),
            saved_at: Utc::now(),
            fallback_reason: reason.to_string(),
        };
        let contents = serde_json::to_vec_pretty(&record).context(SerializeRecordSnafu)?;

        let dir = self.ensure_dir(state).await?;
        let name = file_name(&event.id);
        let path = dir.join(&name);
        let tmp_path = dir.join(format!(".{name}.tmp"));

        let mut file = fs::File::create(&tmp_path)
            .await
            .context(WriteFileSnafu { path: &tmp_path })?;
        file.write_all(&contents)
            .await
            .context(WriteFileSnafu { path: &tmp_path })?;
        file.sync_all()
            .await
            .context(WriteFileSnafu { path: &tmp_path })?;
        drop(file);

        fs::rename(&tmp_path, &path).await.context(MoveFileSnafu {
            from: &tmp_path,
            to: &path,
        })?;

        for other in FileState::ALL.into_iter().filter(|s| *s != state) {
            let stale = self.dir(other).join(&name);
            if fs::remove_file(&stale).await.is_ok() {
                debug!(path = %stale.display(), "Removed stale copy");
            }
        }

        info!(event_id = %event.id, state = state.dir_name(), reason, "Event saved to fallback file");
        emit!(FallbackTransition { state });
        Ok(path)
    }

    /// Names of pending files, sorted. Temp files and anything not named
    /// `webhook-*.json` are skipped.
    pub async fn list_pending(&self) -> Result<Vec<String>, FallbackError> {
        self.list(FileState::Pending).await
    }

    pub async fn list(&self, state: FileState) -> Result<Vec<String>, FallbackError> {
        let dir = self.dir(state);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(source).context(ListDirSnafu { path: &dir }),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ListDirSnafu { path: &dir })?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_fallback_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn checked_name<'a>(&self, name: &'a str) -> Result<&'a str, FallbackError> {
        ensure!(is_fallback_name(name), InvalidFileNameSnafu { name });
        Ok(name)
    }

    /// Read and parse a pending file.
    pub async fn load(&self, name: &str) -> Result<FallbackRecord, FallbackError> {
        let path = self.dir(FileState::Pending).join(self.checked_name(name)?);
        let contents = fs::read(&path).await.context(ReadFileSnafu { path: &path })?;
        serde_json::from_slice(&contents).context(ParseRecordSnafu { path: &path })
    }

    /// Move a pending file to `processed`.
    pub async fn mark_processed(&self, name: &str) -> Result<PathBuf, FallbackError> {
        self.transition(name, FileState::Processed).await
    }

    /// Move a pending file to `failed`.
    pub async fn mark_failed(&self, name: &str) -> Result<PathBuf, FallbackError> {
        self.transition(name, FileState::Failed).await
    }

    async fn transition(&self, name: &str, to: FileState) -> Result<PathBuf, FallbackError> {
        let name = self.checked_name(name)?;
        let from = self.dir(FileState::Pending).join(name);
        let target = self.ensure_dir(to).await?.join(name);

        fs::rename(&from, &target).await.context(MoveFileSnafu {
            from: &from,
            to: &target,
        })?;

        debug!(file = name, state = to.dir_name(), "Fallback file moved");
        emit!(FallbackTransition { state: to });
        Ok(target)
    }

    /// Which state directory currently holds `name`, if any.
    pub async fn locate(&self, name: &str) -> Option<FileState> {
        for state in FileState::ALL {
            if fs::try_exists(self.dir(state).join(name))
                .await
                .unwrap_or(false)
            {
                return Some(state);
            }
        }
        None
    }
}
