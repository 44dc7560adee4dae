// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk overflow journal: one file per undelivered batch.
//!
//! Layout: `<data_dir>/<id as 20 digits>.batch`, JSON. Every write goes to a `.tmp` sibling,
//! is synced, then renamed over the final name, so a record is either absent or complete.
//! Callers serialize access to a given record (see `flusher`); the journal itself holds no
//! locks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::constants::{
    JOURNAL_CORRUPT_EXTENSION, JOURNAL_EXTENSION, JOURNAL_FORMAT_VERSION, JOURNAL_TMP_EXTENSION,
};
use crate::errors::JournalError;

#[derive(Serialize)]
struct RecordRef<'a> {
    version: u32,
    batch: &'a Batch,
}

#[derive(Deserialize)]
struct Record {
    version: u32,
    batch: Batch,
}

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// Opens (creating if needed) the journal directory, checks it is writable and removes
    /// temp files left by an interrupted write.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| JournalError::io(&dir, e))?;

        let probe = dir.join(format!(".probe.{JOURNAL_TMP_EXTENSION}"));
        fs::write(&probe, b"")
            .await
            .map_err(|e| JournalError::io(&probe, e))?;
        fs::remove_file(&probe)
            .await
            .map_err(|e| JournalError::io(&probe, e))?;

        let journal = Journal { dir };
        journal.remove_stale_temp_files().await?;
        debug!("Journal opened at {:?}", journal.dir);
        Ok(journal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:020}.{JOURNAL_EXTENSION}"))
    }

    /// Atomically creates or replaces the record for `batch`.
    pub async fn write(&self, batch: &Batch) -> Result<(), JournalError> {
        let path = self.path_for(batch.id());
        let tmp_path = path.with_extension(format!("{JOURNAL_EXTENSION}.{JOURNAL_TMP_EXTENSION}"));
        let data = serde_json::to_vec(&RecordRef {
            version: JOURNAL_FORMAT_VERSION,
            batch,
        })
        .map_err(JournalError::Serialize)?;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| JournalError::io(&tmp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| JournalError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| JournalError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| JournalError::io(&path, e))?;
        self.sync_dir().await?;

        debug!(
            "Journaled batch {} ({} events, {} attempts, {} bytes)",
            batch.id(),
            batch.len(),
            batch.attempts(),
            data.len()
        );
        Ok(())
    }

    /// Reads the record for `id`. A record that no longer exists is `Ok(None)`.
    pub async fn read(&self, id: u64) -> Result<Option<Batch>, JournalError> {
        let path = self.path_for(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JournalError::io(&path, e)),
        };
        let record: Record = serde_json::from_slice(&data)
            .map_err(|source| JournalError::Corrupt { path, source })?;
        if record.version > JOURNAL_FORMAT_VERSION {
            warn!(
                "Journal record {id} has format version {} (newer than {JOURNAL_FORMAT_VERSION})",
                record.version
            );
        }
        Ok(Some(record.batch))
    }

    pub async fn contains(&self, id: u64) -> Result<bool, JournalError> {
        let path = self.path_for(id);
        fs::try_exists(&path)
            .await
            .map_err(|e| JournalError::io(&path, e))
    }

    /// Deletes the record for `id`. Returns false if there was nothing to delete.
    pub async fn remove(&self, id: u64) -> Result<bool, JournalError> {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.sync_dir().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(JournalError::io(&path, e)),
        }
    }

    /// Identifiers of all records, oldest first.
    pub async fn list(&self) -> Result<Vec<u64>, JournalError> {
        self.ids_with_extension(&[JOURNAL_EXTENSION]).await
    }

    /// Highest identifier ever used in this directory, quarantined records included.
    pub async fn highest_id(&self) -> Result<Option<u64>, JournalError> {
        let ids = self
            .ids_with_extension(&[JOURNAL_EXTENSION, JOURNAL_CORRUPT_EXTENSION])
            .await?;
        Ok(ids.last().copied())
    }

    async fn ids_with_extension(&self, extensions: &[&str]) -> Result<Vec<u64>, JournalError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| JournalError::io(&self.dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JournalError::io(&self.dir, e))?
        {
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(ext) if extensions.contains(&ext) => {}
                _ => continue,
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Moves an unreadable record out of the way so it is never retried.
    pub async fn quarantine(&self, id: u64) -> Result<PathBuf, JournalError> {
        let path = self.path_for(id);
        let target = path.with_extension(JOURNAL_CORRUPT_EXTENSION);
        fs::rename(&path, &target)
            .await
            .map_err(|e| JournalError::io(&path, e))?;
        Ok(target)
    }

    async fn remove_stale_temp_files(&self) -> Result<(), JournalError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| JournalError::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JournalError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(JOURNAL_TMP_EXTENSION) {
                warn!("Removing partial journal write {:?}", path);
                fs::remove_file(&path)
                    .await
                    .map_err(|e| JournalError::io(&path, e))?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), JournalError> {
        let dir = fs::File::open(&self.dir)
            .await
            .map_err(|e| JournalError::io(&self.dir, e))?;
        dir.sync_all()
            .await
            .map_err(|e| JournalError::io(&self.dir, e))
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), JournalError> {
        Ok(())
    }
}
