//! Failure recovery.
//!
//! Recovery is opt-in: hand [`RecoveryConfig`] to the entry points in
//! [`crate::execution`] and each worker will persist snapshots of
//! operator state and its progress through the epoch stream to a
//! SQLite file in a shared directory. On the next execution the
//! cluster reads all those files back, finds the last epoch every
//! worker finished, and rebuilds operator state as of the close of the
//! epoch before it.
//!
//! The resume epoch calculation is deterministic so every worker in
//! the resumed cluster independently converges on the same answer.

use std::path::Path;
use std::path::PathBuf;

use crate::errors::{EngineError, Result};
use crate::execution::WorkerIndex;

use self::model::*;
use self::store::in_mem::InMemProgress;
use self::store::in_mem::InMemStore;
use self::store::sqlite::list_db_files;
use self::store::sqlite::worker_db_file;
use self::store::sqlite::SqliteProgressReader;
use self::store::sqlite::SqliteProgressWriter;
use self::store::sqlite::SqliteStateReader;
use self::store::sqlite::SqliteStateWriter;

pub mod model;
pub mod store;

/// Configuration for a SQLite-backed recovery store.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Directory the per-worker DB files live in. Must be readable
    /// and writeable by every worker process.
    pub db_dir: PathBuf,
}

impl RecoveryConfig {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    fn check_dir(&self) -> Result<&Path> {
        if !self.db_dir.is_dir() {
            return Err(EngineError::Config(format!(
                "recovery directory {:?} does not exist",
                self.db_dir
            )));
        }
        Ok(&self.db_dir)
    }
}

/// The writer half of recovery, owned by one worker for the life of an
/// execution.
pub(crate) struct RecoveryBundle {
    pub(crate) state_writer: Box<dyn StateWriter>,
    pub(crate) progress_writer: Box<dyn ProgressWriter>,
}

impl RecoveryBundle {
    pub(crate) fn build(config: &RecoveryConfig, index: WorkerIndex) -> Result<Self> {
        let db_dir = config.check_dir()?;
        let db_file = worker_db_file(db_dir, index);
        Ok(Self {
            state_writer: Box::new(SqliteStateWriter::new(&db_file)?),
            progress_writer: Box::new(SqliteProgressWriter::new(&db_file)?),
        })
    }
}

/// Read back everything a previous execution left behind.
///
/// Returns where the new execution should resume and the state each
/// stateful step should be rebuilt from. Every worker reads all DB
/// files, not just its own; a key's owning worker can change when the
/// cluster is resized, so each worker picks out the keys that route to
/// it afterwards.
pub(crate) fn read_resume_state(
    config: &RecoveryConfig,
) -> Result<(ResumeFrom, FlowStateBytes)> {
    let db_dir = config.check_dir()?;
    let db_files = list_db_files(db_dir)?;

    let mut progress = InMemProgress::new();
    for db_file in &db_files {
        let mut reader = SqliteProgressReader::new(db_file)?;
        while let Some(kchange) = reader.read() {
            progress.write(kchange);
        }
    }
    let resume_from = progress.resume_from();
    tracing::info!("Calculated {resume_from:?}");

    let ResumeFrom(_ex, resume_epoch) = resume_from;
    let mut store = InMemStore::new();
    for db_file in &db_files {
        let mut reader = SqliteStateReader::new(db_file)?;
        while let Some(kchange) = reader.read() {
            store.write(kchange);
        }
    }
    // Snapshots from epochs the previous execution never finalized
    // must not leak into the resumed state.
    store.filter_before(&resume_epoch);
    store.filter_last();

    let mut resume_state = FlowStateBytes::new();
    for kchange in store.drain_flatten() {
        resume_state.write(kchange);
    }

    Ok((resume_from, resume_state))
}
