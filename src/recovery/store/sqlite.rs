//! SQLite implementation of state and progress stores.
//!
//! One DB file per worker in a shared directory. All tables are
//! addressed at the `(id, epoch)` level only; snapshot payloads are
//! opaque blobs.

use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::{Migrations, M};

use crate::errors::Result;
use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::*;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE state ( \
             step_id TEXT NOT NULL, \
             state_key TEXT NOT NULL, \
             epoch INTEGER NOT NULL, \
             snapshot BLOB, \
             PRIMARY KEY (step_id, state_key, epoch));",
        ),
        M::up(
            "CREATE TABLE execution ( \
             execution INTEGER NOT NULL, \
             worker_index INTEGER NOT NULL, \
             worker_count INTEGER NOT NULL, \
             resume_epoch INTEGER NOT NULL, \
             PRIMARY KEY (execution, worker_index));",
        ),
        M::up(
            "CREATE TABLE progress ( \
             execution INTEGER NOT NULL, \
             worker_index INTEGER NOT NULL, \
             frontier INTEGER NOT NULL, \
             PRIMARY KEY (execution, worker_index));",
        ),
    ])
}

fn open_db(db_file: &Path) -> Result<Connection> {
    tracing::debug!("Opening SQLite connection to {db_file:?}");
    let mut conn = Connection::open(db_file)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    tracing::debug!("Running any pending SQLite migrations");
    migrations().to_latest(&mut conn)?;
    Ok(conn)
}

/// DB file for a given worker within the recovery directory.
///
/// Keeping one file per worker means workers never contend on a
/// writer lock, at the cost of the resume calculation reading all
/// files.
pub(crate) fn worker_db_file(db_dir: &Path, index: WorkerIndex) -> PathBuf {
    db_dir.join(format!("worker{}.sqlite3", index.0))
}

pub(crate) fn list_db_files(db_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<_> = std::fs::read_dir(db_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "sqlite3")
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

pub(crate) struct SqliteStateWriter {
    conn: Connection,
}

impl SqliteStateWriter {
    pub(crate) fn new(db_file: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_db(db_file)?,
        })
    }
}

impl KWriter<StoreKey, Change<StateBytes>> for SqliteStateWriter {
    fn write(&mut self, kchange: KChange<StoreKey, Change<StateBytes>>) {
        tracing::trace!("Writing state change {kchange:?}");
        let KChange(store_key, recovery_change) = kchange;
        let StoreKey(epoch, FlowKey(step_id, state_key)) = store_key;
        let epoch = i64::try_from(epoch.0).expect("epoch can't fit into SQLite int");

        match recovery_change {
            Change::Upsert(step_change) => {
                // Discarded step state is stored as an explicit NULL
                // so resume knows to drop the key, as opposed to the
                // row being garbage collected.
                let snapshot = match step_change {
                    Change::Upsert(snapshot) => Some(snapshot.0),
                    Change::Discard => None,
                };
                self.conn
                    .execute(
                        "INSERT INTO state (step_id, state_key, epoch, snapshot) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT (step_id, state_key, epoch) DO UPDATE \
                         SET snapshot = EXCLUDED.snapshot",
                        params![step_id.0, state_key.0, epoch, snapshot],
                    )
                    .expect("error writing state snapshot");
            }
            Change::Discard => {
                self.conn
                    .execute(
                        "DELETE FROM state \
                         WHERE step_id = ?1 AND state_key = ?2 AND epoch = ?3",
                        params![step_id.0, state_key.0, epoch],
                    )
                    .expect("error deleting state snapshot");
            }
        }
    }
}

impl StateWriter for SqliteStateWriter {}

pub(crate) struct SqliteStateReader {
    changes: VecDeque<StoreChange>,
}

impl SqliteStateReader {
    pub(crate) fn new(db_file: &Path) -> Result<Self> {
        // Bootstrap off the writer to get table creation.
        let writer = SqliteStateWriter::new(db_file)?;
        let conn = writer.conn;

        let mut stmt = conn.prepare(
            "SELECT step_id, state_key, epoch, snapshot \
             FROM state \
             ORDER BY epoch ASC",
        )?;
        let changes = stmt
            .query_map([], |row| {
                let step_id = StepId(row.get(0)?);
                let state_key = StateKey(row.get(1)?);
                let epoch = SnapshotEpoch(
                    u64::try_from(row.get::<_, i64>(2)?)
                        .expect("SQLite int can't fit into epoch; might be negative"),
                );
                let store_key = StoreKey(epoch, FlowKey(step_id, state_key));
                let step_change = match row.get::<_, Option<Vec<u8>>>(3)? {
                    Some(snapshot) => Change::Upsert(StateBytes(snapshot)),
                    None => Change::Discard,
                };
                Ok(KChange(store_key, Change::Upsert(step_change)))
            })?
            .collect::<std::result::Result<VecDeque<_>, _>>()?;
        drop(stmt);

        Ok(Self { changes })
    }
}

impl KReader<StoreKey, Change<StateBytes>> for SqliteStateReader {
    fn read(&mut self) -> Option<StoreChange> {
        let kchange = self.changes.pop_front();
        if let Some(kchange) = &kchange {
            tracing::trace!("Reading state change {kchange:?}");
        }
        kchange
    }
}

impl StateReader for SqliteStateReader {}

pub(crate) struct SqliteProgressWriter {
    conn: Connection,
}

impl SqliteProgressWriter {
    pub(crate) fn new(db_file: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_db(db_file)?,
        })
    }
}

impl KWriter<WorkerKey, ProgressMsg> for SqliteProgressWriter {
    fn write(&mut self, kchange: ProgressChange) {
        tracing::trace!("Writing progress change {kchange:?}");
        let KChange(key, change) = kchange;
        let WorkerKey(ex, index) = key;
        let ex = i64::try_from(ex.0).expect("execution can't fit into SQLite int");
        let index = i64::try_from(index.0).expect("worker index can't fit into SQLite int");

        match change {
            Change::Upsert(msg) => match msg {
                ProgressMsg::Init(count, epoch) => {
                    self.conn
                        .execute(
                            "INSERT INTO execution \
                             (execution, worker_index, worker_count, resume_epoch) \
                             VALUES (?1, ?2, ?3, ?4) \
                             ON CONFLICT (execution, worker_index) DO UPDATE \
                             SET worker_count = EXCLUDED.worker_count, \
                             resume_epoch = EXCLUDED.resume_epoch",
                            params![
                                ex,
                                index,
                                i64::try_from(count.0)
                                    .expect("worker count can't fit into SQLite int"),
                                i64::try_from(epoch.0)
                                    .expect("epoch can't fit into SQLite int"),
                            ],
                        )
                        .expect("error writing execution info");
                }
                ProgressMsg::Advance(front) => {
                    self.conn
                        .execute(
                            "INSERT INTO progress (execution, worker_index, frontier) \
                             VALUES (?1, ?2, ?3) \
                             ON CONFLICT (execution, worker_index) DO UPDATE \
                             SET frontier = EXCLUDED.frontier",
                            params![
                                ex,
                                index,
                                i64::try_from(front.0)
                                    .expect("frontier can't fit into SQLite int"),
                            ],
                        )
                        .expect("error writing worker frontier");
                }
            },
            Change::Discard => {
                self.conn
                    .execute(
                        "DELETE FROM progress WHERE execution = ?1 AND worker_index = ?2",
                        params![ex, index],
                    )
                    .expect("error deleting worker progress");
            }
        }
    }
}

impl ProgressWriter for SqliteProgressWriter {}

pub(crate) struct SqliteProgressReader {
    changes: VecDeque<ProgressChange>,
}

impl SqliteProgressReader {
    pub(crate) fn new(db_file: &Path) -> Result<Self> {
        let writer = SqliteProgressWriter::new(db_file)?;
        let conn = writer.conn;

        let mut changes = VecDeque::new();

        let last_ex: Option<i64> = conn
            .query_row(
                "SELECT MAX(execution) FROM execution",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();

        if let Some(ex) = last_ex {
            let mut stmt = conn.prepare(
                "SELECT execution, worker_index, worker_count, resume_epoch \
                 FROM execution WHERE execution = ?1",
            )?;
            let inits = stmt.query_map([ex], |row| {
                let ex = Execution(
                    u64::try_from(row.get::<_, i64>(0)?)
                        .expect("SQLite int can't fit into execution; might be negative"),
                );
                let index = WorkerIndex(
                    usize::try_from(row.get::<_, i64>(1)?)
                        .expect("SQLite int can't fit into worker index"),
                );
                let count = WorkerCount(
                    usize::try_from(row.get::<_, i64>(2)?)
                        .expect("SQLite int can't fit into worker count"),
                );
                let epoch = ResumeEpoch(
                    u64::try_from(row.get::<_, i64>(3)?)
                        .expect("SQLite int can't fit into epoch; might be negative"),
                );
                Ok(KChange(
                    WorkerKey(ex, index),
                    Change::Upsert(ProgressMsg::Init(count, epoch)),
                ))
            })?;
            for kchange in inits {
                changes.push_back(kchange?);
            }
            drop(stmt);

            let mut stmt = conn.prepare(
                "SELECT execution, worker_index, frontier \
                 FROM progress WHERE execution = ?1 ORDER BY frontier ASC",
            )?;
            let fronts = stmt.query_map([ex], |row| {
                let ex = Execution(
                    u64::try_from(row.get::<_, i64>(0)?)
                        .expect("SQLite int can't fit into execution; might be negative"),
                );
                let index = WorkerIndex(
                    usize::try_from(row.get::<_, i64>(1)?)
                        .expect("SQLite int can't fit into worker index"),
                );
                let front = WorkerFrontier(
                    u64::try_from(row.get::<_, i64>(2)?)
                        .expect("SQLite int can't fit into frontier; might be negative"),
                );
                Ok(KChange(
                    WorkerKey(ex, index),
                    Change::Upsert(ProgressMsg::Advance(front)),
                ))
            })?;
            for kchange in fronts {
                changes.push_back(kchange?);
            }
        }

        Ok(Self { changes })
    }
}

impl KReader<WorkerKey, ProgressMsg> for SqliteProgressReader {
    fn read(&mut self) -> Option<ProgressChange> {
        let kchange = self.changes.pop_front();
        if let Some(kchange) = &kchange {
            tracing::trace!("Reading progress change {kchange:?}");
        }
        kchange
    }
}

impl ProgressReader for SqliteProgressReader {}
