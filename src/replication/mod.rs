//! WAL replication: the hinge between SQLite and the Raft log.
//!
//! On the leader, the VFS routes WAL commit writes through
//! [`Replication::frames`], which journals the transaction as a `COMMAND`
//! entry and suspends the calling (SQLite-owning) thread until the entry is
//! quorum-committed and applied. The apply path is shared by every member:
//! the member that originated a transaction merely advances its committed
//! boundary, everyone else injects the frames into its in-memory VFS.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result, SQLITE_IOERR_LEADERSHIP_LOST, SQLITE_IOERR_NOT_LEADER};
use crate::raft::node::NodeRequest;
use crate::vfs::{FrameData, MemVfs, WalReplication};
use crate::wire::{Builder, Cursor};

pub mod command;

pub use command::FramesCommand;

struct PendingTx {
    db_name: String,
    done: oneshot::Sender<Result<()>>,
}

/// State shared between the VFS hook, the Raft node and the checkpointer.
pub struct Replication {
    server_id: u64,
    vfs: MemVfs,
    node: mpsc::Sender<NodeRequest>,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingTx>>,
    /// Databases touched by applied entries; the snapshot payload covers
    /// exactly these.
    dbs: Mutex<BTreeSet<String>>,
    checkpoint_threshold: u32,
    checkpointer: mpsc::UnboundedSender<String>,
}

impl Replication {
    pub fn new(
        server_id: u64,
        vfs: MemVfs,
        node: mpsc::Sender<NodeRequest>,
        checkpoint_threshold: u32,
        checkpointer: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            vfs,
            node,
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            dbs: Mutex::new(BTreeSet::new()),
            checkpoint_threshold,
            checkpointer,
        })
    }

    pub fn vfs(&self) -> &MemVfs {
        &self.vfs
    }

    /// Apply a committed `COMMAND` entry. Called by the Raft node, in log
    /// index order.
    pub fn apply_command(&self, data: &[u8]) -> Result<()> {
        let command = FramesCommand::decode(data)?;
        self.dbs.lock().insert(command.db_name.clone());

        let local = command.origin_id == self.server_id
            && self.pending.lock().contains_key(&command.origin_seq);

        let mut result = self.vfs.apply_frames(
            &command.db_name,
            command.page_size,
            &command.frames,
            command.truncate,
            command.commit,
            local,
        );
        if !local && result.is_err() {
            // The WAL holds uncommitted frames from a suspended local
            // transaction that can no longer win: another entry got in
            // first. Abort it and retry the injection.
            self.fail_pending_for(&command.db_name, || Error::LeadershipLost);
            self.vfs.rollback_tx(&command.db_name);
            result = self.vfs.apply_frames(
                &command.db_name,
                command.page_size,
                &command.frames,
                command.truncate,
                command.commit,
                false,
            );
        }
        if let Err(e) = result {
            return Err(Error::Internal(format!(
                "apply frames to {}: {e}",
                command.db_name
            )));
        }

        if local {
            if let Some(tx) = self.pending.lock().remove(&command.origin_seq) {
                let _ = tx.done.send(Ok(()));
            }
        }

        if command.commit
            && self.vfs.wal_committed_frames(&command.db_name)
                >= self.checkpoint_threshold as usize
        {
            let _ = self.checkpointer.send(command.db_name);
        }
        Ok(())
    }

    /// Fail every suspended transaction; used on leadership loss and on
    /// shutdown.
    pub fn fail_pending(&self, mut reason: impl FnMut() -> Error) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in pending {
            let _ = tx.done.send(Err(reason()));
        }
    }

    fn fail_pending_for(&self, db_name: &str, reason: impl Fn() -> Error) {
        let mut pending = self.pending.lock();
        let keys: Vec<u64> = pending
            .iter()
            .filter(|(_, tx)| tx.db_name == db_name)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(tx) = pending.remove(&key) {
                let _ = tx.done.send(Err(reason()));
            }
        }
    }

    /// Serialize the replicated database images for a snapshot.
    pub fn snapshot_payload(&self) -> Vec<u8> {
        let dbs = self.dbs.lock().clone();
        let mut b = Builder::new();
        b.put_u64(dbs.len() as u64);
        for name in &dbs {
            let db_image = self.vfs.read(name);
            let wal_image = self.vfs.read(&format!("{name}-wal"));
            b.put_text(name);
            b.put_blob(&db_image);
            b.put_blob(&wal_image);
        }
        b.finish().to_vec()
    }

    /// Restore database images from a snapshot payload.
    pub fn restore_payload(&self, data: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(data);
        let n = cursor.get_u64()? as usize;
        let mut dbs = BTreeSet::new();
        for _ in 0..n {
            let name = cursor.get_text()?.to_owned();
            let db_image = cursor.get_blob()?.to_vec();
            let wal_image = cursor.get_blob()?.to_vec();
            self.vfs
                .write(&name, &db_image)
                .map_err(|e| Error::Corrupt(format!("restore {name}: {e}")))?;
            self.vfs
                .write(&format!("{name}-wal"), &wal_image)
                .map_err(|e| Error::Corrupt(format!("restore {name} WAL: {e}")))?;
            dbs.insert(name);
        }
        *self.dbs.lock() = dbs;
        Ok(())
    }

    /// Wait until every entry committed so far has been applied locally.
    pub async fn barrier(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.node
            .send(NodeRequest::Barrier { done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }
}

impl WalReplication for Replication {
    fn begin(&self, _db: &str) -> i32 {
        rusqlite::ffi::SQLITE_OK
    }

    fn frames(
        &self,
        db: &str,
        page_size: u32,
        frames: Vec<FrameData>,
        truncate: u32,
        commit: bool,
    ) -> i32 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let command = FramesCommand {
            origin_id: self.server_id,
            origin_seq: seq,
            db_name: db.to_string(),
            page_size,
            truncate,
            commit,
            frames,
        };
        let (done, rx) = oneshot::channel();
        self.pending.lock().insert(
            seq,
            PendingTx { db_name: db.to_string(), done },
        );

        let request = NodeRequest::Propose { data: command.encode(), origin_seq: seq };
        if self.node.blocking_send(request).is_err() {
            self.pending.lock().remove(&seq);
            return SQLITE_IOERR_NOT_LEADER;
        }

        // Suspend the SQLite-owning thread until the entry is committed by
        // quorum and applied, or the proposal is aborted.
        match rx.blocking_recv() {
            Ok(Ok(())) => rusqlite::ffi::SQLITE_OK,
            Ok(Err(Error::NotLeader { .. })) => SQLITE_IOERR_NOT_LEADER,
            Ok(Err(Error::LeadershipLost)) => SQLITE_IOERR_LEADERSHIP_LOST,
            Ok(Err(e)) => {
                tracing::warn!("replication failed: {e}");
                rusqlite::ffi::SQLITE_IOERR
            }
            Err(_) => SQLITE_IOERR_LEADERSHIP_LOST,
        }
    }

    fn undo(&self, _db: &str) -> i32 {
        rusqlite::ffi::SQLITE_OK
    }

    fn end(&self, _db: &str) -> i32 {
        rusqlite::ffi::SQLITE_OK
    }
}

/// Remove a pending transaction that failed to propose.
impl Replication {
    pub fn abort_tx(&self, origin_seq: u64, err: Error) {
        if let Some(tx) = self.pending.lock().remove(&origin_seq) {
            let _ = tx.done.send(Err(err));
        }
    }
}

/// Run the checkpoint loop: owns one maintenance connection per database
/// and issues TRUNCATE checkpoints when the apply path asks for them.
/// Checkpoints are local, never replicated; every member reaches the
/// threshold on the same frame and truncates independently.
pub fn spawn_checkpointer(vfs_name: String) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::task::spawn_blocking(move || {
        let mut connections: HashMap<String, rusqlite::Connection> = HashMap::new();
        while let Some(db_name) = rx.blocking_recv() {
            let conn = match connections.entry(db_name.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    match open_maintenance_conn(&db_name, &vfs_name) {
                        Ok(conn) => e.insert(conn),
                        Err(err) => {
                            tracing::error!("checkpoint open {db_name}: {err}");
                            continue;
                        }
                    }
                }
            };
            match conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                row.get::<_, i64>(0)
            }) {
                Ok(0) => tracing::debug!("checkpointed {db_name}"),
                Ok(_) => tracing::debug!("checkpoint of {db_name} blocked by readers"),
                Err(err) => tracing::warn!("checkpoint {db_name}: {err}"),
            }
        }
    });
    tx
}

fn open_maintenance_conn(db_name: &str, vfs_name: &str) -> Result<rusqlite::Connection> {
    use rusqlite::OpenFlags;
    let conn = rusqlite::Connection::open_with_flags_and_vfs(
        db_name,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs_name,
    )?;
    conn.busy_timeout(std::time::Duration::from_millis(100))?;
    conn.pragma_update(None, "wal_autocheckpoint", 0)?;
    let mode: String = conn.query_row("PRAGMA journal_mode=wal", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(Error::Internal(format!("journal mode is {mode}, not wal")));
    }
    Ok(conn)
}

#[cfg(test)]
mod test {
    use super::*;

    fn replication_for_test() -> (Arc<Replication>, mpsc::Receiver<NodeRequest>) {
        let (node_tx, node_rx) = mpsc::channel(16);
        let (ckpt_tx, _ckpt_rx) = mpsc::unbounded_channel();
        let replication = Replication::new(1, MemVfs::new(), node_tx, 1000, ckpt_tx);
        (replication, node_rx)
    }

    #[test]
    fn apply_command_injects_frames() {
        let (replication, _rx) = replication_for_test();
        let command = FramesCommand {
            origin_id: 2,
            origin_seq: 1,
            db_name: "test.db".into(),
            page_size: 512,
            truncate: 1,
            commit: true,
            frames: vec![FrameData { page_number: 1, data: vec![7u8; 512] }],
        };
        replication.apply_command(&command.encode()).unwrap();
        assert_eq!(replication.vfs().wal_committed_frames("test.db"), 1);
    }

    #[test]
    fn snapshot_payload_round_trip() {
        let (replication, _rx) = replication_for_test();
        let command = FramesCommand {
            origin_id: 2,
            origin_seq: 1,
            db_name: "test.db".into(),
            page_size: 512,
            truncate: 1,
            commit: true,
            frames: vec![FrameData { page_number: 1, data: vec![7u8; 512] }],
        };
        replication.apply_command(&command.encode()).unwrap();

        let payload = replication.snapshot_payload();
        let (restored, _rx2) = replication_for_test();
        restored.restore_payload(&payload).unwrap();
        assert_eq!(
            restored.vfs().read("test.db-wal"),
            replication.vfs().read("test.db-wal")
        );
    }

    #[test]
    fn identical_histories_identical_bytes() {
        let commands: Vec<FramesCommand> = (0..4)
            .map(|i| FramesCommand {
                origin_id: 1,
                origin_seq: i as u64 + 1,
                db_name: "t.db".into(),
                page_size: 512,
                truncate: i + 1,
                commit: true,
                frames: vec![FrameData {
                    page_number: i + 1,
                    data: vec![i as u8; 512],
                }],
            })
            .collect();

        let images: Vec<_> = (0..3)
            .map(|_| {
                let (replication, _rx) = replication_for_test();
                for command in &commands {
                    replication.apply_command(&command.encode()).unwrap();
                }
                (
                    replication.vfs().read("t.db"),
                    replication.vfs().read("t.db-wal"),
                )
            })
            .collect();
        assert_eq!(images[0], images[1]);
        assert_eq!(images[1], images[2]);
    }
}
