//! In-memory SQLite VFS.
//!
//! Database pages, WAL frames, journals and the WAL-index shared memory all
//! live in process memory, behind a process-wide registry of named files.
//! Handles that open the same name share the same content; shared-memory
//! blocks are shared, never copied.
//!
//! The VFS is also the replication seam: WAL commit writes on a leader
//! connection are routed through a [`WalReplication`] hook before they are
//! acknowledged to SQLite, and committed entries are written back through
//! the same content types on every member.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::ffi::{
    SQLITE_BUSY, SQLITE_CANTOPEN, SQLITE_CORRUPT, SQLITE_IOERR_DELETE,
    SQLITE_IOERR_DELETE_NOENT, SQLITE_IOERR_WRITE, SQLITE_OK,
};

pub mod ffi;
pub mod file;
pub mod shm;

pub use file::{FrameData, WalWriteOutcome, DB_HEADER_SIZE, WAL_FRAME_HDR_SIZE, WAL_HDR_SIZE};
pub use shm::{ShmRegion, SHM_BLOCK_SIZE, SHM_NLOCK, SHM_WRITE_LOCK};

use file::{DbContent, JournalContent, WalContent};

/// Hard cap on the number of distinct file names the VFS will hold.
pub const MAX_FILES: usize = 64;

/// Longest accepted file name.
pub const MAX_FILENAME: usize = 128;

/// Error carrying a SQLite result code and an owned human-readable message.
#[derive(Debug, Clone)]
pub struct VfsError {
    pub code: i32,
    pub message: String,
}

impl VfsError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn wrap(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }
}

impl std::fmt::Display for VfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for VfsError {}

pub type VfsResult<T> = Result<T, VfsError>;

/// WAL replication interception points, called by the VFS on the leader
/// connection. `frames` returns only when the entry is either committed by
/// quorum or aborted; the return value is a SQLite result code.
pub trait WalReplication: Send + Sync {
    fn begin(&self, db: &str) -> i32;
    fn frames(
        &self,
        db: &str,
        page_size: u32,
        frames: Vec<FrameData>,
        truncate: u32,
        commit: bool,
    ) -> i32;
    fn undo(&self, db: &str) -> i32;
    fn end(&self, db: &str) -> i32;
}

/// File classes recognized at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    MainDb,
    Wal,
    MainJournal,
    Other,
}

#[derive(Debug)]
pub enum Content {
    Db(DbContent),
    Wal(WalContent),
    Journal(JournalContent),
}

/// A named file shared by every handle that opens it.
#[derive(Debug)]
pub struct FileShared {
    pub name: String,
    pub kind: FileKind,
    pub content: Mutex<Content>,
    pub shm: Mutex<ShmRegion>,
    refs: AtomicUsize,
}

impl FileShared {
    fn new(name: String, kind: FileKind) -> Self {
        let content = match kind {
            FileKind::MainDb => Content::Db(DbContent::default()),
            FileKind::Wal => Content::Wal(WalContent::default()),
            FileKind::MainJournal | FileKind::Other => {
                Content::Journal(JournalContent::default())
            }
        };
        Self {
            name,
            kind,
            content: Mutex::new(content),
            shm: Mutex::new(ShmRegion::default()),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> u64 {
        match &*self.content.lock() {
            Content::Db(db) => db.size(),
            Content::Wal(wal) => wal.size(),
            Content::Journal(journal) => journal.size(),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        match &*self.content.lock() {
            Content::Db(db) => db.read_at(offset, buf),
            Content::Wal(wal) => wal.read_at(offset, buf),
            Content::Journal(journal) => journal.read_at(offset, buf),
        }
    }

    /// Plain write; WAL handles use [`FileShared::write_wal`] instead so the
    /// caller can observe commit boundaries.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<()> {
        match &mut *self.content.lock() {
            Content::Db(db) => db.write_at(offset, data),
            Content::Wal(wal) => wal.write_at(offset, data).map(|_| ()),
            Content::Journal(journal) => journal.write_at(offset, data),
        }
    }

    pub fn write_wal(&self, offset: u64, data: &[u8]) -> VfsResult<WalWriteOutcome> {
        match &mut *self.content.lock() {
            Content::Wal(wal) => wal.write_at(offset, data),
            _ => Err(VfsError::new(SQLITE_IOERR_WRITE, "not a WAL file")),
        }
    }

    pub fn truncate(&self, size: u64) -> VfsResult<()> {
        match &mut *self.content.lock() {
            Content::Db(db) => db.truncate(size),
            Content::Wal(wal) => wal.truncate(size),
            Content::Journal(journal) => journal.truncate(size),
        }
    }

    /// Page size and frames of the in-progress WAL transaction.
    pub fn wal_tx_frames(&self) -> (u32, Vec<FrameData>) {
        match &*self.content.lock() {
            Content::Wal(wal) => (wal.page_size(), wal.tx_frames()),
            _ => (0, Vec::new()),
        }
    }

    pub fn wal_commit(&self) {
        if let Content::Wal(wal) = &mut *self.content.lock() {
            wal.commit();
        }
    }

    pub fn wal_rollback(&self) {
        if let Content::Wal(wal) = &mut *self.content.lock() {
            wal.rollback();
        }
    }

    /// Latched page size of a database file, if any.
    pub fn db_page_size(&self) -> Option<u32> {
        match &*self.content.lock() {
            Content::Db(db) => db.page_size(),
            _ => None,
        }
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub create: bool,
    pub exclusive: bool,
}

struct VfsInner {
    files: Mutex<HashMap<String, Arc<FileShared>>>,
    replication: RwLock<Option<Arc<dyn WalReplication>>>,
    temp_counter: AtomicU64,
}

/// The process-wide in-memory filesystem. Cloning shares the registry.
#[derive(Clone)]
pub struct MemVfs {
    inner: Arc<VfsInner>,
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemVfs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(VfsInner {
                files: Mutex::new(HashMap::new()),
                replication: RwLock::new(None),
                temp_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Install the replication hook invoked on WAL commit writes.
    pub fn set_replication(&self, replication: Arc<dyn WalReplication>) {
        *self.inner.replication.write() = Some(replication);
    }

    pub fn replication(&self) -> Option<Arc<dyn WalReplication>> {
        self.inner.replication.read().clone()
    }

    /// Name for an anonymous temporary file.
    pub fn temp_name(&self) -> String {
        let n = self.inner.temp_counter.fetch_add(1, Ordering::SeqCst);
        format!("tmp-{n}")
    }

    pub fn open(
        &self,
        name: &str,
        kind: FileKind,
        opts: OpenOptions,
    ) -> VfsResult<Arc<FileShared>> {
        if name.len() > MAX_FILENAME {
            return Err(VfsError::new(SQLITE_CANTOPEN, format!("file name too long: {name}")));
        }
        let mut files = self.inner.files.lock();
        if let Some(existing) = files.get(name) {
            if opts.create && opts.exclusive {
                return Err(VfsError::new(
                    SQLITE_CANTOPEN,
                    format!("file {name} already exists"),
                ));
            }
            existing.retain();
            return Ok(existing.clone());
        }
        if !opts.create {
            return Err(VfsError::new(SQLITE_CANTOPEN, format!("no such file {name}")));
        }
        if kind == FileKind::Wal {
            let db_name = name.strip_suffix("-wal").unwrap_or(name);
            if !files.contains_key(db_name) {
                return Err(VfsError::new(
                    SQLITE_CORRUPT,
                    format!("WAL {name} has no database"),
                ));
            }
        }
        if files.len() >= MAX_FILES {
            return Err(VfsError::new(SQLITE_CANTOPEN, "too many open files"));
        }
        let file = Arc::new(FileShared::new(name.to_string(), kind));
        file.retain();
        files.insert(name.to_string(), file.clone());
        Ok(file)
    }

    pub fn delete(&self, name: &str) -> VfsResult<()> {
        let mut files = self.inner.files.lock();
        match files.get(name) {
            None => Err(VfsError::new(
                SQLITE_IOERR_DELETE_NOENT,
                format!("no such file {name}"),
            )),
            Some(file) if file.ref_count() > 0 => Err(VfsError::new(
                SQLITE_IOERR_DELETE,
                format!("file {name} is busy"),
            )),
            Some(_) => {
                files.remove(name);
                Ok(())
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.files.lock().contains_key(name)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<FileShared>> {
        self.inner.files.lock().get(name).cloned()
    }

    fn get_or_insert(&self, name: &str, kind: FileKind) -> VfsResult<Arc<FileShared>> {
        let mut files = self.inner.files.lock();
        if let Some(file) = files.get(name) {
            return Ok(file.clone());
        }
        if files.len() >= MAX_FILES {
            return Err(VfsError::new(SQLITE_CANTOPEN, "too many open files"));
        }
        let file = Arc::new(FileShared::new(name.to_string(), kind));
        files.insert(name.to_string(), file.clone());
        Ok(file)
    }

    /// Raw image of a named file, for snapshot transfer. Missing files read
    /// as empty.
    pub fn read(&self, name: &str) -> Vec<u8> {
        match self.lookup(name) {
            Some(file) => match &*file.content.lock() {
                Content::Db(db) => db.to_bytes(),
                Content::Wal(wal) => wal.to_bytes(),
                Content::Journal(_) => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Replace a named file with a raw image, for snapshot restore.
    pub fn write(&self, name: &str, data: &[u8]) -> VfsResult<()> {
        let kind = if name.ends_with("-wal") {
            FileKind::Wal
        } else {
            FileKind::MainDb
        };
        let file = self.get_or_insert(name, kind)?;
        let result = match &mut *file.content.lock() {
            Content::Db(db) => db.restore(data),
            Content::Wal(wal) => wal.restore(data),
            Content::Journal(_) => {
                return Err(VfsError::new(SQLITE_IOERR_WRITE, "not a database file"))
            }
        };
        result?;
        file.shm.lock().invalidate_header();
        Ok(())
    }

    /// Number of committed frames in a database's WAL.
    pub fn wal_committed_frames(&self, db_name: &str) -> usize {
        match self.lookup(&format!("{db_name}-wal")) {
            Some(file) => match &*file.content.lock() {
                Content::Wal(wal) => wal.committed_frame_count(),
                _ => 0,
            },
            None => 0,
        }
    }

    /// Apply a replicated transaction to a database's WAL.
    ///
    /// On the member that originated the transaction the frames are already
    /// in the WAL (`local`), so the committed boundary just advances. On
    /// every other member the frames are injected and the WAL-index header
    /// is invalidated so live connections rebuild their view from the WAL.
    pub fn apply_frames(
        &self,
        db_name: &str,
        page_size: u32,
        frames: &[FrameData],
        truncate: u32,
        commit: bool,
        local: bool,
    ) -> VfsResult<()> {
        let wal_name = format!("{db_name}-wal");
        self.get_or_insert(db_name, FileKind::MainDb)?;
        let file = self.get_or_insert(&wal_name, FileKind::Wal)?;
        let mut content = file.content.lock();
        let wal = match &mut *content {
            Content::Wal(wal) => wal,
            _ => return Err(VfsError::new(SQLITE_IOERR_WRITE, "not a WAL file")),
        };
        if local {
            wal.commit();
            return Ok(());
        }
        let size_after = if commit { truncate } else { 0 };
        wal.apply_frames(page_size, frames, size_after)?;
        drop(content);
        file.shm.lock().invalidate_header();
        Ok(())
    }

    /// Discard the uncommitted tail of a database's WAL.
    pub fn rollback_tx(&self, db_name: &str) {
        if let Some(file) = self.lookup(&format!("{db_name}-wal")) {
            if let Content::Wal(wal) = &mut *file.content.lock() {
                wal.rollback();
            }
        }
    }

    /// Shared-memory lock, for tests and lock introspection.
    pub fn shm_lock(
        &self,
        name: &str,
        slot: usize,
        n: usize,
        exclusive: bool,
    ) -> VfsResult<()> {
        let file = self
            .lookup(name)
            .ok_or_else(|| VfsError::new(SQLITE_CANTOPEN, format!("no such file {name}")))?;
        let mut shm = file.shm.lock();
        let ok = if exclusive {
            shm.lock_exclusive(slot, n)
        } else {
            debug_assert_eq!(n, 1);
            shm.lock_shared(slot)
        };
        if ok {
            Ok(())
        } else {
            Err(VfsError::new(SQLITE_BUSY, "shm lock contention"))
        }
    }

    pub fn file_count(&self) -> usize {
        self.inner.files.lock().len()
    }
}

/// Convert a VFS result to a SQLite return code, logging the failure.
pub fn rc_of(result: VfsResult<()>) -> i32 {
    match result {
        Ok(()) => SQLITE_OK,
        Err(e) => {
            tracing::debug!("vfs: {e}");
            e.code
        }
    }
}
