//! On-disk Raft log: open and closed segment files.
//!
//! A segment starts with an 8-byte format version and holds a sequence of
//! batches, each carrying two CRC32 checksums (header block and payload
//! block), the entry count, fixed entry headers and the 8-byte-padded
//! payloads. Closed segments are named `<first>-<last>` (zero-padded
//! 16-digit hex indices); the segment being appended to is `open-<counter>`.
//!
//! Appends are pipelined: requests that arrive while a write is in flight
//! coalesce into the next batch, and completions fire strictly in
//! submission order, only after the bytes are durable.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

pub const SEGMENT_FORMAT: u64 = 1;

pub const ENTRY_COMMAND: u8 = 1;
pub const ENTRY_BARRIER: u8 = 2;
pub const ENTRY_CHANGE: u8 = 3;

/// One durable log entry, as stored in a segment batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskEntry {
    pub term: u64,
    pub kind: u8,
    pub data: Vec<u8>,
}

fn pad8(n: usize) -> usize {
    n.next_multiple_of(8)
}

/// Encode one batch. The two CRCs cover the header block (count plus entry
/// headers) and the padded payload block respectively.
pub fn encode_batch(entries: &[DiskEntry]) -> Vec<u8> {
    let mut header = Vec::with_capacity(8 + entries.len() * 16);
    header.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        header.extend_from_slice(&entry.term.to_le_bytes());
        header.push(entry.kind);
        header.extend_from_slice(&[0u8; 3]);
        header.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
    }
    let mut data = Vec::new();
    for entry in entries {
        data.extend_from_slice(&entry.data);
        data.resize(pad8(data.len()), 0);
    }

    let mut out = Vec::with_capacity(8 + header.len() + data.len());
    out.extend_from_slice(&crc32fast::hash(&header).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    out
}

/// Decode one batch from `buf`, returning the entries and the bytes
/// consumed.
pub fn decode_batch(buf: &[u8]) -> Result<(Vec<DiskEntry>, usize)> {
    if buf.len() < 16 {
        return Err(Error::Corrupt("short batch header".into()));
    }
    let crc_header = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let crc_data = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let n = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
    let header_len = 8 + n * 16;
    if n == 0 || buf.len() < 8 + header_len {
        return Err(Error::Corrupt("truncated batch header".into()));
    }
    let header = &buf[8..8 + header_len];
    if crc32fast::hash(header) != crc_header {
        return Err(Error::Corrupt("batch header checksum mismatch".into()));
    }

    let mut lens = Vec::with_capacity(n);
    let mut kinds = Vec::with_capacity(n);
    let mut terms = Vec::with_capacity(n);
    let mut data_len = 0usize;
    for i in 0..n {
        let off = 8 + i * 16;
        terms.push(u64::from_le_bytes(header[off..off + 8].try_into().unwrap()));
        let kind = header[off + 8];
        if !(ENTRY_COMMAND..=ENTRY_CHANGE).contains(&kind) {
            return Err(Error::Corrupt(format!("unknown entry type {kind}")));
        }
        kinds.push(kind);
        let len = u32::from_le_bytes(header[off + 12..off + 16].try_into().unwrap()) as usize;
        lens.push(len);
        data_len += pad8(len);
    }

    let data_start = 8 + header_len;
    if buf.len() < data_start + data_len {
        return Err(Error::Corrupt("truncated batch data".into()));
    }
    let data = &buf[data_start..data_start + data_len];
    if crc32fast::hash(data) != crc_data {
        return Err(Error::Corrupt("batch data checksum mismatch".into()));
    }

    let mut entries = Vec::with_capacity(n);
    let mut off = 0usize;
    for i in 0..n {
        entries.push(DiskEntry {
            term: terms[i],
            kind: kinds[i],
            data: data[off..off + lens[i]].to_vec(),
        });
        off += pad8(lens[i]);
    }
    Ok((entries, data_start + data_len))
}

pub fn closed_name(first: u64, last: u64) -> String {
    format!("{first:016x}-{last:016x}")
}

pub fn open_name(counter: u64) -> String {
    format!("open-{counter}")
}

pub fn parse_closed_name(name: &str) -> Option<(u64, u64)> {
    let (first, last) = name.split_once('-')?;
    if first.len() != 16 || last.len() != 16 {
        return None;
    }
    let first = u64::from_str_radix(first, 16).ok()?;
    let last = u64::from_str_radix(last, 16).ok()?;
    if first == 0 || last < first {
        return None;
    }
    Some((first, last))
}

pub fn parse_open_name(name: &str) -> Option<u64> {
    name.strip_prefix("open-")?.parse().ok()
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Result of scanning and decoding the log directory.
#[derive(Debug, Default)]
pub struct LoadResult {
    /// Index of the first loaded entry (snapshot index + 1 when a snapshot
    /// exists).
    pub first_index: u64,
    pub entries: Vec<DiskEntry>,
    /// Counter to use for the next open segment.
    pub next_counter: u64,
}

struct SegmentInfo {
    name: String,
    first: u64,
    last: u64,
    open_counter: Option<u64>,
}

fn scan_dir(dir: &Path) -> Result<(Vec<SegmentInfo>, Vec<SegmentInfo>, u64)> {
    let mut closed = Vec::new();
    let mut open = Vec::new();
    let mut next_counter = 1;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with("tmp-") {
            tracing::info!("removing temporary file {name}");
            let _ = std::fs::remove_file(entry.path());
            continue;
        }
        if let Some((first, last)) = parse_closed_name(&name) {
            closed.push(SegmentInfo { name, first, last, open_counter: None });
        } else if let Some(counter) = parse_open_name(&name) {
            next_counter = next_counter.max(counter + 1);
            open.push(SegmentInfo { name, first: 0, last: 0, open_counter: Some(counter) });
        }
    }
    closed.sort_by_key(|s| s.first);
    open.sort_by_key(|s| s.open_counter);
    Ok((closed, open, next_counter))
}

/// Load the log from `dir`, given the index of the most recent snapshot
/// (0 when there is none). Open segments are finalized in place; corrupt
/// files are quarantined and the load retried once when `auto_recovery` is
/// set.
pub fn load(dir: &Path, snapshot_index: u64, auto_recovery: bool) -> Result<LoadResult> {
    match load_once(dir, snapshot_index, auto_recovery) {
        Ok(result) => Ok(result),
        Err(LoadError { error, offender: Some(name) }) if auto_recovery => {
            let quarantined = format!("corrupt-{}-{}", nanos_now(), name);
            tracing::warn!("load failed ({error}); quarantining {name} as {quarantined}");
            std::fs::rename(dir.join(&name), dir.join(&quarantined))?;
            load_once(dir, snapshot_index, auto_recovery).map_err(|e| e.error)
        }
        Err(e) => Err(e.error),
    }
}

struct LoadError {
    error: Error,
    /// File to quarantine before retrying, if recovery makes sense.
    offender: Option<String>,
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError { error: e.into(), offender: None }
    }
}

impl From<Error> for LoadError {
    fn from(error: Error) -> Self {
        LoadError { error, offender: None }
    }
}

fn load_once(
    dir: &Path,
    snapshot_index: u64,
    auto_recovery: bool,
) -> std::result::Result<LoadResult, LoadError> {
    let (mut closed, open, next_counter) = scan_dir(dir)?;

    // Drop closed segments fully behind the snapshot, keeping the last one
    // when open segments follow it: they may extend past the snapshot.
    if snapshot_index > 0 {
        let keep_tail = !open.is_empty();
        let mut kept: Vec<SegmentInfo> = Vec::new();
        let n = closed.len();
        for (i, info) in closed.into_iter().enumerate() {
            if info.last < snapshot_index && !(keep_tail && i == n - 1) {
                tracing::info!("removing stale segment {}", info.name);
                std::fs::remove_file(dir.join(&info.name))?;
            } else {
                kept.push(info);
            }
        }
        closed = kept;
        if let Some(first) = closed.first() {
            if first.first > snapshot_index + 1 {
                return Err(LoadError {
                    error: Error::Corrupt(format!(
                        "first segment {} starts past snapshot index {snapshot_index}",
                        first.name
                    )),
                    offender: None,
                });
            }
        }
    }

    // Contiguity is checked backwards: a gap truncates the kept list.
    let mut start = 0;
    for i in (1..closed.len()).rev() {
        if closed[i - 1].last + 1 != closed[i].first {
            tracing::warn!(
                "gap between segments {} and {}; dropping entries before {}",
                closed[i - 1].name,
                closed[i].name,
                closed[i].first
            );
            start = i;
            break;
        }
    }
    let closed = &closed[start..];

    let mut entries = Vec::new();
    let mut first_index = 0u64;
    for info in closed {
        if first_index == 0 {
            first_index = info.first;
        }
        let buf = std::fs::read(dir.join(&info.name))?;
        let loaded = decode_segment(&buf, true, auto_recovery).map_err(|error| LoadError {
            error: error.wrap(&format!("segment {}", info.name)),
            offender: Some(info.name.clone()),
        })?;
        let expected = (info.last - info.first + 1) as usize;
        if loaded.entries.len() != expected {
            return Err(LoadError {
                error: Error::Corrupt(format!(
                    "segment {} has {} entries, expected {expected}",
                    info.name,
                    loaded.entries.len()
                )),
                offender: Some(info.name.clone()),
            });
        }
        entries.extend(loaded.entries);
    }

    let mut next_index = if first_index == 0 {
        snapshot_index + 1
    } else {
        first_index + entries.len() as u64
    };

    for info in &open {
        let path = dir.join(&info.name);
        let buf = std::fs::read(&path)?;
        let loaded = decode_segment(&buf, false, auto_recovery).map_err(|error| LoadError {
            error: error.wrap(&format!("segment {}", info.name)),
            offender: Some(info.name.clone()),
        })?;
        if loaded.entries.is_empty() {
            tracing::info!("removing empty open segment {}", info.name);
            std::fs::remove_file(&path)?;
            continue;
        }
        // Finalize in place: truncate to the decoded bytes and rename to a
        // closed segment.
        let first = next_index;
        let last = first + loaded.entries.len() as u64 - 1;
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(loaded.bytes as u64)?;
        file.sync_data()?;
        std::fs::rename(&path, dir.join(closed_name(first, last)))?;
        sync_dir(dir)?;
        tracing::info!("finalized open segment {} as {}", info.name, closed_name(first, last));
        if first_index == 0 {
            first_index = first;
        }
        next_index = last + 1;
        entries.extend(loaded.entries);
    }

    if first_index == 0 {
        first_index = snapshot_index + 1;
    }
    Ok(LoadResult { first_index, entries, next_counter })
}

struct DecodedSegment {
    entries: Vec<DiskEntry>,
    /// Valid prefix length in bytes, including the format word.
    bytes: usize,
}

/// Decode a whole segment file. Closed segments are decoded strictly; open
/// segments accept an all-zero tail (never written) and, when
/// `auto_recovery` is set, a corrupt tail.
fn decode_segment(buf: &[u8], strict: bool, auto_recovery: bool) -> Result<DecodedSegment> {
    if buf.iter().all(|&b| b == 0) {
        if strict {
            return Err(Error::Corrupt("closed segment is empty".into()));
        }
        return Ok(DecodedSegment { entries: Vec::new(), bytes: 0 });
    }
    if buf.len() < 8 {
        return Err(Error::Corrupt("segment too short".into()));
    }
    let format = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    if format != SEGMENT_FORMAT {
        return Err(Error::Corrupt(format!("unknown segment format {format}")));
    }
    let mut entries = Vec::new();
    let mut offset = 8usize;
    while offset < buf.len() {
        match decode_batch(&buf[offset..]) {
            Ok((batch, consumed)) => {
                entries.extend(batch);
                offset += consumed;
            }
            Err(e) => {
                if buf[offset..].iter().all(|&b| b == 0) {
                    // Preallocated space that was never written.
                    break;
                }
                if strict || !auto_recovery {
                    return Err(e);
                }
                tracing::warn!("truncating corrupt open segment tail: {e}");
                break;
            }
        }
    }
    Ok(DecodedSegment { entries, bytes: offset })
}

/// Handle to the append pipeline actor.
#[derive(Clone)]
pub struct SegmentLog {
    tx: mpsc::Sender<LogCommand>,
}

enum LogCommand {
    Append { entries: Vec<DiskEntry>, done: oneshot::Sender<Result<()>> },
    Barrier { next_index: u64, blocking: bool, done: oneshot::Sender<Result<()>> },
    Unblock,
    Truncate { index: u64, done: oneshot::Sender<Result<()>> },
    RemoveBefore { index: u64, done: oneshot::Sender<Result<()>> },
    Close { done: oneshot::Sender<()> },
}

impl SegmentLog {
    /// Spawn the pipeline actor. `next_index` is the index the next
    /// appended entry will receive.
    pub fn start(
        dir: PathBuf,
        segment_size: u64,
        pool_target: usize,
        next_counter: u64,
        next_index: u64,
    ) -> SegmentLog {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(
            Writer {
                dir,
                segment_size,
                pool_target,
                next_counter,
                append_next_index: next_index,
                pool: VecDeque::new(),
                current: None,
                pending: VecDeque::new(),
                blocked: false,
                barriers: Vec::new(),
            }
            .run(rx),
        );
        SegmentLog { tx }
    }

    pub async fn append(&self, entries: Vec<DiskEntry>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Append { entries, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Wait for all in-flight and pending appends to settle and for every
    /// open segment to be finalized, then reposition the next append index.
    pub async fn barrier(&self, next_index: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Barrier { next_index, blocking: false, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Like [`SegmentLog::barrier`] but suspends new appends until
    /// [`SegmentLog::unblock`].
    pub async fn blocking_barrier(&self, next_index: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Barrier { next_index, blocking: true, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    pub async fn unblock(&self) -> Result<()> {
        self.tx.send(LogCommand::Unblock).await.map_err(|_| Error::Stopped)
    }

    /// Discard all entries at and after `index`.
    pub async fn truncate(&self, index: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Truncate { index, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Unlink closed segments whose entries all precede `index`.
    pub async fn remove_before(&self, index: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::RemoveBefore { index, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(LogCommand::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Prepared {
    counter: u64,
    path: PathBuf,
    file: Arc<File>,
}

struct OpenSegment {
    counter: u64,
    path: PathBuf,
    file: Arc<File>,
    first_index: u64,
    n_entries: u64,
    bytes: u64,
}

struct PendingAppend {
    entries: Vec<DiskEntry>,
    done: oneshot::Sender<Result<()>>,
}

struct Writer {
    dir: PathBuf,
    segment_size: u64,
    pool_target: usize,
    pool: VecDeque<Prepared>,
    current: Option<OpenSegment>,
    next_counter: u64,
    append_next_index: u64,
    pending: VecDeque<PendingAppend>,
    blocked: bool,
    barriers: Vec<oneshot::Sender<Result<()>>>,
}

struct InflightWrite {
    requests: Vec<PendingAppend>,
    n_entries: u64,
    bytes: u64,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<LogCommand>) {
        enum Event {
            Command(Option<LogCommand>),
            WriteDone(std::result::Result<std::io::Result<()>, tokio::task::JoinError>),
        }

        let mut inflight: Option<InflightWrite> = None;
        loop {
            // The pipeline invariant: whenever the writer is idle and
            // unblocked, nothing stays queued.
            if inflight.is_none() && !self.blocked {
                debug_assert!(self.pending.is_empty());
            }
            let event = match inflight.as_mut() {
                Some(write) => tokio::select! {
                    command = rx.recv() => Event::Command(command),
                    result = &mut write.task => Event::WriteDone(result),
                },
                None => Event::Command(rx.recv().await),
            };
            match event {
                Event::WriteDone(result) => {
                    let write = inflight.take().unwrap();
                    self.on_write_done(write, result).await;
                    self.maybe_start(&mut inflight).await;
                }
                Event::Command(None) => break,
                Event::Command(Some(command)) => match command {
                    LogCommand::Append { entries, done } => {
                        self.append_next_index += entries.len() as u64;
                        self.pending.push_back(PendingAppend { entries, done });
                        self.maybe_start(&mut inflight).await;
                    }
                    LogCommand::Barrier { next_index, blocking, done } => {
                        self.append_next_index = next_index;
                        if blocking {
                            self.blocked = true;
                        }
                        self.barriers.push(done);
                        // Already-queued appends still run; the barrier
                        // fires once they and their segments settle.
                        self.maybe_start(&mut inflight).await;
                    }
                    LogCommand::Unblock => {
                        self.blocked = false;
                        self.maybe_start(&mut inflight).await;
                    }
                    LogCommand::Truncate { index, done } => {
                        self.drain_inflight(&mut inflight).await;
                        debug_assert!(self.pending.is_empty());
                        self.finalize_current().await;
                        let result = self.truncate_segments(index).await;
                        self.append_next_index = index;
                        let _ = done.send(result);
                    }
                    LogCommand::RemoveBefore { index, done } => {
                        let _ = done.send(self.remove_before(index).await);
                    }
                    LogCommand::Close { done } => {
                        self.drain_inflight(&mut inflight).await;
                        self.finalize_current().await;
                        for request in self.pending.drain(..) {
                            let _ = request.done.send(Err(Error::Stopped));
                        }
                        for barrier in self.barriers.drain(..) {
                            let _ = barrier.send(Err(Error::Canceled));
                        }
                        let _ = done.send(());
                        return;
                    }
                },
            }
            self.check_barriers(inflight.is_some()).await;
        }
    }

    async fn drain_inflight(&mut self, inflight: &mut Option<InflightWrite>) {
        if let Some(mut write) = inflight.take() {
            let result = (&mut write.task).await;
            self.on_write_done(write, result).await;
        }
    }

    async fn maybe_start(&mut self, inflight: &mut Option<InflightWrite>) {
        if inflight.is_some() || self.blocked || self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.start_write(inflight).await {
            tracing::error!("segment append failed to start: {e}");
            for request in self.pending.drain(..) {
                self.append_next_index -= request.entries.len() as u64;
                let _ = request.done.send(Err(Error::Internal(e.to_string())));
            }
        }
    }

    async fn start_write(&mut self, inflight: &mut Option<InflightWrite>) -> Result<()> {
        // Coalesce every pending request that fits the current segment into
        // one batch.
        let mut taken = Vec::new();
        let mut entries: Vec<DiskEntry> = Vec::new();
        let mut size_guess = 16usize;
        while let Some(front) = self.pending.front() {
            let request_size: usize =
                front.entries.iter().map(|e| 16 + pad8(e.data.len())).sum();
            let fits = {
                let current_bytes = self.current.as_ref().map(|c| c.bytes).unwrap_or(8);
                entries.is_empty()
                    || current_bytes + (size_guess + request_size) as u64 <= self.segment_size
            };
            if !fits {
                break;
            }
            size_guess += request_size;
            let request = self.pending.pop_front().unwrap();
            entries.extend(request.entries.iter().cloned());
            taken.push(request);
        }
        debug_assert!(!taken.is_empty());

        let batch = encode_batch(&entries);
        // Rotate to a fresh segment when the batch does not fit.
        if let Some(current) = &self.current {
            if current.bytes + batch.len() as u64 > self.segment_size && current.n_entries > 0 {
                self.finalize_current().await;
            }
        }
        if self.current.is_none() {
            let prepared = self.acquire_segment().await?;
            let first_index = self.append_next_index
                - self.pending.iter().map(|p| p.entries.len() as u64).sum::<u64>()
                - entries.len() as u64;
            self.current = Some(OpenSegment {
                counter: prepared.counter,
                path: prepared.path,
                file: prepared.file,
                first_index,
                n_entries: 0,
                bytes: 0,
            });
        }

        let current = self.current.as_ref().unwrap();
        let file = current.file.clone();
        let offset = current.bytes.max(8);
        let fresh = current.bytes == 0;
        let n_entries = entries.len() as u64;
        let bytes = batch.len() as u64;
        let task = tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            if fresh {
                file.write_all_at(&SEGMENT_FORMAT.to_le_bytes(), 0)?;
            }
            file.write_all_at(&batch, offset)?;
            file.sync_data()
        });
        *inflight = Some(InflightWrite { requests: taken, n_entries, bytes, task });
        Ok(())
    }

    async fn on_write_done(
        &mut self,
        write: InflightWrite,
        result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
    ) {
        let result = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(e) => Err(Error::Internal(format!("append task panicked: {e}"))),
        };
        match result {
            Ok(()) => {
                if let Some(current) = &mut self.current {
                    if current.bytes == 0 {
                        current.bytes = 8;
                    }
                    current.bytes += write.bytes;
                    current.n_entries += write.n_entries;
                }
                for request in write.requests {
                    let _ = request.done.send(Ok(()));
                }
            }
            Err(e) => {
                // A failed write fails everything queued behind it, rewinds
                // the next index and forces the segment out of service.
                tracing::error!("segment write failed: {e}");
                let failed: u64 = write.n_entries
                    + self.pending.iter().map(|p| p.entries.len() as u64).sum::<u64>();
                self.append_next_index -= failed;
                let message = e.to_string();
                for request in write.requests {
                    let _ = request.done.send(Err(Error::Internal(message.clone())));
                }
                for request in self.pending.drain(..) {
                    let _ = request.done.send(Err(Error::Internal(message.clone())));
                }
                self.finalize_current().await;
            }
        }
    }

    async fn acquire_segment(&mut self) -> Result<Prepared> {
        let prepared = match self.pool.pop_front() {
            Some(prepared) => prepared,
            None => {
                let counter = self.next_counter;
                self.next_counter += 1;
                prepare_segment(&self.dir, counter, self.segment_size).await?
            }
        };
        // Refill the pool ahead of need.
        while self.pool.len() < self.pool_target {
            let counter = self.next_counter;
            self.next_counter += 1;
            match prepare_segment(&self.dir, counter, self.segment_size).await {
                Ok(spare) => self.pool.push_back(spare),
                Err(e) => {
                    tracing::warn!("failed to prepare spare segment: {e}");
                    break;
                }
            }
        }
        Ok(prepared)
    }

    /// Finalize the current open segment: truncate to the bytes actually
    /// used, rename to `<first>-<last>` and fsync the directory. An
    /// unwritten segment is just unlinked.
    async fn finalize_current(&mut self) {
        let Some(segment) = self.current.take() else { return };
        let dir = self.dir.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if segment.n_entries == 0 {
                std::fs::remove_file(&segment.path)?;
                return Ok(());
            }
            segment.file.set_len(segment.bytes)?;
            segment.file.sync_data()?;
            let last = segment.first_index + segment.n_entries - 1;
            std::fs::rename(&segment.path, dir.join(closed_name(segment.first_index, last)))?;
            sync_dir(&dir)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("segment finalize failed: {e}"),
            Err(e) => tracing::error!("segment finalize panicked: {e}"),
        }
    }

    async fn check_barriers(&mut self, inflight: bool) {
        if self.barriers.is_empty() || inflight || !self.pending.is_empty() {
            return;
        }
        self.finalize_current().await;
        for barrier in self.barriers.drain(..) {
            let _ = barrier.send(Ok(()));
        }
    }

    async fn truncate_segments(&mut self, index: u64) -> Result<()> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || truncate_segments_sync(&dir, index))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn remove_before(&mut self, index: u64) -> Result<()> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let (closed, _, _) = scan_dir(&dir)?;
            for info in closed {
                if info.last < index {
                    tracing::info!("removing compacted segment {}", info.name);
                    std::fs::remove_file(dir.join(&info.name))?;
                }
            }
            sync_dir(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }
}

/// Rewrite the log so that no entry at or after `index` survives.
fn truncate_segments_sync(dir: &Path, index: u64) -> Result<()> {
    let (closed, open, _) = scan_dir(dir)?;
    for info in open {
        std::fs::remove_file(dir.join(&info.name))?;
    }
    for info in closed {
        if info.first >= index {
            tracing::info!("removing conflicting segment {}", info.name);
            std::fs::remove_file(dir.join(&info.name))?;
        } else if info.last >= index {
            // The boundary falls inside this segment: rewrite its prefix.
            let buf = std::fs::read(dir.join(&info.name))?;
            let decoded = decode_segment(&buf, true, false)
                .map_err(|e| e.wrap(&format!("segment {}", info.name)))?;
            let keep = (index - info.first) as usize;
            let entries = &decoded.entries[..keep];
            let tmp = dir.join(format!("tmp-{}", nanos_now()));
            let mut data = SEGMENT_FORMAT.to_le_bytes().to_vec();
            data.extend_from_slice(&encode_batch(entries));
            std::fs::write(&tmp, &data)?;
            File::open(&tmp)?.sync_data()?;
            std::fs::rename(&tmp, dir.join(closed_name(info.first, index - 1)))?;
            std::fs::remove_file(dir.join(&info.name))?;
        }
    }
    sync_dir(dir)?;
    Ok(())
}

async fn prepare_segment(dir: &Path, counter: u64, segment_size: u64) -> Result<Prepared> {
    let path = dir.join(open_name(counter));
    let dir = dir.to_path_buf();
    let (file, path) = tokio::task::spawn_blocking(move || -> std::io::Result<(File, PathBuf)> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(segment_size)?;
        file.sync_all()?;
        sync_dir(&dir)?;
        Ok((file, path))
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))??;
    Ok(Prepared { counter, path, file: Arc::new(file) })
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(term: u64, kind: u8, fill: u8, len: usize) -> DiskEntry {
        DiskEntry { term, kind, data: vec![fill; len] }
    }

    #[test]
    fn batch_round_trip() {
        let entries = vec![
            entry(1, ENTRY_COMMAND, 7, 100),
            entry(1, ENTRY_BARRIER, 0, 0),
            entry(2, ENTRY_CHANGE, 9, 17),
        ];
        let encoded = encode_batch(&entries);
        let (decoded, consumed) = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn batch_checksums_detect_corruption() {
        let entries = vec![entry(1, ENTRY_COMMAND, 7, 64)];
        let mut encoded = encode_batch(&entries);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(decode_batch(&encoded), Err(Error::Corrupt(_))));

        let mut encoded = encode_batch(&entries);
        encoded[10] ^= 0xff;
        assert!(matches!(decode_batch(&encoded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn closed_names_round_trip() {
        let name = closed_name(1, 256);
        assert_eq!(name, "0000000000000001-0000000000000100");
        assert_eq!(parse_closed_name(&name), Some((1, 256)));
        assert_eq!(parse_closed_name("open-3"), None);
        assert_eq!(parse_open_name("open-3"), Some(3));
    }

    #[tokio::test]
    async fn append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);

        let mut expected = Vec::new();
        for i in 0..10u8 {
            let e = entry(1, ENTRY_COMMAND, i, 128);
            expected.push(e.clone());
            log.append(vec![e]).await.unwrap();
        }
        log.close().await;

        let loaded = load(dir.path(), 0, false).unwrap();
        assert_eq!(loaded.first_index, 1);
        assert_eq!(loaded.entries, expected);
    }

    #[tokio::test]
    async fn concurrent_appends_complete_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(vec![entry(1, ENTRY_COMMAND, i, 64)]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        log.barrier(21).await.unwrap();
        log.close().await;

        let loaded = load(dir.path(), 0, false).unwrap();
        assert_eq!(loaded.entries.len(), 20);
    }

    #[tokio::test]
    async fn segment_rotation() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segments force rotation.
        let log = SegmentLog::start(dir.path().to_path_buf(), 2048, 2, 1, 1);
        for i in 0..8u8 {
            log.append(vec![entry(1, ENTRY_COMMAND, i, 512)]).await.unwrap();
        }
        log.barrier(9).await.unwrap();
        log.close().await;

        let (closed, open, _) = scan_dir(dir.path()).unwrap();
        assert!(closed.len() > 1, "expected rotation, got {} segments", closed.len());
        assert!(open.is_empty());

        let loaded = load(dir.path(), 0, false).unwrap();
        assert_eq!(loaded.entries.len(), 8);
    }

    #[tokio::test]
    async fn open_segment_survives_crash() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);
            for i in 0..100u8 {
                log.append(vec![entry(1, ENTRY_COMMAND, i, 32)]).await.unwrap();
            }
            // No close: the open segment keeps its preallocated zero tail,
            // as after a crash mid-run.
        }
        let (_, open, _) = scan_dir(dir.path()).unwrap();
        assert_eq!(open.len(), 1);

        let loaded = load(dir.path(), 0, false).unwrap();
        assert_eq!(loaded.entries.len(), 100);
        assert_eq!(loaded.first_index, 1);

        // The open segment was finalized in place.
        let (closed, open, _) = scan_dir(dir.path()).unwrap();
        assert_eq!(open.len(), 0);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].name, closed_name(1, 100));
    }

    #[tokio::test]
    async fn corrupt_open_segment_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);
            log.append(vec![entry(1, ENTRY_COMMAND, 1, 32)]).await.unwrap();
        }
        // Zero the format version of the open segment.
        let (_, open, _) = scan_dir(dir.path()).unwrap();
        let path = dir.path().join(&open[0].name);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        use std::os::unix::fs::FileExt;
        file.write_all_at(&[0xff; 8], 0).unwrap();
        file.sync_data().unwrap();

        assert!(load(dir.path(), 0, false).is_err());

        let loaded = load(dir.path(), 0, true).unwrap();
        assert!(loaded.entries.is_empty());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("corrupt-")), "{names:?}");
    }

    #[tokio::test]
    async fn truncate_discards_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);
        for i in 0..10u8 {
            log.append(vec![entry(1, ENTRY_COMMAND, i, 64)]).await.unwrap();
        }
        log.truncate(6).await.unwrap();
        log.append(vec![entry(2, ENTRY_COMMAND, 99, 64)]).await.unwrap();
        log.barrier(7).await.unwrap();
        log.close().await;

        let loaded = load(dir.path(), 0, false).unwrap();
        assert_eq!(loaded.entries.len(), 6);
        assert_eq!(loaded.entries[5].term, 2);
        assert_eq!(loaded.entries[5].data, vec![99; 64]);
    }

    #[tokio::test]
    async fn blocking_barrier_suspends_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::start(dir.path().to_path_buf(), 1 << 20, 1, 1, 1);
        log.append(vec![entry(1, ENTRY_COMMAND, 1, 64)]).await.unwrap();
        log.blocking_barrier(10).await.unwrap();

        let pending = {
            let log = log.clone();
            tokio::spawn(async move { log.append(vec![entry(1, ENTRY_COMMAND, 2, 64)]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        log.unblock().await.unwrap();
        pending.await.unwrap().unwrap();
        log.close().await;

        // The barrier repositioned the next index: the second append landed
        // at index 10, in its own segment.
        let (closed, _, _) = scan_dir(dir.path()).unwrap();
        assert!(closed.iter().any(|s| s.first == 10), "barrier did not reposition");

        // With a snapshot covering the gap, the load keeps the new tail.
        let loaded = load(dir.path(), 9, false).unwrap();
        assert_eq!(loaded.first_index, 10);
        assert_eq!(loaded.entries.len(), 1);
    }

    #[tokio::test]
    async fn load_respects_snapshot_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::start(dir.path().to_path_buf(), 512, 1, 1, 1);
        for i in 0..12u8 {
            log.append(vec![entry(1, ENTRY_COMMAND, i, 128)]).await.unwrap();
        }
        log.barrier(13).await.unwrap();
        log.close().await;

        let (closed, _, _) = scan_dir(dir.path()).unwrap();
        assert!(closed.len() >= 3);
        let boundary = closed[closed.len() - 2].first;

        let loaded = load(dir.path(), boundary + 1, false).unwrap();
        // Segments fully behind the snapshot are gone; the remainder is a
        // contiguous prefix reaching past the snapshot.
        assert!(loaded.first_index <= boundary + 2);
        let (closed_after, _, _) = scan_dir(dir.path()).unwrap();
        assert!(closed_after.len() < closed.len());
    }
}
