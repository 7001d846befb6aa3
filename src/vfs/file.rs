//! In-memory file contents: database page vectors, WAL frame logs and
//! journal byte buffers.
//!
//! WAL frame headers are canonicalized on write: salts come from the WAL
//! header generation counter and checksums are recomputed with SQLite's WAL
//! checksum chain. Every member of the cluster therefore stores the same WAL
//! bytes for the same history, no matter which connection produced the
//! frames.

use rusqlite::ffi::{
    SQLITE_IOERR_SHORT_READ, SQLITE_IOERR_TRUNCATE, SQLITE_IOERR_WRITE,
};

use super::{VfsError, VfsResult};

/// Size of the WAL file header.
pub const WAL_HDR_SIZE: usize = 32;

/// Size of a WAL frame header.
pub const WAL_FRAME_HDR_SIZE: usize = 24;

/// WAL magic with little-endian checksums.
const WAL_MAGIC: u32 = 0x377f0682;

const WAL_VERSION: u32 = 3007000;

/// Minimum first write to a fresh database file: the SQLite header.
pub const DB_HEADER_SIZE: usize = 100;

/// One page of a replicated write, as carried in a replication entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    pub page_number: u32,
    pub data: Vec<u8>,
}

/// SQLite's WAL checksum chain: pairs of little-endian u32 additions over
/// 8-byte chunks.
pub fn wal_checksum(init: (u32, u32), data: &[u8]) -> (u32, u32) {
    debug_assert!(data.len() % 8 == 0);
    let (mut s1, mut s2) = init;
    for chunk in data.chunks_exact(8) {
        let x0 = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let x1 = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
    }
    (s1, s2)
}

fn ioerr(code: i32, message: impl Into<String>) -> VfsError {
    VfsError::new(code, message)
}

/// An ordered, dynamically grown vector of page buffers.
#[derive(Debug, Default)]
pub struct DbContent {
    page_size: Option<u32>,
    pages: Vec<Vec<u8>>,
}

impl DbContent {
    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn size(&self) -> u64 {
        match self.page_size {
            Some(ps) => self.pages.len() as u64 * ps as u64,
            None => 0,
        }
    }

    fn latch_page_size(header: &[u8]) -> VfsResult<u32> {
        let raw = u16::from_be_bytes(header[16..18].try_into().unwrap());
        let ps = if raw == 1 { 65536 } else { raw as u32 };
        if !ps.is_power_of_two() || !(512..=65536).contains(&ps) {
            return Err(ioerr(SQLITE_IOERR_WRITE, format!("invalid page size {ps}")));
        }
        Ok(ps)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        let ps = match self.page_size {
            Some(ps) => ps,
            None => {
                // First write: must start at byte 0 and cover at least the
                // 100-byte SQLite header, from which the page size latches.
                if offset != 0 || data.len() < DB_HEADER_SIZE {
                    return Err(ioerr(
                        SQLITE_IOERR_WRITE,
                        "first write must cover the database header",
                    ));
                }
                let ps = Self::latch_page_size(data)?;
                self.page_size = Some(ps);
                if data.len() < ps as usize {
                    // Header-only write; SQLite overwrites it with the full
                    // first page shortly after.
                    let mut page = vec![0u8; ps as usize];
                    page[..data.len()].copy_from_slice(data);
                    self.pages.push(page);
                    return Ok(());
                }
                ps
            }
        };

        let ps = ps as usize;
        if offset as usize % ps != 0 || data.len() % ps != 0 || data.is_empty() {
            return Err(ioerr(SQLITE_IOERR_WRITE, "unaligned database write"));
        }
        let mut page_no = offset as usize / ps;
        for chunk in data.chunks_exact(ps) {
            if page_no > self.pages.len() {
                return Err(ioerr(
                    SQLITE_IOERR_WRITE,
                    format!("write to page {} would leave a hole", page_no + 1),
                ));
            }
            if page_no == self.pages.len() {
                self.pages.push(chunk.to_vec());
            } else {
                self.pages[page_no].copy_from_slice(chunk);
            }
            page_no += 1;
        }
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        buf.fill(0);
        let ps = match self.page_size {
            Some(ps) => ps as usize,
            None => return Err(ioerr(SQLITE_IOERR_SHORT_READ, "empty database")),
        };
        let mut copied = 0usize;
        let offset = offset as usize;
        while copied < buf.len() {
            let pos = offset + copied;
            let page_no = pos / ps;
            if page_no >= self.pages.len() {
                return Err(ioerr(SQLITE_IOERR_SHORT_READ, "read past end"));
            }
            let in_page = pos % ps;
            let n = (ps - in_page).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&self.pages[page_no][in_page..in_page + n]);
            copied += n;
        }
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        let ps = match self.page_size {
            Some(ps) => ps as u64,
            None if size == 0 => return Ok(()),
            None => return Err(ioerr(SQLITE_IOERR_TRUNCATE, "empty database")),
        };
        if size % ps != 0 {
            return Err(ioerr(SQLITE_IOERR_TRUNCATE, "unaligned truncate"));
        }
        let n = (size / ps) as usize;
        if n > self.pages.len() {
            return Err(ioerr(SQLITE_IOERR_TRUNCATE, "cannot grow via truncate"));
        }
        self.pages.truncate(n);
        Ok(())
    }

    /// Serialize the whole database image; used for snapshot transfer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for page in &self.pages {
            out.extend_from_slice(page);
        }
        out
    }

    /// Replace the whole database image; used for snapshot restore.
    pub fn restore(&mut self, data: &[u8]) -> VfsResult<()> {
        if data.is_empty() {
            self.page_size = None;
            self.pages.clear();
            return Ok(());
        }
        if data.len() < DB_HEADER_SIZE {
            return Err(ioerr(SQLITE_IOERR_WRITE, "database image too short"));
        }
        let ps = Self::latch_page_size(data)? as usize;
        if data.len() % ps != 0 {
            return Err(ioerr(SQLITE_IOERR_WRITE, "database image not page aligned"));
        }
        self.page_size = Some(ps as u32);
        self.pages = data.chunks_exact(ps).map(|c| c.to_vec()).collect();
        Ok(())
    }
}

#[derive(Debug)]
struct WalFrame {
    hdr: [u8; WAL_FRAME_HDR_SIZE],
    page: Vec<u8>,
    /// Cumulative checksum after this frame.
    cksum: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    index: usize,
    page_number: u32,
    size_after: u32,
    /// Rewriting an existing uncommitted frame (SQLite overwrites a
    /// spilled page in place rather than appending a second copy).
    in_place: bool,
}

/// Outcome of a WAL write, so the caller can drive the replication hook.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WalWriteOutcome {
    /// A write transaction started with this write.
    pub began: bool,
    /// Uncommitted frames from an aborted transaction were discarded.
    pub undone: bool,
    /// A commit frame completed; holds the post-commit database size.
    pub commit: Option<u32>,
}

/// WAL frame log with canonical headers.
#[derive(Debug, Default)]
pub struct WalContent {
    header: Option<[u8; WAL_HDR_SIZE]>,
    page_size: u32,
    frames: Vec<WalFrame>,
    committed: usize,
    /// Salt and checkpoint sequence for the next header.
    generation: u32,
    pending: Option<PendingFrame>,
    in_tx: bool,
}

impl WalContent {
    fn frame_size(&self) -> usize {
        WAL_FRAME_HDR_SIZE + self.page_size as usize
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn committed_frame_count(&self) -> usize {
        self.committed
    }

    pub fn in_tx(&self) -> bool {
        self.in_tx
    }

    pub fn size(&self) -> u64 {
        match self.header {
            Some(_) => (WAL_HDR_SIZE + self.frames.len() * self.frame_size()) as u64,
            None => 0,
        }
    }

    fn header_checksum(hdr: &[u8; WAL_HDR_SIZE]) -> (u32, u32) {
        (
            u32::from_be_bytes(hdr[24..28].try_into().unwrap()),
            u32::from_be_bytes(hdr[28..32].try_into().unwrap()),
        )
    }

    fn running_checksum(&self) -> (u32, u32) {
        match self.frames.last() {
            Some(frame) => frame.cksum,
            None => Self::header_checksum(self.header.as_ref().unwrap()),
        }
    }

    fn build_header(&mut self, page_size: u32) -> [u8; WAL_HDR_SIZE] {
        let mut hdr = [0u8; WAL_HDR_SIZE];
        hdr[0..4].copy_from_slice(&WAL_MAGIC.to_be_bytes());
        hdr[4..8].copy_from_slice(&WAL_VERSION.to_be_bytes());
        hdr[8..12].copy_from_slice(&page_size.to_be_bytes());
        hdr[12..16].copy_from_slice(&self.generation.to_be_bytes());
        hdr[16..20].copy_from_slice(&self.generation.to_le_bytes());
        // salt2 stays zero
        let cksum = wal_checksum((0, 0), &hdr[0..24]);
        hdr[24..28].copy_from_slice(&cksum.0.to_be_bytes());
        hdr[28..32].copy_from_slice(&cksum.1.to_be_bytes());
        self.generation += 1;
        hdr
    }

    fn set_header(&mut self, page_size: u32) -> VfsResult<()> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(ioerr(SQLITE_IOERR_WRITE, format!("invalid WAL page size {page_size}")));
        }
        let hdr = self.build_header(page_size);
        self.header = Some(hdr);
        self.page_size = page_size;
        self.frames.clear();
        self.committed = 0;
        self.pending = None;
        self.in_tx = false;
        Ok(())
    }

    /// Append one canonical frame. The header must exist.
    fn push_frame(&mut self, page_number: u32, size_after: u32, page: &[u8]) -> VfsResult<()> {
        if page.len() != self.page_size as usize {
            return Err(ioerr(SQLITE_IOERR_WRITE, "frame page size mismatch"));
        }
        let header = self.header.as_ref().unwrap();
        let mut hdr = [0u8; WAL_FRAME_HDR_SIZE];
        hdr[0..4].copy_from_slice(&page_number.to_be_bytes());
        hdr[4..8].copy_from_slice(&size_after.to_be_bytes());
        hdr[8..16].copy_from_slice(&header[16..24]);
        let cksum = wal_checksum(self.running_checksum(), &hdr[0..8]);
        let cksum = wal_checksum(cksum, page);
        hdr[16..20].copy_from_slice(&cksum.0.to_be_bytes());
        hdr[20..24].copy_from_slice(&cksum.1.to_be_bytes());
        self.frames.push(WalFrame { hdr, page: page.to_vec(), cksum });
        Ok(())
    }

    /// Recompute the canonical checksum chain from frame `from` onward,
    /// after an in-place rewrite.
    fn rechain(&mut self, from: usize) {
        let salts: [u8; 8] = self.header.as_ref().unwrap()[16..24].try_into().unwrap();
        let mut running = if from == 0 {
            Self::header_checksum(self.header.as_ref().unwrap())
        } else {
            self.frames[from - 1].cksum
        };
        for frame in &mut self.frames[from..] {
            frame.hdr[8..16].copy_from_slice(&salts);
            let cksum = wal_checksum(running, &frame.hdr[0..8]);
            let cksum = wal_checksum(cksum, &frame.page);
            frame.hdr[16..20].copy_from_slice(&cksum.0.to_be_bytes());
            frame.hdr[20..24].copy_from_slice(&cksum.1.to_be_bytes());
            frame.cksum = cksum;
            running = cksum;
        }
    }

    /// Map a SQLite write onto the frame log.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<WalWriteOutcome> {
        let mut outcome = WalWriteOutcome::default();
        if offset == 0 && data.len() == WAL_HDR_SIZE {
            let page_size = u32::from_be_bytes(data[8..12].try_into().unwrap());
            self.set_header(page_size)?;
            return Ok(outcome);
        }
        if self.header.is_none() {
            return Err(ioerr(SQLITE_IOERR_WRITE, "first WAL write must be the header"));
        }
        if offset < WAL_HDR_SIZE as u64 {
            return Err(ioerr(SQLITE_IOERR_WRITE, "partial WAL header write"));
        }

        let fsz = self.frame_size() as u64;
        let rel = offset - WAL_HDR_SIZE as u64;
        let index = (rel / fsz) as usize;
        let in_frame = (rel % fsz) as usize;

        if in_frame == 0 && data.len() == WAL_FRAME_HDR_SIZE {
            if index > self.frames.len() {
                return Err(ioerr(SQLITE_IOERR_WRITE, "WAL write would leave a hole"));
            }
            if index < self.committed {
                return Err(ioerr(SQLITE_IOERR_WRITE, "overwrite of committed WAL frame"));
            }
            let page_number = u32::from_be_bytes(data[0..4].try_into().unwrap());
            let size_after = u32::from_be_bytes(data[4..8].try_into().unwrap());
            if index < self.frames.len() {
                if self.in_tx {
                    // The writer rewrites one of its own earlier frames in
                    // place, either to overwrite a spilled page or to
                    // refresh checksums behind such an overwrite.
                    self.frames[index].hdr[0..4].copy_from_slice(&data[0..4]);
                    self.frames[index].hdr[4..8].copy_from_slice(&data[4..8]);
                    self.rechain(index);
                    self.pending = Some(PendingFrame {
                        index,
                        page_number,
                        size_after,
                        in_place: true,
                    });
                    return Ok(outcome);
                }
                // A new transaction reuses the tail of an aborted one.
                self.frames.truncate(index);
                outcome.undone = true;
            }
            self.pending = Some(PendingFrame { index, page_number, size_after, in_place: false });
            return Ok(outcome);
        }

        if in_frame == WAL_FRAME_HDR_SIZE && data.len() == self.page_size as usize {
            let pending = self
                .pending
                .take()
                .filter(|p| p.index == index)
                .ok_or_else(|| ioerr(SQLITE_IOERR_WRITE, "WAL page write without frame header"))?;
            if pending.in_place {
                self.frames[index].page = data.to_vec();
                self.rechain(index);
            } else {
                if index != self.frames.len() {
                    return Err(ioerr(SQLITE_IOERR_WRITE, "WAL write would leave a hole"));
                }
                self.push_frame(pending.page_number, pending.size_after, data)?;
            }
            if !self.in_tx {
                self.in_tx = true;
                outcome.began = true;
            }
            if pending.size_after != 0 {
                outcome.commit = Some(pending.size_after);
            }
            return Ok(outcome);
        }

        Err(ioerr(SQLITE_IOERR_WRITE, "unaligned WAL write"))
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        buf.fill(0);
        let header = match &self.header {
            Some(h) => h,
            None => return Err(ioerr(SQLITE_IOERR_SHORT_READ, "empty WAL")),
        };
        let size = self.size();
        let fsz = self.frame_size() as u64;
        let mut copied = 0usize;
        while copied < buf.len() {
            let pos = offset + copied as u64;
            if pos >= size {
                return Err(ioerr(SQLITE_IOERR_SHORT_READ, "read past WAL end"));
            }
            let n;
            if pos < WAL_HDR_SIZE as u64 {
                let off = pos as usize;
                n = (WAL_HDR_SIZE - off).min(buf.len() - copied);
                buf[copied..copied + n].copy_from_slice(&header[off..off + n]);
            } else {
                let rel = pos - WAL_HDR_SIZE as u64;
                let frame = &self.frames[(rel / fsz) as usize];
                let in_frame = (rel % fsz) as usize;
                if in_frame < WAL_FRAME_HDR_SIZE {
                    n = (WAL_FRAME_HDR_SIZE - in_frame).min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&frame.hdr[in_frame..in_frame + n]);
                } else {
                    let off = in_frame - WAL_FRAME_HDR_SIZE;
                    n = (self.page_size as usize - off).min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&frame.page[off..off + n]);
                }
            }
            copied += n;
        }
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if size != 0 {
            return Err(ioerr(SQLITE_IOERR_TRUNCATE, "WAL may only be truncated to zero"));
        }
        self.header = None;
        self.frames.clear();
        self.committed = 0;
        self.pending = None;
        self.in_tx = false;
        Ok(())
    }

    /// The frames of the in-progress transaction, for the replication hook.
    pub fn tx_frames(&self) -> Vec<FrameData> {
        self.frames[self.committed..]
            .iter()
            .map(|f| FrameData {
                page_number: u32::from_be_bytes(f.hdr[0..4].try_into().unwrap()),
                data: f.page.clone(),
            })
            .collect()
    }

    /// Mark the in-progress transaction as durable.
    pub fn commit(&mut self) {
        self.committed = self.frames.len();
        self.in_tx = false;
        self.pending = None;
    }

    /// Discard the in-progress transaction.
    pub fn rollback(&mut self) {
        self.frames.truncate(self.committed);
        self.in_tx = false;
        self.pending = None;
    }

    /// Apply replicated frames directly, as the follower path does. Creates
    /// the header if the WAL is empty. A nonzero `size_after` marks the last
    /// frame as a commit frame and advances the committed boundary.
    pub fn apply_frames(
        &mut self,
        page_size: u32,
        frames: &[FrameData],
        size_after: u32,
    ) -> VfsResult<()> {
        if self.header.is_none() {
            self.set_header(page_size)?;
        }
        if self.page_size != page_size {
            return Err(ioerr(SQLITE_IOERR_WRITE, "WAL page size mismatch"));
        }
        if self.frames.len() != self.committed {
            return Err(ioerr(SQLITE_IOERR_WRITE, "apply with transaction in progress"));
        }
        for (i, frame) in frames.iter().enumerate() {
            let last = i == frames.len() - 1;
            let commit = if last { size_after } else { 0 };
            self.push_frame(frame.page_number, commit, &frame.data)?;
        }
        if size_after != 0 {
            self.committed = self.frames.len();
        }
        Ok(())
    }

    /// Serialize the whole WAL image; used for snapshot transfer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        if let Some(header) = &self.header {
            out.extend_from_slice(header);
            for frame in &self.frames {
                out.extend_from_slice(&frame.hdr);
                out.extend_from_slice(&frame.page);
            }
        }
        out
    }

    /// Replace the whole WAL image; used for snapshot restore.
    pub fn restore(&mut self, data: &[u8]) -> VfsResult<()> {
        *self = WalContent::default();
        if data.is_empty() {
            return Ok(());
        }
        if data.len() < WAL_HDR_SIZE {
            return Err(ioerr(SQLITE_IOERR_WRITE, "WAL image too short"));
        }
        let mut hdr = [0u8; WAL_HDR_SIZE];
        hdr.copy_from_slice(&data[..WAL_HDR_SIZE]);
        let page_size = u32::from_be_bytes(hdr[8..12].try_into().unwrap());
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(ioerr(SQLITE_IOERR_WRITE, "invalid WAL image page size"));
        }
        self.header = Some(hdr);
        self.page_size = page_size;
        self.generation = u32::from_be_bytes(hdr[12..16].try_into().unwrap()) + 1;

        let fsz = self.frame_size();
        let body = &data[WAL_HDR_SIZE..];
        if body.len() % fsz != 0 {
            return Err(ioerr(SQLITE_IOERR_WRITE, "WAL image not frame aligned"));
        }
        for chunk in body.chunks_exact(fsz) {
            let mut fh = [0u8; WAL_FRAME_HDR_SIZE];
            fh.copy_from_slice(&chunk[..WAL_FRAME_HDR_SIZE]);
            let cksum = (
                u32::from_be_bytes(fh[16..20].try_into().unwrap()),
                u32::from_be_bytes(fh[20..24].try_into().unwrap()),
            );
            self.frames.push(WalFrame {
                hdr: fh,
                page: chunk[WAL_FRAME_HDR_SIZE..].to_vec(),
                cksum,
            });
        }
        self.committed = self.frames.len();
        Ok(())
    }
}

/// Rollback journals and temporary files: a plain byte buffer.
#[derive(Debug, Default)]
pub struct JournalContent {
    data: Vec<u8>,
}

impl JournalContent {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        let end = offset as usize + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        buf.fill(0);
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            if offset < self.data.len() {
                let n = self.data.len() - offset;
                buf[..n].copy_from_slice(&self.data[offset..]);
            }
            return Err(ioerr(SQLITE_IOERR_SHORT_READ, "read past journal end"));
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        Err(ioerr(SQLITE_IOERR_TRUNCATE, "journal truncate not supported"))
    }
}
