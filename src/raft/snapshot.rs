//! Snapshot persistence: `snapshot-<term>-<index>-<timestamp>` payload files
//! paired with `.meta` files carrying the cluster configuration.
//!
//! Payloads are optionally LZ4-framed; the frame magic makes the format
//! self-describing, so compression can be toggled without migration. Orphan
//! halves are removed at startup and only the two most recent pairs are
//! retained.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

const SNAPSHOT_FORMAT: u64 = 1;
const META_SUFFIX: &str = ".meta";

/// Magic prefix of an LZ4 frame.
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotId {
    pub term: u64,
    pub index: u64,
    pub timestamp: u64,
}

impl SnapshotId {
    fn data_name(&self) -> String {
        format!("snapshot-{}-{}-{}", self.term, self.index, self.timestamp)
    }

    fn meta_name(&self) -> String {
        format!("{}{META_SUFFIX}", self.data_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub conf_index: u64,
    pub configuration: Vec<u8>,
    pub payload: Vec<u8>,
}

fn parse_snapshot_name(name: &str) -> Option<(SnapshotId, bool)> {
    let (core, is_meta) = match name.strip_suffix(META_SUFFIX) {
        Some(core) => (core, true),
        None => (name, false),
    };
    let rest = core.strip_prefix("snapshot-")?;
    let mut parts = rest.splitn(3, '-');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let timestamp = parts.next()?.parse().ok()?;
    Some((SnapshotId { term, index, timestamp }, is_meta))
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

pub struct SnapshotStore {
    dir: PathBuf,
    compression: bool,
}

impl SnapshotStore {
    pub fn new(dir: &Path, compression: bool) -> Self {
        Self { dir: dir.to_path_buf(), compression }
    }

    fn scan(&self) -> Result<(Vec<SnapshotId>, Vec<SnapshotId>)> {
        let mut data = Vec::new();
        let mut meta = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some((id, is_meta)) = parse_snapshot_name(&name) {
                if is_meta {
                    meta.push(id);
                } else {
                    data.push(id);
                }
            }
        }
        data.sort();
        meta.sort();
        Ok((data, meta))
    }

    /// Complete snapshot pairs, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let (data, meta) = self.scan()?;
        Ok(data.into_iter().filter(|id| meta.contains(id)).collect())
    }

    /// Remove snapshot halves whose counterpart is missing. Run at startup,
    /// before the log is loaded.
    pub fn cleanup_orphans(&self) -> Result<()> {
        let (data, meta) = self.scan()?;
        for id in &data {
            if !meta.contains(id) {
                tracing::warn!("removing orphan snapshot {}", id.data_name());
                std::fs::remove_file(self.dir.join(id.data_name()))?;
            }
        }
        for id in &meta {
            if !data.contains(id) {
                tracing::warn!("removing orphan snapshot meta {}", id.meta_name());
                std::fs::remove_file(self.dir.join(id.meta_name()))?;
            }
        }
        Ok(())
    }

    /// Persist a snapshot pair: meta first (exclusive create, fsync), then
    /// the payload, then the directory; finally drop pairs older than the
    /// most recent two.
    pub fn put(
        &self,
        term: u64,
        index: u64,
        conf_index: u64,
        configuration: &[u8],
        payload: &[u8],
    ) -> Result<SnapshotId> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = SnapshotId { term, index, timestamp };

        let mut crc = crc32fast::Hasher::new();
        crc.update(&conf_index.to_le_bytes());
        crc.update(&(configuration.len() as u64).to_le_bytes());
        crc.update(configuration);
        let crc = crc.finalize();

        let mut meta = Vec::with_capacity(32 + configuration.len());
        meta.extend_from_slice(&SNAPSHOT_FORMAT.to_le_bytes());
        meta.extend_from_slice(&(crc as u64).to_le_bytes());
        meta.extend_from_slice(&conf_index.to_le_bytes());
        meta.extend_from_slice(&(configuration.len() as u64).to_le_bytes());
        meta.extend_from_slice(configuration);

        let meta_path = self.dir.join(id.meta_name());
        let mut meta_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&meta_path)?;
        meta_file.write_all(&meta)?;
        meta_file.sync_all()?;
        sync_dir(&self.dir)?;

        let data_path = self.dir.join(id.data_name());
        let mut data_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&data_path)?;
        if self.compression {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(&mut data_file);
            encoder.write_all(payload)?;
            encoder
                .finish()
                .map_err(|e| Error::Internal(format!("lz4 compression: {e}")))?;
        } else {
            data_file.write_all(payload)?;
        }
        data_file.sync_all()?;
        sync_dir(&self.dir)?;

        self.retain_recent(2)?;
        Ok(id)
    }

    fn retain_recent(&self, keep: usize) -> Result<()> {
        let complete = self.list()?;
        if complete.len() <= keep {
            return Ok(());
        }
        for id in &complete[..complete.len() - keep] {
            tracing::info!("removing old snapshot {}", id.data_name());
            std::fs::remove_file(self.dir.join(id.data_name()))?;
            std::fs::remove_file(self.dir.join(id.meta_name()))?;
        }
        sync_dir(&self.dir)?;
        Ok(())
    }

    /// Load the most recent complete snapshot.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let complete = self.list()?;
        let Some(id) = complete.last().copied() else {
            return Ok(None);
        };
        Ok(Some(self.load(id)?))
    }

    pub fn load(&self, id: SnapshotId) -> Result<Snapshot> {
        let meta = std::fs::read(self.dir.join(id.meta_name()))?;
        if meta.len() < 32 {
            return Err(Error::Corrupt(format!("snapshot meta {} too short", id.meta_name())));
        }
        let format = u64::from_le_bytes(meta[0..8].try_into().unwrap());
        if format != SNAPSHOT_FORMAT {
            return Err(Error::Corrupt(format!("unknown snapshot format {format}")));
        }
        let crc_stored = u64::from_le_bytes(meta[8..16].try_into().unwrap());
        let conf_index = u64::from_le_bytes(meta[16..24].try_into().unwrap());
        let conf_len = u64::from_le_bytes(meta[24..32].try_into().unwrap()) as usize;
        if meta.len() < 32 + conf_len {
            return Err(Error::Corrupt(format!(
                "snapshot meta {} truncated configuration",
                id.meta_name()
            )));
        }
        let configuration = meta[32..32 + conf_len].to_vec();

        let mut crc = crc32fast::Hasher::new();
        crc.update(&conf_index.to_le_bytes());
        crc.update(&(conf_len as u64).to_le_bytes());
        crc.update(&configuration);
        if crc.finalize() as u64 != crc_stored {
            return Err(Error::Corrupt(format!(
                "snapshot meta {} checksum mismatch",
                id.meta_name()
            )));
        }

        let raw = std::fs::read(self.dir.join(id.data_name()))?;
        let payload = if raw.len() >= 4 && raw[0..4] == LZ4_MAGIC {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(&raw[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Corrupt(format!("lz4 decompression: {e}")))?;
            out
        } else {
            raw
        };

        Ok(Snapshot { id, conf_index, configuration, payload })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let id = store.put(2, 9, 9, b"conf-bytes", b"payload-bytes").unwrap();
        assert_eq!((id.term, id.index), (2, 9));

        let snapshot = store.latest().unwrap().unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.conf_index, 9);
        assert_eq!(snapshot.configuration, b"conf-bytes");
        assert_eq!(snapshot.payload, b"payload-bytes");
    }

    #[test]
    fn compressed_payload_detected_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![42u8; 100_000];
        let store = SnapshotStore::new(dir.path(), true);
        let id = store.put(1, 4, 4, b"c", &payload).unwrap();

        let raw = std::fs::read(dir.path().join(id.data_name())).unwrap();
        assert_eq!(&raw[0..4], &LZ4_MAGIC);
        assert!(raw.len() < payload.len());

        // A store without compression still reads it back.
        let store = SnapshotStore::new(dir.path(), false);
        assert_eq!(store.latest().unwrap().unwrap().payload, payload);
    }

    #[test]
    fn newest_pair_wins_and_orphans_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        store.put(1, 4, 4, b"c", b"p14").unwrap();
        store.put(2, 6, 6, b"c", b"p26").unwrap();
        store.put(2, 9, 9, b"c", b"p29").unwrap();

        // Fabricate the data-less snapshot (1, 8).
        std::fs::write(dir.path().join("snapshot-1-8-123.meta"), [0u8; 32]).unwrap();

        store.cleanup_orphans().unwrap();
        assert!(!dir.path().join("snapshot-1-8-123.meta").exists());

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.payload, b"p29");
    }

    #[test]
    fn retains_two_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        store.put(1, 2, 2, b"c", b"a").unwrap();
        store.put(1, 4, 4, b"c", b"b").unwrap();
        store.put(1, 6, 6, b"c", b"c").unwrap();
        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].index, 4);
        assert_eq!(ids[1].index, 6);
    }

    #[test]
    fn corrupt_meta_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let id = store.put(1, 2, 2, b"configuration", b"payload").unwrap();

        let meta_path = dir.path().join(id.meta_name());
        let mut meta = std::fs::read(&meta_path).unwrap();
        let last = meta.len() - 1;
        meta[last] ^= 0xff;
        std::fs::write(&meta_path, meta).unwrap();

        assert!(matches!(store.load(id), Err(Error::Corrupt(_))));
    }
}
