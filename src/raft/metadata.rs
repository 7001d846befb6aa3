//! Term and vote persistence.
//!
//! Two fixed-size files, `metadata1` and `metadata2`, are written
//! alternately: odd versions go to file 1, even versions to file 2. The
//! loader reads both and keeps the higher version, so a torn write of one
//! file can never lose the other.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

const METADATA_FORMAT: u64 = 1;
const METADATA_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct MetadataRecord {
    format: u64,
    version: u64,
    term: u64,
    voted_for: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    pub version: u64,
    pub term: u64,
    pub voted_for: u64,
}

pub struct MetadataStore {
    dir: PathBuf,
    current: Metadata,
}

impl MetadataStore {
    /// Load the most recent metadata from disk, if any.
    pub fn load(dir: &Path) -> Result<Self> {
        let meta1 = read_file(&dir.join("metadata1"))?;
        let meta2 = read_file(&dir.join("metadata2"))?;
        let current = match (meta1, meta2) {
            (None, None) => Metadata::default(),
            (Some(m), None) | (None, Some(m)) => m,
            (Some(m1), Some(m2)) => {
                if m1.version == m2.version {
                    return Err(Error::Corrupt(format!(
                        "metadata1 and metadata2 have the same version {}",
                        m1.version
                    )));
                }
                if m1.version > m2.version {
                    m1
                } else {
                    m2
                }
            }
        };
        Ok(Self { dir: dir.to_path_buf(), current })
    }

    pub fn current(&self) -> Metadata {
        self.current
    }

    /// Persist a term/vote change. Bumps the version and writes the
    /// alternate file synchronously.
    pub fn store(&mut self, term: u64, voted_for: u64) -> Result<()> {
        let next = Metadata {
            version: self.current.version + 1,
            term,
            voted_for,
        };
        let name = if next.version % 2 == 1 { "metadata1" } else { "metadata2" };
        let record = MetadataRecord {
            format: METADATA_FORMAT,
            version: next.version.to_le(),
            term: next.term.to_le(),
            voted_for: next.voted_for.to_le(),
        };
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        use std::os::unix::fs::FileExt;
        file.write_all_at(bytemuck::bytes_of(&record), 0)?;
        file.sync_data()?;
        self.current = next;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Option<Metadata>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = [0u8; METADATA_SIZE];
    let mut read = 0;
    while read < METADATA_SIZE {
        match file.read(&mut buf[read..])? {
            // A short file was never fully written; treat it as absent.
            0 => return Ok(None),
            n => read += n,
        }
    }
    let record: MetadataRecord = bytemuck::pod_read_unaligned(&buf);
    let record = MetadataRecord {
        format: u64::from_le(record.format),
        version: u64::from_le(record.version),
        term: u64::from_le(record.term),
        voted_for: u64::from_le(record.voted_for),
    };
    if record.format != METADATA_FORMAT {
        return Err(Error::Corrupt(format!(
            "{}: unknown metadata format {}",
            path.display(),
            record.format
        )));
    }
    Ok(Some(Metadata {
        version: record.version,
        term: record.term,
        voted_for: record.voted_for,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_alternates_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(store.current(), Metadata::default());

        store.store(1, 0).unwrap();
        assert!(dir.path().join("metadata1").exists());
        assert!(!dir.path().join("metadata2").exists());

        store.store(1, 2).unwrap();
        assert!(dir.path().join("metadata2").exists());

        let reloaded = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.current(), Metadata { version: 2, term: 1, voted_for: 2 });
    }

    #[test]
    fn loader_picks_higher_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path()).unwrap();
        store.store(1, 0).unwrap();
        store.store(2, 1).unwrap();
        store.store(3, 1).unwrap();

        let reloaded = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.current().version, 3);
        assert_eq!(reloaded.current().term, 3);
    }

    #[test]
    fn short_file_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metadata1"), [1u8; 16]).unwrap();
        let store = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(store.current(), Metadata::default());
    }

    #[test]
    fn equal_versions_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path()).unwrap();
        store.store(1, 0).unwrap();
        let record = std::fs::read(dir.path().join("metadata1")).unwrap();
        std::fs::write(dir.path().join("metadata2"), record).unwrap();
        assert!(matches!(MetadataStore::load(dir.path()), Err(Error::Corrupt(_))));
    }
}
