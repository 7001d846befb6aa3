//! In-memory log backing the `raft` crate's `Storage` trait.
//!
//! The Raft core reads entries, terms and the hard state from here; the
//! durable side lives in the segment, metadata and snapshot stores, which
//! the node keeps in lockstep with this cache: entries are appended here
//! only after (or together with) their durable append, and the hard state
//! only after the metadata write.

use std::sync::Arc;

use parking_lot::RwLock;
use protobuf::Message as _;
use raft::eraftpb::{ConfChange, ConfState, Entry, EntryType, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

use crate::error::{Error, Result};
use crate::wire::{Builder, Cursor};

use super::segment::{DiskEntry, ENTRY_BARRIER, ENTRY_CHANGE, ENTRY_COMMAND};

/// Cluster configuration: voter ids and their dial addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub servers: Vec<(u64, String)>,
}

impl Configuration {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = Builder::new();
        b.put_u64(self.servers.len() as u64);
        for (id, address) in &self.servers {
            b.put_u64(*id);
            b.put_text(address);
        }
        b.finish().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Configuration> {
        let mut cursor = Cursor::new(data);
        let n = cursor.get_u64()? as usize;
        let mut servers = Vec::with_capacity(n);
        for _ in 0..n {
            let id = cursor.get_u64()?;
            let address = cursor.get_text()?.to_owned();
            servers.push((id, address));
        }
        Ok(Configuration { servers })
    }

    pub fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::default();
        cs.set_voters(self.servers.iter().map(|(id, _)| *id).collect());
        cs
    }

    pub fn address_of(&self, id: u64) -> Option<&str> {
        self.servers
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, address)| address.as_str())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.servers.iter().any(|(sid, _)| *sid == id)
    }
}

/// Convert a raft entry into its durable representation. The index is
/// implicit in the entry's position in the log.
pub fn entry_to_disk(entry: &Entry) -> DiskEntry {
    let kind = match entry.get_entry_type() {
        EntryType::EntryNormal if entry.get_data().is_empty() => ENTRY_BARRIER,
        EntryType::EntryNormal => ENTRY_COMMAND,
        EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => ENTRY_CHANGE,
    };
    DiskEntry {
        term: entry.get_term(),
        kind,
        data: entry.get_data().to_vec(),
    }
}

pub fn disk_to_entry(index: u64, disk: &DiskEntry) -> Entry {
    let mut entry = Entry::default();
    entry.set_index(index);
    entry.set_term(disk.term);
    entry.set_entry_type(match disk.kind {
        ENTRY_CHANGE => EntryType::EntryConfChange,
        _ => EntryType::EntryNormal,
    });
    entry.set_data(disk.data.clone().into());
    entry
}

#[derive(Default)]
struct Core {
    entries: Vec<Entry>,
    snapshot_index: u64,
    snapshot_term: u64,
    hard_state: HardState,
    configuration: Configuration,
    conf_index: u64,
    /// Most recent materialized snapshot, served to lagging followers.
    cached_snapshot: Option<Snapshot>,
}

impl Core {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(entry) => entry.get_index(),
            None => self.snapshot_index + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.get_index(),
            None => self.snapshot_index,
        }
    }

    fn offset(&self, index: u64) -> usize {
        (index - self.first_index()) as usize
    }
}

#[derive(Clone, Default)]
pub struct LogStore {
    core: Arc<RwLock<Core>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from the loaded log: entries start at `first_index`,
    /// which is one past the snapshot index when a snapshot exists.
    pub fn seed(
        &self,
        first_index: u64,
        disk_entries: &[DiskEntry],
        term: u64,
        voted_for: u64,
        snapshot: Option<(u64, u64, Configuration, u64)>,
    ) {
        let mut core = self.core.write();
        if let Some((index, term, configuration, conf_index)) = snapshot {
            core.snapshot_index = index;
            core.snapshot_term = term;
            core.configuration = configuration;
            core.conf_index = conf_index;
            // Everything up to the snapshot is known committed.
            core.hard_state.set_commit(index);
        }
        core.entries = disk_entries
            .iter()
            .enumerate()
            .map(|(i, disk)| disk_to_entry(first_index + i as u64, disk))
            .collect();

        // Replay configuration changes recorded in the log; the latest one
        // takes effect even before commit.
        let entries = core.entries.clone();
        for entry in &entries {
            if entry.get_entry_type() == EntryType::EntryConfChange {
                if let Err(e) = apply_change_to(&mut core.configuration, entry.get_data()) {
                    tracing::warn!("ignoring malformed configuration entry: {e}");
                }
                core.conf_index = entry.get_index();
            }
        }

        core.hard_state.set_term(term);
        core.hard_state.set_vote(voted_for);
    }

    pub fn append(&self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let mut core = self.core.write();
        let first_new = entries[0].get_index();
        if first_new <= core.last_index() && first_new >= core.first_index() {
            let keep = core.offset(first_new);
            core.entries.truncate(keep);
        }
        core.entries.extend_from_slice(entries);
    }

    pub fn set_hard_state(&self, hs: &HardState) {
        self.core.write().hard_state = hs.clone();
    }

    pub fn hard_state(&self) -> HardState {
        self.core.read().hard_state.clone()
    }

    pub fn configuration(&self) -> Configuration {
        self.core.read().configuration.clone()
    }

    pub fn set_configuration(&self, configuration: Configuration, conf_index: u64) {
        let mut core = self.core.write();
        core.configuration = configuration;
        core.conf_index = conf_index;
    }

    pub fn conf_index(&self) -> u64 {
        self.core.read().conf_index
    }

    pub fn snapshot_index(&self) -> u64 {
        self.core.read().snapshot_index
    }

    pub fn last_log_index(&self) -> u64 {
        self.core.read().last_index()
    }

    /// Record a snapshot taken at `(index, term)` and drop entries no
    /// longer needed, keeping `trailing` entries behind the snapshot for
    /// follower catch-up.
    pub fn compact(&self, index: u64, term: u64, trailing: u64) {
        let mut core = self.core.write();
        core.snapshot_index = index;
        core.snapshot_term = term;
        let cut = index.saturating_sub(trailing);
        if cut >= core.first_index() && cut <= core.last_index() {
            let keep = core.offset(cut) + 1;
            core.entries.drain(..keep);
        }
    }

    pub fn cache_snapshot(&self, snapshot: Snapshot) {
        self.core.write().cached_snapshot = Some(snapshot);
    }

    /// Install a snapshot received from the leader: the local log is
    /// replaced wholesale.
    pub fn restore_snapshot(&self, metadata: &SnapshotMetadata, configuration: Configuration) {
        let mut core = self.core.write();
        core.entries.clear();
        core.snapshot_index = metadata.get_index();
        core.snapshot_term = metadata.get_term();
        core.configuration = configuration;
        core.conf_index = metadata.get_index();
        core.hard_state.set_commit(metadata.get_index());
    }
}

/// Apply one encoded `ConfChange` to a configuration.
pub fn apply_change_to(configuration: &mut Configuration, data: &[u8]) -> Result<()> {
    let mut change = ConfChange::default();
    change
        .merge_from_bytes(data)
        .map_err(|e| Error::Internal(format!("malformed conf change: {e}")))?;
    let id = change.get_node_id();
    match change.get_change_type() {
        raft::eraftpb::ConfChangeType::AddNode
        | raft::eraftpb::ConfChangeType::AddLearnerNode => {
            let address = String::from_utf8_lossy(change.get_context()).into_owned();
            if let Some(entry) = configuration.servers.iter_mut().find(|(sid, _)| *sid == id) {
                entry.1 = address;
            } else {
                configuration.servers.push((id, address));
            }
        }
        raft::eraftpb::ConfChangeType::RemoveNode => {
            configuration.servers.retain(|(sid, _)| *sid != id);
        }
    }
    Ok(())
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.configuration.conf_state(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.core.read();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let lo = core.offset(low);
        let hi = core.offset(high);
        let mut entries: Vec<Entry> = core.entries[lo..hi].to_vec();
        if let Some(max_size) = max_size.into() {
            let mut total = 0u64;
            let mut keep = 0;
            for (i, entry) in entries.iter().enumerate() {
                total += entry.compute_size() as u64;
                if total > max_size && i > 0 {
                    break;
                }
                keep = i + 1;
            }
            entries.truncate(keep);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.core.read();
        if idx == core.snapshot_index {
            return Ok(core.snapshot_term);
        }
        if idx < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(core.entries[core.offset(idx)].get_term())
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.core.read();
        match &core.cached_snapshot {
            Some(snapshot) if snapshot.get_metadata().get_index() >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn normal_entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut entry = Entry::default();
        entry.set_index(index);
        entry.set_term(term);
        entry.set_entry_type(EntryType::EntryNormal);
        entry.set_data(data.to_vec().into());
        entry
    }

    #[test]
    fn configuration_round_trip() {
        let configuration = Configuration {
            servers: vec![(1, "127.0.0.1:9001".into()), (2, "127.0.0.1:9002".into())],
        };
        let decoded = Configuration::decode(&configuration.encode()).unwrap();
        assert_eq!(decoded, configuration);
        assert_eq!(decoded.conf_state().get_voters(), &[1, 2]);
        assert_eq!(decoded.address_of(2), Some("127.0.0.1:9002"));
    }

    #[test]
    fn disk_entry_mapping() {
        let command = normal_entry(3, 2, b"payload");
        let disk = entry_to_disk(&command);
        assert_eq!(disk.kind, ENTRY_COMMAND);
        assert_eq!(disk_to_entry(3, &disk), command);

        let barrier = normal_entry(4, 2, b"");
        assert_eq!(entry_to_disk(&barrier).kind, ENTRY_BARRIER);
    }

    #[test]
    fn append_truncates_conflicts() {
        let store = LogStore::new();
        store.append(&[
            normal_entry(1, 1, b"a"),
            normal_entry(2, 1, b"b"),
            normal_entry(3, 1, b"c"),
        ]);
        store.append(&[normal_entry(2, 2, b"d")]);
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.term(2).unwrap(), 2);
    }

    #[test]
    fn compact_keeps_trailing() {
        let store = LogStore::new();
        let entries: Vec<Entry> = (1..=10).map(|i| normal_entry(i, 1, b"x")).collect();
        store.append(&entries);
        store.compact(8, 1, 2);
        assert_eq!(store.first_index().unwrap(), 7);
        assert_eq!(store.last_index().unwrap(), 10);
        assert!(matches!(
            store.entries(5, 8, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
    }

    #[test]
    fn seed_replays_configuration_changes() {
        let mut change = ConfChange::default();
        change.set_change_type(raft::eraftpb::ConfChangeType::AddNode);
        change.set_node_id(1);
        change.set_context(b"127.0.0.1:9001".to_vec().into());
        let disk = DiskEntry {
            term: 1,
            kind: ENTRY_CHANGE,
            data: change.write_to_bytes().unwrap(),
        };

        let store = LogStore::new();
        store.seed(1, &[disk], 1, 0, None);
        let configuration = store.configuration();
        assert_eq!(configuration.servers, vec![(1, "127.0.0.1:9001".to_string())]);
        assert_eq!(store.conf_index(), 1);
    }
}
