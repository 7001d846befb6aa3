//! Drives the `raft` crate's `RawNode`: ticks, message stepping, the ready
//! loop, entry application and snapshot management.
//!
//! The loop persists in this order: entries go to the segment store before
//! they enter the in-memory log, the hard state goes to the metadata files
//! before messages that depend on it are sent, and committed entries are
//! applied strictly in index order.

use std::sync::Arc;
use std::time::Duration;

use protobuf::Message as _;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Snapshot, SnapshotMetadata};
use raft::{RawNode, StateRole};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::replication::Replication;
use crate::wire::{Builder, Cursor};

use super::metadata::MetadataStore;
use super::segment::{self, DiskEntry, SegmentLog, ENTRY_CHANGE};
use super::snapshot::SnapshotStore;
use super::store::{apply_change_to, entry_to_disk, Configuration, LogStore};
use super::transport::Transport;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum NodeRequest {
    /// Journal a replicated command. The origin sequence ties the entry
    /// back to the suspended transaction that proposed it.
    Propose { data: Vec<u8>, origin_seq: u64 },
    /// Complete once every entry committed so far has been applied.
    Barrier { done: oneshot::Sender<Result<()>> },
    Status { done: oneshot::Sender<NodeStatus> },
    AddServer { id: u64, address: String, done: oneshot::Sender<Result<()>> },
    RemoveServer { id: u64, done: oneshot::Sender<Result<()>> },
    TransferLeadership { to: u64, done: oneshot::Sender<Result<()>> },
    Stop { done: oneshot::Sender<()> },
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u64,
    pub is_leader: bool,
    pub leader_id: u64,
    pub leader_address: Option<String>,
    pub servers: Vec<(u64, String)>,
}

#[derive(Clone)]
pub struct NodeHandle {
    pub requests: mpsc::Sender<NodeRequest>,
}

impl NodeHandle {
    pub fn new(requests: mpsc::Sender<NodeRequest>) -> Self {
        Self { requests }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (done, rx) = oneshot::channel();
        self.requests
            .send(NodeRequest::Status { done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.requests.send(NodeRequest::Stop { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Write the initial cluster configuration. The data directory must be
/// pristine: a one-entry-per-server closed segment and the initial term are
/// created, exactly once in the lifetime of a cluster.
pub async fn bootstrap(config: &Config, servers: Vec<(u64, String)>) -> Result<()> {
    let dir = config.data_dir.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        let has_state = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).any(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("metadata") || segment::parse_closed_name(&name).is_some()
        });
        if has_state {
            return Err(Error::CantBootstrap("data directory is not empty".into()));
        }

        let entries: Vec<DiskEntry> = servers
            .iter()
            .map(|(id, address)| {
                let mut change = ConfChange::default();
                change.set_change_type(ConfChangeType::AddNode);
                change.set_node_id(*id);
                change.set_context(address.as_bytes().to_vec().into());
                DiskEntry {
                    term: 1,
                    kind: ENTRY_CHANGE,
                    data: change.write_to_bytes().expect("conf change encoding"),
                }
            })
            .collect();

        let name = segment::closed_name(1, entries.len() as u64);
        let mut data = segment::SEGMENT_FORMAT.to_le_bytes().to_vec();
        data.extend_from_slice(&segment::encode_batch(&entries));
        std::fs::write(dir.join(&name), &data)?;
        std::fs::File::open(dir.join(&name))?.sync_all()?;
        std::fs::File::open(&dir)?.sync_all()?;

        let mut metadata = MetadataStore::load(&dir)?;
        metadata.store(1, 0)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))?
}

/// Load the durable state and spawn the node task. Returns once the log is
/// loaded and the state machine restored.
pub async fn start(
    config: Config,
    replication: Arc<Replication>,
    requests: mpsc::Receiver<NodeRequest>,
    raft_in: mpsc::Receiver<raft::eraftpb::Message>,
    transport: Arc<Transport>,
) -> Result<()> {
    let dir = config.data_dir.clone();
    std::fs::create_dir_all(&dir)?;

    let auto_recovery = config.auto_recovery;
    let compression = config.snapshot_compression;
    let loaded = {
        let dir = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<_> {
            let metadata = MetadataStore::load(&dir)?;
            let snapshots = SnapshotStore::new(&dir, compression);
            snapshots.cleanup_orphans()?;
            let snapshot = snapshots.latest()?;
            let snapshot_index = snapshot.as_ref().map(|s| s.id.index).unwrap_or(0);
            let log = segment::load(&dir, snapshot_index, auto_recovery)?;
            Ok((metadata, snapshots, snapshot, log))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??
    };
    let (metadata, snapshots, snapshot, log) = loaded;

    let store = LogStore::new();
    let mut cached = None;
    let snapshot_seed = match &snapshot {
        Some(snapshot) => {
            let configuration = Configuration::decode(&snapshot.configuration)
                .map_err(|e| e.wrap("snapshot configuration"))?;
            replication.restore_payload(&snapshot.payload)?;
            cached = Some(build_raft_snapshot(
                snapshot.id.index,
                snapshot.id.term,
                &configuration,
                &snapshot.configuration,
                &snapshot.payload,
            ));
            Some((
                snapshot.id.index,
                snapshot.id.term,
                configuration,
                snapshot.conf_index,
            ))
        }
        None => None,
    };
    let current = metadata.current();
    store.seed(log.first_index, &log.entries, current.term, current.voted_for, snapshot_seed);
    if let Some(snapshot) = cached {
        store.cache_snapshot(snapshot);
    }

    let durable_next_index = log.first_index + log.entries.len() as u64;
    let segment_log = SegmentLog::start(
        dir.clone(),
        config.segment_size,
        config.prepare_pool_target,
        log.next_counter,
        durable_next_index,
    );

    let raft_config = raft::Config {
        id: config.id,
        election_tick: config.election_tick,
        heartbeat_tick: config.heartbeat_tick,
        applied: store.snapshot_index(),
        check_quorum: true,
        pre_vote: true,
        ..Default::default()
    };
    raft_config.validate()?;
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let raw = RawNode::new(&raft_config, store.clone(), &logger)?;

    let node = Node {
        config,
        raw,
        store,
        metadata,
        snapshots: Arc::new(snapshots),
        segment_log,
        transport,
        replication,
        durable_next_index,
        applied: 0,
        barrier_waiters: Vec::new(),
        conf_waiters: Vec::new(),
        was_leader: false,
    };
    node_spawn(node, requests, raft_in);
    Ok(())
}

fn node_spawn(
    mut node: Node,
    mut requests: mpsc::Receiver<NodeRequest>,
    mut raft_in: mpsc::Receiver<raft::eraftpb::Message>,
) {
    node.applied = node.store.snapshot_index();

    // Single-member clusters elect themselves immediately.
    if node.store.configuration().servers.len() == 1
        && node.store.configuration().contains(node.config.id)
    {
        let _ = node.raw.campaign();
    }

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => { node.raw.tick(); }
                message = raft_in.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = node.raw.step(message) {
                        tracing::debug!("step: {e}");
                    }
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    if node.handle_request(request).await {
                        return;
                    }
                }
            }
            if let Err(e) = node.on_ready().await {
                tracing::error!("raft ready loop: {e}");
            }
        }
        node.shutdown().await;
    });
}

struct Node {
    config: Config,
    raw: RawNode<LogStore>,
    store: LogStore,
    metadata: MetadataStore,
    snapshots: Arc<SnapshotStore>,
    segment_log: SegmentLog,
    transport: Arc<Transport>,
    replication: Arc<Replication>,
    /// Index the next durable append will receive.
    durable_next_index: u64,
    applied: u64,
    barrier_waiters: Vec<(u64, oneshot::Sender<Result<()>>)>,
    conf_waiters: Vec<(u64, oneshot::Sender<Result<()>>)>,
    was_leader: bool,
}

impl Node {
    /// Returns true when the node should stop.
    async fn handle_request(&mut self, request: NodeRequest) -> bool {
        match request {
            NodeRequest::Propose { data, origin_seq } => {
                if self.raw.raft.state != StateRole::Leader {
                    let leader = self.leader_address();
                    self.replication.abort_tx(origin_seq, Error::NotLeader { leader });
                    return false;
                }
                if let Err(e) = self.raw.propose(vec![], data) {
                    tracing::debug!("propose: {e}");
                    self.replication.abort_tx(origin_seq, Error::NotLeader { leader: None });
                }
            }
            NodeRequest::Barrier { done } => {
                if self.raw.raft.state == StateRole::Leader {
                    let target = self.raw.raft.raft_log.last_index() + 1;
                    if let Err(e) = self.raw.propose(vec![], vec![]) {
                        let _ = done.send(Err(e.into()));
                    } else {
                        self.barrier_waiters.push((target, done));
                    }
                } else {
                    let committed = self.raw.raft.raft_log.committed;
                    if self.applied >= committed {
                        let _ = done.send(Ok(()));
                    } else {
                        self.barrier_waiters.push((committed, done));
                    }
                }
            }
            NodeRequest::Status { done } => {
                let _ = done.send(self.status());
            }
            NodeRequest::AddServer { id, address, done } => {
                let mut change = ConfChange::default();
                change.set_change_type(ConfChangeType::AddNode);
                change.set_node_id(id);
                change.set_context(address.into_bytes().into());
                self.propose_change(change, done);
            }
            NodeRequest::RemoveServer { id, done } => {
                let mut change = ConfChange::default();
                change.set_change_type(ConfChangeType::RemoveNode);
                change.set_node_id(id);
                self.propose_change(change, done);
            }
            NodeRequest::TransferLeadership { to, done } => {
                self.raw.transfer_leader(to);
                let _ = done.send(Ok(()));
            }
            NodeRequest::Stop { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    fn propose_change(&mut self, change: ConfChange, done: oneshot::Sender<Result<()>>) {
        if self.raw.raft.state != StateRole::Leader {
            let _ = done.send(Err(Error::NotLeader { leader: self.leader_address() }));
            return;
        }
        let target = self.raw.raft.raft_log.last_index() + 1;
        match self.raw.propose_conf_change(vec![], change) {
            Ok(()) => self.conf_waiters.push((target, done)),
            Err(e) => {
                let _ = done.send(Err(e.into()));
            }
        }
    }

    fn leader_address(&self) -> Option<String> {
        let leader_id = self.raw.raft.leader_id;
        if leader_id == 0 {
            return None;
        }
        self.store.configuration().address_of(leader_id).map(str::to_owned)
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.config.id,
            is_leader: self.raw.raft.state == StateRole::Leader,
            leader_id: self.raw.raft.leader_id,
            leader_address: self.leader_address(),
            servers: self.store.configuration().servers,
        }
    }

    async fn on_ready(&mut self) -> Result<()> {
        while self.raw.has_ready() {
            let mut ready = self.raw.ready();

            if !ready.messages().is_empty() {
                self.send_messages(ready.take_messages());
            }

            if !ready.snapshot().is_empty() {
                let snapshot = ready.snapshot().clone();
                self.install_snapshot(snapshot).await?;
            }

            let committed = ready.take_committed_entries();
            self.apply_entries(committed).await?;

            if !ready.entries().is_empty() {
                self.persist_entries(ready.entries()).await?;
                self.store.append(ready.entries());
            }

            if let Some(hs) = ready.hs().cloned() {
                let current = self.metadata.current();
                if hs.get_term() != current.term || hs.get_vote() != current.voted_for {
                    self.metadata.store(hs.get_term(), hs.get_vote())?;
                }
                self.store.set_hard_state(&hs);
            }

            if !ready.persisted_messages().is_empty() {
                self.send_messages(ready.take_persisted_messages());
            }

            let mut light = self.raw.advance(ready);
            self.send_messages(light.take_messages());
            let committed = light.take_committed_entries();
            self.apply_entries(committed).await?;
            self.raw.advance_apply();

            self.observe_role();
        }
        self.observe_role();
        Ok(())
    }

    fn observe_role(&mut self) {
        let is_leader = self.raw.raft.state == StateRole::Leader;
        if self.was_leader && !is_leader {
            tracing::info!("lost leadership to server {}", self.raw.raft.leader_id);
            self.replication.fail_pending(|| Error::LeadershipLost);
        }
        if !self.was_leader && is_leader {
            tracing::info!("elected leader at term {}", self.raw.raft.term);
        }
        self.was_leader = is_leader;
    }

    fn send_messages(&mut self, messages: Vec<raft::eraftpb::Message>) {
        let configuration = self.store.configuration();
        for message in messages {
            let to = message.get_to();
            match configuration.address_of(to) {
                Some(address) => self.transport.send(to, address, message),
                None => tracing::debug!("no address for server {to}, dropping message"),
            }
        }
    }

    async fn persist_entries(&mut self, entries: &[Entry]) -> Result<()> {
        let first = entries[0].get_index();
        if first < self.durable_next_index {
            self.segment_log.truncate(first).await?;
            self.durable_next_index = first;
        }
        debug_assert_eq!(first, self.durable_next_index);
        let disk: Vec<DiskEntry> = entries.iter().map(entry_to_disk).collect();
        self.segment_log.append(disk).await?;
        self.durable_next_index = entries.last().unwrap().get_index() + 1;
        Ok(())
    }

    async fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            if entry.get_index() <= self.applied {
                continue;
            }
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    if !entry.get_data().is_empty() {
                        if let Err(e) = self.replication.apply_command(entry.get_data()) {
                            tracing::error!("apply entry {}: {e}", entry.get_index());
                        }
                    }
                }
                EntryType::EntryConfChange if !entry.get_data().is_empty() => {
                    let mut change = ConfChange::default();
                    if change.merge_from_bytes(entry.get_data()).is_ok() {
                        self.apply_conf_change(&entry, change);
                    } else {
                        tracing::warn!("malformed conf change at index {}", entry.get_index());
                    }
                }
                EntryType::EntryConfChange => {}
                EntryType::EntryConfChangeV2 => {
                    tracing::warn!("unsupported conf change v2 at index {}", entry.get_index());
                }
            }
            self.applied = entry.get_index();
            self.wake_waiters();
        }
        self.maybe_snapshot().await;
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry, change: ConfChange) {
        let mut configuration = self.store.configuration();
        let id = change.get_node_id();
        let is_member = configuration.contains(id);
        let noop = match change.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => is_member,
            ConfChangeType::RemoveNode => !is_member,
        };
        if !noop {
            match self.raw.apply_conf_change(&change) {
                Ok(state) => {
                    tracing::info!("configuration now has voters {:?}", state.get_voters());
                }
                Err(e) => {
                    tracing::error!("apply conf change: {e}");
                    return;
                }
            }
        }
        let _ = apply_change_to(&mut configuration, entry.get_data());
        self.store.set_configuration(configuration, entry.get_index());
        let index = entry.get_index();
        let mut i = 0;
        while i < self.conf_waiters.len() {
            if self.conf_waiters[i].0 <= index {
                let (_, done) = self.conf_waiters.swap_remove(i);
                let _ = done.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    fn wake_waiters(&mut self) {
        let applied = self.applied;
        let mut i = 0;
        while i < self.barrier_waiters.len() {
            if self.barrier_waiters[i].0 <= applied {
                let (_, done) = self.barrier_waiters.swap_remove(i);
                let _ = done.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    async fn maybe_snapshot(&mut self) {
        if self.applied - self.store.snapshot_index() < self.config.snapshot_threshold {
            return;
        }
        if let Err(e) = self.take_snapshot().await {
            tracing::error!("snapshot at {} failed: {e}", self.applied);
        }
    }

    async fn take_snapshot(&mut self) -> Result<()> {
        use raft::Storage as _;
        let index = self.applied;
        let term = self.store.term(index)?;
        let configuration = self.store.configuration();
        let conf_index = self.store.conf_index();
        let conf_bytes = configuration.encode();
        let payload = self.replication.snapshot_payload();

        tracing::info!("taking snapshot at index {index} term {term}");
        let snapshots = self.snapshots.clone();
        let put = {
            let conf_bytes = conf_bytes.clone();
            let payload = payload.clone();
            tokio::task::spawn_blocking(move || {
                snapshots.put(term, index, conf_index, &conf_bytes, &payload)
            })
        };
        put.await.map_err(|e| Error::Internal(e.to_string()))??;

        // Segments whose last index is at most (index - trailing) are no
        // longer needed for follower catch-up.
        let trailing = self.config.snapshot_trailing;
        self.segment_log
            .remove_before(index.saturating_sub(trailing) + 1)
            .await?;
        self.store.compact(index, term, trailing);
        self.store.cache_snapshot(build_raft_snapshot(
            index,
            term,
            &configuration,
            &conf_bytes,
            &payload,
        ));
        Ok(())
    }

    /// Install a snapshot streamed from the leader: restore the state
    /// machine, reset the log position under a blocking barrier, and
    /// persist the snapshot pair.
    async fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        let index = metadata.get_index();
        let term = metadata.get_term();
        tracing::info!("installing snapshot at index {index} term {term}");

        let (conf_bytes, payload) = split_snapshot_data(snapshot.get_data())?;
        let configuration = Configuration::decode(&conf_bytes)?;
        self.replication.restore_payload(&payload)?;

        self.segment_log.blocking_barrier(index + 1).await?;
        let snapshots = self.snapshots.clone();
        let put = {
            let conf_bytes = conf_bytes.clone();
            let payload = payload.clone();
            tokio::task::spawn_blocking(move || {
                snapshots.put(term, index, index, &conf_bytes, &payload)
            })
        };
        let result = put.await.map_err(|e| Error::Internal(e.to_string()))?;
        self.segment_log.unblock().await?;
        result?;
        self.segment_log.remove_before(index + 1).await?;

        self.store.restore_snapshot(metadata, configuration.clone());
        self.store.cache_snapshot(build_raft_snapshot(
            index,
            term,
            &configuration,
            &conf_bytes,
            &payload,
        ));
        self.durable_next_index = index + 1;
        self.applied = index;
        self.wake_waiters();
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!("stopping raft node");
        self.replication.fail_pending(|| Error::Stopped);
        for (_, done) in self.barrier_waiters.drain(..) {
            let _ = done.send(Err(Error::Canceled));
        }
        for (_, done) in self.conf_waiters.drain(..) {
            let _ = done.send(Err(Error::Canceled));
        }
        self.segment_log.close().await;
        self.transport.close();
    }
}

fn build_raft_snapshot(
    index: u64,
    term: u64,
    configuration: &Configuration,
    conf_bytes: &[u8],
    payload: &[u8],
) -> Snapshot {
    let mut metadata = SnapshotMetadata::default();
    metadata.set_index(index);
    metadata.set_term(term);
    metadata.set_conf_state(configuration.conf_state());
    let mut snapshot = Snapshot::default();
    snapshot.set_metadata(metadata);
    snapshot.set_data(join_snapshot_data(conf_bytes, payload).into());
    snapshot
}

/// Snapshot data as shipped between members: the configuration (with
/// addresses, which `ConfState` does not carry) followed by the database
/// images.
fn join_snapshot_data(conf_bytes: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut b = Builder::new();
    b.put_blob(conf_bytes);
    b.put_blob(payload);
    b.finish().to_vec()
}

fn split_snapshot_data(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut cursor = Cursor::new(data);
    let conf_bytes = cursor.get_blob()?.to_vec();
    let payload = cursor.get_blob()?.to_vec();
    Ok((conf_bytes, payload))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_data_round_trip() {
        let conf = Configuration { servers: vec![(1, "addr".into())] };
        let data = join_snapshot_data(&conf.encode(), b"payload");
        let (conf_bytes, payload) = split_snapshot_data(&data).unwrap();
        assert_eq!(Configuration::decode(&conf_bytes).unwrap(), conf);
        assert_eq!(payload, b"payload");
    }
}
