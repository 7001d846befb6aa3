use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name under which the in-memory VFS registers with SQLite.
pub const VFS_NAME: &str = "duralite";

/// Runtime configuration for a single cluster member.
///
/// Defaults: 15s client heartbeat, 4096-byte pages, checkpoint after 1000
/// WAL frames, 8 MiB log segments, 8192 trailing entries behind a
/// snapshot, 1s connect retry, two spare open segments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Raft server id. Must be nonzero and unique across the cluster.
    pub id: u64,
    /// Address advertised to peers and clients, e.g. "127.0.0.1:9001".
    pub address: String,
    /// Data directory holding metadata, log segments and snapshots.
    pub data_dir: PathBuf,
    /// Name the in-memory VFS registers under. Distinct per server when
    /// several members share a process, as in tests.
    pub vfs_name: String,
    /// Address the TCP listener binds to.
    pub listen_addr: SocketAddr,
    /// Clients whose last heartbeat is older than this are dropped.
    pub heartbeat_timeout: Duration,
    /// Database page size in bytes.
    pub page_size: u32,
    /// Number of WAL frames after which a local checkpoint is issued.
    pub checkpoint_threshold: u32,
    /// Target size of an open log segment.
    pub segment_size: u64,
    /// Log entries retained behind a snapshot for follower catch-up.
    pub snapshot_trailing: u64,
    /// Applied entries between automatic snapshots.
    pub snapshot_threshold: u64,
    /// Base delay between outbound transport reconnect attempts.
    pub connect_retry_delay: Duration,
    /// Number of spare open segments prepared ahead of the current one.
    pub prepare_pool_target: usize,
    /// Compress snapshot payloads with the LZ4 frame format.
    pub snapshot_compression: bool,
    /// Rename corrupt files and retry once on load, instead of failing.
    pub auto_recovery: bool,
    /// Collect request counters.
    pub metrics: bool,
    /// Raft election timeout, in ticks of 100ms.
    pub election_tick: usize,
    /// Raft heartbeat interval, in ticks of 100ms.
    pub heartbeat_tick: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 1,
            address: "127.0.0.1:9001".to_string(),
            data_dir: "data.duralite".into(),
            vfs_name: VFS_NAME.to_string(),
            listen_addr: "127.0.0.1:9001".parse().unwrap(),
            heartbeat_timeout: Duration::from_millis(15_000),
            page_size: 4096,
            checkpoint_threshold: 1000,
            segment_size: 8 * 1024 * 1024,
            snapshot_trailing: 8192,
            snapshot_threshold: 1024,
            connect_retry_delay: Duration::from_millis(1000),
            prepare_pool_target: 2,
            snapshot_compression: false,
            auto_recovery: true,
            metrics: false,
            election_tick: 10,
            heartbeat_tick: 3,
        }
    }
}

impl Config {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.id == 0 {
            return Err(crate::error::Error::Internal("server id must be nonzero".into()));
        }
        if !self.page_size.is_power_of_two() || !(512..=65536).contains(&self.page_size) {
            return Err(crate::error::Error::Internal(format!(
                "invalid page size {}",
                self.page_size
            )));
        }
        if self.address.len() > crate::raft::transport::MAX_ADDRESS_LEN {
            return Err(crate::error::Error::NameTooLong(self.address.clone()));
        }
        Ok(())
    }
}
