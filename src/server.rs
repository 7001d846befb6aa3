//! Server lifecycle: the TCP listener, the opening-magic dispatch between
//! client gateways and the Raft transport, and ordered shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::raft::{self, transport::Transport, NodeHandle, NodeStatus};
use crate::replication::{self, Replication};
use crate::stats::Stats;
use crate::vfs::MemVfs;
use crate::wire::{PROTOCOL_RAFT_UPGRADE, PROTOCOL_VERSION};

/// One cluster member: the in-memory VFS, the Raft engine, and the client
/// gateway behind a single TCP listener.
pub struct Server {
    config: Config,
    node: NodeHandle,
    replication: Arc<Replication>,
    stats: Arc<Stats>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Server {
    /// Write the initial cluster configuration into a pristine data
    /// directory. Run exactly once in the lifetime of a cluster, on one
    /// member.
    pub async fn bootstrap(config: &Config, servers: Vec<(u64, String)>) -> Result<()> {
        if servers.is_empty() {
            return Err(Error::CantBootstrap("no servers given".into()));
        }
        raft::bootstrap(config, servers).await
    }

    pub async fn start(config: Config) -> Result<Server> {
        config.validate()?;
        let vfs = MemVfs::new();
        crate::vfs::ffi::register(&config.vfs_name, vfs.clone())
            .map_err(|e| Error::Internal(format!("vfs registration: {e}")))?;

        let (node_tx, node_rx) = mpsc::channel(256);
        let (raft_tx, raft_rx) = mpsc::channel(256);
        let transport = Transport::new(
            config.id,
            config.address.clone(),
            config.connect_retry_delay,
            raft_tx,
        );
        let checkpointer = replication::spawn_checkpointer(config.vfs_name.clone());
        let replication = Replication::new(
            config.id,
            vfs.clone(),
            node_tx.clone(),
            config.checkpoint_threshold,
            checkpointer,
        );
        vfs.set_replication(replication.clone());

        raft::node::start(
            config.clone(),
            replication.clone(),
            node_rx,
            raft_rx,
            transport.clone(),
        )
        .await?;
        let node = NodeHandle::new(node_tx);

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("server {} listening on {local_addr}", config.id);

        let stats = Stats::new(config.metrics);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(
            listener,
            config.clone(),
            node.clone(),
            replication.clone(),
            stats.clone(),
            transport,
            shutdown_rx,
        ));

        Ok(Server {
            config,
            node,
            replication,
            stats,
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.node.status().await
    }

    pub async fn add_server(&self, id: u64, address: String) -> Result<()> {
        let (done, rx) = tokio::sync::oneshot::channel();
        self.node
            .requests
            .send(raft::NodeRequest::AddServer { id, address, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub async fn remove_server(&self, id: u64) -> Result<()> {
        let (done, rx) = tokio::sync::oneshot::channel();
        self.node
            .requests
            .send(raft::NodeRequest::RemoveServer { id, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub async fn transfer_leadership(&self, to: u64) -> Result<()> {
        let (done, rx) = tokio::sync::oneshot::channel();
        self.node
            .requests
            .send(raft::NodeRequest::TransferLeadership { to, done })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Stop everything, in reverse dependency order: stop accepting and
    /// drop client connections, then wind down the Raft node (which fails
    /// suspended transactions, finalizes open segments and closes the
    /// transport).
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.node.stop().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Config,
    node: NodeHandle,
    replication: Arc<Replication>,
    stats: Arc<Stats>,
    transport: Arc<Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                tracing::debug!("connection from {peer}");
                let config = config.clone();
                let node = node.clone();
                let replication = replication.clone();
                let stats = stats.clone();
                let transport = transport.clone();
                connections.spawn(async move {
                    if let Err(e) = handshake(stream, config, node, replication, stats, transport).await {
                        tracing::debug!("connection from {peer} closed: {e}");
                    }
                });
                // Reap finished connection tasks.
                while connections.try_join_next().is_some() {}
            }
            _ = shutdown.changed() => {
                connections.shutdown().await;
                return;
            }
        }
    }
}

/// Read the opening magic and hand the connection to the right subsystem.
/// Unknown magic closes the connection silently.
async fn handshake(
    mut stream: TcpStream,
    config: Config,
    node: NodeHandle,
    replication: Arc<Replication>,
    stats: Arc<Stats>,
    transport: Arc<Transport>,
) -> Result<()> {
    let mut magic = [0u8; 8];
    stream.read_exact(&mut magic).await?;
    match u64::from_le_bytes(magic) {
        PROTOCOL_VERSION => {
            let gateway = Gateway::new(config, node, replication, stats);
            gateway.serve(stream).await
        }
        PROTOCOL_RAFT_UPGRADE => transport.handle_inbound(stream).await,
        other => {
            tracing::debug!("bad protocol magic {other:#x}, closing");
            Ok(())
        }
    }
}
