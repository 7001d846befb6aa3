use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use duralite::{Config, Server};

/// Replicated SQLite server.
#[derive(Debug, Parser)]
#[command(name = "duralited", version)]
struct Cli {
    /// Unique server id within the cluster.
    #[arg(long, env = "DURALITE_ID")]
    id: u64,

    /// Address advertised to peers and clients.
    #[arg(long, env = "DURALITE_ADDRESS")]
    address: String,

    /// Address to listen on; defaults to the advertised address.
    #[arg(long, env = "DURALITE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Data directory.
    #[arg(long, env = "DURALITE_DATA_DIR", default_value = "data.duralite")]
    data_dir: PathBuf,

    /// Bootstrap a new cluster with this member as the initial voter.
    /// Accepts additional `id=address` pairs for multi-member bootstrap.
    #[arg(long, num_args = 0.., value_name = "ID=ADDRESS")]
    bootstrap: Option<Vec<String>>,

    /// Client heartbeat timeout in milliseconds.
    #[arg(long, default_value_t = 15_000)]
    heartbeat_timeout_ms: u64,

    /// WAL frames before a local checkpoint.
    #[arg(long, default_value_t = 1000)]
    checkpoint_threshold: u32,

    /// Target log segment size in bytes.
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    segment_size: u64,

    /// Log entries retained behind a snapshot.
    #[arg(long, default_value_t = 8192)]
    snapshot_trailing: u64,

    /// Compress snapshots with LZ4.
    #[arg(long)]
    snapshot_compression: bool,

    /// Collect request counters.
    #[arg(long)]
    metrics: bool,
}

fn parse_bootstrap(cli: &Cli) -> anyhow::Result<Option<Vec<(u64, String)>>> {
    let Some(extra) = &cli.bootstrap else { return Ok(None) };
    let mut servers = vec![(cli.id, cli.address.clone())];
    for pair in extra {
        let (id, address) = pair
            .split_once('=')
            .with_context(|| format!("invalid bootstrap pair `{pair}`"))?;
        servers.push((id.parse().context("invalid bootstrap id")?, address.to_string()));
    }
    Ok(Some(servers))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let listen_addr = match cli.listen {
        Some(addr) => addr,
        None => cli.address.parse().context("advertised address is not a socket address")?,
    };
    let config = Config {
        id: cli.id,
        address: cli.address.clone(),
        listen_addr,
        data_dir: cli.data_dir.clone(),
        heartbeat_timeout: std::time::Duration::from_millis(cli.heartbeat_timeout_ms),
        checkpoint_threshold: cli.checkpoint_threshold,
        segment_size: cli.segment_size,
        snapshot_trailing: cli.snapshot_trailing,
        snapshot_compression: cli.snapshot_compression,
        metrics: cli.metrics,
        ..Config::default()
    };

    if let Some(servers) = parse_bootstrap(&cli)? {
        Server::bootstrap(&config, servers).await?;
        tracing::info!("bootstrapped cluster in {}", config.data_dir.display());
    }

    let server = Server::start(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}
