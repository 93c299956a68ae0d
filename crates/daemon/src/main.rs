use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::{config::LogFormat, ReconstructorConfig};
use reconstructor_core::{
    EcCodec, FileRingView, HttpPeerControl, HttpPeerSync, LocalFragmentStore, PassOverrides, ReconstructorLoop,
    ReedSolomonCodec,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reconstructord", about = "Erasure-coded object reconstructor daemon")]
struct Args {
    #[arg(long, default_value = "/etc/reconstructor/reconstructor.toml")]
    config: PathBuf,

    /// Log everything at info but take no mutating action.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Restrict the pass to these device names; repeatable, combinable
    /// with --override-partition.
    #[arg(long = "override-device")]
    override_devices: Vec<String>,

    /// Restrict the pass to these partition numbers; repeatable,
    /// combinable with --override-device.
    #[arg(long = "override-partition")]
    override_partitions: Vec<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single reconstruction pass and exit.
    RunOnce,
    /// Run passes forever, pausing `run_pause_secs` between them.
    RunForever,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ReconstructorConfig::load(&args.config)?;
    init_tracing(config.log_format);

    let (handoffs_only, resolution) = config.resolve_handoffs_only();
    tracing::info!(handoffs_only, ?resolution, "resolved handoffs-only mode");

    let ring = Arc::new(
        FileRingView::open(
            config.ring_path.clone(),
            Duration::from_secs(config.ring_freshness_secs),
            config.bind_ip.clone(),
            config.bind_port,
            config.servers_per_port,
        )
        .await?,
    );
    let store = Arc::new(LocalFragmentStore::new(config.devices.clone(), "hashes.pkl"));
    let peer_control = Arc::new(HttpPeerControl::new(Duration::from_secs(config.peer_timeout_secs))?);
    let peer_sync = Arc::new(HttpPeerSync::new(Duration::from_secs(config.peer_sync_timeout_secs))?);

    let mut codecs: BTreeMap<u32, Box<dyn EcCodec>> = BTreeMap::new();
    for policy in &config.policies {
        let codec = ReedSolomonCodec::new(policy.n_data, policy.n_parity, policy.duplication_factor, policy.segment_size)?;
        codecs.insert(policy.policy_index, Box::new(codec));
    }

    let overrides = PassOverrides { devices: args.override_devices, partitions: args.override_partitions };
    let reconstructor = ReconstructorLoop::new(config, ring, store, peer_control, peer_sync, codecs);

    match args.command {
        Command::RunOnce => {
            let outcome = reconstructor.run_once(&overrides, handoffs_only, args.dry_run).await?;
            tracing::info!(stats = ?outcome.stats, "pass complete");
            Ok(())
        }
        Command::RunForever => {
            reconstructor.run_forever(&overrides, handoffs_only, args.dry_run).await;
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::from_default_env();
    match format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }
}
