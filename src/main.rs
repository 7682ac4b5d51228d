//! Command line entry point: bootstrap one tablet replica from a remote
//! leader peer.

use std::sync::Arc;

use clap::Parser;

use tablet_bootstrap::client::{LogStatusListener, RemoteBootstrapClient};
use tablet_bootstrap::config::BootstrapConfig;
use tablet_bootstrap::fs_manager::FsManager;
use tablet_bootstrap::metadata::TabletMetadata;
use tablet_bootstrap::proxy::GrpcMessenger;
use tablet_bootstrap::{metrics, pb};

/// Command line arguments for a bootstrap run.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/bootstrap.toml"))]
    config: String,
    /// Directory holding the local tablet data
    #[arg(long = "data-root", default_value_t = String::from("./data"))]
    data_root: String,
    /// Id of the tablet to bootstrap
    #[arg(long = "tablet-id")]
    tablet_id: String,
    /// Permanent uuid of the leader peer to bootstrap from
    #[arg(long = "leader-uuid")]
    leader_uuid: String,
    /// host:port the leader peer serves on
    #[arg(long = "leader-addr")]
    leader_addr: String,
    /// Permanent uuid of this server; generated when not given
    #[arg(long = "server-uuid")]
    server_uuid: Option<String>,
}

fn parse_host_port(addr: &str) -> Result<(String, u32), String> {
    match addr.rsplit_once(':') {
        Some((host, port)) => port
            .parse::<u32>()
            .map(|port| (host.to_string(), port))
            .map_err(|e| format!("bad port in {}: {}", addr, e)),
        None => Err(format!("expected host:port, got {}", addr)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = BootstrapConfig::from_toml(&args.config).expect("Config is missing");
    metrics::init_registry();

    let server_uuid = args
        .server_uuid
        .unwrap_or_else(|| format!("{:032x}", rand::random::<u128>()));
    let fs_manager = Arc::new(FsManager::open(&args.data_root, server_uuid.clone())?);
    let mut meta = TabletMetadata::create_for_bootstrap(fs_manager.clone(), &args.tablet_id)?;

    let (host, port) = parse_host_port(&args.leader_addr)?;
    let cstate = pb::ConsensusState {
        current_term: 0,
        leader_uuid: args.leader_uuid.clone(),
        config: Some(pb::RaftConfig {
            opid_index: 0,
            peers: vec![pb::RaftPeer {
                permanent_uuid: args.leader_uuid,
                last_known_addr: Some(pb::HostPort { host, port }),
            }],
        }),
    };

    let client = RemoteBootstrapClient::new(
        fs_manager,
        Arc::new(GrpcMessenger),
        server_uuid,
        config,
    );
    client
        .run_remote_bootstrap(&mut meta, &cstate, &LogStatusListener)
        .await?;
    log::info!(
        "Tablet {} bootstrapped from {}",
        args.tablet_id,
        args.leader_addr
    );
    Ok(())
}
