//! TrueNAS CSI Driver
//!
//! Kubernetes CSI driver daemon. One binary serves both roles: the
//! controller (cluster singleton, drives the TrueNAS backend) and the node
//! plugin (one per worker, attaches and mounts volumes).

use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tnas_client::{Session, SessionConfig, TruenasClient};

use csi_driver::config::Args;
use csi_driver::controller::{ControllerConfig, ControllerService};
use csi_driver::csi::controller_server::ControllerServer;
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::identity::{IdentityService, ReadinessState};
use csi_driver::metrics;
use csi_driver::node::NodeService;
use csi_driver::volume_lock::VolumeLocks;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node_id = match args.node_id.clone() {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        truenas_host = %args.truenas_host,
        node_id = %node_id,
        controller_mode = %args.controller,
        node_mode = %args.node,
        "Starting TrueNAS CSI Driver"
    );

    metrics::init_metrics(args.metrics_addr)?;

    // First connect happens inline: bad configuration or credentials fail
    // startup with a non-zero exit. Later outages reconnect forever.
    let mut session_config = SessionConfig::new(args.socket_url(), args.truenas_api_key.clone());
    session_config.ping_interval = args.ping_interval();
    session_config.read_deadline = args.read_deadline();
    let session = Session::connect(session_config).await?;
    let client = TruenasClient::new(session.clone());

    // The probe follows the session state: it degrades on its own while the
    // session reconnects.
    let readiness = Arc::new(ReadinessState::new(session.state_watch()));

    let locks = VolumeLocks::new();

    let socket_path = args.socket_path().to_string();
    if let Some(parent) = std::path::Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Remove a stale socket left by a previous run.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    let incoming = UnixListenerStream::new(listener);

    let identity = IdentityService::with_readiness(readiness.clone());
    let mut router = Server::builder().add_service(IdentityServer::new(identity));

    if args.controller {
        let controller_config = ControllerConfig {
            pool: args.truenas_pool.clone(),
            parent_dataset: args.parent_dataset(),
            server: args.server_address(),
            default_subsystem_nqn: args.nvmeof_subsystem_nqn.clone(),
        };
        let controller = ControllerService::new(client.clone(), locks.clone(), controller_config);
        router = router.add_service(ControllerServer::new(controller));
    }

    if args.node {
        let node = NodeService::new(node_id.clone(), locks.clone());
        router = router.add_service(NodeServer::new(node));
    }

    info!(socket = %socket_path, "CSI server listening");

    let shutdown_readiness = readiness.clone();
    router
        .serve_with_incoming_shutdown(incoming, async move {
            shutdown_signal().await;
            shutdown_readiness.begin_shutdown();
            info!("Shutdown signal received, stopping gRPC server");
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
