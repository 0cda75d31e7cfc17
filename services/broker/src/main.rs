//! Lornu AI Service Broker
//!
//! Serves the Open Service Broker API for user-provided and database pod
//! services. Kubernetes access uses in-cluster or kubeconfig credentials.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lornu_broker::{
    api, DatabasePodStrategy, InstanceLifecycleController, KubeProvisioner, StrategyTable,
    UserProvidedStrategy, WorkloadTemplate,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address the broker API listens on
    #[arg(long, env = "BROKER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Container image for database pod instances
    #[arg(long, env = "BROKER_DB_IMAGE", default_value = "docker.io/mongo:7")]
    db_image: String,

    /// Port the database container listens on
    #[arg(long, env = "BROKER_DB_PORT", default_value_t = 27017)]
    db_port: i32,

    /// Log filter directive (e.g. "info,lornu_broker=debug")
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,

    /// Serve only user-provided services, without a Kubernetes client
    #[arg(long, env = "BROKER_NO_KUBE")]
    no_kube: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&cli.log_filter))
        .json()
        .init();

    info!("Starting Lornu AI Service Broker");

    let template = WorkloadTemplate {
        image: cli.db_image.clone(),
        port: cli.db_port,
        ..WorkloadTemplate::default()
    };

    let provisioner = if cli.no_kube {
        info!("Kubernetes disabled, database pod service not offered");
        None
    } else {
        match KubeProvisioner::new(template).await {
            Ok(provisioner) => Some(Arc::new(provisioner)),
            Err(e) => {
                warn!(
                    "Kubernetes not available: {:#} (database pod service not offered)",
                    e
                );
                None
            }
        }
    };

    let mut strategies = StrategyTable::new().register(Arc::new(UserProvidedStrategy::new()));
    let controller = match provisioner {
        Some(provisioner) => {
            strategies = strategies.register(Arc::new(DatabasePodStrategy::new(provisioner.clone())));
            InstanceLifecycleController::new(strategies).with_provisioner(provisioner)
        }
        None => InstanceLifecycleController::new(strategies),
    };

    info!(
        services = controller.catalog().services.len(),
        "Service catalog ready"
    );

    let app = api::router(Arc::new(controller));

    info!("Broker listening on {}", cli.listen);
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    axum::serve(listener, app).await?;

    Ok(())
}
