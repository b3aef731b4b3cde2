use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rudis::aof::Persister;
use rudis::cluster::Cluster;
use rudis::config::ServerConfig;
use rudis::db::engine::DbEngine;
use rudis::server::{listen_and_serve, Backend};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, %path, "cannot load config file");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    let config = Arc::new(config);
    info!(run_id = %config.run_id, "starting");

    let engine = DbEngine::new(Arc::clone(&config));
    if config.append_only {
        match Persister::new(Arc::clone(&config), Arc::clone(&engine), true) {
            Ok(persister) => engine.set_persister(persister),
            Err(err) => {
                error!(%err, "cannot open append only file");
                return ExitCode::FAILURE;
            }
        }
    }

    let backend = if config.cluster_enable {
        match Cluster::new(Arc::clone(&config), engine).await {
            Ok(cluster) => Backend::Cluster(cluster),
            Err(err) => {
                error!(%err, "cannot start cluster node");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Backend::Standalone(engine)
    };

    // Joining a cluster needs the local listener up first: the leader
    // answers a join by pushing a snapshot back to this node.
    let server = tokio::spawn(listen_and_serve(Arc::clone(&config), backend.clone()));
    if let Backend::Cluster(cluster) = &backend {
        if let Err(err) = cluster.join_seed().await {
            error!(%err, "cannot join cluster");
            return ExitCode::FAILURE;
        }
    }

    match server.await {
        Ok(Ok(())) => {
            info!("bye");
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "server task panicked");
            ExitCode::FAILURE
        }
    }
}
