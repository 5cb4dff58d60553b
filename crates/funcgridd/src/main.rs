//! funcgridd — the funcgrid daemon.
//!
//! Runs a single node of the instance control plane:
//! - Meta-store (redb)
//! - Routing directory and meta-store watch
//! - Instance orchestrator and group control
//! - Loopback agent, runtime and scheduler
//! - Admin REST API
//!
//! # Usage
//!
//! ```text
//! funcgridd standalone --config /etc/funcgrid/funcgrid.toml --port 8470
//! funcgridd check-config /etc/funcgrid/funcgrid.toml
//! ```

mod api;
mod loopback;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use funcgrid_control::{AllowAll, Collaborators, GroupCtrl, InstanceCtrl};
use funcgrid_core::ControlConfig;
use funcgrid_routing::RoutingDirectory;
use funcgrid_state::MetaStore;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "funcgridd", about = "funcgrid instance control daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single node with in-process agent and runtime.
    Standalone {
        /// Path to funcgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// API port; overrides `api_port` from the config.
        #[arg(long)]
        port: Option<u16>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Parse and validate a config file, then print the effective values.
    CheckConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            port,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.api_port = port;
            }
            run_standalone(config).await
        }
        Command::CheckConfig { path } => {
            let config = ControlConfig::from_file(&path)?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,funcgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControlConfig> {
    match path {
        Some(path) => ControlConfig::from_file(path),
        None => {
            let config = ControlConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run_standalone(config: ControlConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node_id, "funcgrid daemon starting in standalone mode");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let db_path = config.data_dir.join("funcgrid.redb");
    let store = MetaStore::open(&db_path)?;
    info!(path = ?db_path, "meta-store opened");

    // ── Routing ────────────────────────────────────────────────

    let directory = RoutingDirectory::spawn(&config.node_id);
    let watch_handle = funcgrid_routing::sync::watch_meta_store(directory.clone(), store.clone());

    // ── Orchestrator ───────────────────────────────────────────

    let node = Arc::new(loopback::LoopbackNode::new(&config.node_id));
    let (runtime, init_calls) = loopback::LoopbackRuntime::new();
    let deps = Collaborators {
        scheduler: node.clone(),
        agent: node.clone(),
        runtime: Arc::new(runtime),
        cluster: Arc::new(loopback::StandaloneCluster),
        meta_store: Arc::new(store.clone()),
        function_meta: Arc::new(loopback::AnyFunction),
        resource_view: node.clone(),
        authorizer: Arc::new(AllowAll),
    };
    let shutdown_timeout = config.graceful_shutdown_timeout();
    let api_port = config.api_port;
    let ctrl = InstanceCtrl::new(config, deps, directory.clone());
    loopback::ack_init_calls(ctrl.clone(), init_calls);

    let groups = GroupCtrl::new(ctrl.clone(), Arc::new(store.clone()));

    match ctrl.sync_instances().await {
        Ok(count) => info!(count, "local instances recovered from meta-store"),
        Err(e) => warn!(error = %e, "meta-store sync failed"),
    }
    let agents = node.agents();
    let status = ctrl.sync_agent(&agents).await;
    if !status.is_ok() {
        warn!(%status, "agent sync reported failures");
    }

    // ── API server ─────────────────────────────────────────────

    let router = api::build_router(api::ApiState {
        ctrl: ctrl.clone(),
        groups,
        directory,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    let stats = ctrl.graceful_shutdown(shutdown_timeout).await;
    info!(drained = stats.drained, timed_out = stats.timed_out, "in-flight responses drained");
    watch_handle.abort();

    info!("funcgrid daemon stopped");
    Ok(())
}
