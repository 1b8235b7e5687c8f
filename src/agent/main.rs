//! havoc-agent - Fault-injection daemon.
//!
//! Runs on every node under test and executes commands sent by the driver:
//! - Process control (get, kill, suspend, resume)
//! - Resource burners (CPU, RAM, disk)
//! - Network faults (adapter flapping, DNS blackholing)
//! - Shell exec and node power control
//!
//! Burners re-run this executable as `havoc-agent worker ...`, one process
//! per worker, so a burn never starves the agent itself.
//!
//! # Authentication
//!
//! Each request envelope carries the SHA-256 digest of the node secret stored
//! in the key file. `havoc-agent keygen` writes a fresh secret; `serve`
//! generates one on first start.
//!
//! # Configuration
//!
//! Environment variables:
//! - `HAVOC_AGENT_HOST`: Listen address (default: 0.0.0.0)
//! - `HAVOC_AGENT_PORT`: Listen port (default: 6969)
//! - `HAVOC_KEY_FILE`: Secret location (default: /etc/havoc/agent.key)
//! - `HAVOC_LOG_LEVEL`: Agent log level (default: info)
//! - `RUST_LOG`: Full filter override

mod args;
mod commands;
mod error;
mod exec;
mod hosts;
mod network;
mod node;
mod process;
mod resource;
mod routes;
mod secret;
mod validator;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use havoc::protocol::DEFAULT_AGENT_PORT;

use crate::commands::Agent;
use crate::resource::{WorkerJob, WorkerLauncher};
use crate::validator::Validator;

/// Application state shared across all request handlers.
pub struct AppState {
    pub validator: Validator,
}

#[derive(Parser)]
#[command(name = "havoc-agent")]
#[command(version)]
#[command(about = "Fault-injection agent: kill processes, burn resources, flap networks")]
struct AgentCli {
    #[command(subcommand)]
    command: Option<AgentCommand>,

    /// Address to listen on
    #[arg(long, env = "HAVOC_AGENT_HOST", default_value = "0.0.0.0", global = true)]
    host: String,

    /// Port to listen on
    #[arg(long, env = "HAVOC_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT, global = true)]
    port: u16,

    /// File holding the node secret
    #[arg(long, env = "HAVOC_KEY_FILE", default_value = secret::DEFAULT_KEY_FILE, global = true)]
    key_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HAVOC_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Serve commands over HTTP (default)
    Serve,

    /// Write a new random secret to the key file and print it
    Keygen,

    /// Run one burn worker in the foreground
    #[command(name = resource::WORKER_SUBCOMMAND, hide = true)]
    Worker {
        #[command(subcommand)]
        job: WorkerJob,
    },
}

impl AgentCli {
    /// Error detail goes on the wire only at the chattiest levels.
    fn verbose_errors(&self) -> bool {
        matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "debug" | "trace"
        )
    }
}

fn main() -> Result<()> {
    let cli = AgentCli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("havoc_agent={0},tower_http={0}", cli.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let key_file = secret::expand_path(&cli.key_file);

    match cli.command.as_ref().unwrap_or(&AgentCommand::Serve) {
        AgentCommand::Keygen => {
            let secret = secret::write_new(&key_file)?;
            println!("{}", secret);
            Ok(())
        }
        AgentCommand::Worker { job } => {
            job.clone().run();
            Ok(())
        }
        AgentCommand::Serve => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(serve(&cli, &key_file))
        }
    }
}

async fn serve(cli: &AgentCli, key_file: &std::path::Path) -> Result<()> {
    let digest = secret::load_or_create_digest(key_file)?;
    let agent = Agent::system(WorkerLauncher::current().log_level(&cli.log_level));
    let state = Arc::new(AppState {
        validator: Validator::new(digest, agent, cli.verbose_errors()),
    });

    let app = Router::new()
        .merge(routes::create_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cli.host, cli.port))?;

    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        "havoc-agent v{} on {} listening on {} (key file {})",
        env!("CARGO_PKG_VERSION"),
        hostname,
        addr,
        key_file.display()
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
