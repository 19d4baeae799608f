//! castled - Castle node daemon
//!
//! - `serve` (default): deploy API, health monitor, mesh and gateway sync
//! - `deploy`: run the deploy pipeline once, through the running daemon if
//!   there is one
//! - `render`: print the units and Caddyfile for the current registry

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use castle_daemon::{DaemonConfig, DeployRequest, Deployer, Server};
use castle_deploy::DeployScope;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Castle daemon CLI
#[derive(Parser)]
#[command(name = "castled")]
#[command(about = "Castle - declarative control plane for one node and its peers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CASTLE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "CASTLE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "CASTLE_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon
    Serve,

    /// Reconcile the specification and write units and the Caddyfile
    Deploy {
        /// Only deploy these entries; others keep their previous state
        #[arg(long = "only", value_name = "NAME")]
        only: Vec<String>,

        /// Show what would change without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Do not reload systemd or caddy
        #[arg(long)]
        no_apply: bool,

        /// Deploy in-process even if a daemon is running
        #[arg(long)]
        standalone: bool,
    },

    /// Print the generated units and Caddyfile
    Render,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            Server::new(config).run().await?;
        }
        Command::Deploy {
            only,
            dry_run,
            no_apply,
            standalone,
        } => {
            let request = DeployRequest {
                scope: if only.is_empty() {
                    DeployScope::All
                } else {
                    DeployScope::only(only.clone())
                },
                dry_run,
                apply: !no_apply,
                actor: Some("cli".to_string()),
            };

            if !standalone {
                if let Some(summary) = deploy_via_daemon(&config, &only, dry_run, !no_apply).await? {
                    println!("{}", serde_yaml::to_string(&summary)?);
                    let failed = summary["report"]["failed"].as_array().map_or(0, Vec::len);
                    if failed > 0 {
                        bail!("{} entries failed", failed);
                    }
                    return Ok(());
                }
            }

            let deployer = Deployer::standalone(&config, request.apply && !dry_run)?;
            let summary = deployer.deploy(request).await?;
            println!("{}", serde_yaml::to_string(&summary)?);
            if !summary.report.is_success() {
                bail!("{} entries failed", summary.report.failed.len());
            }
        }
        Command::Render => {
            let deployer = Deployer::standalone(&config, false)?;
            let rendered = deployer.render();
            for unit in &rendered.units.files {
                println!("# {}\n{}", unit.file_name, unit.contents);
            }
            for warning in &rendered.units.warnings {
                eprintln!("warning: {}", warning);
            }
            println!("# Caddyfile\n{}", rendered.caddyfile.text);
        }
    }

    Ok(())
}

/// POST the deploy to a running daemon. `None` when nothing is listening.
async fn deploy_via_daemon(
    config: &DaemonConfig,
    only: &[String],
    dry_run: bool,
    apply: bool,
) -> anyhow::Result<Option<serde_json::Value>> {
    let url = format!("http://{}/api/v1/deploy", config.server.listen_addr);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;

    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "only": only,
            "dry_run": dry_run,
            "apply": apply,
        }))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            tracing::debug!(url = %url, "No running daemon, deploying in-process");
            return Ok(None);
        }
        Err(e) => return Err(e).context("deploy request failed"),
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("malformed deploy response")?;
    if !status.is_success() {
        bail!("daemon rejected deploy ({}): {}", status, body);
    }
    Ok(Some(body))
}
