//! Post-deploy activation: reloading systemd and the gateway.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ApplyConfig;
use crate::error::{DaemonError, DaemonResult};

/// Tells the process supervisor and the gateway that their config changed.
#[async_trait]
pub trait Activator: Send + Sync {
    /// Pick up rewritten unit files.
    async fn reload_units(&self) -> DaemonResult<()>;

    /// Load a rewritten Caddyfile.
    async fn reload_gateway(&self, caddyfile: &Path) -> DaemonResult<()>;
}

/// Runs `systemctl --user` and `caddy` as child processes.
#[derive(Debug, Clone)]
pub struct CommandActivator {
    config: ApplyConfig,
}

impl CommandActivator {
    pub fn new(config: ApplyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Activator for CommandActivator {
    async fn reload_units(&self) -> DaemonResult<()> {
        if !self.config.systemd {
            debug!("systemd reload disabled");
            return Ok(());
        }
        run("systemctl", &["--user", "daemon-reload"]).await
    }

    async fn reload_gateway(&self, caddyfile: &Path) -> DaemonResult<()> {
        if !self.config.caddy {
            debug!("caddy reload disabled");
            return Ok(());
        }
        let config = caddyfile.display().to_string();
        run(
            "caddy",
            &["reload", "--config", &config, "--adapter", "caddyfile"],
        )
        .await
    }
}

/// Does nothing; used for `--no-apply` and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivator;

#[async_trait]
impl Activator for NoopActivator {
    async fn reload_units(&self) -> DaemonResult<()> {
        Ok(())
    }

    async fn reload_gateway(&self, _caddyfile: &Path) -> DaemonResult<()> {
        Ok(())
    }
}

async fn run(program: &str, args: &[&str]) -> DaemonResult<()> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| DaemonError::Apply {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DaemonError::Apply {
            command,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    info!(command = %command, "Activation command succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_activation_runs_nothing() {
        let activator = CommandActivator::new(ApplyConfig {
            systemd: false,
            caddy: false,
        });
        activator.reload_units().await.unwrap();
        activator
            .reload_gateway(Path::new("/nonexistent/Caddyfile"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_an_apply_error() {
        let err = run("castle-definitely-not-installed", &["--version"])
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Apply { .. }));
    }
}
