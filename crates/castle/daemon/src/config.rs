//! Configuration for castled

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use castle_deploy::{castle_home, DEFAULT_DATA_ROOT};
use castle_health::HealthConfig;
use castle_mesh::MeshConfig;
use castle_types::Hostname;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity and filesystem roots of this node
    #[serde(default)]
    pub node: NodeSettings,

    /// Input and output file locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Whether deploys reload systemd and caddy
    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    /// Upper bound on joining background tasks at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            node: NodeSettings::default(),
            paths: PathsConfig::default(),
            apply: ApplyConfig::default(),
            health: HealthConfig::default(),
            mesh: MeshConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: true,
        }
    }
}

/// Node identity and roots handed to the reconciler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Overrides the system hostname
    #[serde(default)]
    pub hostname: Option<String>,

    /// Parent of every managed entry's data directory
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Source checkout that deployed commands must not point into
    #[serde(default)]
    pub source_root: Option<PathBuf>,
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// The specification file
    #[serde(default = "default_spec_path")]
    pub spec: PathBuf,

    /// Persisted node registry
    #[serde(default = "default_registry_path")]
    pub registry: PathBuf,

    /// One file per secret
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,

    /// Where generated systemd user units are written
    #[serde(default = "default_units_dir")]
    pub units_dir: PathBuf,

    /// Where the generated Caddyfile is written
    #[serde(default = "default_caddyfile")]
    pub caddyfile: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            spec: default_spec_path(),
            registry: default_registry_path(),
            secrets_dir: default_secrets_dir(),
            units_dir: default_units_dir(),
            caddyfile: default_caddyfile(),
        }
    }
}

/// Post-deploy activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Run `systemctl --user daemon-reload` after units change
    #[serde(default = "default_true")]
    pub systemd: bool,

    /// Run `caddy reload` after the Caddyfile changes
    #[serde(default = "default_true")]
    pub caddy: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            systemd: true,
            caddy: true,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9020))
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_data_root() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_ROOT)
}

fn home() -> PathBuf {
    castle_home().unwrap_or_else(|| PathBuf::from(".castle"))
}

fn default_spec_path() -> PathBuf {
    home().join("castle.yaml")
}

fn default_registry_path() -> PathBuf {
    home().join("registry.yaml")
}

fn default_secrets_dir() -> PathBuf {
    home().join("secrets")
}

fn default_units_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("systemd").join("user"))
        .unwrap_or_else(|| home().join("units"))
}

fn default_caddyfile() -> PathBuf {
    home().join("generated").join("Caddyfile")
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then `CASTLE_*`
    /// environment variables (`CASTLE_MESH__NAMESPACE=home`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CASTLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// This node's hostname: the configured one, else `$HOSTNAME`, else
    /// `/etc/hostname`, else `localhost`.
    pub fn hostname(&self) -> Hostname {
        let configured = self.node.hostname.clone();
        let from_env = || std::env::var("HOSTNAME").ok();
        let from_file = || std::fs::read_to_string("/etc/hostname").ok();

        configured
            .or_else(from_env)
            .or_else(from_file)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .map(Hostname::new)
            .unwrap_or_else(|| Hostname::new("localhost"))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
