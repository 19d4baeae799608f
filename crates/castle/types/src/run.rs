//! Run specifications.
//!
//! A [`RunSpec`] is a closed set of runner variants tagged by the `runner`
//! key in YAML. Every consumer matches on it exhaustively.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How a service or job process is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "runner", rename_all = "snake_case")]
pub enum RunSpec {
    /// An arbitrary executable with an argument vector.
    Command(CommandRun),
    /// An installed Python entry point.
    Python(PythonRun),
    /// A container started through podman or docker.
    Container(ContainerRun),
    /// A package.json script run through a package manager.
    Node(NodeRun),
    /// A service hosted somewhere else.
    Remote(RemoteRun),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRun {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonRun {
    /// Name of the installed entry point.
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRun {
    pub image: String,
    /// Overrides the image command when set.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Container port to host port.
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
    /// `host:container[:ro]` bind mounts.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRun {
    pub script: String,
    #[serde(default)]
    pub package_manager: PackageManager,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    #[default]
    Pnpm,
    Yarn,
}

impl PackageManager {
    /// Executable name looked up on the search path.
    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRun {
    pub base_url: String,
    #[serde(default)]
    pub health_url: Option<String>,
}

/// Runner variant without its payload, recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Command,
    Python,
    Container,
    Node,
    Remote,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Command => write!(f, "command"),
            RunnerKind::Python => write!(f, "python"),
            RunnerKind::Container => write!(f, "container"),
            RunnerKind::Node => write!(f, "node"),
            RunnerKind::Remote => write!(f, "remote"),
        }
    }
}

impl RunSpec {
    pub fn kind(&self) -> RunnerKind {
        match self {
            RunSpec::Command(_) => RunnerKind::Command,
            RunSpec::Python(_) => RunnerKind::Python,
            RunSpec::Container(_) => RunnerKind::Container,
            RunSpec::Node(_) => RunnerKind::Node,
            RunSpec::Remote(_) => RunnerKind::Remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, RunSpec::Remote(_))
    }

    /// Problems with the variant's required fields.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            RunSpec::Command(run) => {
                if run.argv.first().map_or(true, |a| a.trim().is_empty()) {
                    problems.push("command runner requires a non-empty argv".to_string());
                }
            }
            RunSpec::Python(run) => {
                if run.tool.trim().is_empty() {
                    problems.push("python runner requires a tool name".to_string());
                }
            }
            RunSpec::Container(run) => {
                if run.image.trim().is_empty() {
                    problems.push("container runner requires an image".to_string());
                }
                if run.ports.iter().any(|(c, h)| *c == 0 || *h == 0) {
                    problems.push("container ports must be positive".to_string());
                }
            }
            RunSpec::Node(run) => {
                if run.script.trim().is_empty() {
                    problems.push("node runner requires a script".to_string());
                }
            }
            RunSpec::Remote(run) => {
                if !is_http_url(&run.base_url) {
                    problems.push(format!("remote base_url {:?} is not an http(s) URL", run.base_url));
                }
                if let Some(url) = &run.health_url {
                    if !is_http_url(url) {
                        problems.push(format!("remote health_url {:?} is not an http(s) URL", url));
                    }
                }
            }
        }
        problems
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty())
}
