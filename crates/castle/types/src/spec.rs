//! Specification model.
//!
//! The declared catalog of components, services and jobs. Each capability
//! (expose, proxy, manage, trigger) is an independent optional block so that
//! roles can be derived from presence alone (see [`crate::role`]).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Catalog, ValidationError, ValidationIssue};
use crate::ids::is_valid_entry_name;
use crate::run::RunSpec;
use crate::schedule::CronSchedule;

/// Default gateway listen port.
pub const DEFAULT_GATEWAY_PORT: u16 = 9000;

/// Default timezone for job schedules.
pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

/// A complete, validated specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    #[serde(default)]
    pub node: NodeSpec,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentSpec>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
}

/// Node-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Directory served by the gateway when no route matches.
    #[serde(default)]
    pub static_root: Option<String>,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            gateway_port: DEFAULT_GATEWAY_PORT,
            static_root: None,
        }
    }
}

/// Identity of a piece of software.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(default)]
    pub description: Option<String>,
    /// Where the source lives. Never referenced by the registry.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub install: Option<InstallSpec>,
    #[serde(default)]
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub tool: Option<ToolSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    #[serde(default)]
    pub path: Option<PathInstallSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInstallSpec {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub system_dependencies: Vec<String>,
}

/// A long-running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub run: RunSpec,
    #[serde(default)]
    pub expose: Option<ExposeSpec>,
    #[serde(default)]
    pub proxy: Option<ProxySpec>,
    #[serde(default)]
    pub manage: Option<ManageSpec>,
    #[serde(default)]
    pub defaults: Option<DefaultsSpec>,
}

/// A scheduled process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub run: RunSpec,
    #[serde(flatten)]
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub manage: Option<ManageSpec>,
    #[serde(default)]
    pub defaults: Option<DefaultsSpec>,
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeSpec {
    #[serde(default)]
    pub http: Option<HttpExposeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpExposeSpec {
    pub internal: HttpInternal,
    #[serde(default)]
    pub public: Option<HttpPublic>,
    #[serde(default)]
    pub health_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpInternal {
    #[serde(default = "default_internal_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPublic {
    pub hostnames: Vec<String>,
    #[serde(default = "default_public_prefix")]
    pub path_prefix: String,
    #[serde(default)]
    pub tls: TlsMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Off,
    #[default]
    Internal,
    Letsencrypt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    #[serde(default)]
    pub caddy: Option<CaddySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaddySpec {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageSpec {
    #[serde(default)]
    pub systemd: Option<SystemdSpec>,
}

/// Process supervision parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemdSpec {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_wanted_by")]
    pub wanted_by: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,
    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
    #[serde(default)]
    pub exec_reload: Option<Vec<String>>,
}

impl Default for SystemdSpec {
    fn default() -> Self {
        Self {
            enable: true,
            description: None,
            after: Vec::new(),
            requires: Vec::new(),
            wanted_by: default_wanted_by(),
            restart: RestartPolicy::default(),
            restart_sec: default_restart_sec(),
            no_new_privileges: true,
            exec_reload: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    OnFailure,
    Always,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultsSpec {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_internal_host() -> String {
    crate::registry::DEFAULT_UPSTREAM_HOST.to_string()
}

fn default_public_prefix() -> String {
    "/".to_string()
}

fn default_wanted_by() -> Vec<String> {
    vec!["default.target".to_string()]
}

fn default_restart_sec() -> u32 {
    2
}

/// Supervision block if systemd management is enabled.
fn enabled_systemd(manage: &Option<ManageSpec>) -> Option<&SystemdSpec> {
    manage
        .as_ref()
        .and_then(|m| m.systemd.as_ref())
        .filter(|s| s.enable)
}

impl ServiceSpec {
    pub fn http(&self) -> Option<&HttpExposeSpec> {
        self.expose.as_ref().and_then(|e| e.http.as_ref())
    }

    pub fn systemd(&self) -> Option<&SystemdSpec> {
        enabled_systemd(&self.manage)
    }

    pub fn is_managed(&self) -> bool {
        self.systemd().is_some()
    }

    /// Gateway path prefix, `caddy.path_prefix` or `/<name>`.
    pub fn proxy_path(&self, name: &str) -> Option<String> {
        let caddy = self.proxy.as_ref()?.caddy.as_ref().filter(|c| c.enable)?;
        Some(
            caddy
                .path_prefix
                .clone()
                .unwrap_or_else(|| format!("/{}", name)),
        )
    }

    pub fn default_env(&self) -> Option<&BTreeMap<String, String>> {
        self.defaults.as_ref().map(|d| &d.env)
    }
}

impl JobSpec {
    pub fn systemd(&self) -> Option<&SystemdSpec> {
        enabled_systemd(&self.manage)
    }

    pub fn is_managed(&self) -> bool {
        self.systemd().is_some()
    }

    pub fn default_env(&self) -> Option<&BTreeMap<String, String>> {
        self.defaults.as_ref().map(|d| &d.env)
    }
}

impl Specification {
    /// Parse and validate a YAML document.
    ///
    /// Returns every problem found. A specification is never returned
    /// partially.
    pub fn load(raw: &str) -> Result<Self, ValidationError> {
        let spec: Specification = serde_yaml::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check cross-entry invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.node.gateway_port == 0 {
            issues.push(ValidationIssue::new(
                Catalog::Node,
                "gateway_port",
                "gateway port must be positive",
            ));
        }

        for name in self.components.keys() {
            check_name(Catalog::Components, name, &mut issues);
        }

        for (name, service) in &self.services {
            let mut push = |message: String| {
                issues.push(ValidationIssue::new(Catalog::Services, name, message))
            };
            if !is_valid_entry_name(name) {
                push(format!("invalid name {:?}", name));
            }
            self.check_component(&service.component, &mut push);
            for problem in service.run.problems() {
                push(problem);
            }
            if let Some(http) = service.http() {
                if http.internal.port == 0 {
                    push("expose.http.internal.port must be positive".to_string());
                }
                if let Some(path) = &http.health_path {
                    if !path.starts_with('/') {
                        push(format!("health_path {:?} must start with '/'", path));
                    }
                }
                if let Some(public) = &http.public {
                    if public.hostnames.is_empty() {
                        push("expose.http.public requires at least one hostname".to_string());
                    }
                }
            }
            if let Some(prefix) = service.proxy_path(name) {
                if !prefix.starts_with('/') {
                    push(format!("proxy path_prefix {:?} must start with '/'", prefix));
                }
                if service.http().is_none() {
                    push("proxy.caddy requires expose.http".to_string());
                }
            }
            if service.is_managed() && service.run.is_remote() {
                push("manage.systemd cannot be enabled for runner=remote".to_string());
            }
        }

        for (name, job) in &self.jobs {
            let mut push =
                |message: String| issues.push(ValidationIssue::new(Catalog::Jobs, name, message));
            if !is_valid_entry_name(name) {
                push(format!("invalid name {:?}", name));
            }
            if self.services.contains_key(name) {
                push("name is already used by a service".to_string());
            }
            self.check_component(&job.component, &mut push);
            for problem in job.run.problems() {
                push(problem);
            }
            if job.run.is_remote() {
                push("jobs cannot use runner=remote".to_string());
            }
            if let Err(e) = CronSchedule::parse(&job.trigger.schedule) {
                push(format!("invalid schedule {:?}: {}", job.trigger.schedule, e));
            }
            if job.trigger.timezone.trim().is_empty() {
                push("timezone must not be empty".to_string());
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Invalid(issues))
        }
    }

    fn check_component(&self, component: &Option<String>, push: &mut impl FnMut(String)) {
        if let Some(component) = component {
            if !self.components.contains_key(component) {
                push(format!("unknown component {:?}", component));
            }
        }
    }

    /// Names of every service and job, sorted.
    pub fn entry_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .services
            .keys()
            .chain(self.jobs.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }
}

fn check_name(catalog: Catalog, name: &str, issues: &mut Vec<ValidationIssue>) {
    if !is_valid_entry_name(name) {
        issues.push(ValidationIssue::new(
            catalog,
            name,
            format!("invalid name {:?}", name),
        ));
    }
}
