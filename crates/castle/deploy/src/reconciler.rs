//! Reconciler
//!
//! Turns a validated [`Specification`] into a [`NodeRegistry`]. Each entry
//! is resolved independently: a missing executable or secret fails that
//! entry only, and if the previous registry had a working version of it,
//! that version is kept.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use castle_types::{
    DeployedEntry, EntryKind, Hostname, JobSpec, NodeConfig, NodeRegistry, RemoteTarget, RunSpec,
    ServiceSpec, Specification, Supervision,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::command::build_run_command;
use crate::error::ResolutionError;
use crate::resolve::ExecutableResolver;
use crate::secrets::{substitute_secrets, SecretStore};

/// Default root for per-entry data directories.
pub const DEFAULT_DATA_ROOT: &str = "/data/castle";

/// Environment variable prefix for an entry: `notes-api` becomes `NOTES_API`.
pub fn env_prefix(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Which entries a deploy touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeployScope {
    #[default]
    All,
    /// Only these entries; everything else is carried over unchanged.
    Only(BTreeSet<String>),
}

impl DeployScope {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeployScope::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            DeployScope::All => true,
            DeployScope::Only(names) => names.contains(name),
        }
    }
}

/// Inputs that are not part of the specification.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub hostname: Hostname,
    pub data_root: PathBuf,
    /// Checkout directory that resolved commands must never point into.
    pub source_root: Option<PathBuf>,
}

impl ReconcilerConfig {
    pub fn new(hostname: Hostname) -> Self {
        Self {
            hostname,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            source_root: None,
        }
    }
}

/// An entry that could not be resolved this round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub name: String,
    pub error: ResolutionError,
}

/// Per-entry result of a deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    /// Entries written from the current specification.
    pub deployed: Vec<String>,
    /// Entries that failed resolution.
    pub failed: Vec<EntryFailure>,
    /// Failed or out-of-scope entries kept from the previous registry.
    pub preserved: Vec<String>,
    /// Previous entries no longer in the specification.
    pub removed: Vec<String>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry plus report.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub registry: NodeRegistry,
    pub report: DeployReport,
}

/// Spec to registry reconciler.
pub struct Reconciler {
    config: ReconcilerConfig,
    secrets: Arc<dyn SecretStore>,
    resolver: Arc<dyn ExecutableResolver>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        secrets: Arc<dyn SecretStore>,
        resolver: Arc<dyn ExecutableResolver>,
    ) -> Self {
        Self {
            config,
            secrets,
            resolver,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile every entry of `spec` in `scope`.
    ///
    /// Output depends only on the specification and the external inputs,
    /// so repeating a deploy with nothing changed yields an identical
    /// registry.
    #[instrument(skip_all, fields(hostname = %self.config.hostname))]
    pub fn deploy(
        &self,
        spec: &Specification,
        previous: Option<&NodeRegistry>,
        scope: &DeployScope,
    ) -> DeployOutcome {
        let node = NodeConfig {
            hostname: self.config.hostname.clone(),
            gateway_port: spec.node.gateway_port,
            static_root: spec.node.static_root.clone(),
        };
        let mut registry = NodeRegistry::empty(node);
        let mut report = DeployReport::default();

        let entries = spec
            .services
            .iter()
            .map(|(name, svc)| (name, Declared::Service(svc)))
            .chain(spec.jobs.iter().map(|(name, job)| (name, Declared::Job(job))));

        for (name, declared) in entries {
            let prior = previous.and_then(|p| p.get(name));

            if !scope.contains(name) {
                if let Some(prior) = prior {
                    registry.deployed.insert(name.clone(), prior.clone());
                    report.preserved.push(name.clone());
                }
                continue;
            }

            let result = match declared {
                Declared::Service(svc) => self.resolve_service(name, svc, spec),
                Declared::Job(job) => self.resolve_job(name, job, spec),
            };

            match result {
                Ok(entry) => {
                    debug!(entry = %name, runner = %entry.runner, "Resolved entry");
                    registry.deployed.insert(name.clone(), entry);
                    report.deployed.push(name.clone());
                }
                Err(error) => {
                    warn!(entry = %name, error = %error, "Entry failed to resolve");
                    if let Some(prior) = prior {
                        registry.deployed.insert(name.clone(), prior.clone());
                        report.preserved.push(name.clone());
                    }
                    report.failed.push(EntryFailure {
                        name: name.clone(),
                        error,
                    });
                }
            }
        }

        if let Some(previous) = previous {
            report.removed = previous
                .deployed
                .keys()
                .filter(|name| !registry.deployed.contains_key(*name))
                .cloned()
                .collect();
        }

        report.preserved.sort();
        info!(
            deployed = report.deployed.len(),
            failed = report.failed.len(),
            preserved = report.preserved.len(),
            removed = report.removed.len(),
            "Reconciliation complete"
        );

        DeployOutcome { registry, report }
    }

    fn resolve_service(
        &self,
        name: &str,
        svc: &ServiceSpec,
        spec: &Specification,
    ) -> Result<DeployedEntry, ResolutionError> {
        let http = svc.http();
        let port = http.map(|h| h.internal.port);
        let env = self.resolve_env(name, svc.is_managed(), port, svc.default_env())?;
        let run_cmd = self.resolve_command(name, &svc.run, &env)?;

        Ok(DeployedEntry {
            kind: EntryKind::Service,
            runner: svc.run.kind(),
            description: describe(
                svc.systemd().and_then(|s| s.description.as_ref()),
                svc.description.as_ref(),
                svc.component.as_deref(),
                spec,
            ),
            run_cmd,
            env,
            host: http.map(|h| h.internal.host.clone()),
            port,
            health_path: http.and_then(|h| h.health_path.clone()),
            proxy_path: svc.proxy_path(name),
            remote: remote_target(&svc.run),
            schedule: None,
            timezone: None,
            managed: svc.is_managed(),
            supervision: svc.systemd().map(Supervision::from),
        })
    }

    fn resolve_job(
        &self,
        name: &str,
        job: &JobSpec,
        spec: &Specification,
    ) -> Result<DeployedEntry, ResolutionError> {
        let env = self.resolve_env(name, job.is_managed(), None, job.default_env())?;
        let run_cmd = self.resolve_command(name, &job.run, &env)?;

        Ok(DeployedEntry {
            kind: EntryKind::Job,
            runner: job.run.kind(),
            description: describe(
                job.systemd().and_then(|s| s.description.as_ref()),
                job.description.as_ref(),
                job.component.as_deref(),
                spec,
            ),
            run_cmd,
            env,
            host: None,
            port: None,
            health_path: None,
            proxy_path: None,
            remote: None,
            schedule: Some(job.trigger.schedule.clone()),
            timezone: Some(job.trigger.timezone.clone()),
            managed: job.is_managed(),
            supervision: job.systemd().map(Supervision::from),
        })
    }

    /// Conventions first, then `defaults.env`, then secret substitution.
    fn resolve_env(
        &self,
        name: &str,
        managed: bool,
        port: Option<u16>,
        defaults: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, ResolutionError> {
        let prefix = env_prefix(name);
        let mut env = BTreeMap::new();
        if managed {
            env.insert(
                format!("{}_DATA_DIR", prefix),
                self.config.data_root.join(name).to_string_lossy().into_owned(),
            );
        }
        if let Some(port) = port {
            env.insert(format!("{}_PORT", prefix), port.to_string());
        }
        if let Some(defaults) = defaults {
            env.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for value in env.values_mut() {
            *value = substitute_secrets(value, self.secrets.as_ref())?;
        }
        Ok(env)
    }

    fn resolve_command(
        &self,
        name: &str,
        run: &RunSpec,
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ResolutionError> {
        let argv = build_run_command(name, run, env, self.resolver.as_ref())?;
        if let (Some(root), Some(program)) = (&self.config.source_root, argv.first()) {
            if Path::new(program).starts_with(root) {
                return Err(ResolutionError::SourceTreeReference {
                    path: program.clone(),
                    root: root.display().to_string(),
                });
            }
        }
        Ok(argv)
    }
}

enum Declared<'a> {
    Service(&'a ServiceSpec),
    Job(&'a JobSpec),
}

fn describe(
    systemd: Option<&String>,
    own: Option<&String>,
    component: Option<&str>,
    spec: &Specification,
) -> Option<String> {
    systemd
        .or(own)
        .cloned()
        .or_else(|| {
            component
                .and_then(|c| spec.components.get(c))
                .and_then(|c| c.description.clone())
        })
}

fn remote_target(run: &RunSpec) -> Option<RemoteTarget> {
    match run {
        RunSpec::Remote(remote) => Some(RemoteTarget {
            base_url: remote.base_url.clone(),
            health_url: remote.health_url.clone(),
        }),
        RunSpec::Command(_) | RunSpec::Python(_) | RunSpec::Container(_) | RunSpec::Node(_) => {
            None
        }
    }
}
