//! Derived roles.
//!
//! A role is computed from which capability blocks are present on an
//! entry. There is no field to set it directly.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::run::RunSpec;
use crate::spec::{ComponentSpec, JobSpec, ServiceSpec};

/// Classification of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Containerized,
    Frontend,
    Job,
    Remote,
    Service,
    Tool,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Containerized => "containerized",
            Role::Frontend => "frontend",
            Role::Job => "job",
            Role::Remote => "remote",
            Role::Service => "service",
            Role::Tool => "tool",
            Role::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// Anything whose roles follow from its declared capabilities.
pub trait Capabilities {
    /// Sorted set of roles.
    fn roles(&self) -> BTreeSet<Role>;

    fn has_role(&self, role: Role) -> bool {
        self.roles().contains(&role)
    }
}

fn runner_roles(run: &RunSpec, roles: &mut BTreeSet<Role>) {
    match run {
        RunSpec::Remote(_) => {
            roles.insert(Role::Remote);
        }
        RunSpec::Container(_) => {
            roles.insert(Role::Containerized);
        }
        RunSpec::Command(_) | RunSpec::Python(_) | RunSpec::Node(_) => {}
    }
}

impl Capabilities for ServiceSpec {
    fn roles(&self) -> BTreeSet<Role> {
        let mut roles = BTreeSet::new();
        runner_roles(&self.run, &mut roles);
        if self.http().is_some() {
            roles.insert(Role::Service);
        } else if self.is_managed() {
            roles.insert(Role::Worker);
        }
        if roles.is_empty() {
            roles.insert(Role::Tool);
        }
        roles
    }
}

impl Capabilities for JobSpec {
    fn roles(&self) -> BTreeSet<Role> {
        let mut roles = BTreeSet::from([Role::Job]);
        runner_roles(&self.run, &mut roles);
        roles
    }
}

impl Capabilities for ComponentSpec {
    fn roles(&self) -> BTreeSet<Role> {
        let mut roles = BTreeSet::new();
        let on_path = self
            .install
            .as_ref()
            .and_then(|i| i.path.as_ref())
            .is_some_and(|p| p.enable);
        if on_path || self.tool.is_some() {
            roles.insert(Role::Tool);
        }
        if self
            .build
            .as_ref()
            .is_some_and(|b| !b.commands.is_empty() || !b.outputs.is_empty())
        {
            roles.insert(Role::Frontend);
        }
        if roles.is_empty() {
            roles.insert(Role::Tool);
        }
        roles
    }
}
