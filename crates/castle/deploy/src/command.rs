//! Run command construction.
//!
//! Turns a [`RunSpec`] into an argv whose first element is an absolute
//! path produced by the resolver.

use std::collections::BTreeMap;
use std::path::PathBuf;

use castle_types::RunSpec;

use crate::error::ResolutionError;
use crate::resolve::ExecutableResolver;

/// Container runtimes in order of preference.
const CONTAINER_RUNTIMES: [&str; 2] = ["podman", "docker"];

/// Prefix of generated container names.
pub const CONTAINER_PREFIX: &str = "castle-";

/// Build the argv for `run`. Remote runners have no local command.
///
/// `env` is the entry's resolved environment. Containers get its keys as
/// bare `-e KEY` flags after the runner's own `env` block, so values
/// (secrets included) come from the unit's environment and never appear in
/// the command line.
pub fn build_run_command(
    name: &str,
    run: &RunSpec,
    env: &BTreeMap<String, String>,
    resolver: &dyn ExecutableResolver,
) -> Result<Vec<String>, ResolutionError> {
    let argv = match run {
        RunSpec::Command(cmd) => {
            let (program, args) = cmd.argv.split_first().ok_or_else(|| {
                ResolutionError::ExecutableNotFound {
                    name: String::new(),
                }
            })?;
            let mut argv = vec![path_string(resolver.which(program)?)];
            argv.extend(args.iter().cloned());
            argv
        }
        RunSpec::Python(py) => {
            let mut argv = vec![path_string(resolver.which(&py.tool)?)];
            argv.extend(py.args.iter().cloned());
            argv
        }
        RunSpec::Container(c) => {
            let runtime = container_runtime(resolver)?;
            let mut argv = vec![
                path_string(runtime),
                "run".to_string(),
                "--rm".to_string(),
                format!("--name={}{}", CONTAINER_PREFIX, name),
            ];
            for (container_port, host_port) in &c.ports {
                argv.push("-p".to_string());
                argv.push(format!("{}:{}", host_port, container_port));
            }
            for volume in &c.volumes {
                argv.push("-v".to_string());
                argv.push(volume.clone());
            }
            for (key, value) in &c.env {
                argv.push("-e".to_string());
                argv.push(format!("{}={}", key, value));
            }
            for key in env.keys() {
                argv.push("-e".to_string());
                argv.push(key.clone());
            }
            if let Some(workdir) = &c.workdir {
                argv.push("-w".to_string());
                argv.push(workdir.clone());
            }
            argv.push(c.image.clone());
            if let Some(command) = &c.command {
                argv.extend(command.iter().cloned());
            }
            argv.extend(c.args.iter().cloned());
            argv
        }
        RunSpec::Node(node) => {
            let mut argv = vec![
                path_string(resolver.which(node.package_manager.binary())?),
                "run".to_string(),
                node.script.clone(),
            ];
            argv.extend(node.args.iter().cloned());
            argv
        }
        RunSpec::Remote(_) => Vec::new(),
    };
    Ok(argv)
}

fn container_runtime(resolver: &dyn ExecutableResolver) -> Result<PathBuf, ResolutionError> {
    CONTAINER_RUNTIMES
        .iter()
        .find_map(|runtime| resolver.which(runtime).ok())
        .ok_or(ResolutionError::NoContainerRuntime)
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;
    use castle_types::{CommandRun, ContainerRun, NodeRun, PackageManager, PythonRun, RemoteRun};

    fn resolver() -> StaticResolver {
        StaticResolver::new()
            .with("mpd", "/usr/bin/mpd")
            .with("notes-server", "/home/me/.local/bin/notes-server")
            .with("docker", "/usr/bin/docker")
            .with("yarn", "/usr/local/bin/yarn")
    }

    #[test]
    fn test_command_resolves_program() {
        let run = RunSpec::Command(CommandRun {
            argv: vec!["mpd".into(), "--no-daemon".into()],
        });
        let argv = build_run_command("mpd", &run, &BTreeMap::new(), &resolver()).unwrap();
        assert_eq!(argv, vec!["/usr/bin/mpd", "--no-daemon"]);
    }

    #[test]
    fn test_python_tool() {
        let run = RunSpec::Python(PythonRun {
            tool: "notes-server".into(),
            args: vec!["--port".into(), "9001".into()],
        });
        let argv = build_run_command("notes", &run, &BTreeMap::new(), &resolver()).unwrap();
        assert_eq!(argv[0], "/home/me/.local/bin/notes-server");
        assert_eq!(&argv[1..], ["--port", "9001"]);
    }

    #[test]
    fn test_container_falls_back_to_docker() {
        let run = RunSpec::Container(ContainerRun {
            image: "grafana/grafana:latest".into(),
            command: None,
            args: vec!["--verbose".into()],
            ports: BTreeMap::from([(3000, 3300)]),
            volumes: vec!["/data/grafana:/var/lib/grafana".into()],
            env: BTreeMap::from([("GF_LOG".to_string(), "warn".to_string())]),
            workdir: Some("/srv".into()),
        });
        let env = BTreeMap::from([("GRAFANA_PORT".to_string(), "3300".to_string())]);
        let argv = build_run_command("grafana", &run, &env, &resolver()).unwrap();
        assert_eq!(
            argv,
            vec![
                "/usr/bin/docker",
                "run",
                "--rm",
                "--name=castle-grafana",
                "-p",
                "3300:3000",
                "-v",
                "/data/grafana:/var/lib/grafana",
                "-e",
                "GF_LOG=warn",
                "-e",
                "GRAFANA_PORT",
                "-w",
                "/srv",
                "grafana/grafana:latest",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_container_env_values_stay_out_of_argv() {
        let run = RunSpec::Container(ContainerRun {
            image: "miniflux/miniflux".into(),
            command: None,
            args: vec![],
            ports: BTreeMap::new(),
            volumes: vec![],
            env: BTreeMap::new(),
            workdir: None,
        });
        let env = BTreeMap::from([(
            "DATABASE_URL".to_string(),
            "postgres://rss:hunter2@db/rss".to_string(),
        )]);
        let argv = build_run_command("rss", &run, &env, &resolver()).unwrap();
        assert!(argv.windows(2).any(|w| w == ["-e", "DATABASE_URL"]));
        assert!(argv.iter().all(|arg| !arg.contains("hunter2")));
    }

    #[test]
    fn test_container_without_runtime() {
        let run = RunSpec::Container(ContainerRun {
            image: "redis".into(),
            command: None,
            args: vec![],
            ports: BTreeMap::new(),
            volumes: vec![],
            env: BTreeMap::new(),
            workdir: None,
        });
        let result = build_run_command("redis", &run, &BTreeMap::new(), &StaticResolver::new());
        assert_eq!(result, Err(ResolutionError::NoContainerRuntime));
    }

    #[test]
    fn test_node_script() {
        let run = RunSpec::Node(NodeRun {
            script: "start".into(),
            package_manager: PackageManager::Yarn,
            args: vec![],
        });
        let argv = build_run_command("app", &run, &BTreeMap::new(), &resolver()).unwrap();
        assert_eq!(argv, vec!["/usr/local/bin/yarn", "run", "start"]);

        let missing = RunSpec::Node(NodeRun {
            script: "start".into(),
            package_manager: PackageManager::Pnpm,
            args: vec![],
        });
        assert_eq!(
            build_run_command("app", &missing, &BTreeMap::new(), &resolver()),
            Err(ResolutionError::ExecutableNotFound {
                name: "pnpm".into()
            })
        );
    }

    #[test]
    fn test_remote_has_no_command() {
        let run = RunSpec::Remote(RemoteRun {
            base_url: "http://nas:5000".into(),
            health_url: None,
        });
        assert!(build_run_command("nas", &run, &BTreeMap::new(), &resolver())
            .unwrap()
            .is_empty());
    }
}
