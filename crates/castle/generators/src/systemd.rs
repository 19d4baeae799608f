//! systemd user unit generation.
//!
//! One `castle-<name>.service` per managed entry, plus a
//! `castle-<name>.timer` for managed jobs. The shared prefix lets every
//! generated unit be listed with `systemctl --user list-units 'castle-*'`.

use std::fmt::Write;

use castle_types::{CronSchedule, DeployedEntry, EntryKind, NodeRegistry, ScheduleError};
use serde::Serialize;

use crate::calendar::on_calendar;

/// Prefix shared by every generated unit.
pub const UNIT_PREFIX: &str = "castle-";

pub fn unit_name(name: &str) -> String {
    format!("{}{}.service", UNIT_PREFIX, name)
}

pub fn timer_name(name: &str) -> String {
    format!("{}{}.timer", UNIT_PREFIX, name)
}

/// Whether `file_name` looks like something this module generated.
pub fn is_generated_unit(file_name: &str) -> bool {
    file_name.starts_with(UNIT_PREFIX)
        && (file_name.ends_with(".service") || file_name.ends_with(".timer"))
}

/// A rendered unit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFile {
    pub file_name: String,
    pub contents: String,
}

/// Every unit for a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitSet {
    pub files: Vec<UnitFile>,
    /// Entries skipped because their schedule could not be rendered.
    pub warnings: Vec<String>,
}

/// Render units for every managed entry, in name order.
pub fn generate_units(registry: &NodeRegistry) -> UnitSet {
    let mut set = UnitSet::default();
    for (name, entry) in registry.managed() {
        if entry.kind == EntryKind::Job {
            match generate_timer(name, entry) {
                Ok(Some(timer)) => {
                    set.files.push(UnitFile {
                        file_name: unit_name(name),
                        contents: generate_unit(name, entry, registry),
                    });
                    set.files.push(UnitFile {
                        file_name: timer_name(name),
                        contents: timer,
                    });
                }
                Ok(None) => set.warnings.push(format!("{}: job has no schedule", name)),
                Err(e) => set.warnings.push(format!("{}: {}", name, e)),
            }
            continue;
        }
        set.files.push(UnitFile {
            file_name: unit_name(name),
            contents: generate_unit(name, entry, registry),
        });
    }
    set
}

/// Render the `.service` unit for one entry.
pub fn generate_unit(name: &str, entry: &DeployedEntry, registry: &NodeRegistry) -> String {
    let is_job = entry.kind == EntryKind::Job;
    let supervision = entry.supervision.as_ref();
    let mut out = String::new();

    out.push_str("[Unit]\n");
    let _ = writeln!(out, "Description=Castle: {}", description(name, entry));
    let after: Vec<String> = supervision
        .map(|s| ordering(&s.after, registry))
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| vec!["network.target".to_string()]);
    let _ = writeln!(out, "After={}", after.join(" "));
    if let Some(requires) = supervision
        .map(|s| ordering(&s.requires, registry))
        .filter(|r| !r.is_empty())
    {
        let _ = writeln!(out, "Requires={}", requires.join(" "));
    }

    out.push_str("\n[Service]\n");
    let _ = writeln!(out, "Type={}", if is_job { "oneshot" } else { "simple" });
    let exec: Vec<String> = entry.run_cmd.iter().map(|a| escape_exec_arg(a)).collect();
    let _ = writeln!(out, "ExecStart={}", exec.join(" "));
    for (key, value) in &entry.env {
        let _ = writeln!(out, "Environment={}", escape_env(key, value));
    }
    if let Some(s) = supervision {
        if !is_job {
            let _ = writeln!(out, "Restart={}", s.restart);
            let _ = writeln!(out, "RestartSec={}", s.restart_sec);
        }
    }
    out.push_str("SuccessExitStatus=143\n");
    if let Some(reload) = supervision.and_then(|s| s.exec_reload.as_ref()) {
        let reload: Vec<String> = reload.iter().map(|a| escape_exec_arg(a)).collect();
        let _ = writeln!(out, "ExecReload={}", reload.join(" "));
    }
    if supervision.map_or(true, |s| s.no_new_privileges) {
        out.push_str("NoNewPrivileges=true\n");
    }

    // timers start jobs; only long-running services are wanted at boot
    if !is_job {
        let wanted_by = supervision
            .map(|s| s.wanted_by.clone())
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| vec!["default.target".to_string()]);
        out.push_str("\n[Install]\n");
        let _ = writeln!(out, "WantedBy={}", wanted_by.join(" "));
    }

    out
}

/// Render the `.timer` unit for a job, `None` if the entry has no schedule.
pub fn generate_timer(name: &str, entry: &DeployedEntry) -> Result<Option<String>, ScheduleError> {
    let Some(schedule) = entry.schedule.as_deref() else {
        return Ok(None);
    };
    let cron = CronSchedule::parse(schedule)?;
    let timezone = entry.timezone.as_deref().unwrap_or_default();

    let mut out = String::new();
    out.push_str("[Unit]\n");
    let _ = writeln!(out, "Description=Castle timer: {}", description(name, entry));
    out.push_str("\n[Timer]\n");
    let _ = writeln!(out, "OnCalendar={}", on_calendar(&cron, timezone));
    out.push_str("Persistent=false\n");
    let _ = writeln!(out, "Unit={}", unit_name(name));
    out.push_str("\n[Install]\nWantedBy=timers.target\n");
    Ok(Some(out))
}

fn description(name: &str, entry: &DeployedEntry) -> String {
    entry
        .description
        .clone()
        .unwrap_or_else(|| name.to_string())
}

/// Dependencies naming another registry entry become its unit name.
fn ordering(deps: &[String], registry: &NodeRegistry) -> Vec<String> {
    deps.iter()
        .map(|dep| {
            if registry.deployed.contains_key(dep) {
                unit_name(dep)
            } else {
                dep.clone()
            }
        })
        .collect()
}

fn escape_exec_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    if !escaped.is_empty()
        && !escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'))
    {
        return escaped;
    }
    quote(&escaped)
}

fn escape_env(key: &str, value: &str) -> String {
    let pair = format!("{}={}", key, value.replace('%', "%%"));
    if pair
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\\'))
    {
        quote(&pair)
    } else {
        pair
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_types::{Hostname, NodeConfig, RestartPolicy, RunnerKind, Supervision};
    use std::collections::BTreeMap;

    fn supervision() -> Supervision {
        Supervision {
            after: vec![],
            requires: vec![],
            wanted_by: vec!["default.target".into()],
            restart: RestartPolicy::OnFailure,
            restart_sec: 2,
            no_new_privileges: true,
            exec_reload: None,
        }
    }

    fn service(cmd: &[&str]) -> DeployedEntry {
        DeployedEntry {
            kind: EntryKind::Service,
            runner: RunnerKind::Command,
            description: Some("Music player".into()),
            run_cmd: cmd.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::from([("MPD_DATA_DIR".to_string(), "/data/castle/mpd".to_string())]),
            host: None,
            port: None,
            health_path: None,
            proxy_path: None,
            remote: None,
            schedule: None,
            timezone: None,
            managed: true,
            supervision: Some(supervision()),
        }
    }

    fn registry(entries: Vec<(&str, DeployedEntry)>) -> NodeRegistry {
        NodeRegistry {
            node: NodeConfig {
                hostname: Hostname::new("tower"),
                gateway_port: 9000,
                static_root: None,
            },
            deployed: entries
                .into_iter()
                .map(|(n, e)| (n.to_string(), e))
                .collect(),
        }
    }

    #[test]
    fn test_service_unit() {
        let entry = service(&["/usr/bin/mpd", "--no-daemon"]);
        let reg = registry(vec![("mpd", entry.clone())]);
        let unit = generate_unit("mpd", &entry, &reg);
        assert_eq!(
            unit,
            "[Unit]\n\
             Description=Castle: Music player\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart=/usr/bin/mpd --no-daemon\n\
             Environment=MPD_DATA_DIR=/data/castle/mpd\n\
             Restart=on-failure\n\
             RestartSec=2\n\
             SuccessExitStatus=143\n\
             NoNewPrivileges=true\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n"
        );
        assert!(!unit.contains("WorkingDirectory"));
    }

    #[test]
    fn test_after_maps_entries_to_units() {
        let mut api = service(&["/usr/bin/api"]);
        if let Some(s) = api.supervision.as_mut() {
            s.after = vec!["db".into(), "network-online.target".into()];
            s.requires = vec!["db".into()];
        }
        let reg = registry(vec![("api", api.clone()), ("db", service(&["/usr/bin/pg"]))]);
        let unit = generate_unit("api", &api, &reg);
        assert!(unit.contains("After=castle-db.service network-online.target\n"));
        assert!(unit.contains("Requires=castle-db.service\n"));
    }

    #[test]
    fn test_job_gets_oneshot_and_timer() {
        let mut job = service(&["/usr/bin/restic", "backup"]);
        job.kind = EntryKind::Job;
        job.description = Some("Nightly backup".into());
        job.schedule = Some("0 2 * * *".into());
        job.timezone = Some("America/Los_Angeles".into());
        let reg = registry(vec![("backup", job)]);

        let set = generate_units(&reg);
        assert!(set.warnings.is_empty());
        let names: Vec<&str> = set.files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["castle-backup.service", "castle-backup.timer"]);

        let unit = &set.files[0].contents;
        assert!(unit.contains("Type=oneshot\n"));
        assert!(!unit.contains("Restart="));
        assert!(!unit.contains("[Install]"));

        let timer = &set.files[1].contents;
        assert!(timer.contains("Description=Castle timer: Nightly backup\n"));
        assert!(timer.contains("OnCalendar=*-*-* 02:00:00 America/Los_Angeles\n"));
        assert!(timer.contains("Unit=castle-backup.service\n"));
        assert!(timer.contains("WantedBy=timers.target\n"));
    }

    #[test]
    fn test_unmanaged_entries_skipped() {
        let mut adhoc = service(&["/usr/bin/tool"]);
        adhoc.managed = false;
        let reg = registry(vec![("mpd", service(&["/usr/bin/mpd"])), ("tool", adhoc)]);
        let set = generate_units(&reg);
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.files[0].file_name, "castle-mpd.service");
    }

    #[test]
    fn test_escaping() {
        let mut entry = service(&["/usr/bin/echo", "hello world", "100%", "$HOME"]);
        entry.env = BTreeMap::from([("GREETING".to_string(), "hi there".to_string())]);
        if let Some(s) = entry.supervision.as_mut() {
            s.exec_reload = Some(vec!["/bin/kill".into(), "-HUP".into(), "$MAINPID".into()]);
        }
        let reg = registry(vec![("echo", entry.clone())]);
        let unit = generate_unit("echo", &entry, &reg);
        assert!(unit.contains("ExecStart=/usr/bin/echo \"hello world\" 100%% $$HOME\n"));
        assert!(unit.contains("Environment=\"GREETING=hi there\"\n"));
        assert!(unit.contains("ExecReload=/bin/kill -HUP $$MAINPID\n"));
    }

    #[test]
    fn test_generated_names() {
        assert_eq!(unit_name("notes"), "castle-notes.service");
        assert!(is_generated_unit("castle-notes.timer"));
        assert!(!is_generated_unit("castle-notes.conf"));
        assert!(!is_generated_unit("other.service"));
    }
}
