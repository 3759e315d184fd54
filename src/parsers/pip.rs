//! pip classifier and `pip list` inventory.
//!
//! Requirement specifiers (`requests==2.31.0`, `django>=4`, `rich[jupyter]`)
//! are reduced to the bare distribution name; only an exact `==` pin is
//! recorded as a requested version.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;

use super::{base_record, find_in_path, flag_value, has_flag, run_inventory, MonitorHandle, ToolParser};
use crate::config::Config;
use crate::models::{ExecutionRecord, PackageInfo, META_ACTION, META_VERSIONS};

pub const TOOL: &str = "pip";

const VALUE_FLAGS: &[&str] = &[
    "-r", "--requirement", "-c", "--constraint", "-i", "--index-url", "--extra-index-url",
    "-f", "--find-links", "-t", "--target", "--prefix", "--root", "--platform",
    "--python-version", "--src", "-d", "--dest",
];

pub struct PipParser {
    monitor: MonitorHandle,
    binary: Option<PathBuf>,
}

impl PipParser {
    pub fn new() -> Self {
        Self {
            monitor: MonitorHandle::new(),
            binary: None,
        }
    }
}

impl Default for PipParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParser for PipParser {
    fn name(&self) -> &str {
        TOOL
    }

    fn binaries(&self) -> &[&str] {
        &["pip", "pip3"]
    }

    fn initialize(&mut self, config: &Config) -> Result<()> {
        let wrappers = &config.monitoring.wrapper_dir;
        let binary = find_in_path("pip", wrappers)
            .or_else(|| find_in_path("pip3", wrappers))
            .context("pip not found on PATH")?;
        self.binary = Some(binary);
        Ok(())
    }

    fn classify(&self, command: &str, args: &[String]) -> ExecutionRecord {
        let mut record = base_record(TOOL, command, args);
        let Some(subcommand) = args.first() else {
            return record;
        };
        let rest = &args[1..];

        match subcommand.as_str() {
            "install" => {
                record_requirements(&mut record, rest);
                record.set(META_ACTION, "install");
                if let Some(file) = flag_value(args, &["-r", "--requirement"]) {
                    record.set("requirements", file);
                }
                if has_flag(args, &["-U", "--upgrade"]) {
                    record.set("upgrade", true);
                }
                if let Some(target) = flag_value(args, &["-e", "--editable"]) {
                    record.set("editable", target);
                }
            }
            "uninstall" => {
                record_requirements(&mut record, rest);
                record.set(META_ACTION, "uninstall");
            }
            "download" => {
                record_requirements(&mut record, rest);
                record.set(META_ACTION, "download");
            }
            "list" | "freeze" => {
                record.set(META_ACTION, "list");
                if has_flag(args, &["-o", "--outdated"]) {
                    record.set("outdated", true);
                }
            }
            "show" => {
                record.packages_affected = rest
                    .iter()
                    .filter(|a| !a.starts_with('-'))
                    .cloned()
                    .collect();
                record.set(META_ACTION, "show");
            }
            "search" => {
                if !rest.is_empty() {
                    record.set("search_term", rest.join(" "));
                }
            }
            _ => {}
        }

        record
    }

    fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    fn installed_packages(&self) -> Result<Vec<PackageInfo>> {
        let binary = self.binary.as_deref().context("pip parser is not initialized")?;
        let output = run_inventory(binary, &["list", "--format=json"])?;
        parse_list_json(&output)
    }
}

fn record_requirements(record: &mut ExecutionRecord, args: &[String]) {
    let mut packages = Vec::new();
    let mut pins = Vec::new();
    let mut skip_next = false;

    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with('-') {
            // `-e` consumes a path or VCS URL, never a distribution name.
            skip_next = VALUE_FLAGS.contains(&arg.as_str()) || matches!(arg.as_str(), "-e" | "--editable");
            continue;
        }
        if arg.contains("://") || super::is_path_like(arg) || arg.ends_with(".whl") {
            continue;
        }
        let (name, pin) = split_requirement(arg);
        if name.is_empty() {
            continue;
        }
        if let Some(version) = pin {
            pins.push(format!("{name}@{version}"));
        }
        packages.push(name.to_string());
    }

    record.packages_affected = packages;
    if !pins.is_empty() {
        record.set(META_VERSIONS, pins);
    }
}

/// `name[extras]<op>version` → (`name`, exact pin).
fn split_requirement(spec: &str) -> (&str, Option<&str>) {
    let end = spec
        .find(|c: char| matches!(c, '[' | '=' | '<' | '>' | '!' | '~' | ';' | ' '))
        .unwrap_or(spec.len());
    let name = &spec[..end];
    let pin = spec[end..]
        .split_once("==")
        .map(|(_, version)| version.trim())
        .filter(|version| !version.is_empty());
    (name, pin)
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    #[serde(default)]
    version: String,
}

fn parse_list_json(output: &[u8]) -> Result<Vec<PackageInfo>> {
    let entries: Vec<ListEntry> =
        serde_json::from_slice(output).context("Failed to parse `pip list` output")?;
    let now = Utc::now();
    Ok(entries
        .into_iter()
        .map(|entry| {
            let mut info = PackageInfo::discovered(TOOL, &entry.name, now);
            info.version = entry.version;
            info
        })
        .collect())
}
