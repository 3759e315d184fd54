//! Homebrew classifier and formula/cask inventory.
//!
//! Formula names may contain `@` (`python@3.11`, `node@20`), so version
//! splitting is disabled for this tool.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;

use super::{base_record, find_in_path, has_flag, record_packages, run_inventory, ExtractRules, MonitorHandle, ToolParser};
use crate::config::Config;
use crate::models::{ExecutionRecord, PackageInfo, META_ACTION};

pub const TOOL: &str = "homebrew";
pub const CASK_TOOL: &str = "homebrew-cask";

const RULES: ExtractRules = ExtractRules {
    value_flags: &[],
    split_versions: false,
    skip_paths: false,
};

const PREFIX_CANDIDATES: &[&str] = &["/opt/homebrew", "/usr/local", "/home/linuxbrew/.linuxbrew"];

pub struct HomebrewParser {
    monitor: MonitorHandle,
    binary: Option<PathBuf>,
    cellar_paths: Vec<PathBuf>,
    caskroom: Option<PathBuf>,
    track_casks: bool,
}

impl HomebrewParser {
    pub fn new() -> Self {
        Self {
            monitor: MonitorHandle::new(),
            binary: None,
            cellar_paths: Vec::new(),
            caskroom: None,
            track_casks: true,
        }
    }

    pub fn cellar_paths(&self) -> &[PathBuf] {
        &self.cellar_paths
    }

    fn formula_path(&self, name: &str) -> Option<String> {
        self.cellar_paths
            .iter()
            .map(|cellar| cellar.join(name))
            .find(|path| path.is_dir())
            .map(|path| path.to_string_lossy().into_owned())
    }
}

impl Default for HomebrewParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParser for HomebrewParser {
    fn name(&self) -> &str {
        TOOL
    }

    fn binaries(&self) -> &[&str] {
        &["brew"]
    }

    fn initialize(&mut self, config: &Config) -> Result<()> {
        let brew = &config.tools.homebrew;
        self.track_casks = brew.track_casks;
        self.binary = find_in_path("brew", &config.monitoring.wrapper_dir);

        let mut home_prefix = PathBuf::from(std::env::var_os("HOME").unwrap_or_default());
        home_prefix.push("homebrew");
        let mut prefixes: Vec<PathBuf> = PREFIX_CANDIDATES.iter().map(PathBuf::from).collect();
        prefixes.push(home_prefix);

        self.cellar_paths = if brew.cellar_paths.is_empty() {
            existing_dirs(&prefixes, "Cellar")
        } else {
            brew.cellar_paths.clone()
        };
        self.caskroom = existing_dirs(&prefixes, "Caskroom").into_iter().next();
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
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "install");
                let kind = if has_flag(args, &["--cask"]) { "cask" } else { "formula" };
                record.set("type", kind);
            }
            "uninstall" | "remove" | "rm" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "uninstall");
            }
            "upgrade" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "upgrade");
                if record.packages_affected.is_empty() {
                    record.set("upgrade_all", true);
                }
            }
            "reinstall" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "reinstall");
            }
            "tap" | "untap" => {
                if let Some(tap) = rest.first() {
                    record.set(subcommand.as_str(), tap.as_str());
                }
            }
            "list" | "ls" => record.set(META_ACTION, "list"),
            "search" => {
                if !rest.is_empty() {
                    record.set("search_term", rest.join(" "));
                }
            }
            "info" => {
                if let Some(formula) = rest.iter().find(|a| !a.starts_with('-')) {
                    record.packages_affected = vec![formula.clone()];
                }
            }
            "services" => {
                if let Some(action) = rest.first() {
                    record.set("service_action", action.as_str());
                    if let Some(service) = rest.get(1) {
                        record.packages_affected = vec![service.clone()];
                    }
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
        let binary = self.binary.as_deref().context("brew not found on PATH")?;
        let output = run_inventory(binary, &["info", "--json=v2", "--installed"])?;
        let mut packages = parse_info_json(&output, self.track_casks)?;
        for package in packages.iter_mut().filter(|p| p.tool == TOOL) {
            package.path = self.formula_path(&package.name);
        }
        if self.track_casks {
            if let Some(caskroom) = &self.caskroom {
                for package in packages.iter_mut().filter(|p| p.tool == CASK_TOOL) {
                    let path = caskroom.join(&package.name);
                    if path.is_dir() {
                        package.path = Some(path.to_string_lossy().into_owned());
                    }
                }
            }
        }
        Ok(packages)
    }
}

fn existing_dirs(prefixes: &[PathBuf], leaf: &str) -> Vec<PathBuf> {
    prefixes
        .iter()
        .map(|prefix| prefix.join(leaf))
        .filter(|path| path.is_dir())
        .collect()
}

#[derive(Deserialize)]
struct InfoOutput {
    #[serde(default)]
    formulae: Vec<FormulaInfo>,
    #[serde(default)]
    casks: Vec<CaskInfo>,
}

#[derive(Deserialize)]
struct FormulaInfo {
    name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    installed: Vec<InstalledKeg>,
}

#[derive(Deserialize)]
struct InstalledKeg {
    #[serde(default)]
    version: String,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Deserialize)]
struct CaskInfo {
    token: String,
    #[serde(default)]
    installed: Option<String>,
    #[serde(default)]
    installed_time: Option<i64>,
}

fn from_unix(secs: Option<i64>) -> DateTime<Utc> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(Utc::now)
}

fn parse_info_json(output: &[u8], include_casks: bool) -> Result<Vec<PackageInfo>> {
    let info: InfoOutput =
        serde_json::from_slice(output).context("Failed to parse `brew info` output")?;

    let mut packages = Vec::new();
    for formula in info.formulae {
        let keg = formula.installed.last();
        let mut package = PackageInfo::discovered(TOOL, &formula.name, from_unix(keg.and_then(|k| k.time)));
        package.version = keg.map(|k| k.version.clone()).unwrap_or_default();
        package.dependencies = formula.dependencies;
        packages.push(package);
    }
    if include_casks {
        for cask in info.casks {
            let mut package = PackageInfo::discovered(CASK_TOOL, &cask.token, from_unix(cask.installed_time));
            package.version = cask.installed.unwrap_or_default();
            packages.push(package);
        }
    }
    Ok(packages)
}
