//! Cargo classifier and `cargo install --list` inventory.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;

use super::{base_record, extract_packages, find_in_path, flag_value, has_flag, record_packages, run_inventory, ExtractRules, MonitorHandle, ToolParser};
use crate::config::Config;
use crate::models::{ExecutionRecord, PackageInfo, META_ACTION, META_VERSIONS};

pub const TOOL: &str = "cargo";

const RULES: ExtractRules = ExtractRules {
    value_flags: &[
        "--version", "--vers", "--git", "--branch", "--tag", "--rev", "--path", "--root",
        "--registry", "--index", "--features", "-F", "--bin", "--example", "--target", "-j",
        "--jobs", "--profile", "--rename", "-p", "--package", "--manifest-path", "--precise",
        "--limit",
    ],
    split_versions: true,
    skip_paths: true,
};

pub struct CargoParser {
    monitor: MonitorHandle,
    binary: Option<PathBuf>,
    cargo_home: PathBuf,
}

impl CargoParser {
    pub fn new() -> Self {
        Self {
            monitor: MonitorHandle::new(),
            binary: None,
            cargo_home: PathBuf::new(),
        }
    }
}

impl Default for CargoParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParser for CargoParser {
    fn name(&self) -> &str {
        TOOL
    }

    fn binaries(&self) -> &[&str] {
        &["cargo"]
    }

    fn initialize(&mut self, config: &Config) -> Result<()> {
        self.cargo_home = std::env::var_os("CARGO_HOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(std::env::var_os("HOME").unwrap_or_default()).join(".cargo")
            });
        self.binary = find_in_path("cargo", &config.monitoring.wrapper_dir)
            .or_else(|| Some(self.cargo_home.join("bin/cargo")).filter(|p| p.is_file()));
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
                if let Some(source) = flag_value(args, &["--git", "--path"]) {
                    record.set("source", source);
                }
                pin_single_version(&mut record, args);
            }
            "uninstall" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "uninstall");
            }
            "add" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "add");
                if has_flag(args, &["--dev", "-D"]) {
                    record.set("dev_dependency", true);
                }
                if has_flag(args, &["--build"]) {
                    record.set("build_dependency", true);
                }
            }
            "remove" | "rm" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "remove");
            }
            "update" => {
                record.packages_affected = package_flag_values(rest);
                record.set(META_ACTION, "update");
                if record.packages_affected.is_empty() {
                    record.set("update_all", true);
                }
            }
            "search" => {
                let (terms, _) = extract_packages(rest, &RULES);
                if !terms.is_empty() {
                    record.set("search_term", terms.join(" "));
                }
            }
            "build" | "b" | "test" | "t" | "run" | "r" | "check" | "c" | "clippy" | "fmt"
            | "doc" | "d" | "publish" => {
                record.set(META_ACTION, canonical_action(subcommand));
                if let Some(package) = flag_value(args, &["-p", "--package"]) {
                    record.packages_affected = vec![package.to_string()];
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
        let binary = self.binary.as_deref().context("cargo not found on PATH")?;
        let output = run_inventory(binary, &["install", "--list"])?;
        let text = String::from_utf8_lossy(&output);
        let bin_dir = self.cargo_home.join("bin");
        Ok(parse_install_list(&text)
            .into_iter()
            .map(|mut package| {
                package.path = Some(bin_dir.to_string_lossy().into_owned());
                package
            })
            .collect())
    }
}

fn canonical_action(subcommand: &str) -> &str {
    match subcommand {
        "b" => "build",
        "t" => "test",
        "r" => "run",
        "c" => "check",
        "d" => "doc",
        other => other,
    }
}

/// `cargo install ripgrep --version 14.1.0` pins the single named crate.
fn pin_single_version(record: &mut ExecutionRecord, args: &[String]) {
    if record.meta(META_VERSIONS).is_some() || record.packages_affected.len() != 1 {
        return;
    }
    if let Some(version) = flag_value(args, &["--version", "--vers"]) {
        let spec = format!("{}@{}", record.packages_affected[0], version);
        record.set(META_VERSIONS, vec![spec]);
    }
}

/// Values of every `-p` / `--package` occurrence.
fn package_flag_values(args: &[String]) -> Vec<String> {
    let mut packages = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-p" || arg == "--package" {
            if let Some(value) = iter.next() {
                packages.push(value.clone());
            }
        } else if let Some(value) = arg.strip_prefix("--package=") {
            packages.push(value.to_string());
        }
    }
    packages
}

/// Header lines look like `ripgrep v14.1.0:` or `tool v0.1.0 (/src/tool):`;
/// indented lines list the installed binaries.
fn parse_install_list(text: &str) -> Vec<PackageInfo> {
    let now = Utc::now();
    text.lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.trim_end().strip_suffix(':'))
        .filter_map(|header| {
            let mut parts = header.split_whitespace();
            let name = parts.next()?;
            let version = parts.next().unwrap_or_default().trim_start_matches('v');
            let mut package = PackageInfo::discovered(TOOL, name, now);
            package.version = version.to_string();
            Some(package)
        })
        .collect()
}
