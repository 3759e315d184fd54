//! Go toolchain classifier, plus an inventory of GOBIN executables and the
//! current module's dependencies.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{base_record, find_in_path, flag_value, has_flag, record_packages, run_inventory, ExtractRules, MonitorHandle, ToolParser};
use crate::config::Config;
use crate::models::{ExecutionRecord, PackageInfo, META_ACTION};

pub const TOOL: &str = "go";
/// Inventory tool name for executables found in GOBIN.
pub const BINARY_TOOL: &str = "go-binary";

const RULES: ExtractRules = ExtractRules {
    value_flags: &[
        "-o", "-C", "-p", "-tags", "-ldflags", "-gcflags", "-modfile", "-pkgdir", "-run", "-bench",
        "-count", "-timeout",
    ],
    split_versions: true,
    skip_paths: true,
};

pub struct GoParser {
    monitor: MonitorHandle,
    binary: Option<PathBuf>,
    gopath: PathBuf,
    gobin: PathBuf,
}

impl GoParser {
    pub fn new() -> Self {
        Self {
            monitor: MonitorHandle::new(),
            binary: None,
            gopath: PathBuf::new(),
            gobin: PathBuf::new(),
        }
    }

    pub fn gopath(&self) -> &Path {
        &self.gopath
    }

    pub fn gobin(&self) -> &Path {
        &self.gobin
    }
}

impl Default for GoParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParser for GoParser {
    fn name(&self) -> &str {
        TOOL
    }

    fn binaries(&self) -> &[&str] {
        &["go"]
    }

    fn initialize(&mut self, config: &Config) -> Result<()> {
        let go = &config.tools.go;
        self.gopath = first_non_empty(&[&go.gopath, &env("GOPATH")])
            .map(PathBuf::from)
            .unwrap_or_else(|| home().join("go"));
        self.gobin = first_non_empty(&[&go.gobin, &env("GOBIN")])
            .map(PathBuf::from)
            .unwrap_or_else(|| self.gopath.join("bin"));
        self.binary = find_in_path("go", &config.monitoring.wrapper_dir);
        Ok(())
    }

    fn classify(&self, command: &str, args: &[String]) -> ExecutionRecord {
        let mut record = base_record(TOOL, command, args);
        let Some(subcommand) = args.first() else {
            return record;
        };
        let rest = &args[1..];

        match subcommand.as_str() {
            "get" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "get");
                if has_flag(args, &["-u"]) {
                    record.set("update", true);
                }
            }
            "install" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "install");
            }
            "mod" => {
                if let Some(mod_command) = rest.first() {
                    record.set("mod_command", mod_command.as_str());
                    match mod_command.as_str() {
                        "download" | "tidy" | "vendor" => {
                            record.set(META_ACTION, format!("mod_{mod_command}"));
                        }
                        "init" => {
                            record.set(META_ACTION, "mod_init");
                            if let Some(module) = rest.get(1) {
                                record.set("module", module.as_str());
                            }
                        }
                        _ => {}
                    }
                }
            }
            "build" => {
                record.set(META_ACTION, "build");
                if let Some(output) = flag_value(args, &["-o"]) {
                    record.set("output", output);
                }
            }
            "run" => {
                record.set(META_ACTION, "run");
                if let Some(file) = rest.first().filter(|a| a.ends_with(".go")) {
                    record.set("file", file.as_str());
                }
            }
            "test" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "test");
            }
            "list" => {
                record.set(META_ACTION, "list");
                if has_flag(args, &["-m"]) {
                    record.set("modules", true);
                }
            }
            "clean" => {
                record.set(META_ACTION, "clean");
                if has_flag(args, &["-modcache"]) {
                    record.set("modcache", true);
                }
            }
            "fmt" | "vet" | "env" | "version" => record.set(META_ACTION, subcommand.as_str()),
            _ => {}
        }

        record
    }

    fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    fn installed_packages(&self) -> Result<Vec<PackageInfo>> {
        let mut packages = self.list_modules();
        packages.extend(list_binaries(&self.gobin)?);
        Ok(packages)
    }
}

impl GoParser {
    /// Dependencies of the module in the current directory. Outside a
    /// module, or without a go binary, this is empty.
    fn list_modules(&self) -> Vec<PackageInfo> {
        let Some(binary) = self.binary.as_deref() else {
            return Vec::new();
        };
        match run_inventory(binary, &["list", "-m", "all"]) {
            Ok(output) => parse_module_list(&String::from_utf8_lossy(&output), Utc::now()),
            Err(e) => {
                debug!(error = %e, "no go module inventory");
                Vec::new()
            }
        }
    }
}

/// `go list -m all` prints `path version` per dependency, optionally followed
/// by a `=> replacement`. The main module is printed first, with no version.
fn parse_module_list(text: &str, at: DateTime<Utc>) -> Vec<PackageInfo> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let version = fields.next()?;
            let mut package = PackageInfo::discovered(TOOL, name, at);
            package.version = version.to_string();
            Some(package)
        })
        .collect()
}

/// Executables in `gobin`. A missing directory is an empty inventory.
fn list_binaries(gobin: &Path) -> Result<Vec<PackageInfo>> {
    use std::os::unix::fs::PermissionsExt;

    let entries = match std::fs::read_dir(gobin) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read GOBIN: {}", gobin.display()))
        }
    };

    let mut packages = Vec::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let installed: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        let mut info = PackageInfo::discovered(BINARY_TOOL, &name, installed);
        info.path = Some(entry.path().to_string_lossy().into_owned());
        packages.push(info);
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

fn env(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn first_non_empty<'a>(candidates: &[&'a String]) -> Option<&'a str> {
    candidates.iter().map(|s| s.trim()).find(|s| !s.is_empty())
}
