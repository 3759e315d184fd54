//! npm classifier and global-package inventory.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{base_record, has_flag, record_packages, run_inventory, ExtractRules, MonitorHandle, ToolParser};
use crate::config::Config;
use crate::models::{ExecutionRecord, PackageInfo, META_ACTION};

pub const TOOL: &str = "npm";

const RULES: ExtractRules = ExtractRules {
    value_flags: &["--registry", "--scope", "--tag"],
    split_versions: true,
    skip_paths: false,
};

pub struct NpmParser {
    monitor: MonitorHandle,
    binary: Option<PathBuf>,
    global_only: bool,
}

impl NpmParser {
    pub fn new() -> Self {
        Self {
            monitor: MonitorHandle::new(),
            binary: None,
            global_only: true,
        }
    }

    fn list(&self, global: bool) -> Result<Vec<PackageInfo>> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| anyhow!("npm parser is not initialized"))?;
        let mut args = vec!["list", "--depth=0", "--json"];
        if global {
            args.insert(1, "-g");
        }
        let output = run_inventory(binary, &args)?;
        parse_list_json(&output)
    }
}

impl Default for NpmParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParser for NpmParser {
    fn name(&self) -> &str {
        TOOL
    }

    fn binaries(&self) -> &[&str] {
        &["npm"]
    }

    fn initialize(&mut self, config: &Config) -> Result<()> {
        let binary = super::find_in_path("npm", &config.monitoring.wrapper_dir)
            .context("npm not found on PATH")?;
        self.binary = Some(binary);
        self.global_only = config.tools.npm.track_global_only;
        Ok(())
    }

    fn classify(&self, command: &str, args: &[String]) -> ExecutionRecord {
        let mut record = base_record(TOOL, command, args);
        let Some(subcommand) = args.first() else {
            return record;
        };
        let rest = &args[1..];

        record.set("global", has_flag(args, &["-g", "--global"]));

        match subcommand.as_str() {
            "install" | "i" | "add" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "install");
                if has_flag(args, &["--save-dev", "-D"]) {
                    record.set("dev_dependency", true);
                }
                if has_flag(args, &["--save-optional", "-O"]) {
                    record.set("optional_dependency", true);
                }
            }
            "uninstall" | "remove" | "rm" | "r" | "un" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "uninstall");
            }
            "update" | "up" | "upgrade" => {
                record_packages(&mut record, rest, &RULES);
                record.set(META_ACTION, "update");
                if record.packages_affected.is_empty() {
                    record.set("update_all", true);
                }
            }
            "list" | "ls" | "la" | "ll" => {
                record.set(META_ACTION, "list");
                if let Some(depth) = extract_depth(args) {
                    record.set("depth", depth);
                }
            }
            "search" | "s" | "se" | "find" => {
                if !rest.is_empty() {
                    record.set("search_term", rest.join(" "));
                }
            }
            "run" | "run-script" => {
                if let Some(script) = rest.first() {
                    record.set("script", script.as_str());
                }
            }
            "test" | "t" | "tst" => record.set(META_ACTION, "test"),
            "start" => record.set(META_ACTION, "start"),
            "build" => record.set(META_ACTION, "build"),
            "publish" | "link" | "ln" => {
                let action = if subcommand == "publish" { "publish" } else { "link" };
                record.set(META_ACTION, action);
                if let Some(target) = rest.first().filter(|a| !a.starts_with('-')) {
                    record.packages_affected = vec![target.clone()];
                }
            }
            "audit" => {
                record.set(META_ACTION, "audit");
                if has_flag(args, &["--fix"]) || rest.first().is_some_and(|a| a == "fix") {
                    record.set("fix", true);
                }
            }
            "fund" => record.set(META_ACTION, "fund"),
            "outdated" => record.set(META_ACTION, "outdated"),
            _ => {}
        }

        record
    }

    fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    fn installed_packages(&self) -> Result<Vec<PackageInfo>> {
        let mut packages = self.list(true)?;
        if !self.global_only {
            packages.extend(self.list(false)?);
        }
        Ok(packages)
    }
}

/// `--depth N` or `--depth=N`.
fn extract_depth(args: &[String]) -> Option<i64> {
    super::flag_value(args, &["--depth"]).and_then(|v| v.parse().ok())
}

#[derive(Deserialize)]
struct ListOutput {
    #[serde(default)]
    dependencies: BTreeMap<String, ListEntry>,
}

#[derive(Deserialize)]
struct ListEntry {
    #[serde(default)]
    version: String,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
}

fn parse_list_json(output: &[u8]) -> Result<Vec<PackageInfo>> {
    let list: ListOutput =
        serde_json::from_slice(output).context("Failed to parse `npm list` output")?;
    let now = Utc::now();
    Ok(list
        .dependencies
        .into_iter()
        .map(|(name, entry)| {
            let mut info = PackageInfo::discovered(TOOL, &name, now);
            info.version = entry.version;
            info.dependencies = entry.dependencies.into_keys().collect();
            info
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetaValue, META_SUBCOMMAND};
    use crate::parsers::args;

    fn classify(line: &str) -> ExecutionRecord {
        NpmParser::new().classify(&format!("npm {line}"), &args(line))
    }

    #[test]
    fn test_install_variants() {
        let cases: &[(&str, &[&str])] = &[
            ("install express", &["express"]),
            ("i lodash@4.17.21", &["lodash"]),
            ("add @types/node@20.1.0", &["@types/node"]),
            ("install -g typescript", &["typescript"]),
            ("install --registry https://r.example.com left-pad", &["left-pad"]),
            ("install --save-dev jest eslint", &["jest", "eslint"]),
            ("install", &[]),
        ];
        for (line, expected) in cases {
            let record = classify(line);
            assert_eq!(record.packages_affected, *expected, "npm {line}");
            assert_eq!(record.meta(META_ACTION), Some(&MetaValue::Text("install".into())));
        }
    }

    #[test]
    fn test_install_flags_metadata() {
        let record = classify("install -g -D typescript@5.4.0");
        assert_eq!(record.meta("global"), Some(&MetaValue::Bool(true)));
        assert_eq!(record.meta("dev_dependency"), Some(&MetaValue::Bool(true)));
        assert_eq!(record.requested_version("typescript"), Some("5.4.0"));

        let record = classify("install --save-optional fsevents");
        assert_eq!(record.meta("global"), Some(&MetaValue::Bool(false)));
        assert_eq!(record.meta("optional_dependency"), Some(&MetaValue::Bool(true)));
    }

    #[test]
    fn test_uninstall_aliases() {
        for sub in ["uninstall", "remove", "rm", "r", "un"] {
            let record = classify(&format!("{sub} express"));
            assert_eq!(record.packages_affected, vec!["express"], "{sub}");
            assert_eq!(record.meta(META_ACTION), Some(&MetaValue::Text("uninstall".into())));
        }
    }

    #[test]
    fn test_update_all_when_no_packages() {
        let record = classify("update");
        assert_eq!(record.meta("update_all"), Some(&MetaValue::Bool(true)));
        let record = classify("up react");
        assert_eq!(record.packages_affected, vec!["react"]);
        assert!(record.meta("update_all").is_none());
    }

    #[test]
    fn test_list_depth() {
        let record = classify("ls --depth 2");
        assert_eq!(record.meta("depth"), Some(&MetaValue::Int(2)));
        let record = classify("list --depth=0");
        assert_eq!(record.meta("depth"), Some(&MetaValue::Int(0)));
        assert!(classify("ls").meta("depth").is_none());
    }

    #[test]
    fn test_misc_subcommands() {
        let record = classify("search react hooks");
        assert_eq!(record.meta("search_term"), Some(&MetaValue::Text("react hooks".into())));

        let record = classify("run build:prod");
        assert_eq!(record.meta("script"), Some(&MetaValue::Text("build:prod".into())));

        let record = classify("publish my-lib");
        assert_eq!(record.packages_affected, vec!["my-lib"]);

        let record = classify("link --global");
        assert!(record.packages_affected.is_empty());

        let record = classify("audit --fix");
        assert_eq!(record.meta("fix"), Some(&MetaValue::Bool(true)));

        for (sub, action) in [("t", "test"), ("start", "start"), ("outdated", "outdated"), ("fund", "fund")] {
            assert_eq!(classify(sub).meta(META_ACTION), Some(&MetaValue::Text(action.into())));
        }
    }

    #[test]
    fn test_empty_and_unknown() {
        let record = classify("");
        assert!(record.metadata.is_empty());
        assert!(record.packages_affected.is_empty());

        let record = classify("doctor");
        assert_eq!(record.meta(META_SUBCOMMAND), Some(&MetaValue::Text("doctor".into())));
        assert!(record.meta(META_ACTION).is_none());
    }

    #[test]
    fn test_parse_list_json() {
        let output = br#"{
            "name": "lib",
            "dependencies": {
                "typescript": {"version": "5.4.5", "overridden": false},
                "npm": {"version": "10.5.0", "dependencies": {"abbrev": {}}}
            }
        }"#;
        let packages = parse_list_json(output).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "npm");
        assert_eq!(packages[0].dependencies, vec!["abbrev"]);
        assert_eq!(packages[1].version, "5.4.5");
        assert!(packages.iter().all(|p| p.tool == "npm"));
    }

    #[test]
    fn test_initialize_skips_wrapper_dir() {
        let mut config = Config::default();
        config.monitoring.wrapper_dir = PathBuf::from("/nonexistent-diu-wrappers");
        let mut parser = NpmParser::new();
        match parser.initialize(&config) {
            Ok(()) => assert!(parser.binary.is_some()),
            Err(e) => assert!(e.to_string().contains("npm not found")),
        }
    }
}
