//! Per-tool command classifiers.
//!
//! A [`ToolParser`] turns a raw command line into an [`ExecutionRecord`]
//! annotated with the packages it touched and tool-specific metadata. The
//! [`ParserRegistry`] holds one parser per enabled tool and is what the daemon
//! consults for every incoming record.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 ParserRegistry                  │
//! │ ┌────────┐ ┌─────┐ ┌────┐ ┌─────┐ ┌───────┐     │
//! │ │homebrew│ │ npm │ │ go │ │ pip │ │ cargo │ ... │
//! │ └────────┘ └─────┘ └────┘ └─────┘ └───────┘     │
//! └──────────────┬──────────────────────────────────┘
//!                ▼
//!        enrich(record) → consumer → JsonStore::append
//! ```
//!
//! Classification never fails: unknown subcommands produce a record that
//! carries only the raw `subcommand` metadata.

pub mod cargo;
pub mod go;
pub mod homebrew;
pub mod npm;
pub mod pip;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{split_version, ExecutionRecord, PackageInfo, META_SUBCOMMAND, META_VERSIONS};
use crate::queue::EventQueue;

// ═══════════════════════════════════════════════════════════════════════
// Parser Trait
// ═══════════════════════════════════════════════════════════════════════

/// Capability contract for one tool.
///
/// Implementations are stateless apart from discovery results captured in
/// [`initialize`](ToolParser::initialize) and the [`MonitorHandle`] that
/// tracks whether the parser is running.
pub trait ToolParser: Send + Sync {
    /// Canonical tool name, stored on every record this parser classifies.
    fn name(&self) -> &str;

    /// Executable names this parser answers to.
    fn binaries(&self) -> &[&str];

    /// Resolve tool-specific paths. An error keeps the parser out of the
    /// registry.
    fn initialize(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    /// Classify `command` / `args`, where `args[0]` is the subcommand.
    fn classify(&self, command: &str, args: &[String]) -> ExecutionRecord;

    fn monitor(&self) -> &MonitorHandle;

    /// Begin monitoring. Built-in parsers are fed by wrapper scripts through
    /// the socket, so they only record the running state; a parser that
    /// watches something itself spawns its task here and submits to `queue`.
    fn start(&self, shutdown: &CancellationToken, queue: &EventQueue) -> Result<()> {
        self.monitor().start(shutdown, queue);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.monitor().stop();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.monitor().is_active()
    }

    /// Live inventory of packages installed through this tool.
    fn installed_packages(&self) -> Result<Vec<PackageInfo>> {
        Ok(Vec::new())
    }
}

/// Running state of one parser: a child of the daemon's shutdown token and
/// the queue it may submit to.
#[derive(Debug, Default)]
pub struct MonitorHandle {
    running: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    token: CancellationToken,
    queue: EventQueue,
}

impl MonitorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the parser as running and return its cancellation token.
    /// Starting an already running handle replaces the previous token.
    pub fn start(&self, shutdown: &CancellationToken, queue: &EventQueue) -> CancellationToken {
        let token = shutdown.child_token();
        let previous = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Running {
                token: token.clone(),
                queue: queue.clone(),
            });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        token
    }

    /// Returns `false` when the handle was not running.
    pub fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(running) => {
                running.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.token.is_cancelled())
    }

    pub fn queue(&self) -> Option<EventQueue> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.queue.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Named set of parsers, at most one per tool name.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn ToolParser>>,
}

impl ParserRegistry {
    /// Create an empty parser registry.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Built-in parser for `name`, uninitialized.
    pub fn builtin(name: &str) -> Option<Box<dyn ToolParser>> {
        let parser: Box<dyn ToolParser> = match name {
            homebrew::TOOL => Box::new(homebrew::HomebrewParser::new()),
            npm::TOOL => Box::new(npm::NpmParser::new()),
            go::TOOL => Box::new(go::GoParser::new()),
            pip::TOOL => Box::new(pip::PipParser::new()),
            cargo::TOOL => Box::new(cargo::CargoParser::new()),
            _ => return None,
        };
        Some(parser)
    }

    /// Registry holding every tool in `monitoring.enabled_tools` that
    /// initializes successfully. Unknown or failing tools are logged and
    /// skipped.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();

        for name in &config.monitoring.enabled_tools {
            let Some(mut parser) = Self::builtin(name) else {
                warn!(tool = %name, "unknown tool in monitoring.enabled_tools, skipping");
                continue;
            };
            match parser.initialize(config) {
                Ok(()) => {
                    debug!(tool = %name, "parser initialized");
                    registry.register(parser);
                }
                Err(e) => warn!(tool = %name, error = %e, "parser unavailable, skipping"),
            }
        }

        info!(parsers = ?registry.names(), "parser registry ready");
        registry
    }

    /// Register a parser, replacing any parser with the same name.
    pub fn register(&mut self, parser: Box<dyn ToolParser>) {
        self.parsers.retain(|p| p.name() != parser.name());
        self.parsers.push(parser);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolParser> {
        self.parsers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// Find a parser by tool name or by one of its binary names.
    pub fn lookup(&self, tool: &str) -> Option<&dyn ToolParser> {
        self.get(tool).or_else(|| {
            self.parsers
                .iter()
                .find(|p| p.binaries().contains(&tool))
                .map(|p| p.as_ref())
        })
    }

    pub fn parsers(&self) -> &[Box<dyn ToolParser>] {
        &self.parsers
    }

    pub fn names(&self) -> Vec<&str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Start every parser. A parser that fails to start is logged and the
    /// rest still start.
    pub fn start_all(&self, shutdown: &CancellationToken, queue: &EventQueue) {
        for parser in &self.parsers {
            if let Err(e) = parser.start(shutdown, queue) {
                warn!(tool = parser.name(), error = %e, "failed to start parser");
            }
        }
    }

    pub fn stop_all(&self) {
        for parser in &self.parsers {
            if let Err(e) = parser.stop() {
                warn!(tool = parser.name(), error = %e, "failed to stop parser");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.parsers.iter().filter(|p| p.is_active()).count()
    }

    /// Merge the classification of `record` into it.
    ///
    /// The tool name is normalized to the parser's name. Parser packages are
    /// used only when the producer sent none, and parser metadata never
    /// overwrites a key the producer supplied. Records for unknown tools
    /// pass through unchanged.
    pub fn enrich(&self, mut record: ExecutionRecord) -> ExecutionRecord {
        let Some(parser) = self.lookup(&record.tool) else {
            return record;
        };

        let args = record.effective_args();
        let classified = parser.classify(&record.command, &args);

        record.tool = parser.name().to_string();
        if record.args.is_empty() {
            record.args = args;
        }
        if record.packages_affected.is_empty() {
            record.packages_affected = classified.packages_affected;
        }
        for (key, value) in classified.metadata {
            record.metadata.entry(key).or_insert(value);
        }
        record
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════

/// Record skeleton with the raw subcommand filled in.
pub(crate) fn base_record(tool: &str, command: &str, args: &[String]) -> ExecutionRecord {
    let mut record = ExecutionRecord::new(tool, command, args);
    if let Some(subcommand) = args.first() {
        record.set(META_SUBCOMMAND, subcommand.as_str());
    }
    record
}

pub(crate) fn has_flag(args: &[String], flags: &[&str]) -> bool {
    args.iter().any(|arg| flags.contains(&arg.as_str()))
}

/// Value following the first occurrence of any of `flags`, also accepting
/// the `--flag=value` form.
pub(crate) fn flag_value<'a>(args: &'a [String], flags: &[&str]) -> Option<&'a str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if flags.contains(&arg.as_str()) {
            return iter.next().map(String::as_str);
        }
        for flag in flags {
            if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
                return Some(value);
            }
        }
    }
    None
}

/// How an ecosystem spells package operands.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtractRules {
    /// Flags that consume the following token.
    pub value_flags: &'static [&'static str],
    /// Split `name@version`, keeping a leading scope `@`.
    pub split_versions: bool,
    /// Treat `.`, `./...` and relative paths as non-packages.
    pub skip_paths: bool,
}

/// Package operands in `args`, plus the `name@version` specs that carried
/// an explicit version.
pub(crate) fn extract_packages(args: &[String], rules: &ExtractRules) -> (Vec<String>, Vec<String>) {
    let mut packages = Vec::new();
    let mut versions = Vec::new();
    let mut skip_next = false;

    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with('-') {
            skip_next = rules.value_flags.contains(&arg.as_str());
            continue;
        }
        if rules.skip_paths && is_path_like(arg) {
            continue;
        }
        if rules.split_versions {
            let (name, version) = split_version(arg);
            if name.is_empty() {
                continue;
            }
            if version.is_some() {
                versions.push(arg.clone());
            }
            packages.push(name.to_string());
        } else {
            packages.push(arg.clone());
        }
    }

    (packages, versions)
}

/// Set `packages_affected` and the `versions` metadata from `args`.
pub(crate) fn record_packages(record: &mut ExecutionRecord, args: &[String], rules: &ExtractRules) {
    let (packages, versions) = extract_packages(args, rules);
    record.packages_affected = packages;
    if !versions.is_empty() {
        record.set(META_VERSIONS, versions);
    }
}

pub(crate) fn is_path_like(arg: &str) -> bool {
    matches!(arg, "." | ".." | "...")
        || arg.starts_with("./")
        || arg.starts_with("../")
        || arg.starts_with('/')
}

/// Locate `binary` on `PATH`, ignoring `skip_dir` so that a wrapper script
/// is never mistaken for the real tool.
pub(crate) fn find_in_path(binary: &str, skip_dir: &Path) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in_dirs(binary, std::env::split_paths(&path), skip_dir)
}

fn find_in_dirs(
    binary: &str,
    dirs: impl IntoIterator<Item = PathBuf>,
    skip_dir: &Path,
) -> Option<PathBuf> {
    dirs.into_iter()
        .filter(|dir| dir != skip_dir)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Run an inventory command and return its stdout. Some tools exit
/// non-zero while still printing usable output, so stdout wins when present.
pub(crate) fn run_inventory(binary: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", binary.display()))?;
    if output.stdout.is_empty() {
        bail!(
            "{} {} produced no output: {}",
            binary.display(),
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

#[cfg(test)]
pub(crate) fn args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetaValue;
    use std::time::Duration;

    struct FakeParser {
        monitor: MonitorHandle,
    }

    impl ToolParser for FakeParser {
        fn name(&self) -> &str {
            "fake"
        }
        fn binaries(&self) -> &[&str] {
            &["fk"]
        }
        fn classify(&self, command: &str, args: &[String]) -> ExecutionRecord {
            let mut record = base_record("fake", command, args);
            record.packages_affected = args.iter().skip(1).cloned().collect();
            record.set("action", "install");
            record
        }
        fn monitor(&self) -> &MonitorHandle {
            &self.monitor
        }
    }

    fn fake() -> Box<dyn ToolParser> {
        Box::new(FakeParser {
            monitor: MonitorHandle::new(),
        })
    }

    #[test]
    fn test_lookup_by_name_and_binary() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());
        registry.register(ParserRegistry::builtin("homebrew").unwrap());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("fake").unwrap().name(), "fake");
        assert_eq!(registry.lookup("fk").unwrap().name(), "fake");
        assert_eq!(registry.lookup("brew").unwrap().name(), "homebrew");
        assert!(registry.lookup("apt").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());
        registry.register(fake());
        assert_eq!(registry.names(), vec!["fake"]);
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(ParserRegistry::builtin("apt").is_none());
    }

    #[test]
    fn test_from_config_skips_unknown_tools() {
        let mut config = Config::default();
        config.monitoring.enabled_tools = vec!["homebrew".into(), "apt".into(), "go".into()];
        let registry = ParserRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["homebrew", "go"]);
    }

    #[test]
    fn test_enrich_respects_producer_fields() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());

        let mut record = ExecutionRecord::new("fk", "fk install a b", &args("install a b"));
        record.set("action", "custom");
        let enriched = registry.enrich(record);
        assert_eq!(enriched.tool, "fake");
        assert_eq!(enriched.packages_affected, vec!["a", "b"]);
        assert_eq!(enriched.meta("action"), Some(&MetaValue::Text("custom".into())));
        assert_eq!(enriched.meta("subcommand"), Some(&MetaValue::Text("install".into())));

        let mut record = ExecutionRecord::new("fake", "fk install a", &args("install a"));
        record.packages_affected = vec!["given".into()];
        let enriched = registry.enrich(record);
        assert_eq!(enriched.packages_affected, vec!["given"]);
    }

    #[test]
    fn test_enrich_derives_args_from_command() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());
        let enriched = registry.enrich(ExecutionRecord::new("fake", "fk install z", &[]));
        assert_eq!(enriched.args, vec!["install", "z"]);
        assert_eq!(enriched.packages_affected, vec!["z"]);
    }

    #[test]
    fn test_enrich_passes_unknown_tool_through() {
        let registry = ParserRegistry::new();
        let record = ExecutionRecord::new("apt", "apt install vim", &args("install vim"));
        let enriched = registry.enrich(record.clone());
        assert_eq!(enriched, record);
    }

    #[tokio::test]
    async fn test_start_stop_tracks_active_count() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());
        registry.register(ParserRegistry::builtin("go").unwrap());
        let (queue, _rx) = EventQueue::bounded(4, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        assert_eq!(registry.active_count(), 0);
        registry.start_all(&shutdown, &queue);
        assert_eq!(registry.active_count(), 2);
        assert!(registry.get("fake").unwrap().monitor().queue().is_some());

        registry.stop_all();
        assert_eq!(registry.active_count(), 0);
        registry.stop_all();
    }

    #[tokio::test]
    async fn test_shutdown_token_deactivates_monitors() {
        let mut registry = ParserRegistry::new();
        registry.register(fake());
        let (queue, _rx) = EventQueue::bounded(4, Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        registry.start_all(&shutdown, &queue);

        shutdown.cancel();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_extract_packages_rules() {
        let rules = ExtractRules {
            value_flags: &["--registry"],
            split_versions: true,
            skip_paths: true,
        };
        let (packages, versions) = extract_packages(
            &args("--registry https://r.example lodash@4.17.21 ./local @types/node@20 -D chalk"),
            &rules,
        );
        assert_eq!(packages, vec!["lodash", "@types/node", "chalk"]);
        assert_eq!(versions, vec!["lodash@4.17.21", "@types/node@20"]);
    }

    #[test]
    fn test_flag_value_forms() {
        assert_eq!(flag_value(&args("build -o bin/app ."), &["-o"]), Some("bin/app"));
        assert_eq!(flag_value(&args("build -o=bin/app"), &["-o"]), Some("bin/app"));
        assert_eq!(flag_value(&args("build -o"), &["-o"]), None);
        assert_eq!(flag_value(&args("build"), &["-o"]), None);
    }

    #[test]
    fn test_path_like_tokens() {
        for token in [".", "..", "...", "./...", "../x", "/abs/path"] {
            assert!(is_path_like(token), "{token}");
        }
        assert!(!is_path_like("github.com/x/y"));
        assert!(!is_path_like("lodash"));
    }

    #[test]
    fn test_find_in_dirs_skips_wrapper_dir() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let wrappers = tmp.path().join("wrappers");
        let real = tmp.path().join("bin");
        for dir in [&wrappers, &real] {
            std::fs::create_dir_all(dir).unwrap();
            let script = dir.join("tool");
            std::fs::write(&script, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(tmp.path().join("bin/plain"), "").unwrap();

        let dirs = vec![wrappers.clone(), real.clone()];
        assert_eq!(
            find_in_dirs("tool", dirs.clone(), &wrappers),
            Some(real.join("tool"))
        );
        assert!(find_in_dirs("plain", dirs.clone(), &wrappers).is_none());
        assert!(find_in_dirs("missing", dirs, &wrappers).is_none());
    }
}
