//! # diu CLI
//!
//! The `diu` binary runs the daemon in the foreground and reads the storage
//! document directly for queries. Every command prints pretty JSON on stdout;
//! logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! diu --config ~/.config/diu/config.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `diu daemon start` | Run the daemon in the foreground |
//! | `diu daemon stop` | Send SIGTERM to the running daemon |
//! | `diu daemon status` | Report whether the daemon is running |
//! | `diu query` | Filter recorded executions |
//! | `diu stats` | Aggregate statistics |
//! | `diu packages` | Tracked packages, unused packages, or the live inventory |
//! | `diu cleanup` | Drop executions older than the retention window |
//! | `diu backup` / `diu restore <path>` | Snapshot or replace the storage document |
//! | `diu config init` / `diu config show` | Write or print the configuration |

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use diu::config::{self, Config};
use diu::daemon::Daemon;
use diu::models::{parse_timestamp, QueryFilter};
use diu::parsers::ParserRegistry;
use diu::pidfile;
use diu::storage::JsonStore;

/// diu ("do I use") records package-manager invocations and reports which
/// installed packages are actually used.
#[derive(Parser)]
#[command(name = "diu", version, about)]
struct Cli {
    /// Path to the configuration file (TOML).
    ///
    /// Defaults to `~/.config/diu/config.toml`. A missing file means
    /// built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control the background daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Query recorded executions, newest first.
    Query {
        /// Only executions of this tool (e.g. `npm`, `homebrew`).
        #[arg(long)]
        tool: Option<String>,

        /// Only executions that touched this package.
        #[arg(long)]
        package: Option<String>,

        /// Relative window such as `24h`, `7d`, `2w`. Ignored when `--since` is set.
        #[arg(long)]
        last: Option<String>,

        /// Inclusive lower bound (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Exclusive upper bound (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of records. `0` means no limit.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show aggregate statistics.
    Stats,

    /// List packages.
    Packages {
        #[arg(long)]
        tool: Option<String>,

        /// Only packages not used within this window (e.g. `30d`).
        #[arg(long, conflicts_with = "installed")]
        unused: Option<String>,

        /// Ask the package managers for what is installed right now instead
        /// of reading tracked usage.
        #[arg(long)]
        installed: bool,
    },

    /// Remove executions older than a cutoff.
    ///
    /// Package aggregates are kept. Refused while the daemon is running.
    Cleanup {
        /// Defaults to `storage.retention_days`.
        #[arg(long)]
        older_than: Option<String>,
    },

    /// Write a timestamped copy of the storage document.
    Backup,

    /// Replace the storage document with a backup. Refused while the daemon
    /// is running.
    Restore { path: PathBuf },

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the daemon in the foreground until SIGINT or SIGTERM.
    Start,
    /// Ask the running daemon to shut down and wait for it to exit.
    Stop,
    /// Report whether the daemon is running.
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        init_logging("warn");
        return init_config(&config_path, *force);
    }

    let cfg = config::load_config(&config_path)?;

    match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start => {
                init_logging(&cfg.daemon.log_level);
                let mut daemon = Daemon::new(cfg)?;
                daemon.run().await?;
            }
            DaemonAction::Stop => {
                init_logging("warn");
                let pid = pidfile::signal_stop(&cfg.daemon.pid_file)?;
                let deadline = cfg.shutdown_grace() + Duration::from_secs(5);
                let stopped = wait_for_exit(pid, deadline).await;
                print_json(&json!({ "pid": pid, "stopped": stopped }))?;
            }
            DaemonAction::Status => {
                init_logging("warn");
                let pid = pidfile::running_pid(&cfg.daemon.pid_file)?;
                print_json(&json!({ "running": pid.is_some(), "pid": pid }))?;
            }
        },

        Commands::Query {
            tool,
            package,
            last,
            since,
            until,
            limit,
        } => {
            init_logging("warn");
            let since = match (since, last) {
                (Some(since), _) => Some(parse_timestamp(&since).map_err(anyhow::Error::msg)?),
                (None, Some(last)) => Some(config::window_start(Utc::now(), &last)?),
                (None, None) => None,
            };
            let until = until
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = QueryFilter {
                tool,
                package,
                since,
                until,
                limit: Some(limit),
            };
            let store = open_store(&cfg)?;
            print_json(&store.query(&filter))?;
        }

        Commands::Stats => {
            init_logging("warn");
            let store = open_store(&cfg)?;
            // The running daemon owns the file; it refreshes the day on stop.
            if pidfile::running_pid(&cfg.daemon.pid_file)?.is_none() {
                store.recompute_most_active_day()?;
            }
            print_json(&store.statistics())?;
        }

        Commands::Packages {
            tool,
            unused,
            installed,
        } => {
            init_logging("warn");
            if installed {
                let registry = ParserRegistry::from_config(&cfg);
                let mut packages = Vec::new();
                for parser in registry.parsers() {
                    if tool.as_deref().is_some_and(|t| t != parser.name()) {
                        continue;
                    }
                    match parser.installed_packages() {
                        Ok(found) => packages.extend(found),
                        Err(e) => tracing::warn!(tool = parser.name(), error = %e, "inventory unavailable"),
                    }
                }
                print_json(&packages)?;
            } else {
                let store = open_store(&cfg)?;
                let mut packages = store.get_packages(tool.as_deref());
                if let Some(unused) = unused {
                    let cutoff = config::window_start(Utc::now(), &unused)?;
                    packages.retain(|p| p.last_used < cutoff);
                }
                print_json(&packages)?;
            }
        }

        Commands::Cleanup { older_than } => {
            init_logging("warn");
            refuse_while_running(&cfg, "cleanup")?;
            let now = Utc::now();
            let before = match older_than {
                Some(spec) => config::window_start(now, &spec)?,
                None => config::checked_window_start(now, cfg.retention())
                    .context("storage.retention_days is too large")?,
            };
            let store = open_store(&cfg)?;
            let removed = store.cleanup(before)?;
            print_json(&json!({ "removed": removed, "before": before }))?;
        }

        Commands::Backup => {
            init_logging("warn");
            let store = open_store(&cfg)?;
            let path = store.backup()?;
            print_json(&json!({ "backup": path }))?;
        }

        Commands::Restore { path } => {
            init_logging("warn");
            refuse_while_running(&cfg, "restore")?;
            let store = open_store(&cfg)?;
            store.restore(&path)?;
            print_json(&json!({ "restored": path, "executions": store.execution_count() }))?;
        }

        Commands::Config {
            action: ConfigAction::Show,
        } => print_json(&cfg)?,

        // Handled before the config is loaded.
        Commands::Config {
            action: ConfigAction::Init { .. },
        } => {}
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("diu={level},tower_http=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save_to(path)?;
    print_json(&json!({ "config": path }))
}

fn open_store(cfg: &Config) -> Result<JsonStore> {
    JsonStore::open(&cfg.storage.json_file).with_context(|| {
        format!(
            "Failed to open storage: {}",
            cfg.storage.json_file.display()
        )
    })
}

fn refuse_while_running(cfg: &Config, command: &str) -> Result<()> {
    if let Some(pid) = pidfile::running_pid(&cfg.daemon.pid_file)? {
        bail!("{command} rewrites the storage document; stop the daemon (PID {pid}) first");
    }
    Ok(())
}

async fn wait_for_exit(pid: i32, deadline: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if !pidfile::is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pidfile::is_alive(pid)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{out}");
    Ok(())
}
