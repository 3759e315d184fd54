//! # diu
//!
//! A local daemon that records package-manager invocations (Homebrew, npm,
//! Go, pip, Cargo) and keeps queryable usage statistics, so you can tell
//! which installed packages you actually use.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  socket   ┌────────────┐   ┌──────────┐   ┌───────────┐
//! │ wrapper      │──────────▶│            │   │          │   │           │
//! │ scripts      │           │ EventQueue │──▶│ consumer │──▶│ JsonStore │
//! ├──────────────┤  POST     │ (cap 100)  │   │ + enrich │   │  (JSON)   │
//! │ HTTP clients │──────────▶│            │   │          │   │           │
//! └──────────────┘           └────────────┘   └──────────┘   └─────┬─────┘
//!                                                                  │
//!                                  GET /api/v1/*, CLI ◀────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! diu config init              # write ~/.config/diu/config.toml
//! diu daemon start             # run in the foreground
//! diu query --tool npm --last 7d
//! diu packages --unused 30d
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, defaults, duration parsing |
//! | [`models`] | Execution records, package aggregates, the storage document |
//! | [`parsers`] | Per-tool command classifiers and their registry |
//! | [`storage`] | Atomic JSON storage engine |
//! | [`queue`] | Bounded event queue with drop-on-timeout |
//! | [`socket`] | Unix-socket intake |
//! | [`server`] | HTTP API |
//! | [`daemon`] | Ingestion Core lifecycle |
//! | [`pidfile`] | PID file and liveness check |

pub mod config;
pub mod daemon;
pub mod models;
pub mod parsers;
pub mod pidfile;
pub mod queue;
pub mod server;
pub mod socket;
pub mod storage;
