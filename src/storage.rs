//! JSON-file Storage Engine.
//!
//! The whole [`StorageDocument`] lives in memory behind one `RwLock` and is
//! rewritten to disk on every mutation. Writes go to `<file>.tmp`, are
//! fsynced, and are renamed over the live file, so the live file is always a
//! complete document. A mutation is applied to a copy of the document and
//! only swapped in after the rename succeeds; a failed write leaves both the
//! file and the in-memory state as they were.
//!
//! Every rewrite is O(stored executions). That is fine for one user's tool
//! history and is the reason there is no incremental on-disk format.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::models::{ExecutionRecord, PackageInfo, QueryFilter, Statistics, StorageDocument};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a valid storage document: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode storage document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid execution record: {0}")]
    Invalid(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Owner of the single live [`StorageDocument`].
pub struct JsonStore {
    path: PathBuf,
    doc: RwLock<StorageDocument>,
}

impl JsonStore {
    /// Load the document at `path`, or create and persist an empty one.
    ///
    /// A leftover `<file>.tmp` from an interrupted write is ignored; the live
    /// file is authoritative.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();

        let doc = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<StorageDocument>(&bytes).map_err(|source| {
                StorageError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|source| StorageError::Write {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let doc = StorageDocument::new(local_hostname(), local_user());
                write_atomic(&path, &doc)?;
                info!(path = %path.display(), "created new storage document");
                doc
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };

        debug!(
            path = %path.display(),
            executions = doc.executions.len(),
            "storage opened"
        );
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `record`, assigning an ID when it has none. Returns the ID.
    pub fn append(&self, mut record: ExecutionRecord) -> StorageResult<String> {
        record.validate().map_err(StorageError::Invalid)?;
        if record.id.is_empty() {
            record.id = generate_id(Utc::now());
        }
        let id = record.id.clone();

        self.mutate(|doc| {
            let stats = &mut doc.statistics;
            stats.total_executions += 1;
            *stats.execution_frequency.entry(record.tool.clone()).or_insert(0) += 1;
            if !stats.tools_used.contains(&record.tool) {
                stats.tools_used.push(record.tool.clone());
            }

            let tool_packages = doc.packages.entry(record.tool.clone()).or_default();
            let mut seen = Vec::new();
            for name in &record.packages_affected {
                if seen.contains(&name) {
                    continue;
                }
                seen.push(name);
                let version = record.requested_version(name);
                match tool_packages.get_mut(name) {
                    Some(info) => {
                        info.last_used = record.timestamp;
                        info.usage_count += 1;
                        if let Some(version) = version {
                            info.version = version.to_string();
                        }
                    }
                    None => {
                        let mut info = PackageInfo::first_seen(&record.tool, name, record.timestamp);
                        if let Some(version) = version {
                            info.version = version.to_string();
                        }
                        tool_packages.insert(name.clone(), info);
                    }
                }
            }
            if tool_packages.is_empty() {
                doc.packages.remove(&record.tool);
            }

            doc.executions.push(record);
        })?;

        Ok(id)
    }

    /// Matching executions, newest first.
    pub fn query(&self, filter: &QueryFilter) -> Vec<ExecutionRecord> {
        let doc = self.read();
        let mut results: Vec<ExecutionRecord> = doc
            .executions
            .iter()
            .rev()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit.filter(|&limit| limit > 0) {
            results.truncate(limit);
        }
        results
    }

    pub fn get_execution(&self, id: &str) -> Option<ExecutionRecord> {
        self.read()
            .executions
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Package aggregates ordered by (tool, name), optionally for one tool.
    pub fn get_packages(&self, tool: Option<&str>) -> Vec<PackageInfo> {
        let doc = self.read();
        doc.packages
            .iter()
            .filter(|(name, _)| tool.map_or(true, |tool| tool == name.as_str()))
            .flat_map(|(_, packages)| packages.values().cloned())
            .collect()
    }

    pub fn get_all_packages(&self) -> Vec<PackageInfo> {
        self.get_packages(None)
    }

    pub fn statistics(&self) -> Statistics {
        self.read().statistics.clone()
    }

    pub fn execution_count(&self) -> usize {
        self.read().executions.len()
    }

    pub fn snapshot(&self) -> StorageDocument {
        self.read().clone()
    }

    /// Recompute the busiest calendar day and persist it if it changed.
    pub fn recompute_most_active_day(&self) -> StorageResult<String> {
        let day = most_active_day(&self.read().executions);
        if self.read().statistics.most_active_day == day {
            return Ok(day);
        }
        self.mutate(|doc| {
            doc.statistics.most_active_day = most_active_day(&doc.executions);
            doc.statistics.most_active_day.clone()
        })
    }

    /// Write a timestamped copy of the document beside the live file.
    pub fn backup(&self) -> StorageResult<PathBuf> {
        let doc = self.read();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".backup.{stamp}"));
        let backup_path = self.path.with_file_name(name);

        write_atomic(&backup_path, &doc)?;
        info!(path = %backup_path.display(), "storage backup written");
        Ok(backup_path)
    }

    /// Replace the live document with the backup at `backup`.
    pub fn restore(&self, backup: &Path) -> StorageResult<()> {
        let bytes = std::fs::read(backup).map_err(|source| StorageError::Read {
            path: backup.to_path_buf(),
            source,
        })?;
        let restored: StorageDocument =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: backup.to_path_buf(),
                source,
            })?;

        let mut guard = self.write();
        write_atomic(&self.path, &restored)?;
        *guard = restored;
        info!(from = %backup.display(), "storage restored from backup");
        Ok(())
    }

    /// Remove executions at or before `before`. Returns how many were removed.
    ///
    /// Package aggregates and `tools_used` are kept; the other statistics are
    /// recomputed from the surviving executions.
    pub fn cleanup(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let removed = self.mutate(|doc| {
            let prior = doc.executions.len();
            doc.executions.retain(|record| record.timestamp > before);

            let mut frequency = BTreeMap::new();
            for record in &doc.executions {
                *frequency.entry(record.tool.clone()).or_insert(0) += 1;
            }
            doc.statistics.total_executions = doc.executions.len() as u64;
            doc.statistics.execution_frequency = frequency;
            doc.statistics.most_active_day = most_active_day(&doc.executions);
            prior - doc.executions.len()
        })?;
        info!(removed, before = %before, "cleanup finished");
        Ok(removed)
    }

    /// Final flush of the in-memory document.
    pub fn close(&self) -> StorageResult<()> {
        let doc = self.write();
        write_atomic(&self.path, &doc)?;
        debug!(path = %self.path.display(), "storage closed");
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut StorageDocument) -> T) -> StorageResult<T> {
        let mut guard = self.write();
        let mut next = guard.clone();
        let out = apply(&mut next);
        next.metadata.last_updated = Utc::now();
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    fn read(&self) -> RwLockReadGuard<'_, StorageDocument> {
        self.doc.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StorageDocument> {
        self.doc.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `exec_<YYYYmmdd_HHMMSS>_<6 hex chars>`.
fn generate_id(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("exec_{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..6])
}

/// Busiest day; ties go to the day seen first in execution order.
fn most_active_day(executions: &[ExecutionRecord]) -> String {
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut order = Vec::new();
    for record in executions {
        let day = record.timestamp.format("%Y-%m-%d").to_string();
        let count = counts.entry(day.clone()).or_insert(0);
        if *count == 0 {
            order.push(day);
        }
        *count += 1;
    }

    let mut best = String::new();
    let mut best_count = 0;
    for day in order {
        let count = counts[&day];
        if count > best_count {
            best_count = count;
            best = day;
        }
    }
    best
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, doc: &StorageDocument) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    let tmp = tmp_path(path);

    let write_tmp = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()
    };
    write_tmp().map_err(|source| StorageError::Write {
        path: tmp.clone(),
        source,
    })?;

    std::fs::rename(&tmp, path).map_err(|source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn local_user() -> String {
    std::env::var("USER").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> JsonStore {
        JsonStore::open(tmp.path().join("executions.json")).unwrap()
    }

    fn record_at(tool: &str, packages: &[&str], ts: DateTime<Utc>) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(tool, format!("{tool} install"), &[]);
        record.timestamp = ts;
        record.packages_affected = packages.iter().map(|p| p.to_string()).collect();
        record
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_open_creates_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/executions.json");
        let store = JsonStore::open(&path).unwrap();
        assert!(path.exists());
        let doc = store.snapshot();
        assert_eq!(doc.version, crate::models::DOCUMENT_VERSION);
        assert_eq!(doc.metadata.diu_version, env!("CARGO_PKG_VERSION"));
        assert!(doc.executions.is_empty());
    }

    #[test]
    fn test_open_rejects_corrupt_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("executions.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonStore::open(&path), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_generated_id_format() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = store.append(record_at("npm", &[], day(1, 9))).unwrap();
        assert!(id.starts_with("exec_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);

        let mut given = record_at("npm", &[], day(1, 9));
        given.id = "custom-id".into();
        assert_eq!(store.append(given).unwrap(), "custom-id");
        assert!(store.get_execution("custom-id").is_some());
        assert!(store.get_execution("missing").is_none());
    }

    #[test]
    fn test_append_rejects_empty_tool() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store.append(record_at(" ", &[], day(1, 9))).unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert_eq!(store.execution_count(), 0);
    }

    #[test]
    fn test_duplicate_package_in_one_record_counts_once() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store
            .append(record_at("npm", &["react", "react"], day(1, 9)))
            .unwrap();
        let packages = store.get_packages(Some("npm"));
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].usage_count, 1);
    }

    #[test]
    fn test_version_from_requested_spec() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut record = record_at("npm", &["lodash"], day(1, 9));
        record.set(crate::models::META_VERSIONS, vec!["lodash@4.17.21".to_string()]);
        store.append(record).unwrap();
        store.append(record_at("npm", &["lodash"], day(2, 9))).unwrap();

        let packages = store.get_packages(Some("npm"));
        assert_eq!(packages[0].version, "4.17.21");
        assert_eq!(packages[0].usage_count, 2);
        assert_eq!(packages[0].install_date, day(1, 9));
        assert_eq!(packages[0].last_used, day(2, 9));
    }

    #[test]
    fn test_query_orders_newest_first_with_limit() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("npm", &[], day(2, 9))).unwrap();
        store.append(record_at("go", &[], day(1, 9))).unwrap();
        store.append(record_at("npm", &[], day(3, 9))).unwrap();

        let all = store.query(&QueryFilter::default());
        let stamps: Vec<_> = all.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![day(3, 9), day(2, 9), day(1, 9)]);

        let limited = store.query(&QueryFilter {
            tool: Some("npm".into()),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].timestamp, day(3, 9));

        let unlimited = store.query(&QueryFilter {
            limit: Some(0),
            ..Default::default()
        });
        assert_eq!(unlimited.len(), 3);
    }

    #[test]
    fn test_most_active_day_tie_goes_to_first_seen() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("npm", &[], day(7, 9))).unwrap();
        store.append(record_at("npm", &[], day(3, 9))).unwrap();
        store.append(record_at("npm", &[], day(3, 10))).unwrap();
        store.append(record_at("npm", &[], day(7, 10))).unwrap();

        assert_eq!(store.recompute_most_active_day().unwrap(), "2024-05-07");
        assert_eq!(store.statistics().most_active_day, "2024-05-07");

        store.append(record_at("npm", &[], day(3, 11))).unwrap();
        assert_eq!(store.recompute_most_active_day().unwrap(), "2024-05-03");
    }

    #[test]
    fn test_cleanup_recomputes_frequency_and_keeps_packages() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("go", &["gopls"], day(1, 9))).unwrap();
        store.append(record_at("npm", &["express"], day(2, 9))).unwrap();
        store.append(record_at("npm", &["express"], day(3, 9))).unwrap();

        let removed = store.cleanup(day(2, 9)).unwrap();
        assert_eq!(removed, 2);

        let stats = store.statistics();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.execution_frequency.get("npm"), Some(&1));
        assert!(stats.execution_frequency.get("go").is_none());
        assert_eq!(stats.tools_used, vec!["go", "npm"]);
        assert_eq!(stats.most_active_day, "2024-05-03");
        assert_eq!(store.get_packages(Some("go")).len(), 1);
        assert_eq!(store.get_packages(Some("npm"))[0].usage_count, 2);
    }

    #[test]
    fn test_failed_persist_leaves_state_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("npm", &["a"], day(1, 9))).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        std::fs::create_dir(tmp_path(store.path())).unwrap();
        let err = store.append(record_at("npm", &["b"], day(2, 9))).unwrap_err();
        assert!(matches!(err, StorageError::Write { .. }));

        assert_eq!(store.execution_count(), 1);
        assert_eq!(store.statistics().total_executions, 1);
        assert_eq!(store.get_packages(Some("npm")).len(), 1);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_interrupted_write_keeps_prior_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("executions.json");
        {
            let store = JsonStore::open(&path).unwrap();
            store.append(record_at("npm", &["a"], day(1, 9))).unwrap();
        }
        std::fs::write(tmp_path(&path), b"{\"version\": \"1.0.0\", \"metad").unwrap();

        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.execution_count(), 1);
        reopened.append(record_at("npm", &["b"], day(2, 9))).unwrap();
        assert_eq!(JsonStore::open(&path).unwrap().execution_count(), 2);
    }

    #[test]
    fn test_restore_rejects_missing_and_invalid() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("npm", &[], day(1, 9))).unwrap();

        let missing = tmp.path().join("nope.json");
        assert!(matches!(store.restore(&missing), Err(StorageError::Read { .. })));

        let invalid = tmp.path().join("invalid.json");
        std::fs::write(&invalid, "[]").unwrap();
        assert!(matches!(store.restore(&invalid), Err(StorageError::Corrupt { .. })));
        assert_eq!(store.execution_count(), 1);
    }

    #[test]
    fn test_backup_name_and_content() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append(record_at("npm", &["a"], day(1, 9))).unwrap();

        let backup = store.backup().unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("executions.json.backup."), "{name}");
        let copy: StorageDocument =
            serde_json::from_slice(&std::fs::read(&backup).unwrap()).unwrap();
        assert_eq!(copy.executions.len(), 1);
        assert!(!tmp_path(&backup).exists());
    }
}
