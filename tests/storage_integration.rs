use chrono::{DateTime, Duration, TimeZone, Utc};
use diu::models::{ExecutionRecord, QueryFilter};
use diu::storage::JsonStore;
use tempfile::TempDir;

fn open(tmp: &TempDir) -> JsonStore {
    JsonStore::open(tmp.path().join("executions.json")).unwrap()
}

fn record(tool: &str, packages: &[&str], at: DateTime<Utc>) -> ExecutionRecord {
    let mut record = ExecutionRecord::new(tool, format!("{tool} install"), &[]);
    record.packages_affected = packages.iter().map(|p| p.to_string()).collect();
    record.timestamp = at;
    record
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

#[test]
fn test_total_matches_stored_count() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);

    for i in 0..25u32 {
        let tool = ["npm", "go", "homebrew"][(i % 3) as usize];
        store.append(record(tool, &["pkg"], at(1 + i % 5, i % 24))).unwrap();
        assert_eq!(
            store.statistics().total_executions as usize,
            store.execution_count()
        );
    }

    let stats = store.statistics();
    assert_eq!(stats.total_executions, 25);
    assert_eq!(stats.execution_frequency["npm"], 9);
    assert_eq!(stats.execution_frequency["go"], 8);
    assert_eq!(stats.execution_frequency["homebrew"], 8);
}

#[test]
fn test_usage_count_tracks_executions_per_tool() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);

    store.append(record("npm", &["express"], at(1, 9))).unwrap();
    store.append(record("npm", &["express", "lodash"], at(2, 9))).unwrap();
    store.append(record("pip", &["express"], at(3, 9))).unwrap();

    let mut previous = 0;
    for day in 4..8 {
        store.append(record("npm", &["express"], at(day, 9))).unwrap();
        let express = store
            .get_packages(Some("npm"))
            .into_iter()
            .find(|p| p.name == "express")
            .unwrap();
        assert!(express.usage_count > previous);
        previous = express.usage_count;
    }

    let npm = store.get_packages(Some("npm"));
    let express = npm.iter().find(|p| p.name == "express").unwrap();
    let lodash = npm.iter().find(|p| p.name == "lodash").unwrap();
    assert_eq!(express.usage_count, 6);
    assert_eq!(express.install_date, at(1, 9));
    assert_eq!(express.last_used, at(7, 9));
    assert_eq!(lodash.usage_count, 1);

    let pip = store.get_packages(Some("pip"));
    assert_eq!(pip.len(), 1);
    assert_eq!(pip[0].usage_count, 1);
    assert_eq!(store.get_all_packages().len(), 3);
}

#[test]
fn test_backup_then_restore_on_fresh_store() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);
    for day in 1..6 {
        store.append(record("go", &["golang.org/x/tools"], at(day, 12))).unwrap();
    }
    let backup = store.backup().unwrap();
    let expected_executions = store.query(&QueryFilter::default());
    let expected_stats = store.statistics();

    let other = TempDir::new().unwrap();
    let fresh = open(&other);
    fresh.restore(&backup).unwrap();

    assert_eq!(fresh.query(&QueryFilter::default()), expected_executions);
    assert_eq!(fresh.statistics(), expected_stats);

    // The restore is persisted, not just held in memory.
    drop(fresh);
    let reopened = open(&other);
    assert_eq!(reopened.execution_count(), 5);
}

#[test]
fn test_since_and_until_compose() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);
    for day in 1..=10 {
        store.append(record("npm", &["a"], at(day, 0))).unwrap();
    }

    let t1 = at(3, 0);
    let t2 = at(7, 0);
    let both = store.query(&QueryFilter {
        since: Some(t1),
        until: Some(t2),
        ..Default::default()
    });
    let since_only = store.query(&QueryFilter {
        since: Some(t1),
        ..Default::default()
    });
    let until_only = store.query(&QueryFilter {
        until: Some(t2),
        ..Default::default()
    });

    let intersection: Vec<_> = since_only
        .iter()
        .filter(|r| until_only.iter().any(|u| u.id == r.id))
        .cloned()
        .collect();
    assert_eq!(both, intersection);
    assert_eq!(both.len(), 4);
    assert!(both.iter().all(|r| r.timestamp >= t1 && r.timestamp < t2));
}

#[test]
fn test_repeat_install_scenario() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);
    let first = at(1, 10);
    let second = at(2, 10);

    let mut install = ExecutionRecord::new(
        "npm",
        "npm install express",
        &["install".to_string(), "express".to_string()],
    );
    install.packages_affected = vec!["express".to_string()];
    install.timestamp = first;
    store.append(install.clone()).unwrap();

    install.id.clear();
    install.timestamp = second;
    store.append(install).unwrap();

    let packages = store.get_packages(Some("npm"));
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].name, "express");
    assert_eq!(packages[0].usage_count, 2);
    assert_eq!(packages[0].install_date, first);
    assert_eq!(packages[0].last_used, second);
}

#[test]
fn test_cleanup_keeps_recent_executions() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp);
    let now = Utc::now();

    store.append(record("npm", &["old"], now - Duration::days(3))).unwrap();
    store.append(record("npm", &["old"], now - Duration::hours(30))).unwrap();
    store.append(record("go", &["new"], now - Duration::hours(2))).unwrap();
    store.append(record("go", &["new"], now - Duration::minutes(5))).unwrap();

    let removed = store.cleanup(now - Duration::hours(24)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.execution_count(), 2);
    assert_eq!(store.statistics().total_executions, 2);
    assert!(store
        .query(&QueryFilter::default())
        .iter()
        .all(|r| r.tool == "go"));

    // Package history survives pruning.
    let old = store.get_packages(Some("npm"));
    assert_eq!(old[0].usage_count, 2);
}

#[test]
fn test_document_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested/dir/executions.json");
    {
        let store = JsonStore::open(&path).unwrap();
        store.append(record("cargo", &["ripgrep"], at(5, 8))).unwrap();
        store.close().unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(doc["version"], "1.0.0");
    assert_eq!(doc["executions"][0]["tool"], "cargo");
    assert_eq!(doc["packages"]["cargo"]["ripgrep"]["usage_count"], 1);
    assert!(!path.with_file_name("executions.json.tmp").exists());

    let store = JsonStore::open(&path).unwrap();
    assert_eq!(store.execution_count(), 1);
}
