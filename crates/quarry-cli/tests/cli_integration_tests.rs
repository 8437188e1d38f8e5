//! CLI integration tests for quarry
//!
//! Drives the `quarry` binary end-to-end against a throwaway database and
//! config directory using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("quarry.db")
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A command isolated from the user's config and database
    #[allow(deprecated)]
    fn quarry(&self) -> Command {
        let mut cmd = Command::cargo_bin("quarry").unwrap();
        cmd.env("QUARRY_CONFIG_DIR", self.dir.path().join("config"));
        cmd.env("QUARRY_INGESTION_MODE", "sync");
        cmd.env_remove("QUARRY_SEARCH_ENGINE");
        cmd.arg("--db").arg(self.db_path());
        cmd
    }
}

const CARDS: &str = r#"[
  {
    "model": "card",
    "id": 1,
    "name": "Weekly revenue",
    "description": "Revenue totals by week",
    "database_id": 1,
    "updated_at": "2024-05-01T00:00:00Z"
  },
  {
    "model": "card",
    "id": 2,
    "name": "Churned accounts",
    "archived": true,
    "database_id": 1,
    "updated_at": "2024-05-02T00:00:00Z"
  }
]"#;

fn put(ws: &Workspace, file: &Path) {
    ws.quarry()
        .arg("put")
        .arg(file)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 entities stored."));
}

#[test]
fn test_put_then_search() {
    let ws = Workspace::new();
    let file = ws.write("cards.json", CARDS);
    put(&ws, &file);

    ws.quarry()
        .args(["search", "revenue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Weekly revenue"))
        .stdout(predicate::str::contains("persistent engine"));
}

#[test]
fn test_archived_results_need_the_filter() {
    let ws = Workspace::new();
    let file = ws.write("cards.json", CARDS);
    put(&ws, &file);

    ws.quarry()
        .args(["search", "churned"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No results."));

    ws.quarry()
        .args(["search", "churned", "--archived", "only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Churned accounts [archived]"));
}

#[test]
fn test_remove_drops_document() {
    let ws = Workspace::new();
    let file = ws.write("cards.json", CARDS);
    put(&ws, &file);

    ws.quarry()
        .args(["remove", "card", "1"])
        .assert()
        .success();

    ws.quarry()
        .args(["search", "revenue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No results."));

    ws.quarry()
        .args(["remove", "card", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_reindex_advances_generation() {
    let ws = Workspace::new();
    let file = ws.write("cards.json", CARDS);
    put(&ws, &file);

    ws.quarry()
        .arg("reindex")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reindex complete: generation 2"));

    ws.quarry()
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"engine\": \"persistent\""))
        .stdout(predicate::str::contains("\"generation\": 2"))
        .stdout(predicate::str::contains("\"documents\": 2"));
}

#[test]
fn test_in_place_engine_from_env() {
    let ws = Workspace::new();
    let file = ws.write("cards.json", CARDS);
    put(&ws, &file);

    ws.quarry()
        .env("QUARRY_SEARCH_ENGINE", "in_place")
        .args(["search", "revenue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Weekly revenue"))
        .stdout(predicate::str::contains("in_place engine"));

    ws.quarry()
        .env("QUARRY_SEARCH_ENGINE", "in_place")
        .arg("reindex")
        .assert()
        .failure();
}

#[test]
fn test_put_rejects_unknown_model() {
    let ws = Workspace::new();
    let file = ws.write(
        "pulse.json",
        r#"{"model": "pulse", "id": 1, "name": "Daily", "updated_at": "2024-05-01T00:00:00Z"}"#,
    );

    ws.quarry().arg("put").arg(&file).assert().failure();
}

#[test]
fn test_config_set_and_get() {
    let ws = Workspace::new();

    ws.quarry()
        .args(["config", "set", "search.max_candidates", "250"])
        .assert()
        .success();

    ws.quarry()
        .args(["config", "get", "search.max_candidates"])
        .assert()
        .success()
        .stdout(predicate::str::contains("250"));

    ws.quarry()
        .args(["config", "set", "search.engine", "bogus"])
        .assert()
        .failure();
}
