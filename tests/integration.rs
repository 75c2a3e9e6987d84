//! Command-line tests: drive the built `gflow` binary against a temporary
//! database and configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn gflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("gflow");
    path
}

const RESEARCH_SCRIPT: &str = r#"cat > /dev/null
cat <<'JSON'
{"outcomes": [{
  "item_id": "p-1",
  "payload": {"name": "Trail Runner 2", "brand": "Acme"},
  "evidence": [{
    "source_url": "https://acme.example.com/trail-runner-2",
    "source_kind": "manufacturer",
    "fields_found": ["name", "brand", "weight", "price", "productUrl", "imageUrl", "type"],
    "confidence": "verified"
  }]
}]}
JSON
"#;

const COMMIT_SCRIPT: &str = r#"cat > /dev/null
echo '{"nodes_created": 2, "relationships_created": 1}'
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let scripts_dir = root.join("scripts");
    fs::create_dir_all(&scripts_dir).unwrap();
    fs::write(scripts_dir.join("research.sh"), RESEARCH_SCRIPT).unwrap();
    fs::write(scripts_dir.join("commit.sh"), COMMIT_SCRIPT).unwrap();

    fs::write(
        root.join("discoveries.json"),
        r#"[
  {"id": "p-1", "kind": "product", "source_id": "https://acme.example.com/trail-runner-2", "priority": 8},
  {"id": "p-2", "kind": "product", "source_id": "https://acme.example.com/ridge-3", "priority": 3},
  {"id": "b-1", "kind": "brand", "source_id": "https://forum.example.com/t/42", "source_kind": "forum"}
]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/gflow.sqlite"

[pipeline]
approval_mode = "auto_approve"
call_timeout_secs = 30

[resilience]
max_attempts = 1
initial_delay_ms = 1

[research]
command = "sh"
args = ["{root}/scripts/research.sh"]

[commit]
command = "sh"
args = ["{root}/scripts/commit.sh"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("gflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_gflow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = gflow_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run gflow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let (stdout, stderr, success) = run_gflow(config_path, args);
    assert!(success, "{:?} failed: stdout={}, stderr={}", args, stdout, stderr);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("{:?} printed invalid JSON ({}): {}", args, e, stdout))
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_gflow(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_gflow(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_enqueue_reports_duplicates() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("discoveries.json");

    run_gflow(&config_path, &["init"]);
    let (stdout, stderr, success) = run_gflow(&config_path, &["enqueue", file.to_str().unwrap()]);
    assert!(success, "enqueue failed: {}", stderr);
    assert!(stdout.contains("Enqueued 3 item(s), 0 duplicate(s)"), "got: {}", stdout);

    let (stdout, stderr, _) = run_gflow(&config_path, &["enqueue", file.to_str().unwrap()]);
    assert!(stdout.contains("Enqueued 0 item(s), 3 duplicate(s)"), "got: {}", stdout);
    assert!(stderr.contains("skipped duplicate p-1"));
}

#[test]
fn test_queue_peek_and_stats() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("discoveries.json");

    run_gflow(&config_path, &["init"]);
    run_gflow(&config_path, &["enqueue", file.to_str().unwrap()]);

    let items = run_json(&config_path, &["queue", "peek", "-n", "2", "--json"]);
    let ids: Vec<&str> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["p-1", "b-1"]);
    assert_eq!(items[1]["kind"], "entity");
    assert_eq!(items[1]["source_kind"], "community");

    let stats = run_json(&config_path, &["queue", "stats", "--json"]);
    let fact = stats["pending_by_kind"]
        .as_array()
        .unwrap()
        .iter()
        .find(|pair| pair[0] == "fact")
        .unwrap();
    assert_eq!(fact[1], 2);

    // Peeking claims nothing.
    let (stdout, _, success) = run_gflow(&config_path, &["queue", "stats"]);
    assert!(success);
    assert!(stdout.contains("Total items: 3"));
    assert!(stdout.contains("pending"));
    assert!(!stdout.contains("claimed"));
}

#[test]
fn test_queue_dequeue_and_update() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("discoveries.json");

    run_gflow(&config_path, &["init"]);
    run_gflow(&config_path, &["enqueue", file.to_str().unwrap()]);

    let (stdout, _, success) = run_gflow(&config_path, &["queue", "dequeue"]);
    assert!(success);
    assert!(stdout.contains("p-1"));
    assert!(stdout.contains("claimed"));

    let (_, stderr, success) = run_gflow(&config_path, &["queue", "update", "p-1", "error"]);
    assert!(success, "update failed: {}", stderr);

    let (_, stderr, success) = run_gflow(&config_path, &["queue", "update", "missing", "pending"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_registry_register_and_check() {
    let (_tmp, config_path) = setup_test_env();
    run_gflow(&config_path, &["init"]);

    let url = "https://acme.example.com/catalog";
    let (stdout, _, success) = run_gflow(&config_path, &["registry", "check", url]);
    assert!(success);
    assert!(stdout.contains("unknown"));

    run_gflow(
        &config_path,
        &["registry", "register", url, "--kind", "manufacturer", "--items", "4"],
    );
    run_gflow(&config_path, &["registry", "register", url, "--items", "2"]);

    let (stdout, _, success) = run_gflow(&config_path, &["registry", "check", url]);
    assert!(success);
    assert!(stdout.contains("primary"));
    assert!(stdout.contains("Scans:       2"));
    assert!(stdout.contains("Items found: 6"));

    let stats = run_json(&config_path, &["registry", "stats", "--json"]);
    assert_eq!(stats["total_sources"], 1);
    assert_eq!(stats["total_scans"], 2);
}

#[test]
fn test_run_with_empty_queue_is_idle() {
    let (_tmp, config_path) = setup_test_env();
    run_gflow(&config_path, &["init"]);

    let report = run_json(&config_path, &["run", "--json"]);
    assert_eq!(report["status"], "idle");
    assert_eq!(report["route"], "idle");
    assert_eq!(report["working_set"], 0);
}

#[test]
fn test_run_commits_researched_item() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("discoveries.json");

    run_gflow(&config_path, &["init"]);
    run_gflow(&config_path, &["enqueue", file.to_str().unwrap()]);

    let report = run_json(&config_path, &["run", "--json"]);
    assert_eq!(report["route"], "normal_process");
    assert_eq!(report["working_set"], 3);
    assert_eq!(report["items_committed"], 1);
    assert_eq!(report["nodes_created_total"], 2);
    let needs: Vec<&str> = report["needs_research"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(needs, vec!["b-1", "p-2"]);

    let stats = run_json(&config_path, &["queue", "stats", "--json"]);
    let committed = stats["by_status"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["status"] == "committed")
        .unwrap();
    assert_eq!(committed["count"], 1);

    let (stdout, _, success) = run_gflow(&config_path, &["research", "show", "p-1"]);
    assert!(success);
    assert!(stdout.contains("completed"));
    assert!(stdout.contains("product_url"));
}

#[test]
fn test_run_requires_collaborators() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("gflow.toml");
    fs::write(
        &config_path,
        format!("[db]\npath = \"{}/gflow.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();

    let (_, stderr, success) = run_gflow(&config_path, &["run"]);
    assert!(!success);
    assert!(stderr.contains("[research]"));
}
