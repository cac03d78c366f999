use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use oai_harvest::config;
use oai_harvest::controller::{HarvestController, RetryPolicy};
use oai_harvest::db;
use oai_harvest::migrate;
use oai_harvest::models::{HarvestJobConfig, JobState, NewIndexNode, RunStatus, UpdateStyle};
use oai_harvest::notify::LogNotifier;
use oai_harvest::oai::{OaiClient, OaiSource};
use oai_harvest::schema::ItemTypeSchema;
use oai_harvest::sqlite_store::SqliteStore;
use oai_harvest::store::HarvestStore;

const SCHEMA: &str = include_str!("fixtures/dc_schema.json");

// ---------------------------------------------------------------------------
// Mock OAI-PMH repository
// ---------------------------------------------------------------------------

const PAGE_ONE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-03-01T00:00:00Z</responseDate>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:mock:1</identifier>
        <datestamp>2024-02-01T10:00:00Z</datestamp>
        <setSpec>physics</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title xml:lang="en">Quantum Optics</dc:title>
          <dc:creator>Doe, Jane</dc:creator>
          <dc:date>2023-11-02</dc:date>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header>
        <identifier>oai:mock:2</identifier>
        <datestamp>2024-02-02</datestamp>
        <setSpec>physics</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title>Thermal Noise &amp; Detectors</dc:title>
          <dc:subject>instrumentation</dc:subject>
        </oai_dc:dc>
      </metadata>
    </record>
    <resumptionToken cursor="0" completeListSize="4">p2</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

const PAGE_TWO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-03-01T00:00:01Z</responseDate>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:mock:3</identifier>
        <datestamp>2024-02-03</datestamp>
        <setSpec>physics:optics</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title>Lens Design</dc:title>
          <dc:language>eng</dc:language>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted">
        <identifier>oai:mock:4</identifier>
        <datestamp>2024-02-04</datestamp>
      </header>
    </record>
    <resumptionToken cursor="2" completeListSize="4"/>
  </ListRecords>
</OAI-PMH>"#;

const SETS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListSets>
    <set><setSpec>physics</setSpec><setName>Physics</setName></set>
    <set><setSpec>physics:optics</setSpec><setName>Optics</setName></set>
  </ListSets>
</OAI-PMH>"#;

/// A ListSets page whose resumption token never changes.
const SETS_STUCK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListSets>
    <set><setSpec>physics</setSpec><setName>Physics</setName></set>
    <resumptionToken>again</resumptionToken>
  </ListSets>
</OAI-PMH>"#;

fn oai_error(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error code="{}">{}</error></OAI-PMH>"#,
        code, message
    )
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    /// Number of upcoming requests to answer with 503.
    outages: Arc<AtomicUsize>,
}

struct MockRepository {
    base_url: String,
    state: MockState,
}

impl MockRepository {
    fn requests(&self) -> Vec<HashMap<String, String>> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn oai_endpoint(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.requests.lock().unwrap().push(params.clone());

    if state
        .outages
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again later").into_response();
    }

    let verb = params.get("verb").map(String::as_str);
    let body = match verb {
        Some("ListSets") => SETS.to_string(),
        Some("ListRecords") => match params.get("resumptionToken").map(String::as_str) {
            None if params.get("set").map(String::as_str) == Some("empty") => {
                oai_error("noRecordsMatch", "no records")
            }
            None => PAGE_ONE.to_string(),
            Some("p2") => PAGE_TWO.to_string(),
            Some(_) => oai_error("badResumptionToken", "unknown token"),
        },
        Some("GetRecord") => match params.get("identifier").map(String::as_str) {
            Some("oai:mock:1") => PAGE_ONE
                .replace("<ListRecords>", "<GetRecord>")
                .replace("</ListRecords>", "</GetRecord>"),
            _ => oai_error("idDoesNotExist", "no such record"),
        },
        _ => oai_error("badVerb", "illegal verb"),
    };
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

async fn stuck_endpoint(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.requests.lock().unwrap().push(params);
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], SETS_STUCK).into_response()
}

/// Serve the mock repository on its own thread so blocking CLI
/// subprocesses can reach it too.
fn spawn_mock_repository() -> MockRepository {
    let state = MockState::default();
    let app_state = state.clone();
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            let app = Router::new()
                .route("/oai", get(oai_endpoint))
                .route("/stuck", get(stuck_endpoint))
                .with_state(app_state);
            axum::serve(listener, app).await.unwrap();
        });
    });

    let addr = rx.recv().unwrap();
    MockRepository {
        base_url: format!("http://{}/oai", addr),
        state,
    }
}

// ---------------------------------------------------------------------------
// Library end-to-end
// ---------------------------------------------------------------------------

fn write_config(root: &Path, base_url: &str, set_spec: Option<&str>) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let set_line = set_spec
        .map(|s| format!("set_spec = \"{}\"\n", s))
        .unwrap_or_default();
    let content = format!(
        r#"[db]
path = "{root}/data/oaih.sqlite"

[harvest]
timeout_secs = 5
max_retries = 2
retry_backoff_ms = 1

[jobs.physics]
repository_name = "Mock physics"
base_url = "{base_url}"
index_id = 1
update_style = "bulk"
{set_line}"#,
        root = root.display(),
        base_url = base_url,
        set_line = set_line,
    );

    let path = config_dir.join("oaih.toml");
    fs::write(&path, content).unwrap();
    path
}

async fn open_store(config_path: &Path) -> Arc<SqliteStore> {
    let cfg = config::load_config(config_path).unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    let store = Arc::new(SqliteStore::new(db::connect(&cfg).await.unwrap()));
    for job in cfg.job_configs() {
        store.register_job(&job).await.unwrap();
    }
    let schema: serde_json::Value = serde_json::from_str(SCHEMA).unwrap();
    store
        .save_schema(&ItemTypeSchema::new(1, "Multiple", chrono::Utc::now(), schema))
        .await
        .unwrap();
    store
        .create_index(&NewIndexNode {
            parent_id: None,
            index_name: "Harvested".into(),
            index_name_english: "Harvested".into(),
            harvest_spec: None,
            browsing_role: "3,4".into(),
            contribute_role: "3".into(),
            public_state: true,
            recursive_public_state: true,
            position: 0,
        })
        .await
        .unwrap();
    store
}

fn controller(store: Arc<SqliteStore>) -> HarvestController {
    let client = OaiClient::new(Duration::from_secs(5), "oaih-test").unwrap();
    HarvestController::new(store, Arc::new(client), Arc::new(LogNotifier)).with_retry(
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        },
    )
}

#[tokio::test]
async fn test_harvest_against_mock_repository() {
    let repo = spawn_mock_repository();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let store = open_store(&config_path).await;
    let controller = controller(store.clone());

    let report = controller
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.stats.pages, 2);
    assert_eq!(report.stats.upserted, 3);
    assert_eq!(report.processed, 3);
    assert_eq!(store.count_items().await.unwrap(), 3);
    assert!(store.find_item("oai:mock:4").await.unwrap().is_none());

    let entry = store.find_item("oai:mock:2").await.unwrap().unwrap();
    assert_eq!(entry.indexes, vec![1]);
    assert_eq!(entry.published_on.to_string(), "2024-02-02");
    assert_eq!(
        entry.document["item_title"][0]["subitem_title"],
        "Thermal Noise & Detectors"
    );

    let state = store.run_state("physics").await.unwrap();
    assert_eq!(JobState::of(&state), JobState::Idle);
    assert_eq!(state.last_status, Some(RunStatus::Success));
    assert!(state.resumption_token.is_none());

    // Continuation requests carry only the verb and the token.
    let requests = repo.requests();
    let continuation = requests
        .iter()
        .find(|r| r.get("resumptionToken").map(String::as_str) == Some("p2"))
        .unwrap();
    assert_eq!(continuation.len(), 2);
    assert_eq!(continuation["verb"], "ListRecords");
    assert_eq!(requests[0]["metadataPrefix"], "oai_dc");
}

#[tokio::test]
async fn test_bulk_rerun_skips_unchanged_records() {
    let repo = spawn_mock_repository();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let store = open_store(&config_path).await;
    let controller = controller(store.clone());

    controller
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    let before = store.find_item("oai:mock:1").await.unwrap().unwrap();

    let report = controller
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.stats.upserted, 0);
    assert_eq!(report.stats.skipped, 3);

    let after = store.find_item("oai:mock:1").await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_auto_distribution_creates_set_nodes() {
    let repo = spawn_mock_repository();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let store = open_store(&config_path).await;

    let mut job: HarvestJobConfig = store.job_config("physics").await.unwrap().unwrap();
    job.auto_distribution = true;
    job.update_style = UpdateStyle::Differential;
    store.register_job(&job).await.unwrap();

    let report = controller(store.clone())
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);

    let children = store.child_indexes(Some(1)).await.unwrap();
    let specs: Vec<_> = children
        .iter()
        .map(|n| n.harvest_spec.clone().unwrap())
        .collect();
    assert_eq!(specs, vec!["physics", "physics:optics"]);
    assert!(children.iter().all(|n| n.browsing_role == "3,4"));

    let optics = &children[1];
    let entry = store.find_item("oai:mock:3").await.unwrap().unwrap();
    assert_eq!(entry.indexes, vec![optics.id]);
}

#[tokio::test]
async fn test_no_records_match_is_a_successful_empty_run() {
    let repo = spawn_mock_repository();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, Some("empty"));
    let store = open_store(&config_path).await;

    let report = controller(store.clone())
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.processed, 0);
    assert_eq!(store.count_items().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_http_failure_is_retried() {
    let repo = spawn_mock_repository();
    repo.state.outages.store(1, Ordering::SeqCst);
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let store = open_store(&config_path).await;

    let report = controller(store.clone())
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.processed, 3);
}

#[tokio::test]
async fn test_persistent_outage_fails_and_keeps_error_state() {
    let repo = spawn_mock_repository();
    repo.state.outages.store(100, Ordering::SeqCst);
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let store = open_store(&config_path).await;
    let controller = controller(store.clone());

    let report = controller
        .run("physics", chrono::Utc::now(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Error);
    assert!(report.error.unwrap().contains("503"));
    assert_eq!(controller.state("physics").await.unwrap(), JobState::Error);

    controller.clear("physics", false).await.unwrap();
    assert_eq!(controller.state("physics").await.unwrap(), JobState::Idle);
}

#[tokio::test]
async fn test_client_get_record_and_sets() {
    let repo = spawn_mock_repository();
    let client = OaiClient::new(Duration::from_secs(5), "oaih-test").unwrap();

    let record = client
        .get_record(&repo.base_url, "oai:mock:1", "oai_dc")
        .await
        .unwrap();
    assert_eq!(record.identifier, "oai:mock:1");
    assert!(record.metadata.contains("Quantum Optics"));

    let missing = client
        .get_record(&repo.base_url, "oai:mock:404", "oai_dc")
        .await
        .unwrap_err();
    assert!(missing.to_string().contains("idDoesNotExist"));

    let sets = client.list_sets(&repo.base_url).await.unwrap();
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[1].name, "Optics");
}

#[tokio::test]
async fn test_repeated_set_token_ends_listing() {
    let repo = spawn_mock_repository();
    let client = OaiClient::new(Duration::from_secs(5), "oaih-test").unwrap();
    let stuck_url = repo.base_url.replace("/oai", "/stuck");

    let sets = tokio::time::timeout(Duration::from_secs(10), client.list_sets(&stuck_url))
        .await
        .expect("ListSets kept following a repeated token")
        .unwrap();
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.spec == "physics"));

    let requests = repo.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].contains_key("resumptionToken"));
    assert_eq!(requests[1]["resumptionToken"], "again");
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

fn oaih_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("oaih");
    path
}

fn run_oaih(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = oaih_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run oaih binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("dc_schema.json")
}

#[test]
fn test_init_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);

    let (stdout, stderr, success) = run_oaih(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));
    assert!(stdout.contains("jobs registered: 1"));
    assert!(tmp.path().join("data/oaih.sqlite").exists());

    let (_, stderr, success) = run_oaih(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_jobs_lists_configured_job() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);

    let (stdout, stderr, success) = run_oaih(&config_path, &["jobs"]);
    assert!(success, "jobs failed: {}", stderr);
    let line = stdout.lines().find(|l| l.starts_with("physics")).unwrap();
    assert!(line.contains("idle"));
    assert!(line.contains("Mock physics"));
}

#[test]
fn test_unknown_job_errors() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);

    let (_, stderr, success) = run_oaih(&config_path, &["status", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown harvest job"));
}

#[test]
fn test_clear_idle_job_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);

    let (_, _, success) = run_oaih(&config_path, &["clear", "physics"]);
    assert!(!success);
}

#[test]
fn test_schema_and_index_management() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);
    let fixture = fixture_path();

    let (stdout, stderr, success) = run_oaih(
        &config_path,
        &[
            "schema",
            "import",
            fixture.to_str().unwrap(),
            "--id",
            "7",
            "--category",
            "Dataset",
        ],
    );
    assert!(success, "schema import failed: {}", stderr);
    assert!(stdout.contains("schema 7 imported for 'Dataset'"));

    let (stdout, _, success) = run_oaih(&config_path, &["schema", "list"]);
    assert!(success);
    assert!(stdout.lines().any(|l| l.starts_with('7') && l.contains("Dataset")));

    let (stdout, stderr, success) = run_oaih(&config_path, &["index", "add", "Harvested"]);
    assert!(success, "index add failed: {}", stderr);
    assert!(stdout.contains("index 1 created"));

    let (stdout, _, success) =
        run_oaih(&config_path, &["index", "add", "Physics", "--parent", "1"]);
    assert!(success);
    assert!(stdout.contains("index 2 created"));

    let (_, _, success) = run_oaih(&config_path, &["index", "add", "Orphan", "--parent", "99"]);
    assert!(!success);

    let (stdout, _, success) = run_oaih(&config_path, &["index", "list", "--parent", "1"]);
    assert!(success);
    assert!(stdout.contains("Physics"));
    assert!(!stdout.contains("Harvested"));
}

#[test]
fn test_cli_run_and_status() {
    let repo = spawn_mock_repository();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &repo.base_url, None);
    let fixture = fixture_path();

    let (_, stderr, success) = run_oaih(
        &config_path,
        &[
            "schema",
            "import",
            fixture.to_str().unwrap(),
            "--id",
            "1",
            "--category",
            "Multiple",
        ],
    );
    assert!(success, "schema import failed: {}", stderr);
    let (_, _, success) = run_oaih(&config_path, &["index", "add", "Harvested"]);
    assert!(success);

    let (stdout, stderr, success) =
        run_oaih(&config_path, &["run", "physics", "--progress", "off"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("status:     SUCCESS"));
    assert!(stdout.contains("processed:  3"));

    let (stdout, _, success) = run_oaih(&config_path, &["status", "physics"]);
    assert!(success);
    assert!(stdout.contains("state:        idle"));
    assert!(stdout.contains("last_status:  SUCCESS"));

    let (stdout, stderr, success) = run_oaih(&config_path, &["sets", "physics"]);
    assert!(success, "sets failed: {}", stderr);
    assert!(stdout.contains("physics:optics"));

    let (stdout, stderr, success) = run_oaih(&config_path, &["preview", "physics", "oai:mock:1"]);
    assert!(success, "preview failed: {}", stderr);
    assert!(stdout.contains("category:   Multiple"));
    assert!(stdout.contains("\"$schema\": 1"));
    assert!(stdout.contains("Quantum Optics"));
}

#[test]
fn test_invalid_progress_mode_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9/oai", None);

    let (_, stderr, success) = run_oaih(&config_path, &["run", "physics", "--progress", "loud"]);
    assert!(!success);
    assert!(stderr.contains("invalid progress mode"));
}
