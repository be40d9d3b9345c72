//! Integration tests for the HTTP surface.
//!
//! The router runs in-process via `tower::ServiceExt::oneshot`, backed by an
//! in-memory object store and a fake processor that writes one JSON result
//! per input document. No network access is needed.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use invoice_relay::server::{self, RUN_ID_HEADER};
use invoice_relay::{
    BatchJobRequest, DocumentProcessor, MemoryObjectStore, OperationHandle, OperationStatus, Relay,
    RelayConfig, RelayError,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const KEY: &str = "test-key";
const BOUNDARY: &str = "relay-test-boundary";
const ORIGIN: &str = "https://app.example.test";

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Writes `<output>/op/<i>/<stem>-0.json` for every input on submit.
struct FakeProcessor {
    store: Arc<MemoryObjectStore>,
    submits: AtomicUsize,
    documents: Mutex<Vec<String>>,
    fail_with: Option<String>,
}

#[async_trait]
impl DocumentProcessor for FakeProcessor {
    async fn submit(&self, request: &BatchJobRequest) -> Result<OperationHandle, RelayError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let out = request.output_uri.trim_start_matches("gs://");
        let (bucket, prefix) = out.split_once('/').unwrap();
        for (i, doc) in request.documents.iter().enumerate() {
            self.documents.lock().unwrap().push(doc.uri.clone());
            let stem = doc.uri.rsplit('/').next().unwrap().trim_end_matches(".pdf");
            self.store.insert(
                bucket,
                &format!("{prefix}op/{i}/{stem}-0.json"),
                format!("{{\"entities\":[{i}]}}"),
            );
        }
        Ok(OperationHandle {
            name: "operations/fake".into(),
        })
    }

    async fn poll(&self, _op: &OperationHandle) -> Result<OperationStatus, RelayError> {
        Ok(match &self.fail_with {
            Some(message) => OperationStatus::Failed {
                message: message.clone(),
            },
            None => OperationStatus::Succeeded,
        })
    }
}

struct Harness {
    app: Router,
    dir: TempDir,
    store: Arc<MemoryObjectStore>,
    processor: Arc<FakeProcessor>,
}

impl Harness {
    fn new() -> Self {
        Self::with(|b| b, None)
    }

    fn with(
        tweak: impl FnOnce(invoice_relay::RelayConfigBuilder) -> invoice_relay::RelayConfigBuilder,
        fail_with: Option<&str>,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("invoice_relay=debug")
            .with_test_writer()
            .try_init();

        let dir = TempDir::new().unwrap();
        let builder = RelayConfig::builder()
            .data_dir(dir.path())
            .project_id("proj")
            .location("us")
            .processor_id("proc")
            .input_bucket("gs://invoices-in")
            .output_bucket("gs://invoices-out")
            .output_prefix("results")
            .api_keys(format!("{KEY},other-key"))
            .allowed_origin(ORIGIN)
            .max_file_bytes(64)
            .max_files(3)
            .poll_interval_ms(1);
        let config = tweak(builder).build().unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let processor = Arc::new(FakeProcessor {
            store: Arc::clone(&store),
            submits: AtomicUsize::new(0),
            documents: Mutex::new(Vec::new()),
            fail_with: fail_with.map(str::to_string),
        });
        let relay = Arc::new(Relay::new(config, store.clone(), processor.clone()));
        let app = server::build_router(relay)
            .unwrap()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        Self {
            app,
            dir,
            store,
            processor,
        }
    }

    fn submits(&self) -> usize {
        self.processor.submits.load(Ordering::SeqCst)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    async fn upload(&self, files: &[(&str, usize)]) -> (StatusCode, axum::http::HeaderMap, Value) {
        self.send(upload_request(Some(KEY), files)).await
    }

    async fn fetch(&self, run: &str) -> (StatusCode, Value) {
        let request = Request::get(format!("/processed?run={run}"))
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }
}

fn multipart_body(files: &[(&str, usize)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, size) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files[]\"; filename=\"{name}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend(std::iter::repeat_n(b'%', *size));
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(key: Option<&str>, files: &[(&str, usize)]) -> Request<Body> {
    let mut builder = Request::post("/process-multiple").header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
    );
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(multipart_body(files))).unwrap()
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

fn files_below(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .map(|p| if p.is_dir() { files_below(&p) } else { 1 })
                .sum()
        })
        .unwrap_or(0)
}

// ── Gate ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_key_is_rejected_without_side_effects() {
    let h = Harness::new();

    let (status, _, body) = h.send(upload_request(None, &[("a.pdf", 10)])).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized");
    assert_eq!(h.submits(), 0);
    assert!(h.store.keys("invoices-in").is_empty());
    assert_eq!(files_below(&h.dir.path().join("uploads")), 0);
}

#[tokio::test]
async fn unknown_key_is_rejected() {
    let h = Harness::new();
    let (status, _, _) = h.send(upload_request(Some("guess"), &[("a.pdf", 10)])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.submits(), 0);
}

#[tokio::test]
async fn sixteenth_request_in_window_is_rate_limited() {
    let h = Harness::new();
    let run = invoice_relay::RunId::new().to_string();
    for i in 0..15 {
        let (status, _) = h.fetch(&run).await;
        assert_eq!(status, StatusCode::OK, "request {i}");
    }

    let (status, headers, _) = h.upload(&[("a.pdf", 10)]).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert_eq!(h.submits(), 0, "no processing after the limit");
    assert!(h.store.keys("invoices-in").is_empty());
}

#[tokio::test]
async fn unauthorized_requests_do_not_use_quota() {
    let h = Harness::with(|b| b.rate_limit(1), None);
    for _ in 0..3 {
        let (status, _, _) = h.send(upload_request(None, &[])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, _, _) = h.upload(&[("a.pdf", 10)]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn healthz_needs_no_key() {
    let h = Harness::new();
    let request = Request::get("/healthz").body(Body::empty()).unwrap();
    let (status, _, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn cors_preflight_is_answered_without_key() {
    let h = Harness::new();
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/process-multiple")
        .header(header::ORIGIN, ORIGIN)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-api-key")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
}

// ── Submission ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn manifest_lists_one_entry_per_output() {
    let h = Harness::new();

    let (status, headers, body) = h.upload(&[("a.pdf", 10), ("b.pdf", 20)]).await;

    assert_eq!(status, StatusCode::OK);
    let run = headers[RUN_ID_HEADER].to_str().unwrap();
    let manifest = body.as_array().unwrap();
    assert_eq!(manifest.len(), 2);
    for entry in manifest {
        let path = Path::new(entry["path"].as_str().unwrap());
        assert!(path.is_absolute());
        assert!(path.exists());
        assert!(path.to_string_lossy().contains(run));
        assert!(entry["name"].as_str().unwrap().ends_with("-0.json"));
    }
    assert_eq!(h.submits(), 1);
}

#[tokio::test]
async fn oversize_file_is_left_out_of_the_batch() {
    let h = Harness::new();

    let (status, headers, body) = h.upload(&[("a.pdf", 10), ("b.pdf", 100)]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    let run = headers[RUN_ID_HEADER].to_str().unwrap();
    let documents = h.processor.documents.lock().unwrap().clone();
    assert_eq!(
        documents,
        vec![format!("gs://invoices-in/{run}/{run}-a.pdf")]
    );
    let remote = h.store.keys("invoices-in");
    assert!(remote.iter().all(|k| !k.ends_with("b.pdf")), "got {remote:?}");
}

#[tokio::test]
async fn all_files_oversize_gives_empty_manifest() {
    let h = Harness::new();

    let (status, _, body) = h.upload(&[("big.pdf", 500)]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(vec![]));
    assert_eq!(h.submits(), 0);
}

#[tokio::test]
async fn too_many_files_is_bad_request() {
    let h = Harness::new();

    let (status, _, _) = h
        .upload(&[("1.pdf", 1), ("2.pdf", 1), ("3.pdf", 1), ("4.pdf", 1)])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.submits(), 0);
    assert_eq!(files_below(&h.dir.path().join("uploads")), 0);
}

#[tokio::test]
async fn processing_failure_hides_details() {
    let h = Harness::with(|b| b, Some("quota exceeded in projects/proj"));

    let (status, _, body) = h.upload(&[("a.pdf", 10)]).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "Error processing documents");
}

#[tokio::test]
async fn failed_run_leaves_no_temporary_state() {
    let h = Harness::with(|b| b, Some("boom"));

    let (status, _, _) = h.upload(&[("a.pdf", 10), ("b.pdf", 10)]).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(files_below(&h.dir.path().join("uploads")), 0);
    assert_eq!(files_below(&h.dir.path().join("processed")), 0);
    let remote = h.store.keys("invoices-in");
    assert!(remote.is_empty(), "remote inputs left behind: {remote:?}");
}

// ── Retrieval and cleanup ────────────────────────────────────────────────────

#[tokio::test]
async fn results_are_served_once_then_empty() {
    let h = Harness::new();
    let (_, headers, _) = h.upload(&[("a.pdf", 10), ("b.pdf", 10)]).await;
    let run = headers[RUN_ID_HEADER].to_str().unwrap().to_string();

    let (status, first) = h.fetch(&run).await;
    assert_eq!(status, StatusCode::OK);
    let first = first.as_array().unwrap().clone();
    assert_eq!(first.len(), 2);
    assert!(first[0]["data"].as_str().unwrap().contains("entities"));

    for _ in 0..2 {
        let (status, again) = h.fetch(&run).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again, Value::Array(vec![]));
    }

    let processed = h.dir.path().join("processed").join(&run);
    let uploads = h.dir.path().join("uploads").join(&run);
    for _ in 0..200 {
        if files_in(&processed) == 0 && files_in(&uploads) == 0 && h.store.keys("invoices-in").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(files_in(&processed), 0);
    assert_eq!(files_in(&uploads), 0);
    assert!(processed.exists(), "directories may remain");
    assert!(h.store.keys("invoices-in").is_empty());

    let (status, last) = h.fetch(&run).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last, Value::Array(vec![]));
}

#[tokio::test]
async fn runs_are_served_independently() {
    let h = Harness::new();
    let (_, ha, _) = h.upload(&[("a.pdf", 10)]).await;
    let (_, hb, _) = h.upload(&[("b1.pdf", 10), ("b2.pdf", 10)]).await;

    let (_, a) = h.fetch(ha[RUN_ID_HEADER].to_str().unwrap()).await;
    let (_, b) = h.fetch(hb[RUN_ID_HEADER].to_str().unwrap()).await;

    assert_eq!(a.as_array().unwrap().len(), 1);
    assert_eq!(b.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_or_missing_run_is_bad_request() {
    let h = Harness::new();

    let (status, _) = h.fetch("../../etc/passwd").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::get("/processed")
        .header("x-api-key", KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = h.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn concurrent_fetches_hand_out_results_once() {
    let h = Harness::new();
    let (_, headers, _) = h.upload(&[("a.pdf", 10), ("b.pdf", 10)]).await;
    let run = headers[RUN_ID_HEADER].to_str().unwrap().to_string();

    let ((s1, b1), (s2, b2)) = tokio::join!(h.fetch(&run), h.fetch(&run));

    assert_eq!((s1, s2), (StatusCode::OK, StatusCode::OK));
    let mut counts = vec![b1.as_array().unwrap().len(), b2.as_array().unwrap().len()];
    counts.sort();
    assert_eq!(counts, vec![0, 2]);
}

#[tokio::test]
async fn failed_remote_cleanup_does_not_affect_response() {
    let h = Harness::new();
    h.store.fail_deletes_containing(".pdf");
    let (_, headers, _) = h.upload(&[("a.pdf", 10)]).await;
    let run = headers[RUN_ID_HEADER].to_str().unwrap().to_string();

    let (status, body) = h.fetch(&run).await;

    assert_eq!(status, StatusCode::OK);
    let files = body.as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0]["data"].as_str().unwrap().contains("entities"));

    let processed = h.dir.path().join("processed").join(&run);
    for _ in 0..200 {
        if files_in(&processed) == 0 && h.store.keys("invoices-in").len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(files_in(&processed), 0, "local cleanup still ran");
    assert_eq!(
        h.store.keys("invoices-in"),
        vec![format!("{run}/{run}-a.pdf")],
        "only the undeletable object remains"
    );

    let (status, again) = h.fetch(&run).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, Value::Array(vec![]));
}
