use std::net::SocketAddr;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use pocket_llm::core::runtime::AcquisitionError;
use pocket_llm::engine::{EngineError, EngineOptions, EngineSession, InferenceEngine};
use pocket_llm::models::{
    DownloadError, FetchRequest, HttpDownloader, ModelDescriptor, ModelFetcher, ModelStorage,
    Sha256Stream,
};
use pocket_llm::{
    AcquisitionPhase, AcquisitionState, BackendConfig, FailureKind, LlmRuntime, ProgressEvent,
};

fn payload() -> Vec<u8> {
    (0..50_000usize).map(|i| (i % 249) as u8).collect()
}

fn payload_digest() -> String {
    let mut stream = Sha256Stream::new();
    stream.update(&payload());
    stream.finalize_hex()
}

async fn serve_models() -> SocketAddr {
    let app = Router::new()
        .route(
            "/model.gguf",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    payload(),
                )
            }),
        )
        .route("/missing.gguf", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/flaky.gguf",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn descriptor(addr: SocketAddr, file: &str) -> ModelDescriptor {
    ModelDescriptor {
        id: file.trim_end_matches(".gguf").to_string(),
        display_name: "Test Model".into(),
        source_url: format!("http://{addr}/{file}"),
        size_bytes: payload().len() as u64,
        sha256: Some(payload_digest()),
    }
}

fn test_config() -> BackendConfig {
    let mut config = BackendConfig::default();
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config
}

struct CountingFetcher {
    inner: HttpDownloader,
    calls: AtomicUsize,
}

impl CountingFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HttpDownloader::new(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelFetcher for CountingFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        on_progress: &(dyn Fn(f32, u64) + Send + Sync),
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(request, on_progress, cancelled).await
    }
}

/// Fetch double whose first call parks until the test releases it; later
/// calls write the payload straight to disk. Lets tests hold an acquisition
/// at a mid-download suspension point deterministically.
struct GatedFetcher {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    gate_used: AtomicBool,
}

impl GatedFetcher {
    fn new() -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let fetcher = Arc::new(Self {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            gate_used: AtomicBool::new(false),
        });
        (fetcher, entered, release)
    }
}

#[async_trait]
impl ModelFetcher for GatedFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        on_progress: &(dyn Fn(f32, u64) + Send + Sync),
        _cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, DownloadError> {
        if !self.gate_used.swap(true, Ordering::SeqCst) {
            on_progress(10.0, 100);
            self.entered.notify_one();
            self.release.notified().await;
        }
        let bytes = payload();
        std::fs::write(request.dest, &bytes).map_err(|source| DownloadError::Io {
            path: request.dest.to_path_buf(),
            source,
        })?;
        on_progress(100.0, bytes.len() as u64);
        Ok(bytes.len() as u64)
    }
}

struct RecordingEngine {
    loads: AtomicUsize,
    fail: bool,
}

impl RecordingEngine {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            fail,
        })
    }
}

impl InferenceEngine for RecordingEngine {
    fn load(
        &self,
        path: &Path,
        _options: &EngineOptions,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::Load {
                path: path.to_path_buf(),
                detail: "format not supported on this device".into(),
            });
        }
        Ok(Box::new(EchoSession))
    }
}

struct EchoSession;

impl EngineSession for EchoSession {
    fn generate(
        &mut self,
        _system_prompt: &str,
        user_prompt: &str,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let reply = format!("echo: {user_prompt}");
        on_text(&reply);
        Ok(reply)
    }
}

fn recorder() -> (
    Arc<Mutex<Vec<ProgressEvent>>>,
    impl Fn(ProgressEvent) + Send + Sync,
) {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = Arc::clone(&events);
        move |event: ProgressEvent| events.lock().unwrap().push(event)
    };
    (events, sink)
}

fn storage_in(tmp: &tempfile::TempDir) -> ModelStorage {
    ModelStorage::with_roots(tmp.path().join("primary"), tmp.path().join("fallback"))
}

#[tokio::test]
async fn fresh_download_walks_every_phase_to_ready() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let engine = RecordingEngine::new(false);
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        engine.clone(),
        test_config(),
    );

    let descriptor = descriptor(addr, "model.gguf");
    let (events, sink) = recorder();
    let ready = runtime.acquire_model(&descriptor, sink).await.unwrap();

    assert_eq!(ready.model_id, descriptor.id);
    assert_eq!(std::fs::read(&ready.path).unwrap(), payload());
    assert_eq!(runtime.state(), AcquisitionState::Ready);
    assert!(!runtime.is_acquiring());
    assert_eq!(engine.loads.load(Ordering::SeqCst), 1);

    let events = events.lock().unwrap();
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(pair[1].percent >= pair[0].percent);
    }
    assert_eq!(events.last().unwrap().percent, 100.0);
    for phase in [
        AcquisitionPhase::Downloading,
        AcquisitionPhase::Validating,
        AcquisitionPhase::Initializing,
        AcquisitionPhase::Ready,
    ] {
        assert!(
            events.iter().any(|event| event.phase == phase),
            "missing phase {phase:?}"
        );
    }
}

#[tokio::test]
async fn second_acquire_is_a_cache_hit_and_skips_the_network() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let engine = RecordingEngine::new(false);
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        engine.clone(),
        test_config(),
    );

    let descriptor = descriptor(addr, "model.gguf");
    runtime.acquire_model(&descriptor, |_| {}).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    let ready = runtime.acquire_model(&descriptor, |_| {}).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1, "network hit on cached model");
    assert_eq!(std::fs::read(&ready.path).unwrap(), payload());
    assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn corrupt_local_file_is_deleted_and_redownloaded() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        RecordingEngine::new(false),
        test_config(),
    );

    let descriptor = descriptor(addr, "model.gguf");
    // right size, wrong bytes: survives the size gate, fails the digest
    let storage = storage_in(&tmp);
    let path = storage.resolve(&descriptor).unwrap();
    let mut corrupt = payload();
    corrupt[0] ^= 0xFF;
    std::fs::write(&path, &corrupt).unwrap();

    let ready = runtime.acquire_model(&descriptor, |_| {}).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&ready.path).unwrap(), payload());
}

#[tokio::test]
async fn post_download_digest_mismatch_is_a_validation_failure() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = RecordingEngine::new(false);
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        CountingFetcher::new(),
        engine.clone(),
        test_config(),
    );

    // the server delivers the bytes faithfully, but the descriptor expects
    // a different digest, as if the artifact were corrupted in transit
    let mut descriptor = descriptor(addr, "model.gguf");
    descriptor.sha256 = Some("0".repeat(64));

    let error = runtime
        .acquire_model(&descriptor, |_| {})
        .await
        .unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Validation));
    assert_eq!(
        runtime.state(),
        AcquisitionState::Failed(FailureKind::Validation)
    );
    assert_eq!(engine.loads.load(Ordering::SeqCst), 0, "engine must not see a bad artifact");

    let storage = storage_in(&tmp);
    let path = storage.resolve(&descriptor).unwrap();
    assert!(!path.exists(), "bad artifact must be deleted");
}

#[tokio::test]
async fn retry_exhaustion_surfaces_a_download_failure() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        RecordingEngine::new(false),
        test_config(),
    );

    let descriptor = descriptor(addr, "flaky.gguf");
    let error = runtime
        .acquire_model(&descriptor, |_| {})
        .await
        .unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Download));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        runtime.state(),
        AcquisitionState::Failed(FailureKind::Download)
    );
}

#[tokio::test]
async fn not_found_fails_on_the_first_attempt() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        RecordingEngine::new(false),
        test_config(),
    );

    let descriptor = descriptor(addr, "missing.gguf");
    let error = runtime
        .acquire_model(&descriptor, |_| {})
        .await
        .unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Download));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn engine_rejection_keeps_the_valid_artifact() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        CountingFetcher::new(),
        RecordingEngine::new(true),
        test_config(),
    );

    let descriptor = descriptor(addr, "model.gguf");
    let error = runtime
        .acquire_model(&descriptor, |_| {})
        .await
        .unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Engine));
    assert_eq!(runtime.state(), AcquisitionState::Failed(FailureKind::Engine));

    // the bytes are valid by hash; only the engine refused them
    let storage = storage_in(&tmp);
    let path = storage.resolve(&descriptor).unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn new_acquisition_supersedes_the_inflight_one() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let (fetcher, entered, release) = GatedFetcher::new();
    let runtime = Arc::new(LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher,
        RecordingEngine::new(false),
        test_config(),
    ));

    let first = descriptor(addr, "model.gguf");
    let (first_events, first_sink) = recorder();
    let first_task = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.acquire_model(&first, first_sink).await })
    };
    entered.notified().await;
    let events_before_supersede = first_events.lock().unwrap().len();

    // user picks a different model while the first is still downloading
    let second = descriptor(addr, "other.gguf");
    let (second_events, second_sink) = recorder();
    let second_result = runtime.acquire_model(&second, second_sink).await;
    release.notify_one();
    let first_result = first_task.await.unwrap();

    assert!(matches!(first_result, Err(AcquisitionError::Canceled)));
    let ready = second_result.unwrap();
    assert_eq!(ready.model_id, "other");

    // the superseded session went silent the moment it lost the token
    assert_eq!(first_events.lock().unwrap().len(), events_before_supersede);
    assert!(first_events
        .lock()
        .unwrap()
        .iter()
        .all(|event| event.phase != AcquisitionPhase::Ready));

    // exactly one terminal report across both sessions
    assert_eq!(second_events.lock().unwrap().last().unwrap().percent, 100.0);
    assert_eq!(runtime.state(), AcquisitionState::Ready);
}

#[tokio::test]
async fn cancel_stops_the_run_at_the_next_suspension_point() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let (fetcher, entered, release) = GatedFetcher::new();
    let runtime = Arc::new(LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher,
        RecordingEngine::new(false),
        test_config(),
    ));

    let descriptor = descriptor(addr, "model.gguf");
    let (events, sink) = recorder();
    let task = {
        let runtime = Arc::clone(&runtime);
        let descriptor = descriptor.clone();
        tokio::spawn(async move { runtime.acquire_model(&descriptor, sink).await })
    };
    entered.notified().await;

    runtime.cancel_acquisition();
    assert!(!runtime.is_acquiring());
    let events_at_cancel = events.lock().unwrap().len();

    release.notify_one();
    let result = task.await.unwrap();

    assert!(matches!(result, Err(AcquisitionError::Canceled)));
    assert_eq!(runtime.state(), AcquisitionState::Idle);
    assert_eq!(events.lock().unwrap().len(), events_at_cancel);
}

#[tokio::test]
async fn clear_cache_forces_a_fresh_download() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        fetcher.clone(),
        RecordingEngine::new(false),
        test_config(),
    );

    let descriptor = descriptor(addr, "model.gguf");
    let ready = runtime.acquire_model(&descriptor, |_| {}).await.unwrap();
    assert!(runtime.loaded_model().is_some());

    runtime.clear_cache(&descriptor).unwrap();
    assert!(!ready.path.exists());
    assert!(runtime.loaded_model().is_none(), "loaded model must be released");

    runtime.acquire_model(&descriptor, |_| {}).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn generate_requires_a_loaded_model_and_streams_text() {
    let addr = serve_models().await;
    let tmp = tempfile::tempdir().unwrap();
    let runtime = LlmRuntime::with_parts(
        storage_in(&tmp),
        CountingFetcher::new(),
        RecordingEngine::new(false),
        test_config(),
    );

    let missing = runtime.generate("sys", "hi", |_| {}).await;
    assert!(matches!(missing, Err(EngineError::NotLoaded)));

    let descriptor = descriptor(addr, "model.gguf");
    runtime.acquire_model(&descriptor, |_| {}).await.unwrap();

    let (sender, receiver) = std::sync::mpsc::channel::<String>();
    let reply = runtime
        .generate("sys", "hello there", move |text| {
            let _ = sender.send(text.to_string());
        })
        .await
        .unwrap();

    assert_eq!(reply, "echo: hello there");
    let streamed: Vec<String> = receiver.try_iter().collect();
    assert_eq!(streamed.last().map(String::as_str), Some("echo: hello there"));

    // the session goes back into the slot for the next turn
    let again = runtime.generate("sys", "again", |_| {}).await.unwrap();
    assert_eq!(again, "echo: again");
}
