//! Integration tests for the orchestration pipeline.
//!
//! A harness wires a real state store, limiter, dispatcher, and file mover
//! to scripted collaborators, then injects discovery events directly —
//! no filesystem watcher involved.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lightbox::alerts::AlertGate;
use lightbox::clients::{
    Analyzer, Converter, Notifier, PostRequest, Publisher, StepError, StepResult,
};
use lightbox::clients::files::LocalFileMover;
use lightbox::config::{RateLimitConfig, RetryConfig};
use lightbox::dispatch::{Dispatcher, PipelineSettings};
use lightbox::limiter::RateLimiter;
use lightbox::model::{Discovery, ErrorKind, FileId, State};
use lightbox::orchestrator::Orchestrator;
use lightbox::retry::RetryPolicy;
use lightbox::store::StateStore;

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct ScriptedPublisher {
    calls: AtomicUsize,
    script: Mutex<VecDeque<StepResult<String>>>,
    last_request: Mutex<Option<PostRequest>>,
    delay: Duration,
}

impl ScriptedPublisher {
    fn ok() -> Arc<Self> {
        Self::with_script(vec![])
    }

    fn with_script(script: Vec<StepResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            last_request: Mutex::new(None),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            last_request: Mutex::new(None),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(&self, request: &PostRequest) -> StepResult<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock().unwrap() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(format!("post-{n}")),
        }
    }
}

struct StaticAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    async fn analyze(&self, _file: &std::path::Path) -> StepResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("a red square on white".to_string())
    }
}

/// Renames nothing, encodes nothing: writes a sibling .jpg marker file.
struct MarkerConverter;

#[async_trait]
impl Converter for MarkerConverter {
    async fn convert(&self, file: &std::path::Path) -> StepResult<PathBuf> {
        let target = file.with_extension("jpg");
        tokio::fs::write(&target, b"converted")
            .await
            .map_err(|e| StepError::new(ErrorKind::Internal, e.to_string()))?;
        Ok(target)
    }
}

struct CountingNotifier {
    sent: AtomicUsize,
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify(&self, _title: &str, _message: &str) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct HarnessConfig {
    burst_limit: u32,
    burst_window: Duration,
    upload_delay: Duration,
    max_attempts: u32,
    base_delay: Duration,
    max_concurrent: usize,
    step_timeout: Duration,
    grace: Duration,
    analysis_enabled: bool,
    convert_extensions: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            burst_limit: 100,
            burst_window: Duration::from_secs(60),
            upload_delay: Duration::ZERO,
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_concurrent: 3,
            step_timeout: Duration::from_secs(30),
            grace: Duration::from_millis(200),
            analysis_enabled: false,
            convert_extensions: vec![],
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<StateStore>,
    publisher: Arc<ScriptedPublisher>,
    analyzer: Arc<StaticAnalyzer>,
    notifier: Arc<CountingNotifier>,
    discovery_tx: tokio::sync::mpsc::Sender<Discovery>,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<lightbox::error::Result<()>>,
}

impl Harness {
    fn start(config: HarnessConfig, publisher: Arc<ScriptedPublisher>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("upload/cats")).unwrap();
        let store = Arc::new(StateStore::in_memory().unwrap());
        Self::build(dir, store, config, publisher)
    }

    /// Second run over an existing store and directory tree, as after a
    /// process restart.
    fn restart(
        dir: tempfile::TempDir,
        store: Arc<StateStore>,
        publisher: Arc<ScriptedPublisher>,
    ) -> Self {
        Self::build(dir, store, HarnessConfig::default(), publisher)
    }

    fn build(
        dir: tempfile::TempDir,
        store: Arc<StateStore>,
        config: HarnessConfig,
        publisher: Arc<ScriptedPublisher>,
    ) -> Self {
        let analyzer = Arc::new(StaticAnalyzer {
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicUsize::new(0),
        });
        let mover = Arc::new(LocalFileMover::new(
            dir.path().join("archive"),
            dir.path().join("failed"),
        ));

        let shutdown = CancellationToken::new();
        let work_cancel = CancellationToken::new();
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
        let (discovery_tx, discovery_rx) = tokio::sync::mpsc::channel(64);

        let dispatcher = Dispatcher::new(
            config.max_concurrent,
            analyzer.clone(),
            Arc::new(MarkerConverter),
            publisher.clone(),
            PipelineSettings {
                step_timeout: config.step_timeout,
                analysis_enabled: config.analysis_enabled,
                convert_extensions: config.convert_extensions.clone(),
                post_state: "published".to_string(),
                common_tags: vec!["via-lightbox".to_string()],
            },
            event_tx,
            work_cancel.clone(),
        );

        let orchestrator = Orchestrator::new(
            store.clone(),
            RateLimiter::new(&RateLimitConfig {
                upload_delay: config.upload_delay,
                burst_limit: config.burst_limit,
                burst_window: config.burst_window,
                hourly_limit: 10_000,
                daily_limit: 100_000,
            }),
            RetryPolicy::new(&RetryConfig {
                max_attempts: config.max_attempts,
                base_delay: config.base_delay,
                max_delay: Duration::from_secs(1),
            }),
            dispatcher,
            mover,
            AlertGate::new(notifier.clone(), Duration::from_secs(300)),
            discovery_rx,
            event_rx,
            shutdown.clone(),
            work_cancel,
            config.grace,
        );

        let handle = tokio::spawn(orchestrator.run());

        Self {
            dir,
            store,
            publisher,
            analyzer,
            notifier,
            discovery_tx,
            shutdown,
            handle,
        }
    }

    /// Create a real file under the watch area and return its discovery event.
    fn drop_file(&self, name: &str) -> Discovery {
        let path = self.dir.path().join("upload/cats").join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        Discovery {
            path,
            category: "cats".to_string(),
            size: meta.len(),
            modified: meta.modified().unwrap(),
        }
    }

    async fn discover(&self, discovery: &Discovery) {
        self.discovery_tx.send(discovery.clone()).await.unwrap();
    }

    async fn wait_for_state(&self, id: &FileId, state: State) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.store
                .get(id)
                .unwrap()
                .map(|item| item.state == state)
                .unwrap_or(false)
        })
        .await
    }

    async fn stop(self) -> lightbox::error::Result<()> {
        self.shutdown.cancel();
        self.handle.await.expect("orchestrator panicked")
    }
}

async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn transient(message: &str) -> StepResult<String> {
    Err(StepError::new(ErrorKind::Network, message))
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publishes_and_archives_a_discovered_file() {
    let harness = Harness::start(HarnessConfig::default(), ScriptedPublisher::ok());
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);

    let item = harness.store.get(&id).unwrap().unwrap();
    assert_eq!(item.attempt_count, 0);
    assert_eq!(item.post_id.as_deref(), Some("post-1"));
    assert_eq!(harness.publisher.calls(), 1);

    // Original moved out of the watch area into the archive.
    assert!(!discovery.path.exists());
    assert!(harness.dir.path().join("archive/cats/a.jpg").exists());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn analysis_caption_reaches_the_publisher() {
    let config = HarnessConfig {
        analysis_enabled: true,
        ..Default::default()
    };
    let harness = Harness::start(config, ScriptedPublisher::ok());
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);

    assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 1);
    let request = harness.publisher.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.caption.as_deref(), Some("a red square on white"));
    assert!(request.tags.contains(&"cats".to_string()));
    assert!(request.tags.contains(&"via-lightbox".to_string()));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn conversion_uploads_the_converted_file_and_cleans_it_up() {
    let config = HarnessConfig {
        convert_extensions: vec![".bmp".to_string()],
        ..Default::default()
    };
    let harness = Harness::start(config, ScriptedPublisher::ok());
    let discovery = harness.drop_file("pic.bmp");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);

    let request = harness.publisher.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.file.extension().unwrap(), "jpg");

    // Original archived, conversion artifact removed.
    assert!(harness.dir.path().join("archive/cats/pic.bmp").exists());
    assert!(!harness.dir.path().join("upload/cats/pic.jpg").exists());

    harness.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Idempotent ingestion / exactly-once publication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_discovery_events_publish_once() {
    let harness = Harness::start(HarnessConfig::default(), ScriptedPublisher::ok());
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);

    // Give any erroneous second run time to surface.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.publisher.calls(), 1);

    let counts = harness.store.counts_by_state().unwrap();
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    assert_eq!(total, 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_discovery_while_in_flight_is_a_no_op() {
    let harness = Harness::start(
        HarnessConfig::default(),
        ScriptedPublisher::slow(Duration::from_millis(300)),
    );
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Publishing).await);

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);
    assert_eq!(harness.publisher.calls(), 1);

    harness.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Retry behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried_and_counted() {
    let publisher = ScriptedPublisher::with_script(vec![
        transient("connection reset"),
        transient("connection reset"),
    ]);
    let config = HarnessConfig {
        max_attempts: 5,
        ..Default::default()
    };
    let harness = Harness::start(config, publisher);
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Archived).await);

    let item = harness.store.get(&id).unwrap().unwrap();
    assert_eq!(item.attempt_count, 2);
    assert_eq!(harness.publisher.calls(), 3);
    assert_eq!(harness.notifier.sent.load(Ordering::SeqCst), 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_abandon_quarantine_and_notify_once() {
    let publisher = ScriptedPublisher::with_script(vec![
        transient("boom"),
        transient("boom"),
    ]);
    let config = HarnessConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let harness = Harness::start(config, publisher);
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Failed).await);

    assert_eq!(harness.publisher.calls(), 2);
    let item = harness.store.get(&id).unwrap().unwrap();
    assert_eq!(item.attempt_count, 2);
    assert_eq!(item.last_error_kind, Some(ErrorKind::Network));

    // File is out of the watch area so a restart will not reprocess it.
    assert!(!discovery.path.exists());
    assert!(harness.dir.path().join("failed/cats/a.jpg").exists());
    assert_eq!(harness.notifier.sent.load(Ordering::SeqCst), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn permanent_failure_abandons_without_retry() {
    let publisher = ScriptedPublisher::with_script(vec![Err(StepError::new(
        ErrorKind::Auth,
        "invalid credentials",
    ))]);
    let harness = Harness::start(HarnessConfig::default(), publisher);
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Failed).await);

    assert_eq!(harness.publisher.calls(), 1);
    assert_eq!(harness.notifier.sent.load(Ordering::SeqCst), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_abandonments_of_one_kind_notify_once_within_cooldown() {
    let publisher = ScriptedPublisher::with_script(vec![
        Err(StepError::new(ErrorKind::Auth, "bad token")),
        Err(StepError::new(ErrorKind::Auth, "bad token")),
    ]);
    let harness = Harness::start(HarnessConfig::default(), publisher);

    let first = harness.drop_file("a.jpg");
    let second = harness.drop_file("b.jpg");
    harness.discover(&first).await;
    harness.discover(&second).await;

    assert!(harness.wait_for_state(&first.file_id(), State::Failed).await);
    assert!(harness.wait_for_state(&second.file_id(), State::Failed).await);

    assert_eq!(harness.notifier.sent.load(Ordering::SeqCst), 1);

    harness.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Admission control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_limit_caps_immediate_admissions() {
    let config = HarnessConfig {
        burst_limit: 3,
        burst_window: Duration::from_secs(120),
        ..Default::default()
    };
    let harness = Harness::start(config, ScriptedPublisher::ok());

    let discoveries: Vec<Discovery> = (0..5)
        .map(|i| harness.drop_file(&format!("f{i}.jpg")))
        .collect();
    for discovery in &discoveries {
        harness.discover(discovery).await;
    }

    assert!(
        wait_until(Duration::from_secs(5), || harness.publisher.calls() == 3).await,
        "expected exactly 3 admissions"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.publisher.calls(), 3);

    // The two denied items are still waiting, untouched.
    let discovered = harness.store.list_by_state(State::Discovered).unwrap();
    assert_eq!(discovered.len(), 2);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn denied_items_are_admitted_after_the_window_rolls() {
    let config = HarnessConfig {
        burst_limit: 1,
        burst_window: Duration::from_millis(300),
        ..Default::default()
    };
    let harness = Harness::start(config, ScriptedPublisher::ok());

    let first = harness.drop_file("a.jpg");
    let second = harness.drop_file("b.jpg");
    harness.discover(&first).await;
    harness.discover(&second).await;

    // Second admission happens on the scheduled re-check, no extra nudge.
    assert!(harness.wait_for_state(&first.file_id(), State::Archived).await);
    assert!(harness.wait_for_state(&second.file_id(), State::Archived).await);
    assert_eq!(harness.publisher.calls(), 2);

    harness.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_mid_publish_reverts_to_retrying() {
    let harness = Harness::start(
        HarnessConfig {
            grace: Duration::from_millis(100),
            ..Default::default()
        },
        ScriptedPublisher::slow(Duration::from_secs(30)),
    );
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();

    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Publishing).await);

    let store = harness.store.clone();
    harness.stop().await.unwrap();

    let item = store.get(&id).unwrap().unwrap();
    assert_eq!(item.state, State::Retrying);
    // Cancellation is not a failure; no attempt was consumed.
    assert_eq!(item.attempt_count, 0);
}

#[tokio::test]
async fn restart_resumes_swept_items() {
    // First run: killed mid-publish, item left Retrying.
    let publisher = ScriptedPublisher::slow(Duration::from_secs(30));
    let harness = Harness::start(
        HarnessConfig {
            grace: Duration::from_millis(100),
            ..Default::default()
        },
        publisher,
    );
    let discovery = harness.drop_file("a.jpg");
    let id = discovery.file_id();
    harness.discover(&discovery).await;
    assert!(harness.wait_for_state(&id, State::Publishing).await);

    let store = harness.store.clone();
    let dir = harness.dir;
    harness.shutdown.cancel();
    harness.handle.await.unwrap().unwrap();
    assert_eq!(store.get(&id).unwrap().unwrap().state, State::Retrying);

    // Second run over the same store: recovery schedules the item and it
    // publishes without a new discovery event.
    let harness = Harness::restart(dir, store.clone(), ScriptedPublisher::ok());
    assert!(harness.wait_for_state(&id, State::Archived).await);
    assert_eq!(harness.publisher.calls(), 1);

    harness.stop().await.unwrap();
}
