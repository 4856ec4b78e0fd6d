//! Common test fakes: a recordable backend, persistence, sender, and gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use floodgate::gateway::{GatewaySender, SendError};
use floodgate::llm::{
    BackendGate, CompletionBackend, CompletionRequest, CompletionResponse, LlmError, Message,
};
use floodgate::protocol::{InboundMessage, Sender};
use floodgate::store::{SessionPersistence, StorageResult};
use floodgate::{Config, DispatcherDeps, MessageDispatcher};

// ============================================================================
// Backend
// ============================================================================

/// Completion backend that records requests and can be delayed, gated on a
/// semaphore, or told to fail its next call.
#[derive(Default)]
pub struct RecordingBackend {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    fail_next: AtomicBool,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// A backend that blocks each call until a permit is added to the
    /// returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (backend, gate)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl CompletionBackend for RecordingBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().await.push(request);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LlmError::Unavailable("induced outage".to_string()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            text: format!("completion-{call}"),
            ..Default::default()
        })
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// In-memory persistence that records saves and flushes.
#[derive(Default)]
pub struct MemoryPersistence {
    saved: Mutex<HashMap<String, Vec<Message>>>,
    flushed: Mutex<Vec<String>>,
}

impl MemoryPersistence {
    pub async fn saved(&self, channel_id: &str) -> Vec<Message> {
        self.saved
            .lock()
            .await
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn flushed(&self) -> Vec<String> {
        self.flushed.lock().await.clone()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn load(&self, _channel_id: &str) -> StorageResult<Option<Vec<Message>>> {
        Ok(None)
    }

    async fn save(&self, channel_id: &str, entries: &[Message]) -> StorageResult<()> {
        self.saved
            .lock()
            .await
            .entry(channel_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn flush(&self, channel_id: &str) -> StorageResult<()> {
        self.flushed.lock().await.push(channel_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Sender / Gate
// ============================================================================

/// Gateway sender that records deliveries and can be made to fail.
#[derive(Default)]
pub struct RecordingSender {
    fail: AtomicBool,
    delivered: Mutex<Vec<(String, String)>>,
    typing: AtomicUsize,
}

impl RecordingSender {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().await.clone()
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewaySender for RecordingSender {
    async fn deliver(&self, target: &str, text: &str) -> Result<String, SendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::new(target, "induced delivery failure"));
        }
        let mut delivered = self.delivered.lock().await;
        delivered.push((target.to_string(), text.to_string()));
        Ok(format!("m{}", delivered.len()))
    }

    async fn send_typing(&self, _target: &str) -> Result<(), SendError> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend gate that can be opened and closed from the test.
pub struct ToggleGate {
    open: AtomicBool,
}

impl ToggleGate {
    pub fn open() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl BackendGate for ToggleGate {
    fn can_execute(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Everything a dispatch test needs, wired together.
pub struct TestHarness {
    pub dispatcher: Arc<MessageDispatcher>,
    pub backend: Arc<RecordingBackend>,
    pub persistence: Arc<MemoryPersistence>,
    pub sender: Arc<RecordingSender>,
    pub gate: Arc<ToggleGate>,
}

/// Config with short timeouts suited to tests.
pub fn test_config() -> Config {
    Config {
        lock_timeout_secs: 5,
        ..Config::default()
    }
}

/// Initialize test logging from `RUST_LOG`. Safe to call repeatedly.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness(config: Config, backend: RecordingBackend) -> TestHarness {
    init_tracing();
    let backend = Arc::new(backend);
    let persistence = Arc::new(MemoryPersistence::default());
    let sender = Arc::new(RecordingSender::default());
    let gate = Arc::new(ToggleGate::open());

    let dispatcher = Arc::new(MessageDispatcher::new(
        config,
        DispatcherDeps {
            backend: Arc::clone(&backend) as Arc<dyn CompletionBackend>,
            gate: Arc::clone(&gate) as Arc<dyn BackendGate>,
            persistence: Arc::clone(&persistence) as Arc<dyn SessionPersistence>,
            sender: Arc::clone(&sender) as Arc<dyn GatewaySender>,
        },
    ));

    TestHarness {
        dispatcher,
        backend,
        persistence,
        sender,
        gate,
    }
}

/// Build an inbound message with sensible defaults.
pub fn message(channel: &str, sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        channel_id: channel.to_string(),
        sender: Sender {
            id: sender.to_string(),
            display_name: None,
        },
        text: text.to_string(),
        attachments: Vec::new(),
        reply_target: format!("{channel}-replies"),
        should_respond: true,
        message_id: format!("src-{text}"),
        metadata: serde_json::Value::Null,
    }
}
