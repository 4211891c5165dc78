//! End-to-end tests for the chat pipeline
//!
//! The intent and retrieval services are replaced by in-process fakes and time
//! is driven by a `ManualClock`.

use async_trait::async_trait;
use colloquy_core::prelude::*;
use colloquy_core::services::{INTENT_SERVICE, RETRIEVAL_SERVICE};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Intent service that classifies by keyword and records what it was asked
#[derive(Default)]
struct FakeIntent {
    calls: AtomicUsize,
    failing: AtomicBool,
    seen: Mutex<Vec<String>>,
}

impl FakeIntent {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_text(&self) -> Option<String> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Dependency<IntentRequest, IntentResult> for FakeIntent {
    async fn call(&self, request: &IntentRequest) -> Result<IntentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.text.clone());

        if self.failing.load(Ordering::SeqCst) {
            return Err(ColloquyError::dependency(INTENT_SERVICE, "HTTP 500"));
        }

        let text = request.text.to_lowercase();
        let mut entities = Vec::new();
        if text.contains("install nginx") {
            entities.push(Entity::new("package", "nginx", 0.92));
        }
        if text.contains("22.04") {
            entities.push(Entity::new("ubuntu_version", "22.04", 0.95));
        }

        let intent = if text.contains("install") || text.contains("update") {
            "MakeUpdate"
        } else if text.contains("restart") {
            "Troubleshooting"
        } else {
            "None"
        };

        Ok(IntentResult {
            intent: intent.to_string(),
            confidence: 0.9,
            entities,
        })
    }
}

/// Retrieval service with a fixed answer
#[derive(Default)]
struct FakeRetrieval {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeRetrieval {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dependency<RetrievalRequest, RetrievalResult> for FakeRetrieval {
    async fn call(&self, request: &RetrievalRequest) -> Result<RetrievalResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(ColloquyError::dependency(RETRIEVAL_SERVICE, "HTTP 503"));
        }

        Ok(RetrievalResult {
            response: format!("Answer for: {}", request.query),
            confidence: 0.85,
            sources: vec![Source {
                id: "doc-1".to_string(),
                content: "apt documentation".to_string(),
                similarity: 0.85,
                source: "askubuntu".to_string(),
            }],
        })
    }
}

/// Intent service that never answers in time
struct SlowIntent;

#[async_trait]
impl Dependency<IntentRequest, IntentResult> for SlowIntent {
    async fn call(&self, _request: &IntentRequest) -> Result<IntentResult> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(ColloquyError::dependency(INTENT_SERVICE, "unreachable"))
    }
}

/// Persistence backend that is always down
struct BrokenPersistence;

#[async_trait]
impl SessionPersistence for BrokenPersistence {
    async fn save(&self, _session: &Session) -> Result<()> {
        Err(ColloquyError::SessionStore("connection refused".to_string()))
    }

    async fn load(&self, _session_id: &str) -> Result<Option<Session>> {
        Err(ColloquyError::SessionStore("connection refused".to_string()))
    }

    async fn delete(&self, _session_id: &str) -> Result<bool> {
        Err(ColloquyError::SessionStore("connection refused".to_string()))
    }

    async fn purge_expired(&self) -> Result<usize> {
        Err(ColloquyError::SessionStore("connection refused".to_string()))
    }

    async fn health(&self) -> StorageHealth {
        StorageHealth {
            backend: "broken".to_string(),
            connected: false,
        }
    }
}

/// Memory backend whose first `failing_loads` loads fail
struct FlakyPersistence {
    inner: Arc<MemoryPersistence>,
    failing_loads: AtomicUsize,
}

#[async_trait]
impl SessionPersistence for FlakyPersistence {
    async fn save(&self, session: &Session) -> Result<()> {
        self.inner.save(session).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(ColloquyError::SessionStore("timed out".to_string()));
        }
        self.inner.load(session_id).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        self.inner.delete(session_id).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired().await
    }

    async fn health(&self) -> StorageHealth {
        self.inner.health().await
    }
}

struct Harness {
    pipeline: ChatPipeline,
    clock: Arc<ManualClock>,
    intent: Arc<FakeIntent>,
    retrieval: Arc<FakeRetrieval>,
}

fn config() -> ColloquyConfig {
    let mut config = ColloquyConfig::default();
    config.session = config
        .session
        .with_history_limit(6)
        .with_idle_timeout(Duration::from_secs(600));
    config.dependencies.retrieval.failure_threshold = 3;
    config.dependencies.retrieval.reset_timeout = Duration::from_secs(30);
    config
}

fn harness_with(config: ColloquyConfig, persistence: Option<Arc<dyn SessionPersistence>>) -> Harness {
    harness_with_clock(config, persistence, Arc::new(ManualClock::starting_now()))
}

fn harness_with_clock(
    config: ColloquyConfig,
    persistence: Option<Arc<dyn SessionPersistence>>,
    clock: Arc<ManualClock>,
) -> Harness {
    let intent = Arc::new(FakeIntent::default());
    let retrieval = Arc::new(FakeRetrieval::default());

    let mut builder = ChatPipeline::builder(config)
        .clock(clock.clone())
        .intent_service(intent.clone())
        .retrieval_service(retrieval.clone());
    if let Some(persistence) = persistence {
        builder = builder.persistence(persistence);
    }

    Harness {
        pipeline: builder.build().unwrap(),
        clock,
        intent,
        retrieval,
    }
}

fn harness() -> Harness {
    harness_with(config(), None)
}

#[tokio::test]
async fn test_fresh_session_standalone_question() {
    let h = harness();

    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?"))
        .await
        .unwrap();

    assert!(reply.rewritten_query.is_none());
    assert_eq!(h.intent.last_text().as_deref(), Some("How do I update Ubuntu?"));
    assert_eq!(reply.intent, "MakeUpdate");
    assert!(!reply.suggestions.is_empty());
    assert!(!reply.degraded);
    assert!(!reply.session_id.is_empty());
    assert_eq!(reply.history.len(), 2);
    assert_eq!(reply.history[0].role, Role::User);
    assert_eq!(reply.history[1].role, Role::Assistant);
    assert_eq!(reply.history[1].content, reply.response);
}

#[tokio::test]
async fn test_pronoun_resolved_from_previous_turn() {
    let h = harness();

    let first = h
        .pipeline
        .handle(ChatRequest::new("How do I install nginx on my server?"))
        .await
        .unwrap();
    assert_eq!(first.entities, vec![Entity::new("package", "nginx", 0.92)]);

    let second = h
        .pipeline
        .handle(ChatRequest::new("How do I restart it?").with_session(first.session_id.clone()))
        .await
        .unwrap();

    assert_eq!(
        second.rewritten_query.as_deref(),
        Some("Given our discussion regarding nginx about MakeUpdate, How do I restart nginx?")
    );
    assert!(h.intent.last_text().unwrap().ends_with("How do I restart nginx?"));
    assert_eq!(second.session_id, first.session_id);
}

#[tokio::test]
async fn test_open_retrieval_circuit_skips_service() {
    let h = harness();
    h.retrieval.failing.store(true, Ordering::SeqCst);

    let session = "scenario-c";
    for _ in 0..3 {
        let reply = h
            .pipeline
            .handle(ChatRequest::new("How do I update Ubuntu?").with_session(session))
            .await
            .unwrap();
        assert!(reply.degraded);
    }
    assert_eq!(h.retrieval.calls(), 3);

    h.clock.advance(Duration::from_secs(10));
    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session(session))
        .await
        .unwrap();

    assert_eq!(h.retrieval.calls(), 3);
    assert!(reply.response.starts_with("It seems you're trying to update or install software."));
    assert_eq!(reply.confidence, 0.3);
    assert!(reply.sources.is_empty());

    let snapshot = h.pipeline.breaker().snapshot("retrieval").unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(h.pipeline.health().await.status, "degraded");

    // Cooldown elapses and the service has recovered
    h.retrieval.failing.store(false, Ordering::SeqCst);
    h.clock.advance(Duration::from_secs(20));
    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session(session))
        .await
        .unwrap();

    assert!(!reply.degraded);
    assert_eq!(h.retrieval.calls(), 4);
    let snapshot = h.pipeline.breaker().snapshot("retrieval").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[tokio::test]
async fn test_idle_session_swept_and_recreated() {
    let h = harness();
    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I install nginx on my server?").with_session("idle"))
        .await
        .unwrap();
    assert_eq!(reply.session_id, "idle");

    h.clock.advance(Duration::from_secs(601));
    let removed = h.pipeline.sweep();
    assert_eq!(removed, vec!["idle".to_string()]);

    let fresh = h.pipeline.store().get_or_create("idle");
    assert!(fresh.is_empty());
    assert!(fresh.entities().is_empty());
}

#[tokio::test]
async fn test_turn_count_and_history_bounds() {
    let h = harness();

    for k in 1..=9u32 {
        let reply = h
            .pipeline
            .handle(ChatRequest::new(format!("Question number {} about packages", k)).with_session("bounded"))
            .await
            .unwrap();
        assert!(reply.history.len() <= 6);
        assert_eq!(h.pipeline.store().get_or_create("bounded").turn_count(), k);
        assert!((2..=4).contains(&reply.suggestions.len()));
    }

    assert_eq!(h.pipeline.history("bounded").await.len(), 6);
}

#[tokio::test]
async fn test_both_dependencies_down_still_replies() {
    let h = harness();
    h.intent.failing.store(true, Ordering::SeqCst);
    h.retrieval.failing.store(true, Ordering::SeqCst);

    let reply = h
        .pipeline
        .handle(ChatRequest::new("my screen flickers"))
        .await
        .unwrap();

    assert!(reply.degraded);
    assert_eq!(reply.intent, "None");
    assert_eq!(reply.confidence, 0.3);
    assert!(reply.entities.is_empty());
    assert!(reply.sources.is_empty());
    assert!(!reply.response.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_intent_times_out_to_rule_based() {
    let mut config = config();
    config.dependencies.intent.call_timeout = Duration::from_secs(1);

    let clock = Arc::new(ManualClock::starting_now());
    let retrieval = Arc::new(FakeRetrieval::default());
    let pipeline = ChatPipeline::builder(config)
        .clock(clock)
        .intent_service(Arc::new(SlowIntent))
        .retrieval_service(retrieval.clone())
        .build()
        .unwrap();

    let reply = pipeline
        .handle(ChatRequest::new("printer is not printing"))
        .await
        .unwrap();

    assert!(reply.degraded);
    assert_eq!(reply.intent, "SetupPrinter");
    assert_eq!(retrieval.calls(), 1);
    assert_eq!(
        pipeline.breaker().snapshot("intent").unwrap().consecutive_failures,
        1
    );
}

#[tokio::test]
async fn test_blank_message_is_validation_error() {
    let h = harness();
    let err = h.pipeline.handle(ChatRequest::new("")).await.unwrap_err();
    assert!(matches!(err, ColloquyError::Validation(_)));
    assert_eq!(h.intent.calls(), 0);
}

#[tokio::test]
async fn test_session_restored_from_persistence() {
    let clock: SharedClock = Arc::new(ManualClock::starting_now());
    let persistence: Arc<dyn SessionPersistence> =
        Arc::new(MemoryPersistence::new(Duration::from_secs(3600), clock));

    let first = harness_with(config(), Some(persistence.clone()));
    first
        .pipeline
        .handle(ChatRequest::new("How do I install nginx on my server?").with_session("durable"))
        .await
        .unwrap();

    // A second pipeline with an empty store picks the session up
    let second = harness_with(config(), Some(persistence.clone()));
    let reply = second
        .pipeline
        .handle(ChatRequest::new("How do I restart it?").with_session("durable"))
        .await
        .unwrap();

    assert_eq!(reply.history.len(), 4);
    assert_eq!(second.pipeline.store().get_or_create("durable").turn_count(), 2);
    assert!(reply.rewritten_query.unwrap().contains("restart nginx"));

    assert!(second.pipeline.reset("durable").await);
    assert!(second.pipeline.history("durable").await.is_empty());
}

#[tokio::test]
async fn test_persistence_failure_degrades_to_ephemeral_session() {
    let h = harness_with(config(), Some(Arc::new(BrokenPersistence)));

    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session("ephemeral"))
        .await
        .unwrap();
    assert_eq!(reply.session_id, "ephemeral");
    assert_eq!(reply.history.len(), 2);
    assert!(!h.pipeline.store().contains("ephemeral"));

    let health = h.pipeline.health().await;
    assert_eq!(health.status, "degraded");
    assert!(!health.storage.connected);
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let h = Arc::new(harness());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                for _ in 0..3 {
                    h.pipeline
                        .handle(ChatRequest::new("How do I update Ubuntu?").with_session(format!("s-{}", i)))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..8 {
        let session = h.pipeline.store().get_or_create(&format!("s-{}", i));
        assert_eq!(session.turn_count(), 3);
        assert_eq!(session.history().len(), 6);
    }
    assert_eq!(h.pipeline.health().await.active_sessions, 8);
}

#[tokio::test]
async fn test_failed_load_does_not_overwrite_persisted_session() {
    let clock = Arc::new(ManualClock::starting_now());
    let memory = Arc::new(MemoryPersistence::new(Duration::from_secs(3600), clock.clone()));

    let writer = harness_with_clock(config(), Some(memory.clone() as Arc<dyn SessionPersistence>), clock.clone());
    for _ in 0..3 {
        writer
            .pipeline
            .handle(ChatRequest::new("How do I update Ubuntu?").with_session("shared"))
            .await
            .unwrap();
    }

    let flaky = Arc::new(FlakyPersistence {
        inner: memory.clone(),
        failing_loads: AtomicUsize::new(1),
    });
    let reader = harness_with_clock(config(), Some(flaky as Arc<dyn SessionPersistence>), clock.clone());

    let reply = reader
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session("shared"))
        .await
        .unwrap();
    assert_eq!(reply.history.len(), 2);
    assert_eq!(memory.load("shared").await.unwrap().unwrap().turn_count(), 3);
    assert!(!reader.pipeline.store().contains("shared"));

    // The backend is back; the next request continues the stored session
    let reply = reader
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session("shared"))
        .await
        .unwrap();
    assert_eq!(reply.history.len(), 6);
    assert_eq!(memory.load("shared").await.unwrap().unwrap().turn_count(), 4);
}

#[tokio::test]
async fn test_persisted_session_outlives_idle_timeout() {
    let clock = Arc::new(ManualClock::starting_now());
    let memory = Arc::new(MemoryPersistence::new(
        Duration::from_secs(24 * 3600),
        clock.clone(),
    ));
    let h = harness_with_clock(config(), Some(memory.clone() as Arc<dyn SessionPersistence>), clock.clone());

    for _ in 0..3 {
        h.pipeline
            .handle(ChatRequest::new("How do I update Ubuntu?").with_session("returning"))
            .await
            .unwrap();
    }

    clock.advance(Duration::from_secs(2 * 3600));
    let reply = h
        .pipeline
        .handle(ChatRequest::new("How do I update Ubuntu?").with_session("returning"))
        .await
        .unwrap();

    assert_eq!(reply.history.len(), 6);
    assert_eq!(h.pipeline.store().get_or_create("returning").turn_count(), 4);
    assert_eq!(memory.load("returning").await.unwrap().unwrap().turn_count(), 4);
}

#[tokio::test]
async fn test_stale_entities_not_used_for_context() {
    let mut config = config();
    config.session = config
        .session
        .with_idle_timeout(Duration::from_secs(2 * 3600))
        .with_entity_max_age(Duration::from_secs(30 * 60));
    let h = harness_with(config, None);

    let first = h
        .pipeline
        .handle(ChatRequest::new("How do I install nginx on my server?"))
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(45 * 60));
    let second = h
        .pipeline
        .handle(ChatRequest::new("How do I restart it?").with_session(first.session_id))
        .await
        .unwrap();

    assert_eq!(
        second.rewritten_query.as_deref(),
        Some("Given our discussion about MakeUpdate, How do I restart it?")
    );
    assert!(!second.response.contains("nginx"));
}

#[tokio::test]
async fn test_rule_based_intent_uses_message_not_context() {
    let h = harness();
    h.intent.failing.store(true, Ordering::SeqCst);
    h.retrieval.failing.store(true, Ordering::SeqCst);

    let first = h
        .pipeline
        .handle(ChatRequest::new("How do I set up my printer?"))
        .await
        .unwrap();
    assert_eq!(first.intent, "SetupPrinter");

    let second = h
        .pipeline
        .handle(ChatRequest::new("what about errors?").with_session(first.session_id))
        .await
        .unwrap();

    assert!(second.rewritten_query.unwrap().contains("SetupPrinter"));
    assert_eq!(second.intent, "Troubleshooting");
}

#[tokio::test]
async fn test_purge_expired_snapshots() {
    let clock = Arc::new(ManualClock::starting_now());
    let memory = Arc::new(MemoryPersistence::new(Duration::from_secs(3600), clock.clone()));
    let h = harness_with_clock(config(), Some(memory.clone() as Arc<dyn SessionPersistence>), clock.clone());

    for id in ["one", "two"] {
        h.pipeline
            .handle(ChatRequest::new("How do I update Ubuntu?").with_session(id))
            .await
            .unwrap();
    }
    assert_eq!(memory.len().await, 2);

    clock.advance(Duration::from_secs(48 * 3600));
    assert_eq!(h.pipeline.purge_expired_snapshots().await, 2);
    assert!(memory.is_empty().await);
    assert_eq!(h.pipeline.purge_expired_snapshots().await, 0);
}
