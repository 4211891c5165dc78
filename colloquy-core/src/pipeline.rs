//! Chat orchestration pipeline
//!
//! Coordinates one inbound chat message end to end:
//!
//! ```text
//! load session → rewrite → intent → record topic → retrieval → record entities
//!   → enhance → suggest → append history → increment turn → persist → reply
//! ```
//!
//! Dependency failures are absorbed by the circuit breaker and its fallbacks;
//! persistence failures degrade to an ephemeral session. Only validation
//! errors reach the caller.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitSnapshot, CircuitState, Dependency, DependencyOptions,
    GuardedDependency,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::ColloquyConfig;
use crate::context::{Entity, HistoryEntry, HistoryMetadata, Session, SessionStore};
use crate::enhancer::ResponseEnhancer;
use crate::error::{ColloquyError, Result};
use crate::persistence::{SessionPersistence, StorageHealth};
use crate::rewriter::QueryRewriter;
use crate::services::{
    HttpIntentService, HttpRetrievalService, INTENT_SERVICE, IntentRequest, IntentResult,
    RETRIEVAL_SERVICE, RetrievalRequest, RetrievalResult, Source, canned_retrieval,
    rule_based_intent,
};
use crate::suggestions::SuggestionGenerator;

/// Inbound chat message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    /// The user's message
    #[serde(default)]
    pub message: String,
    /// Existing session to continue
    #[serde(default)]
    pub session_id: Option<String>,
    /// Opaque context forwarded to the services
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl ChatRequest {
    /// A message without a session
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Builder: continue a session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Builder: attach context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Reply to a chat message
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    /// Enhanced answer
    pub response: String,
    /// Session the message was handled in
    pub session_id: String,
    /// Classified intent
    pub intent: String,
    /// Answer confidence
    pub confidence: f64,
    /// Entities extracted from the message
    pub entities: Vec<Entity>,
    /// Passages backing the answer
    pub sources: Vec<Source>,
    /// Follow-up suggestions
    pub suggestions: Vec<String>,
    /// The query sent downstream, when it differs from the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    /// Most recent history entries, oldest first
    pub history: Vec<HistoryEntry>,
    /// Whether any fallback answered for a dependency
    pub degraded: bool,
}

/// Overall service health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy` when every circuit is closed and storage is reachable
    pub status: &'static str,
    /// Per-dependency circuit state
    pub dependencies: Vec<CircuitSnapshot>,
    /// Storage connectivity
    pub storage: StorageHealth,
    /// Sessions currently held in memory
    pub active_sessions: usize,
}

/// How the session handled by one request relates to persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    /// No backend is configured
    MemoryOnly,
    /// Loaded from the backend, or new to it; saved after the turn
    Persisted,
    /// The backend failed to load; the session is dropped after the reply
    Ephemeral,
}

/// Builder for [`ChatPipeline`]
pub struct PipelineBuilder {
    config: ColloquyConfig,
    clock: SharedClock,
    intent: Option<Arc<dyn Dependency<IntentRequest, IntentResult>>>,
    retrieval: Option<Arc<dyn Dependency<RetrievalRequest, RetrievalResult>>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl PipelineBuilder {
    /// Start from a configuration
    pub fn new(config: ColloquyConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            intent: None,
            retrieval: None,
            persistence: None,
        }
    }

    /// Use a specific clock
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the HTTP intent client
    pub fn intent_service(
        mut self,
        service: Arc<dyn Dependency<IntentRequest, IntentResult>>,
    ) -> Self {
        self.intent = Some(service);
        self
    }

    /// Replace the HTTP retrieval client
    pub fn retrieval_service(
        mut self,
        service: Arc<dyn Dependency<RetrievalRequest, RetrievalResult>>,
    ) -> Self {
        self.retrieval = Some(service);
        self
    }

    /// Persist sessions to a backend
    pub fn persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Build the pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<ChatPipeline> {
        self.config.validate()?;

        let intent_settings = &self.config.dependencies.intent;
        let retrieval_settings = self.config.dependencies.retrieval.service();

        let client = reqwest::Client::new();
        let intent_service = self.intent.unwrap_or_else(|| {
            Arc::new(HttpIntentService::with_client(
                client.clone(),
                intent_settings.base_url.clone(),
            ))
        });
        let retrieval_service = self.retrieval.unwrap_or_else(|| {
            Arc::new(HttpRetrievalService::with_client(
                client,
                retrieval_settings.base_url.clone(),
            ))
        });

        let breaker = Arc::new(CircuitBreaker::new(Arc::clone(&self.clock)));
        let intent = breaker.register_dependency(
            INTENT_SERVICE,
            intent_service,
            DependencyOptions::new(intent_settings.breaker_config()).with_fallback(rule_based_intent),
        );
        let retrieval = breaker.register_dependency(
            RETRIEVAL_SERVICE,
            retrieval_service,
            DependencyOptions::new(retrieval_settings.breaker_config())
                .with_fallback(canned_retrieval),
        );

        Ok(ChatPipeline {
            store: Arc::new(SessionStore::new(
                self.config.session.clone(),
                Arc::clone(&self.clock),
            )),
            breaker,
            intent,
            retrieval,
            rewriter: QueryRewriter::new(self.config.rewriter.clone())?,
            enhancer: ResponseEnhancer::new(&self.config.enhancer),
            suggestions: SuggestionGenerator::new(),
            persistence: self.persistence,
            top_k: self.config.dependencies.retrieval.top_k,
            response_history: self.config.session.response_history,
        })
    }
}

/// Per-message coordinator over the session store and the guarded services
pub struct ChatPipeline {
    store: Arc<SessionStore>,
    breaker: Arc<CircuitBreaker>,
    intent: GuardedDependency<IntentRequest, IntentResult>,
    retrieval: GuardedDependency<RetrievalRequest, RetrievalResult>,
    rewriter: QueryRewriter,
    enhancer: ResponseEnhancer,
    suggestions: SuggestionGenerator,
    persistence: Option<Arc<dyn SessionPersistence>>,
    top_k: usize,
    response_history: usize,
}

impl ChatPipeline {
    /// Start building a pipeline
    pub fn builder(config: ColloquyConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// The session store
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The circuit breaker registry
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Handle one chat message
    ///
    /// # Errors
    ///
    /// Returns [`ColloquyError::Validation`] when the message is blank. Every
    /// other failure is absorbed into a best-effort reply.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(ColloquyError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = request
            .context
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        let durability = self.load(&session_id).await;
        let session = self.context_snapshot(&session_id);

        let rewrite = self.rewriter.rewrite(&session, message);

        let (classification, intent_degraded) = self
            .classify(IntentRequest {
                text: rewrite.rewritten.clone(),
                session_id: session_id.clone(),
                context: context.clone(),
                resolved_text: Some(rewrite.resolved.clone()),
            })
            .await;
        self.store
            .record_topic(&session_id, &classification.intent, message);

        let (answer, retrieval_degraded) = self
            .retrieve(RetrievalRequest {
                query: rewrite.rewritten.clone(),
                intent: classification.intent.clone(),
                top_k: self.top_k,
                session_id: session_id.clone(),
                context,
            })
            .await;
        self.store
            .record_entities(&session_id, &classification.entities);

        let session = self.context_snapshot(&session_id);
        let response = self.enhancer.enhance(&answer.response, &session);
        let suggestions =
            self.suggestions
                .generate(&classification.intent, &classification.entities, &session);

        let now = self.store.now();
        self.store
            .append_history(&session_id, HistoryEntry::user(message, now));
        self.store.append_history(
            &session_id,
            HistoryEntry::assistant(response.clone(), now).with_metadata(HistoryMetadata {
                intent: Some(classification.intent.clone()),
                confidence: Some(answer.confidence),
                entities: classification.entities.clone(),
                suggestions: suggestions.clone(),
            }),
        );
        let turn = self.store.increment_turn(&session_id);

        let session = self.store.get_or_create(&session_id);
        match durability {
            Durability::Persisted => self.save(&session).await,
            Durability::Ephemeral => {
                self.store.discard(&session_id);
            }
            Durability::MemoryOnly => {}
        }

        tracing::debug!(
            session_id = %session_id,
            turn,
            intent = %classification.intent,
            confidence = answer.confidence,
            intent_degraded,
            retrieval_degraded,
            "Handled chat message"
        );

        Ok(ChatResponse {
            response,
            session_id,
            intent: classification.intent,
            confidence: answer.confidence,
            entities: classification.entities,
            sources: answer.sources,
            suggestions,
            rewritten_query: rewrite.changed().then_some(rewrite.rewritten),
            history: session.recent_history(self.response_history).to_vec(),
            degraded: intent_degraded || retrieval_degraded,
        })
    }

    /// Session snapshot for the text heuristics, without stale entities
    fn context_snapshot(&self, session_id: &str) -> Session {
        let mut session = self.store.get_or_create(session_id);
        session.retain_fresh_entities(self.store.now(), self.store.config().entity_max_age);
        session
    }

    /// Restore a persisted session that is not in memory
    async fn load(&self, session_id: &str) -> Durability {
        let Some(persistence) = &self.persistence else {
            return Durability::MemoryOnly;
        };
        if self.store.contains(session_id) {
            return Durability::Persisted;
        }

        match persistence.load(session_id).await {
            Ok(Some(session)) => {
                self.store.restore(session);
                Durability::Persisted
            }
            Ok(None) => Durability::Persisted,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Session persistence unavailable, continuing with ephemeral session"
                );
                Durability::Ephemeral
            }
        }
    }

    async fn save(&self, session: &Session) {
        if let Some(persistence) = &self.persistence
            && let Err(e) = persistence.save(session).await
        {
            tracing::warn!(
                session_id = %session.id(),
                error = %e,
                "Failed to persist session"
            );
        }
    }

    async fn classify(&self, request: IntentRequest) -> (IntentResult, bool) {
        match self.intent.execute_detailed(&request).await {
            Ok(execution) => {
                let degraded = execution.is_degraded();
                (execution.value, degraded)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Intent classification failed");
                (rule_based_intent(&request), true)
            }
        }
    }

    async fn retrieve(&self, request: RetrievalRequest) -> (RetrievalResult, bool) {
        match self.retrieval.execute_detailed(&request).await {
            Ok(execution) => {
                let degraded = execution.is_degraded();
                (execution.value, degraded)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed");
                (canned_retrieval(&request), true)
            }
        }
    }

    /// Ordered history for a session: in-memory first, then persistence
    pub async fn history(&self, session_id: &str) -> Vec<HistoryEntry> {
        if let Some(session) = self.store.snapshot(session_id) {
            return session.history().to_vec();
        }

        match &self.persistence {
            Some(persistence) => match persistence.load(session_id).await {
                Ok(Some(session)) => session.history().to_vec(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to load history");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    /// Forget a session in memory and in persistence; returns whether it existed
    pub async fn reset(&self, session_id: &str) -> bool {
        let in_memory = self.store.reset(session_id);
        let persisted = match &self.persistence {
            Some(persistence) => persistence.delete(session_id).await.unwrap_or_else(|e| {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to delete persisted session");
                false
            }),
            None => false,
        };
        in_memory || persisted
    }

    /// Remove idle sessions from memory; returns the removed ids
    pub fn sweep(&self) -> Vec<String> {
        self.store.sweep_expired()
    }

    /// Drop expired snapshots from persistence; returns how many were removed
    pub async fn purge_expired_snapshots(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };
        match persistence.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge expired sessions");
                0
            }
        }
    }

    /// Circuit and storage health
    pub async fn health(&self) -> HealthReport {
        let dependencies = self.breaker.snapshots();
        let storage = match &self.persistence {
            Some(persistence) => persistence.health().await,
            None => StorageHealth {
                backend: "ephemeral".to_string(),
                connected: true,
            },
        };

        let healthy = storage.connected
            && dependencies
                .iter()
                .all(|snapshot| snapshot.state == CircuitState::Closed);

        HealthReport {
            status: if healthy { "healthy" } else { "degraded" },
            dependencies,
            storage,
            active_sessions: self.store.len(),
        }
    }
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("store", &self.store)
            .field("breaker", &self.breaker)
            .field("top_k", &self.top_k)
            .finish()
    }
}
