//! # Colloquy - Resilient Conversational Orchestration
//!
//! Colloquy routes chat messages through external intent-classification and
//! answer-retrieval services and returns a conversationally coherent reply:
//! - Per-dependency circuit breaking with pure fallbacks
//! - Bounded, expiring session memory (history, entities, topics, turns)
//! - Follow-up detection and pronoun resolution
//! - Response grounding, continuity phrasing and progress probing
//! - Follow-up suggestions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use colloquy_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pipeline = ChatPipeline::builder(ColloquyConfig::load()?).build()?;
//!
//!     let reply = pipeline.handle(ChatRequest::new("How do I update Ubuntu?")).await?;
//!     println!("{}", reply.response);
//!
//!     let follow_up = ChatRequest::new("How do I restart it?").with_session(reply.session_id);
//!     let reply = pipeline.handle(follow_up).await?;
//!     println!("{:?}", reply.rewritten_query);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **circuit_breaker**: CLOSED / OPEN / HALF_OPEN state machine per dependency
//! - **context**: sessions and the per-session-locked store
//! - **rewriter**, **enhancer**, **suggestions**: deterministic text heuristics
//! - **services**: HTTP clients for the intent and retrieval services
//! - **persistence**: TTL-bound session snapshots
//! - **pipeline**: the per-message coordinator

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod enhancer;
pub mod error;
pub mod feedback;
pub mod persistence;
pub mod pipeline;
pub mod rewriter;
pub mod services;
pub mod suggestions;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::circuit_breaker::{
        Admission, Circuit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
        Dependency, DependencyOptions, Execution, ExecutionSource, GuardedDependency,
    };
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::{
        ColloquyConfig, DependenciesConfig, DependencySettings, EnhancerConfig,
        PersistenceBackend, PersistenceConfig, RetrievalSettings, RewriterConfig, ServerConfig,
        SessionConfig,
    };
    pub use crate::context::{
        Entity, EntityRecord, HistoryEntry, HistoryMetadata, Role, Session, SessionStore, Topic,
    };
    pub use crate::enhancer::ResponseEnhancer;
    pub use crate::error::{ColloquyError, Result};
    pub use crate::feedback::{
        FeedbackAnalytics, FeedbackLog, FeedbackRecord, FeedbackRequest, FeedbackType,
        ReviewItem, ReviewPriority,
    };
    pub use crate::persistence::{
        DirectoryPersistence, MemoryPersistence, SessionPersistence, StorageHealth,
    };
    pub use crate::pipeline::{
        ChatPipeline, ChatRequest, ChatResponse, HealthReport, PipelineBuilder,
    };
    pub use crate::rewriter::{QueryRewriter, RewrittenQuery};
    pub use crate::services::{
        HttpIntentService, HttpRetrievalService, IntentRequest, IntentResult, RetrievalRequest,
        RetrievalResult, Source,
    };
    pub use crate::suggestions::SuggestionGenerator;
}
