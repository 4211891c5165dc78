//! External collaborators
//!
//! Wire types and HTTP clients for the intent-classification and
//! answer-retrieval services, plus the pure fallbacks used while a service's
//! circuit is open.

mod fallback;
mod intent;
mod retrieval;

pub use fallback::{canned_retrieval, rule_based_intent};
pub use intent::HttpIntentService;
pub use retrieval::HttpRetrievalService;

use serde::{Deserialize, Serialize};

use crate::context::Entity;

/// Dependency name of the intent service
pub const INTENT_SERVICE: &str = "intent";

/// Dependency name of the retrieval service
pub const RETRIEVAL_SERVICE: &str = "retrieval";

/// Intent recorded when nothing matched
pub const NO_INTENT: &str = "None";

/// Request body for `POST /classify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    /// Text to classify
    pub text: String,
    /// Session the text belongs to
    pub session_id: String,
    /// Caller-supplied context
    #[serde(default)]
    pub context: serde_json::Value,
    /// The text without any conversation prefix; used by local classification
    #[serde(skip)]
    pub resolved_text: Option<String>,
}

/// Response body of `POST /classify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    /// Classified intent
    pub intent: String,
    /// Classification confidence
    pub confidence: f64,
    /// Extracted entities
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// Request body for `POST /retrieve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    /// Query to answer
    pub query: String,
    /// Intent of the query
    pub intent: String,
    /// Number of passages to retrieve
    pub top_k: usize,
    /// Session the query belongs to
    pub session_id: String,
    /// Caller-supplied context
    #[serde(default)]
    pub context: serde_json::Value,
}

/// A passage backing a retrieved answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Passage id
    pub id: String,
    /// Passage excerpt
    pub content: String,
    /// Similarity to the query
    #[serde(default)]
    pub similarity: f64,
    /// Where the passage came from
    #[serde(default)]
    pub source: String,
}

/// Response body of `POST /retrieve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Answer text
    pub response: String,
    /// Answer confidence
    pub confidence: f64,
    /// Supporting passages
    #[serde(default)]
    pub sources: Vec<Source>,
}
