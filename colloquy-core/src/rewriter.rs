//! Query Rewriter
//!
//! Detects follow-up utterances and turns them into self-contained queries by
//! resolving pronouns against entity memory and prefixing recent context.

use regex::Regex;
use serde::Serialize;

use crate::config::RewriterConfig;
use crate::context::Session;
use crate::error::{ColloquyError, Result};
use crate::services::NO_INTENT;

/// Phrases that mark an utterance as depending on earlier turns
const FOLLOW_UP_PATTERN: &str = r"(?i)\b(?:it|this|that|they|those|the\s+same|what\s+about|how\s+about|and\s+then|after\s+that|next|also)\b";

/// Pronouns replaced by the most recently seen entity
const PRONOUN_PATTERN: &str = r"(?i)\b(?:it|this|that|they|them|those)\b";

/// Outcome of rewriting one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewrittenQuery {
    /// The query as the user sent it
    pub original: String,
    /// The query with pronouns resolved
    pub resolved: String,
    /// The query sent to downstream dependencies
    pub rewritten: String,
    /// Whether the query was treated as a follow-up
    pub is_follow_up: bool,
}

impl RewrittenQuery {
    /// Whether rewriting changed the query
    pub fn changed(&self) -> bool {
        self.rewritten != self.original
    }
}

/// Rewrites follow-up queries using session memory
#[derive(Debug, Clone)]
pub struct QueryRewriter {
    config: RewriterConfig,
    follow_up: Regex,
    pronouns: Regex,
}

impl QueryRewriter {
    /// Create a rewriter
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in pattern fails to compile.
    pub fn new(config: RewriterConfig) -> Result<Self> {
        Ok(Self {
            config,
            follow_up: compile(FOLLOW_UP_PATTERN)?,
            pronouns: compile(PRONOUN_PATTERN)?,
        })
    }

    /// Whether the query can only be understood with earlier turns
    pub fn is_follow_up(&self, query: &str) -> bool {
        query.split_whitespace().count() <= self.config.follow_up_max_tokens
            || self.follow_up.is_match(query)
    }

    /// Replace pronouns with the value of the most recently seen entity.
    ///
    /// Returns the query unchanged when the session has no entities.
    pub fn resolve_pronouns(&self, session: &Session, query: &str) -> String {
        match session.most_recent_entity() {
            Some((_, record)) => self
                .pronouns
                .replace_all(query, regex::NoExpand(&record.value))
                .into_owned(),
            None => query.to_string(),
        }
    }

    /// Resolve pronouns and, for follow-ups, prefix the recent context
    pub fn rewrite(&self, session: &Session, query: &str) -> RewrittenQuery {
        let resolved = self.resolve_pronouns(session, query);
        let is_follow_up = self.is_follow_up(query);

        let rewritten = if is_follow_up {
            self.with_context(session, &resolved)
                .unwrap_or_else(|| resolved.clone())
        } else {
            resolved.clone()
        };

        if rewritten != query {
            tracing::debug!(
                session_id = %session.id(),
                original = %query,
                rewritten = %rewritten,
                "Rewrote query"
            );
        }

        RewrittenQuery {
            original: query.to_string(),
            resolved,
            rewritten,
            is_follow_up,
        }
    }

    fn with_context(&self, session: &Session, resolved: &str) -> Option<String> {
        let entities: Vec<&str> = session
            .entities_by_recency()
            .into_iter()
            .take(self.config.context_entities)
            .map(|(_, record)| record.value.as_str())
            .collect();

        let mut topics: Vec<&str> = Vec::new();
        for topic in session.recent_topics(self.config.context_topics) {
            if topic.intent != NO_INTENT && !topics.contains(&topic.intent.as_str()) {
                topics.push(&topic.intent);
            }
        }

        let clause = match (entities.is_empty(), topics.is_empty()) {
            (true, true) => return None,
            (false, true) => format!("regarding {}", entities.join(", ")),
            (true, false) => format!("about {}", topics.join(", ")),
            (false, false) => format!(
                "regarding {} about {}",
                entities.join(", "),
                topics.join(", ")
            ),
        };

        Some(format!("Given our discussion {}, {}", clause, resolved))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ColloquyError::Configuration(format!("Invalid regex pattern '{}': {}", pattern, e))
    })
}
