//! Session state
//!
//! A [`Session`] holds everything remembered about one conversation: the
//! bounded message history, entity memory keyed by entity type, the bounded
//! topic trail and the turn counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::elapsed_between;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Reply from the assistant
    Assistant,
}

/// An entity observed in a user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type, e.g. `package` or `ubuntu_version`
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Observed value
    pub value: String,
    /// Extraction confidence
    #[serde(default)]
    pub confidence: f64,
}

impl Entity {
    /// Create an entity observation
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
            confidence,
        }
    }
}

/// What the session remembers about one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Latest observed value
    pub value: String,
    /// Confidence of the latest observation
    pub confidence: f64,
    /// When the type was last observed
    pub last_seen: DateTime<Utc>,
    /// How many times the type has been observed
    pub mention_count: u32,
    /// Observation order within the session
    pub sequence: u64,
}

/// Metadata attached to a history entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    /// Classified intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Answer confidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Entities observed in the turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    /// Suggestions offered with the reply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// One message in the session history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Who sent the message
    pub role: Role,
    /// Message text
    pub content: String,
    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
    /// Optional per-turn metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HistoryMetadata>,
}

impl HistoryEntry {
    /// A user message
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            metadata: None,
        }
    }

    /// An assistant reply
    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
            metadata: None,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: HistoryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A topic the conversation touched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Intent classified for the query
    pub intent: String,
    /// The query that raised the topic
    pub query: String,
    /// When the topic was recorded
    pub timestamp: DateTime<Utc>,
}

/// Conversational memory for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    history: Vec<HistoryEntry>,
    entity_memory: HashMap<String, EntityRecord>,
    topic_memory: Vec<Topic>,
    turn_count: u32,
    last_intent: Option<String>,
    #[serde(default)]
    next_sequence: u64,
}

impl Session {
    /// Create an empty session
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            last_activity_at: now,
            history: Vec::new(),
            entity_memory: HashMap::new(),
            topic_memory: Vec::new(),
            turn_count: 0,
            last_intent: None,
            next_sequence: 0,
        }
    }

    /// Session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the session was last mutated
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Message history, oldest first
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The last `n` history entries, oldest first
    pub fn recent_history(&self, n: usize) -> &[HistoryEntry] {
        &self.history[self.history.len().saturating_sub(n)..]
    }

    /// Entity memory keyed by type
    pub fn entities(&self) -> &HashMap<String, EntityRecord> {
        &self.entity_memory
    }

    /// Record for one entity type
    pub fn entity(&self, entity_type: &str) -> Option<&EntityRecord> {
        self.entity_memory.get(entity_type)
    }

    /// Topic trail, oldest first
    pub fn topics(&self) -> &[Topic] {
        &self.topic_memory
    }

    /// The last `n` topics, oldest first
    pub fn recent_topics(&self, n: usize) -> &[Topic] {
        &self.topic_memory[self.topic_memory.len().saturating_sub(n)..]
    }

    /// Number of processed user messages
    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Intent of the latest recorded topic
    pub fn last_intent(&self) -> Option<&str> {
        self.last_intent.as_deref()
    }

    /// True when nothing has been remembered yet
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
            && self.entity_memory.is_empty()
            && self.topic_memory.is_empty()
            && self.turn_count == 0
    }

    /// Entities ordered from most to least recently seen
    pub fn entities_by_recency(&self) -> Vec<(&str, &EntityRecord)> {
        let mut entities: Vec<_> = self
            .entity_memory
            .iter()
            .map(|(kind, record)| (kind.as_str(), record))
            .collect();
        entities.sort_by(|(_, a), (_, b)| {
            b.last_seen
                .cmp(&a.last_seen)
                .then(b.sequence.cmp(&a.sequence))
        });
        entities
    }

    /// The most recently seen entity
    pub fn most_recent_entity(&self) -> Option<(&str, &EntityRecord)> {
        self.entities_by_recency().into_iter().next()
    }

    /// The most frequently mentioned entity, if it was mentioned more than once.
    ///
    /// Ties go to the more recently seen entity.
    pub fn top_entity(&self) -> Option<(&str, &EntityRecord)> {
        self.entity_memory
            .iter()
            .filter(|(_, record)| record.mention_count > 1)
            .max_by(|(_, a), (_, b)| {
                a.mention_count
                    .cmp(&b.mention_count)
                    .then(a.last_seen.cmp(&b.last_seen))
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|(kind, record)| (kind.as_str(), record))
    }

    /// Whether the session has been idle for longer than `max_idle`
    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        elapsed_between(self.last_activity_at, now) > max_idle
    }

    /// Drop entity records last seen longer than `max_age` ago
    pub fn retain_fresh_entities(&mut self, now: DateTime<Utc>, max_age: Duration) {
        self.entity_memory
            .retain(|_, record| elapsed_between(record.last_seen, now) <= max_age);
    }

    /// Mark activity
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Append a history entry, keeping at most `limit` entries
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize, now: DateTime<Utc>) {
        self.history.push(entry);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
        self.touch(now);
    }

    /// Upsert entity observations by type
    pub fn observe_entities(&mut self, entities: &[Entity], now: DateTime<Utc>) {
        for entity in entities {
            let sequence = self.next_sequence;
            self.next_sequence += 1;

            self.entity_memory
                .entry(entity.entity_type.clone())
                .and_modify(|record| {
                    record.value = entity.value.clone();
                    record.confidence = entity.confidence;
                    record.last_seen = record.last_seen.max(now);
                    record.mention_count = record.mention_count.saturating_add(1);
                    record.sequence = sequence;
                })
                .or_insert_with(|| EntityRecord {
                    value: entity.value.clone(),
                    confidence: entity.confidence,
                    last_seen: now,
                    mention_count: 1,
                    sequence,
                });
        }
        self.touch(now);
    }

    /// Append a topic, keeping at most `limit` topics
    pub fn push_topic(
        &mut self,
        intent: impl Into<String>,
        query: impl Into<String>,
        limit: usize,
        now: DateTime<Utc>,
    ) {
        let intent = intent.into();
        self.last_intent = Some(intent.clone());
        self.topic_memory.push(Topic {
            intent,
            query: query.into(),
            timestamp: now,
        });
        if self.topic_memory.len() > limit {
            let excess = self.topic_memory.len() - limit;
            self.topic_memory.drain(..excess);
        }
        self.touch(now);
    }

    /// Count one processed user message and return the new total
    pub fn increment_turn(&mut self, now: DateTime<Utc>) -> u32 {
        self.turn_count = self.turn_count.saturating_add(1);
        self.touch(now);
        self.turn_count
    }

    /// Serialize to JSON for persistence
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
