//! Feedback collection and analytics
//!
//! Keeps a bounded log of recent feedback in memory, queues negative feedback
//! for review and summarizes the log on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{ColloquyError, Result};

/// Default number of feedback records kept
pub const DEFAULT_FEEDBACK_CAPACITY: usize = 1000;

/// Kind of user reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    /// Thumbs up on a reply
    ThumbsUp,
    /// Thumbs down on a reply
    ThumbsDown,
    /// Reply marked helpful
    Helpful,
    /// Reply marked not helpful
    NotHelpful,
    /// A suggested follow-up was clicked
    FollowUpClicked,
    /// The user left mid-conversation
    ConversationAbandoned,
    /// The user reported the problem solved
    ProblemSolved,
    /// The user reported the problem unsolved
    ProblemUnsolved,
    /// A suggestion was used
    SuggestionUsed,
    /// Suggestions were ignored
    SuggestionIgnored,
}

impl FeedbackType {
    /// Importance weight; negative reactions weigh more than positive ones
    pub fn weight(self) -> f64 {
        match self {
            FeedbackType::ThumbsUp => 1.0,
            FeedbackType::ThumbsDown => -2.0,
            FeedbackType::Helpful => 1.5,
            FeedbackType::NotHelpful => -2.5,
            FeedbackType::FollowUpClicked => 0.5,
            FeedbackType::ConversationAbandoned => -1.0,
            FeedbackType::ProblemSolved => 2.0,
            FeedbackType::ProblemUnsolved => -3.0,
            FeedbackType::SuggestionUsed => 1.0,
            FeedbackType::SuggestionIgnored => -0.2,
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackType::ThumbsUp => "thumbs_up",
            FeedbackType::ThumbsDown => "thumbs_down",
            FeedbackType::Helpful => "helpful",
            FeedbackType::NotHelpful => "not_helpful",
            FeedbackType::FollowUpClicked => "follow_up_clicked",
            FeedbackType::ConversationAbandoned => "conversation_abandoned",
            FeedbackType::ProblemSolved => "problem_solved",
            FeedbackType::ProblemUnsolved => "problem_unsolved",
            FeedbackType::SuggestionUsed => "suggestion_used",
            FeedbackType::SuggestionIgnored => "suggestion_ignored",
        }
    }

    fn review_priority(self) -> Option<ReviewPriority> {
        match self {
            FeedbackType::ProblemUnsolved => Some(ReviewPriority::High),
            FeedbackType::ThumbsDown
            | FeedbackType::NotHelpful
            | FeedbackType::ConversationAbandoned => Some(ReviewPriority::Medium),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feedback as submitted by a client
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    /// Session the feedback is about
    pub session_id: String,
    /// Kind of reaction
    pub feedback_type: FeedbackType,
    /// Message the feedback refers to
    #[serde(default)]
    pub message_id: Option<String>,
    /// Intent of the rated reply
    #[serde(default)]
    pub intent: Option<String>,
    /// Entities of the rated reply
    #[serde(default)]
    pub entities: Vec<String>,
    /// Confidence of the rated reply
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Reply latency in seconds
    #[serde(default)]
    pub response_time: Option<f64>,
}

/// A recorded piece of feedback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRecord {
    /// Feedback id
    pub id: String,
    /// Session the feedback is about
    pub session_id: String,
    /// Kind of reaction
    pub feedback_type: FeedbackType,
    /// Importance weight of the reaction
    pub weight: f64,
    /// Message the feedback refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Intent of the rated reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Entities of the rated reply
    pub entities: Vec<String>,
    /// Confidence of the rated reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Reply latency in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    /// When the feedback arrived
    pub timestamp: DateTime<Utc>,
}

/// Review urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    /// Unsolved problems
    High,
    /// Other negative feedback
    Medium,
}

/// Negative feedback queued for a human look
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    /// Feedback that triggered the review
    pub feedback_id: String,
    /// Session the feedback is about
    pub session_id: String,
    /// Kind of reaction
    pub feedback_type: FeedbackType,
    /// Urgency
    pub priority: ReviewPriority,
    /// When the item was queued
    pub created_at: DateTime<Utc>,
}

/// Summary over the recent feedback log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackAnalytics {
    /// Records in the log
    pub total_feedback: usize,
    /// Records with positive weight
    pub positive_feedback: usize,
    /// Records with negative weight
    pub negative_feedback: usize,
    /// Mean weight, 0 when empty
    pub satisfaction_score: f64,
    /// Record counts by feedback type
    pub by_type: BTreeMap<String, usize>,
    /// Record counts by intent
    pub by_intent: BTreeMap<String, usize>,
    /// Review items waiting
    pub pending_reviews: usize,
}

#[derive(Debug, Default)]
struct FeedbackState {
    recent: VecDeque<FeedbackRecord>,
    reviews: VecDeque<ReviewItem>,
}

/// Bounded in-memory feedback log
#[derive(Debug)]
pub struct FeedbackLog {
    clock: SharedClock,
    capacity: usize,
    state: Mutex<FeedbackState>,
}

impl FeedbackLog {
    /// Create a log keeping the last [`DEFAULT_FEEDBACK_CAPACITY`] records
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, DEFAULT_FEEDBACK_CAPACITY)
    }

    /// Create a log keeping the last `capacity` records
    pub fn with_capacity(clock: SharedClock, capacity: usize) -> Self {
        Self {
            clock,
            capacity: capacity.max(1),
            state: Mutex::new(FeedbackState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record feedback and queue a review item for negative reactions
    pub fn record(&self, request: FeedbackRequest) -> Result<FeedbackRecord> {
        if request.session_id.trim().is_empty() {
            return Err(ColloquyError::Validation(
                "session_id must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let record = FeedbackRecord {
            id: Uuid::new_v4().to_string(),
            session_id: request.session_id,
            feedback_type: request.feedback_type,
            weight: request.feedback_type.weight(),
            message_id: request.message_id,
            intent: request.intent,
            entities: request.entities,
            confidence: request.confidence,
            response_time: request.response_time,
            timestamp: now,
        };

        let mut state = self.lock();
        state.recent.push_back(record.clone());
        while state.recent.len() > self.capacity {
            state.recent.pop_front();
        }

        if let Some(priority) = record.feedback_type.review_priority() {
            state.reviews.push_back(ReviewItem {
                feedback_id: record.id.clone(),
                session_id: record.session_id.clone(),
                feedback_type: record.feedback_type,
                priority,
                created_at: now,
            });
            while state.reviews.len() > self.capacity {
                state.reviews.pop_front();
            }
            tracing::info!(
                session_id = %record.session_id,
                feedback_type = %record.feedback_type,
                ?priority,
                "Queued feedback for review"
            );
        }

        tracing::debug!(
            feedback_id = %record.id,
            feedback_type = %record.feedback_type,
            weight = record.weight,
            "Recorded feedback"
        );
        Ok(record)
    }

    /// Summarize the recent log
    pub fn analytics(&self) -> FeedbackAnalytics {
        let state = self.lock();

        let mut by_type = BTreeMap::new();
        let mut by_intent = BTreeMap::new();
        let mut positive = 0;
        let mut negative = 0;
        let mut weight_sum = 0.0;

        for record in &state.recent {
            *by_type
                .entry(record.feedback_type.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(intent) = &record.intent {
                *by_intent.entry(intent.clone()).or_insert(0) += 1;
            }
            if record.weight > 0.0 {
                positive += 1;
            } else if record.weight < 0.0 {
                negative += 1;
            }
            weight_sum += record.weight;
        }

        let total = state.recent.len();
        FeedbackAnalytics {
            total_feedback: total,
            positive_feedback: positive,
            negative_feedback: negative,
            satisfaction_score: if total == 0 {
                0.0
            } else {
                weight_sum / total as f64
            },
            by_type,
            by_intent,
            pending_reviews: state.reviews.len(),
        }
    }

    /// Feedback for one session, newest first
    pub fn for_session(&self, session_id: &str) -> Vec<FeedbackRecord> {
        self.lock()
            .recent
            .iter()
            .rev()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Review items, oldest first
    pub fn pending_reviews(&self) -> Vec<ReviewItem> {
        self.lock().reviews.iter().cloned().collect()
    }
}
