//! Follow-up suggestion generation

use crate::context::{Entity, Session};

const MIN_SUGGESTIONS: usize = 2;
const MAX_SUGGESTIONS: usize = 4;

/// Turns after which resolution checks are offered
const RESOLUTION_DEPTH: u32 = 3;

const DEFAULT_SUGGESTIONS: &[&str] = &[
    "How do I update Ubuntu?",
    "How do I install new software?",
    "How do I check which Ubuntu version I'm running?",
];

const RESOLUTION_SUGGESTIONS: &[&str] = &["That solved my problem", "I still need help with this"];

fn intent_suggestions(intent: &str) -> Option<&'static [&'static str]> {
    let suggestions: &'static [&'static str] = match intent {
        "MakeUpdate" => &[
            "How do I upgrade to the next Ubuntu release?",
            "How do I fix broken packages after an update?",
            "How do I enable automatic security updates?",
        ],
        "SetupPrinter" => &[
            "How do I install a printer driver?",
            "Why is my printer not detected?",
            "How do I share a printer on my network?",
        ],
        "ShutdownComputer" => &[
            "How do I schedule a shutdown?",
            "What should I do if Ubuntu hangs on shutdown?",
            "How do I restart from the terminal?",
        ],
        "SoftwareRecommendation" => &[
            "What is a good text editor for Ubuntu?",
            "How do I install apps from the Snap Store?",
            "What are alternatives to Microsoft Office on Ubuntu?",
        ],
        "Troubleshooting" => &[
            "How do I read the system logs?",
            "How do I boot into recovery mode?",
            "How do I report a bug in Ubuntu?",
        ],
        _ => return None,
    };
    Some(suggestions)
}

fn entity_suggestions(entity: &Entity) -> Vec<String> {
    let value = &entity.value;
    match entity.entity_type.as_str() {
        "package" | "package_name" => vec![
            format!("How do I check which version of {} is installed?", value),
            format!("How do I remove {}?", value),
        ],
        "ubuntu_version" => vec![format!("What's new in Ubuntu {}?", value)],
        "service_name" => vec![format!("How do I check the status of the {} service?", value)],
        "error_code" => vec![format!("What usually causes error {}?", value)],
        "file_path" => vec![format!("How do I change the permissions of {}?", value)],
        "ppa" => vec![format!("How do I remove the {} PPA?", value)],
        _ => Vec::new(),
    }
}

/// Proposes follow-up questions for a reply
#[derive(Debug, Clone, Copy, Default)]
pub struct SuggestionGenerator;

impl SuggestionGenerator {
    /// Create a generator
    pub fn new() -> Self {
        Self
    }

    /// Generate 2 to 4 suggestions in a fixed assembly order.
    ///
    /// More suggestions are offered as the conversation deepens.
    pub fn generate(&self, intent: &str, entities: &[Entity], session: &Session) -> Vec<String> {
        let mut suggestions: Vec<String> = Vec::new();

        match intent_suggestions(intent) {
            Some(base) => suggestions.extend(base.iter().map(|s| s.to_string())),
            None => {
                let derived = Self::from_recent_topics(session);
                if derived.is_empty() {
                    suggestions.extend(DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()));
                } else {
                    suggestions.extend(derived);
                }
            }
        }

        for entity in entities {
            suggestions.extend(entity_suggestions(entity));
        }

        if let Some((_, record)) = session.top_entity() {
            suggestions.push(format!("Do you have more questions about {}?", record.value));
        }

        if session.turn_count() > RESOLUTION_DEPTH {
            suggestions.extend(RESOLUTION_SUGGESTIONS.iter().map(|s| s.to_string()));
        }

        let mut unique: Vec<String> = Vec::with_capacity(suggestions.len());
        for suggestion in suggestions {
            if !unique.contains(&suggestion) {
                unique.push(suggestion);
            }
        }

        for fallback in DEFAULT_SUGGESTIONS {
            if unique.len() >= MIN_SUGGESTIONS {
                break;
            }
            if !unique.iter().any(|s| s == fallback) {
                unique.push(fallback.to_string());
            }
        }

        unique.truncate(Self::target_size(session.turn_count()));
        unique
    }

    fn target_size(turns: u32) -> usize {
        (MIN_SUGGESTIONS + (turns / 2) as usize).clamp(MIN_SUGGESTIONS, MAX_SUGGESTIONS)
    }

    /// One suggestion per distinct recent intent, newest first
    fn from_recent_topics(session: &Session) -> Vec<String> {
        let mut seen: Vec<&str> = Vec::new();
        let mut derived = Vec::new();

        for topic in session.topics().iter().rev() {
            if seen.contains(&topic.intent.as_str()) {
                continue;
            }
            seen.push(&topic.intent);
            if let Some(base) = intent_suggestions(&topic.intent) {
                derived.push(base[0].to_string());
            }
        }
        derived
    }
}
