//! Degraded answers used while a service is unavailable
//!
//! Both fallbacks are pure: the same request always yields the same result.

use super::{IntentRequest, IntentResult, NO_INTENT, RetrievalRequest, RetrievalResult};

/// Keyword families checked in order; the first family with a hit wins
const INTENT_KEYWORDS: &[(&str, &[&str], f64)] = &[
    (
        "MakeUpdate",
        &["update", "upgrade", "install", "apt", "package", "download"],
        0.4,
    ),
    ("SetupPrinter", &["print", "printer", "cups", "driver"], 0.4),
    (
        "ShutdownComputer",
        &["shutdown", "shut down", "turn off", "restart", "reboot", "power"],
        0.4,
    ),
    (
        "SoftwareRecommendation",
        &["recommend", "alternative", "suggest", "best", "which"],
        0.4,
    ),
    (
        "Troubleshooting",
        &["error", "problem", "issue", "fix", "trouble", "not working"],
        0.3,
    ),
];

const NO_INTENT_CONFIDENCE: f64 = 0.2;

/// Confidence reported with canned answers
pub const CANNED_CONFIDENCE: f64 = 0.3;

const GENERIC_ANSWERS: &[&str] = &[
    "I'm not sure how to help with that specific Ubuntu issue. Could you provide more details?",
    "I don't have enough information about that topic. Could you rephrase your question?",
    "That's a good question about Ubuntu. Let me check the documentation and get back to you.",
    "I'm still learning about Ubuntu support. Could you ask in a different way?",
    "I don't have the answer to that question yet. Have you tried searching the Ubuntu forums?",
];

fn intent_answer(intent: &str) -> Option<&'static str> {
    match intent {
        "MakeUpdate" => Some(
            "It seems you're trying to update or install software. The basic command for updating Ubuntu is 'sudo apt update && sudo apt upgrade'. Could you tell me more about what you're trying to update?",
        ),
        "SetupPrinter" => Some(
            "For printer setup issues, first make sure your printer is connected and powered on. Then go to Settings > Printers to add or configure your printer.",
        ),
        "ShutdownComputer" => Some(
            "To shut down your Ubuntu computer, you can use the command 'sudo shutdown now' or click on the power icon in the top-right menu and select 'Power Off'.",
        ),
        "SoftwareRecommendation" => Some(
            "I can help recommend software for Ubuntu. Could you tell me more about what type of application you're looking for?",
        ),
        _ => None,
    }
}

/// Classify by keyword when the intent service is unavailable.
///
/// Matches against `resolved_text` when present so an injected conversation
/// prefix cannot echo an earlier intent. Confidence is low and no entities
/// are extracted.
pub fn rule_based_intent(request: &IntentRequest) -> IntentResult {
    let text = request
        .resolved_text
        .as_deref()
        .unwrap_or(&request.text)
        .to_lowercase();

    let (intent, confidence) = INTENT_KEYWORDS
        .iter()
        .find(|(_, keywords, _)| keywords.iter().any(|k| text.contains(k)))
        .map(|(intent, _, confidence)| (*intent, *confidence))
        .unwrap_or((NO_INTENT, NO_INTENT_CONFIDENCE));

    IntentResult {
        intent: intent.to_string(),
        confidence,
        entities: Vec::new(),
    }
}

/// Canned answer when the retrieval service is unavailable
pub fn canned_retrieval(request: &RetrievalRequest) -> RetrievalResult {
    let response = intent_answer(&request.intent).unwrap_or_else(|| {
        let index = request
            .query
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        GENERIC_ANSWERS[index % GENERIC_ANSWERS.len()]
    });

    RetrievalResult {
        response: response.to_string(),
        confidence: CANNED_CONFIDENCE,
        sources: Vec::new(),
    }
}
