//! Response Enhancer
//!
//! Personalizes a raw answer with entity grounding, continuity phrasing and a
//! closing question. Each step is conditional and idempotent, and the
//! enhancer never touches session memory.

use crate::config::EnhancerConfig;
use crate::context::Session;

/// Lower-cased markers whose presence means the answer already reads as a continuation
const CONTINUITY_MARKERS: &[&str] = &[
    "as we discussed",
    "building on",
    "continuing from",
    "picking up",
    "earlier",
    "left off",
];

const CONTINUITY_PHRASES: &[&str] = &[
    "Continuing from where we left off: ",
    "Building on what we've covered so far: ",
    "Picking up our earlier thread: ",
    "As we discussed earlier: ",
];

const RESOLUTION_CHECK: &str = "Did that solve your problem, or is there anything else I can help with?";

const GENERIC_PROBE: &str = "Could you share a bit more detail about what you're trying to do?";

/// Turns below which the intent-specific clarifying question is asked
const PROBING_DEPTH: u32 = 3;

/// Turns after which continuity phrasing is considered
const CONTINUITY_DEPTH: u32 = 5;

/// Applies grounding, continuity and probing to raw answers
#[derive(Debug, Clone, Default)]
pub struct ResponseEnhancer {
    rotation_seed: u64,
}

impl ResponseEnhancer {
    /// Create an enhancer
    pub fn new(config: &EnhancerConfig) -> Self {
        Self {
            rotation_seed: config.rotation_seed,
        }
    }

    /// Enhance `raw_answer` for the session.
    ///
    /// The closing question is keyed by the session's last recorded intent.
    pub fn enhance(&self, raw_answer: &str, session: &Session) -> String {
        let answer = raw_answer.trim();
        let answer = self.ground(answer, session);
        let answer = self.add_continuity(answer, session);
        self.add_probe(answer, session)
    }

    fn ground(&self, answer: &str, session: &Session) -> String {
        let Some((entity_type, record)) = session.top_entity() else {
            return answer.to_string();
        };

        if answer
            .to_lowercase()
            .contains(&record.value.to_lowercase())
        {
            return answer.to_string();
        }

        format!("{}{}", grounding_prefix(entity_type, &record.value), answer)
    }

    fn add_continuity(&self, answer: String, session: &Session) -> String {
        let turns = session.turn_count();
        if turns <= CONTINUITY_DEPTH {
            return answer;
        }

        let lowered = answer.to_lowercase();
        if CONTINUITY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return answer;
        }

        let index = self.rotation_index(turns);
        format!("{}{}", CONTINUITY_PHRASES[index], answer)
    }

    fn add_probe(&self, answer: String, session: &Session) -> String {
        let question = if session.turn_count() < PROBING_DEPTH {
            clarifying_question(session.last_intent().unwrap_or_default())
        } else {
            RESOLUTION_CHECK
        };

        if answer.ends_with(question) {
            return answer;
        }
        if answer.is_empty() {
            return question.to_string();
        }
        format!("{}\n\n{}", answer, question)
    }

    fn rotation_index(&self, turns: u32) -> usize {
        let len = CONTINUITY_PHRASES.len() as u64;
        (self.rotation_seed.wrapping_add(u64::from(turns)) % len) as usize
    }
}

fn grounding_prefix(entity_type: &str, value: &str) -> String {
    match entity_type {
        "ubuntu_version" => format!("For Ubuntu {}: ", value),
        "package" | "package_name" => format!("Regarding the {} package: ", value),
        "service_name" => format!("For the {} service: ", value),
        "error_code" => format!("About error {}: ", value),
        "file_path" => format!("For {}: ", value),
        "ppa" => format!("For the {} PPA: ", value),
        _ => format!("Regarding {}: ", value),
    }
}

fn clarifying_question(intent: &str) -> &'static str {
    match intent {
        "MakeUpdate" => "Which package or Ubuntu release are you trying to update?",
        "SetupPrinter" => "What printer model are you setting up, and is it connected by USB or network?",
        "ShutdownComputer" => "Is the computer failing to shut down, or are you looking for the right command?",
        "SoftwareRecommendation" => "What will you mainly use the software for?",
        "Troubleshooting" => "Could you share the exact error message you are seeing?",
        _ => GENERIC_PROBE,
    }
}
