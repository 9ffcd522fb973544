//! Deterministic analysis used when no LLM is configured or the LLM call fails.
//!
//! Keyword lists stay crop- and region-neutral.

use std::collections::BTreeMap;

use serde_json::Value;

use super::types::{
    ActionsNeeded, AnalysisSource, ConversationType, Entities, Intent, IntentAnalysis,
};
use crate::registration::{RegistrationExtraction, RegistrationField, RegistrationState};

const CHAT_WORDS: &[&str] = &[
    "hello", "hi", "hey", "thanks", "thank", "you", "bye", "goodbye", "good", "morning",
    "evening", "afternoon", "night", "ok", "okay", "yes", "no", "please", "help", "cheers",
    "great", "fine", "how", "are", "what", "who", "see", "later",
];

const FARMING_KEYWORDS: &[&str] = &[
    "field", "crop", "harvest", "spray", "plant", "fertil", "yield", "seed", "sow", "irrigat",
    "water", "pest", "disease", "soil", "prun", "weed", "orchard", "vineyard", "hectare",
    "livestock", "tractor", "task", "grow", "ripe", "fungicid", "herbicid", "pesticid",
];

const HARVEST_KEYWORDS: &[&str] = &["harvest", "pick", "ripe", "yield"];
const PRODUCT_KEYWORDS: &[&str] = &[
    "spray", "fertil", "pesticid", "herbicid", "fungicid", "product", "dose", "dosage", "treat",
];
const FIELD_KEYWORDS: &[&str] = &["field", "plot", "parcel", "hectare", "boundary"];

const REPORT_WORDS: &[&str] = &[
    "planted", "sowed", "sown", "sprayed", "harvested", "applied", "fertilized", "fertilised",
    "watered", "irrigated", "pruned", "seeded", "picked", "used",
];

const QUESTION_STARTS: &[&str] = &[
    "what", "when", "which", "how", "where", "show", "list", "do", "did", "is", "are", "can",
    "should",
];

const CORRECTION_MARKERS: &[&str] = &[
    "actually", "correction", "sorry", "no,", "i meant", "wrong", "change my", "update my",
];

const GREETINGS: &[&str] = &["hello", "hi", "hey", "good morning", "good evening", "good afternoon"];
const THANKS: &[&str] = &["thank", "thanks", "cheers", "appreciate"];
const GOODBYES: &[&str] = &["bye", "goodbye", "see you", "good night"];

/// Normalized phone number when the whole message is one.
pub fn phone_like(message: &str) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }
    let allowed = trimmed.char_indices().all(|(i, c)| {
        c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.') || (c == '+' && i == 0)
    });
    if !allowed {
        return None;
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if !(8..=15).contains(&digits.len()) {
        return None;
    }
    Some(if trimmed.starts_with('+') {
        format!("+{}", digits)
    } else {
        digits
    })
}

/// The first phone-like token run inside a longer message.
fn find_phone(message: &str) -> Option<String> {
    let start = message.find(|c: char| c == '+' || c.is_ascii_digit())?;
    let candidate: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.' | '+'))
        .collect();
    phone_like(candidate.trim())
}

/// The message as a person's name when it is `min..=max` alphabetic words and
/// not everyday chat.
pub fn name_like(message: &str, min: usize, max: usize) -> Option<String> {
    let words: Vec<&str> = message.split_whitespace().collect();
    if !(min..=max).contains(&words.len()) {
        return None;
    }
    let alphabetic = words.iter().all(|w| {
        w.chars().any(char::is_alphabetic)
            && w.chars().all(|c| c.is_alphabetic() || c == '-' || c == '\'')
    });
    if !alphabetic {
        return None;
    }
    let chatty = words
        .iter()
        .any(|w| CHAT_WORDS.contains(&w.to_lowercase().as_str()));
    if chatty {
        return None;
    }
    Some(words.join(" "))
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn first_match(text: &str, keywords: &[&str]) -> Option<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .find(|word| keywords.iter().any(|k| word.starts_with(k)))
        .map(str::to_string)
}

fn is_question(lower: &str) -> bool {
    lower.contains('?')
        || lower
            .split_whitespace()
            .next()
            .map(|w| QUESTION_STARTS.contains(&w))
            .unwrap_or(false)
}

/// Keyword analysis of a message.
pub fn analyze(message: &str) -> IntentAnalysis {
    let lower = message.trim().to_lowercase();

    if let Some(phone) = phone_like(&lower) {
        return IntentAnalysis {
            intent: Intent::Registration,
            entities: Entities {
                phone: Some(phone),
                ..Default::default()
            },
            actions_needed: ActionsNeeded::default(),
            conversation_type: ConversationType::Registration,
            confidence: 0.6,
            source: AnalysisSource::Heuristic,
        };
    }

    let farming = contains_any(&lower, FARMING_KEYWORDS);
    if !farming {
        if let Some(name) = name_like(message, 2, 3) {
            return IntentAnalysis {
                intent: Intent::Registration,
                entities: Entities {
                    name: Some(name),
                    ..Default::default()
                },
                actions_needed: ActionsNeeded::default(),
                conversation_type: ConversationType::Registration,
                confidence: 0.5,
                source: AnalysisSource::Heuristic,
            };
        }
    }

    let question = is_question(&lower);
    if farming || question {
        let intent = if contains_any(&lower, HARVEST_KEYWORDS) {
            Intent::HarvestQuestion
        } else if contains_any(&lower, PRODUCT_KEYWORDS) {
            Intent::ProductQuestion
        } else if contains_any(&lower, FIELD_KEYWORDS) {
            Intent::FieldQuestion
        } else {
            Intent::FarmingQuestion
        };

        let reported = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| REPORT_WORDS.contains(&w));

        return IntentAnalysis {
            intent,
            entities: Entities {
                field: first_match(&lower, FIELD_KEYWORDS),
                product: first_match(&lower, PRODUCT_KEYWORDS),
                ..Default::default()
            },
            actions_needed: ActionsNeeded {
                store_data: reported && !question,
                query_data: question,
                ask_clarification: !reported && !question,
            },
            conversation_type: ConversationType::Farming,
            confidence: 0.4,
            source: AnalysisSource::Heuristic,
        };
    }

    IntentAnalysis {
        intent: Intent::GeneralChat,
        entities: Entities::default(),
        actions_needed: ActionsNeeded::default(),
        conversation_type: ConversationType::GeneralChat,
        confidence: 0.3,
        source: AnalysisSource::Heuristic,
    }
}

fn after_marker<'a>(message: &'a str, lower: &str, markers: &[&str]) -> Option<&'a str> {
    markers.iter().find_map(|marker| {
        lower
            .find(marker)
            .map(|pos| message[pos + marker.len()..].trim())
            .filter(|rest| !rest.is_empty())
    })
}

/// Registration values in a message, checked against what is already known.
///
/// Explicit markers ("my name is ...", "my farm is called ...") win; otherwise a
/// phone-like message fills the phone, and anything else fills the next missing
/// field if it has the right shape.
pub fn extract_registration(message: &str, state: &RegistrationState) -> RegistrationExtraction {
    let trimmed = message.trim();
    let lower = trimmed.to_lowercase();
    let correction = CORRECTION_MARKERS.iter().any(|m| lower.starts_with(m))
        || lower.contains("i meant");
    let mut values = BTreeMap::new();

    // `to_lowercase` can change byte lengths; only slice by markers when it did not.
    let same_layout = lower.len() == trimmed.len();
    if same_layout {
        if let Some(rest) = after_marker(trimmed, &lower, &["my name is ", "name is "]) {
            if let Some(name) = name_like(rest.trim_end_matches('.'), 1, 4) {
                values.insert(RegistrationField::FullName, name);
            }
        }
        if let Some(rest) = after_marker(
            trimmed,
            &lower,
            &["my farm is called ", "farm name is ", "my farm is ", "farm is called "],
        ) {
            values.insert(
                RegistrationField::FarmName,
                rest.trim_end_matches('.').to_string(),
            );
        }
    }
    if !values.contains_key(&RegistrationField::WaPhoneNumber) {
        if let Some(phone) = phone_like(trimmed).or_else(|| {
            if lower.contains("phone") || lower.contains("number") {
                find_phone(trimmed)
            } else {
                None
            }
        }) {
            values.insert(RegistrationField::WaPhoneNumber, phone);
        }
    }

    if values.is_empty() {
        if let Some(field) = state.missing_fields().into_iter().next() {
            let value = match field {
                RegistrationField::FullName => {
                    let plausible =
                        !contains_any(&lower, FARMING_KEYWORDS) && !is_question(&lower);
                    name_like(trimmed, 2, 4).filter(|_| plausible)
                }
                RegistrationField::WaPhoneNumber => None,
                RegistrationField::Password => {
                    let single_token = !trimmed.contains(char::is_whitespace);
                    (single_token && trimmed.chars().count() >= 6).then(|| trimmed.to_string())
                }
                RegistrationField::FarmName => {
                    let len = trimmed.chars().count();
                    (len >= 2 && len <= 100 && !is_small_talk(&lower))
                        .then(|| trimmed.trim_end_matches('.').to_string())
                }
            };
            if let Some(value) = value {
                values.insert(field, value);
            }
        }
    }

    RegistrationExtraction::against(state, values, correction)
}

/// Kind of small talk, for canned replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallTalk {
    Greeting,
    Thanks,
    Goodbye,
}

pub fn small_talk(message: &str) -> Option<SmallTalk> {
    let lower = message.trim().to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |phrases: &[&str]| {
        phrases.iter().any(|p| {
            if p.contains(' ') {
                lower.contains(p)
            } else {
                words.contains(p)
            }
        })
    };
    if has(GOODBYES) {
        Some(SmallTalk::Goodbye)
    } else if has(THANKS) {
        Some(SmallTalk::Thanks)
    } else if has(GREETINGS) {
        Some(SmallTalk::Greeting)
    } else {
        None
    }
}

fn is_small_talk(lower: &str) -> bool {
    small_talk(lower).is_some() && lower.split_whitespace().count() <= 3
}

/// Read query for common dashboard questions, scoped to the farmer.
pub fn read_query(question: &str, farmer_id: i64) -> Option<String> {
    let lower = question.to_lowercase();
    if lower.contains("task") || lower.contains("todo") || lower.contains("to do") {
        return Some(format!(
            "SELECT t.title, t.status, t.due_date, t.completion_notes \
             FROM tasks t WHERE t.farmer_id = {} \
             ORDER BY COALESCE(t.due_date, '9999-12-31') LIMIT 50",
            farmer_id
        ));
    }
    if contains_any(
        &lower,
        &["field", "crop", "plant", "grow", "harvest", "hectare", "variet"],
    ) {
        return Some(format!(
            "SELECT f.name AS field_name, f.area_hectares, fc.crop_type, fc.variety, fc.planting_date \
             FROM fields f LEFT JOIN field_crops fc ON fc.field_id = f.id \
             WHERE f.farmer_id = {} ORDER BY f.id, fc.id LIMIT 50",
            farmer_id
        ));
    }
    None
}

/// Question asked when a lookup returned nothing.
pub fn clarifying_question() -> String {
    "I couldn't find any records that answer that. Which field or crop do you mean, \
     and roughly when did it happen?"
        .to_string()
}

/// Plain-text summary of rows, naming the values actually present.
pub fn format_rows(rows: &[Value]) -> String {
    if rows.is_empty() {
        return clarifying_question();
    }

    let lines: Vec<String> = rows
        .iter()
        .take(10)
        .map(|row| match row.as_object() {
            Some(object) => object
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{}: {}", k.replace('_', " "), s),
                    other => format!("{}: {}", k.replace('_', " "), other),
                })
                .collect::<Vec<_>>()
                .join(", "),
            None => row.to_string(),
        })
        .filter(|line| !line.is_empty())
        .map(|line| format!("- {}", line))
        .collect();

    let mut text = format!("Here is what I found in your records:\n{}", lines.join("\n"));
    if rows.len() > 10 {
        text.push_str(&format!("\n...and {} more.", rows.len() - 10));
    }
    text
}

/// First JSON object in provider output, tolerating code fences and prose.
pub fn parse_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
