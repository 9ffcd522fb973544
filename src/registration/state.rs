use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// A registration answer the assistant collects, in the order it asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationField {
    FullName,
    WaPhoneNumber,
    Password,
    FarmName,
}

impl RegistrationField {
    /// Collection order.
    pub const ALL: [RegistrationField; 4] = [
        RegistrationField::FullName,
        RegistrationField::WaPhoneNumber,
        RegistrationField::Password,
        RegistrationField::FarmName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationField::FullName => "full_name",
            RegistrationField::WaPhoneNumber => "wa_phone_number",
            RegistrationField::Password => "password",
            RegistrationField::FarmName => "farm_name",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "full_name" | "name" => Some(RegistrationField::FullName),
            "wa_phone_number" | "phone" | "phone_number" => Some(RegistrationField::WaPhoneNumber),
            "password" => Some(RegistrationField::Password),
            "farm_name" | "farm" => Some(RegistrationField::FarmName),
            _ => None,
        }
    }
}

impl fmt::Display for RegistrationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Values pulled out of one farmer message.
///
/// `values` holds everything the message provided; `updates_made` lists only the
/// fields that may be written given the state the extraction ran against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationExtraction {
    pub values: BTreeMap<RegistrationField, String>,
    pub updates_made: Vec<RegistrationField>,
    pub correction: bool,
}

impl RegistrationExtraction {
    /// Build an extraction, keeping in `updates_made` only fields that are absent
    /// from `state` (or all of them when the message is an explicit correction).
    pub fn against(
        state: &RegistrationState,
        values: BTreeMap<RegistrationField, String>,
        correction: bool,
    ) -> Self {
        let values: BTreeMap<_, _> = values
            .into_iter()
            .map(|(field, value)| (field, value.trim().to_string()))
            .filter(|(_, value)| !value.is_empty())
            .collect();

        let updates_made = values
            .keys()
            .copied()
            .filter(|field| correction || !state.has(*field))
            .collect();

        Self {
            values,
            updates_made,
            correction,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates_made.is_empty()
    }
}

/// Partial registration answers accumulated across turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub full_name: Option<String>,
    pub wa_phone_number: Option<String>,
    /// bcrypt hash; the plaintext password is never stored.
    pub password_hash: Option<String>,
    pub farm_name: Option<String>,
    pub country_detected: Option<String>,
    pub completed: bool,
    pub farmer_record_id: Option<i64>,
}

impl RegistrationState {
    pub fn get(&self, field: RegistrationField) -> Option<&str> {
        match field {
            RegistrationField::FullName => self.full_name.as_deref(),
            RegistrationField::WaPhoneNumber => self.wa_phone_number.as_deref(),
            RegistrationField::Password => self.password_hash.as_deref(),
            RegistrationField::FarmName => self.farm_name.as_deref(),
        }
    }

    pub fn has(&self, field: RegistrationField) -> bool {
        self.get(field).is_some()
    }

    /// Missing fields in collection order.
    pub fn missing_fields(&self) -> Vec<RegistrationField> {
        RegistrationField::ALL
            .into_iter()
            .filter(|f| !self.has(*f))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Some answers collected but the farmer record not yet written.
    pub fn in_progress(&self) -> bool {
        !self.completed && RegistrationField::ALL.iter().any(|f| self.has(*f))
    }

    /// Merge an extraction. Only fields listed in `updates_made` are written, and an
    /// existing value is overwritten only when the extraction is a correction.
    ///
    /// The password value must already be hashed (see [`hash_password`]).
    /// Returns the fields that changed.
    pub fn apply(&mut self, extraction: &RegistrationExtraction) -> Vec<RegistrationField> {
        let mut applied = Vec::new();
        for field in &extraction.updates_made {
            let Some(value) = extraction.values.get(field) else {
                continue;
            };
            if self.has(*field) && !extraction.correction {
                continue;
            }
            let value = value.clone();
            match field {
                RegistrationField::FullName => self.full_name = Some(value),
                RegistrationField::WaPhoneNumber => {
                    self.country_detected = country_from_phone(&value).map(str::to_string);
                    self.wa_phone_number = Some(value);
                }
                RegistrationField::Password => self.password_hash = Some(value),
                RegistrationField::FarmName => self.farm_name = Some(value),
            }
            applied.push(*field);
        }
        applied
    }

    /// Forget the phone answer so it is asked for again.
    pub fn clear_phone(&mut self) {
        self.wa_phone_number = None;
        self.country_detected = None;
    }

    /// First name, for friendly prompts.
    pub fn first_name(&self) -> Option<&str> {
        self.full_name
            .as_deref()
            .and_then(|name| name.split_whitespace().next())
    }

    /// Prompt for the first missing field, or `None` when complete.
    pub fn next_prompt(&self) -> Option<String> {
        let field = self.missing_fields().into_iter().next()?;
        Some(match field {
            RegistrationField::FullName => {
                "Welcome to AVA OLO! I'll help you register. What is your full name?".to_string()
            }
            RegistrationField::WaPhoneNumber => match self.first_name() {
                Some(first) => format!(
                    "Thanks, {}! What is your WhatsApp phone number? (e.g. +385912345678)",
                    first
                ),
                None => "What is your WhatsApp phone number? (e.g. +385912345678)".to_string(),
            },
            RegistrationField::Password => {
                "Great! Please choose a password for your account (at least 6 characters, no spaces)."
                    .to_string()
            }
            RegistrationField::FarmName => {
                "Almost done! What is the name of your farm?".to_string()
            }
        })
    }

    /// Message sent once every field is collected.
    pub fn completion_message(&self) -> String {
        let name = self.full_name.as_deref().unwrap_or("farmer");
        match self.farm_name.as_deref() {
            Some(farm) => format!(
                "Welcome aboard, {}! {} is now registered with AVA OLO. How can I help with your farming today?",
                name, farm
            ),
            None => format!("Welcome aboard, {}! How can I help with your farming today?", name),
        }
    }
}

/// Replace a plaintext password in `extraction` with its bcrypt hash.
///
/// Hashing is CPU bound, so it runs on the blocking pool.
pub async fn hash_password(
    mut extraction: RegistrationExtraction,
    cost: u32,
) -> AppResult<RegistrationExtraction> {
    let Some(plain) = extraction.values.remove(&RegistrationField::Password) else {
        return Ok(extraction);
    };

    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(plain, cost))
        .await
        .map_err(|e| AppError::Internal {
            message: format!("password hashing task failed: {}", e),
        })?
        .map_err(|e| AppError::Internal {
            message: format!("password hashing failed: {}", e),
        })?;

    extraction.values.insert(RegistrationField::Password, hash);
    Ok(extraction)
}

/// Country for an international dialling prefix.
pub fn country_from_phone(phone: &str) -> Option<&'static str> {
    const PREFIXES: &[(&str, &str)] = &[
        ("+385", "Croatia"),
        ("+386", "Slovenia"),
        ("+387", "Bosnia and Herzegovina"),
        ("+381", "Serbia"),
        ("+382", "Montenegro"),
        ("+389", "North Macedonia"),
        ("+359", "Bulgaria"),
        ("+36", "Hungary"),
        ("+40", "Romania"),
        ("+43", "Austria"),
        ("+49", "Germany"),
        ("+39", "Italy"),
        ("+33", "France"),
        ("+34", "Spain"),
        ("+44", "United Kingdom"),
        ("+48", "Poland"),
        ("+91", "India"),
        ("+254", "Kenya"),
        ("+55", "Brazil"),
    ];
    let compact: String = phone.chars().filter(|c| !c.is_whitespace()).collect();
    PREFIXES
        .iter()
        .find(|(prefix, _)| compact.starts_with(prefix))
        .map(|(_, country)| *country)
}
