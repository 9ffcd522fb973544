use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the farmer is trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Registration,
    FarmingQuestion,
    HarvestQuestion,
    ProductQuestion,
    FieldQuestion,
    GeneralChat,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Registration => "registration",
            Intent::FarmingQuestion => "farming_question",
            Intent::HarvestQuestion => "harvest_question",
            Intent::ProductQuestion => "product_question",
            Intent::FieldQuestion => "field_question",
            Intent::GeneralChat => "general_chat",
        }
    }

    pub fn is_farming(&self) -> bool {
        matches!(
            self,
            Intent::FarmingQuestion
                | Intent::HarvestQuestion
                | Intent::ProductQuestion
                | Intent::FieldQuestion
        )
    }

    /// Lenient parse of provider output; unknown values are general chat.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "registration" => Intent::Registration,
            "farming_question" | "farming" => Intent::FarmingQuestion,
            "harvest_question" | "harvest" => Intent::HarvestQuestion,
            "product_question" | "product" => Intent::ProductQuestion,
            "field_question" | "field" => Intent::FieldQuestion,
            _ => Intent::GeneralChat,
        }
    }
}

/// Conversation category used for routing, caching and the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Registration,
    Farming,
    GeneralChat,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Registration => "registration",
            ConversationType::Farming => "farming",
            ConversationType::GeneralChat => "general_chat",
        }
    }
}

impl From<Intent> for ConversationType {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Registration => ConversationType::Registration,
            Intent::GeneralChat => ConversationType::GeneralChat,
            _ => ConversationType::Farming,
        }
    }
}

/// Entities mentioned in a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Entities {
    /// Build from loosely typed provider output: numbers become strings, empty and
    /// null values are dropped.
    pub fn from_json(value: &Value) -> Self {
        let get = |key: &str| -> Option<String> {
            match value.get(key)? {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        Self {
            crop: get("crop"),
            field: get("field"),
            product: get("product"),
            quantity: get("quantity"),
            date: get("date"),
            name: get("name"),
            phone: get("phone"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Entities::default()
    }
}

/// Follow-up work a message requires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionsNeeded {
    #[serde(default)]
    pub store_data: bool,
    #[serde(default)]
    pub query_data: bool,
    #[serde(default)]
    pub ask_clarification: bool,
}

/// Where an analysis came from. Anything other than `Llm` is degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisSource {
    Llm,
    /// No LLM configured; keyword heuristics were used.
    Heuristic,
    /// The LLM call failed or returned unusable output.
    Fallback { error: String },
}

impl AnalysisSource {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, AnalysisSource::Llm)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, AnalysisSource::Fallback { .. })
    }
}

/// Result of analyzing one farmer message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: Intent,
    pub entities: Entities,
    pub actions_needed: ActionsNeeded,
    pub conversation_type: ConversationType,
    pub confidence: f64,
    pub source: AnalysisSource,
}

impl IntentAnalysis {
    /// Safe default used when analysis fails.
    pub fn fallback(error: impl Into<String>) -> Self {
        Self {
            intent: Intent::GeneralChat,
            entities: Entities::default(),
            actions_needed: ActionsNeeded::default(),
            conversation_type: ConversationType::GeneralChat,
            confidence: 0.0,
            source: AnalysisSource::Fallback {
                error: error.into(),
            },
        }
    }

    /// Parse provider JSON. Missing optional parts take defaults; a missing or
    /// non-object body is an error.
    pub fn from_llm_json(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "analysis is not a JSON object".to_string())?;
        let intent = object
            .get("intent")
            .and_then(Value::as_str)
            .map(Intent::parse_lenient)
            .ok_or_else(|| "analysis has no intent".to_string())?;

        let actions_needed = object
            .get("actions_needed")
            .cloned()
            .map(serde_json::from_value::<ActionsNeeded>)
            .transpose()
            .map_err(|e| format!("invalid actions_needed: {}", e))?
            .unwrap_or_default();

        let conversation_type = match object.get("conversation_type").and_then(Value::as_str) {
            Some("registration") => ConversationType::Registration,
            Some("farming") => ConversationType::Farming,
            Some("general_chat") => ConversationType::GeneralChat,
            _ => ConversationType::from(intent),
        };

        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        Ok(Self {
            intent,
            entities: object
                .get("entities")
                .map(Entities::from_json)
                .unwrap_or_default(),
            actions_needed,
            conversation_type,
            confidence,
            source: AnalysisSource::Llm,
        })
    }
}
