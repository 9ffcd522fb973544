use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{ConversationRequest, ConversationResponse, EmotionalState};
use crate::backends::{GraphStore, SimilarConversation, VectorStore};
use crate::config::{CacheConfig, SessionConfig};
use crate::error::{AppError, AppResult, ResilienceError, StorageError, StorageResult};
use crate::generator::heuristics::{self, SmallTalk};
use crate::generator::{
    ActionsNeeded, AnalysisSource, ConversationType, Entities, Intent, IntentAnalysis,
    QueryGenerator,
};
use crate::performance::{CacheStats, ParallelProcessor, ResponseCache};
use crate::registration::{hash_password, RegistrationField, RegistrationTracker};
use crate::resilience::{services, FailoverManager};
use crate::session::{Channel, ConversationSession, SessionLocks, SessionRole, SessionStore};
use crate::storage::{FarmUserRole, IntelligenceLogEntry, NewFarmer, Storage};

/// Messages of history handed to the generator as context.
const CONTEXT_MESSAGES: usize = 6;
/// Table size above which idle locks, tracker entries and expired analyses are dropped.
const PRUNE_THRESHOLD: usize = 1024;

const TELL_ME_MORE: &str = "Tell me a bit more so I can help: which field or crop is this about, \
     and what would you like to know or record?";
const STORE_UNCLEAR: &str = "Thanks for the update! I couldn't work out exactly what to record. \
     Could you tell me the field, what you did and when?";
const STORE_FAILED: &str = "I understood your update, but I couldn't save it right now. \
     Please send it again in a little while.";
const RECORDED: &str = "Got it, I've recorded that in your farm records.";
const REGISTRATION_SAVE_FAILED: &str = "I have all your details, but I couldn't finish your \
     registration right now. Please send any message in a moment to try again.";
const PHONE_TAKEN: &str = "That WhatsApp number is already registered with AVA OLO. \
     Please send a different phone number.";
const ALREADY_REGISTERED: &str =
    "You're already registered with AVA OLO. How can I help with your farm today?";
const GREETING_REPLY: &str =
    "Hello! I'm AVA, your farming assistant. How can I help with your farm today?";
const THANKS_REPLY: &str = "You're welcome! Let me know if there's anything else I can help with.";
const GOODBYE_REPLY: &str = "Goodbye! Good luck on the farm, and message me any time.";
const CHAT_FALLBACK: &str = "I'm here to help with your farm. Ask me about your fields, crops \
     or tasks, or tell me what you did today.";

/// Everything the engine talks to.
pub struct EngineParts {
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub generator: Arc<QueryGenerator>,
    pub storage: Arc<dyn Storage>,
    pub sessions: Arc<dyn SessionStore>,
    pub graph: Arc<GraphStore>,
    pub vector: Arc<VectorStore>,
    pub failover: Arc<FailoverManager>,
    pub tracker: Arc<RegistrationTracker>,
}

/// Reply produced by one of the sub-flows
struct TurnReply {
    message: String,
    conversation_type: ConversationType,
    requires_action: bool,
    degraded: bool,
}

impl TurnReply {
    fn new(message: impl Into<String>, conversation_type: ConversationType) -> Self {
        Self {
            message: message.into(),
            conversation_type,
            requires_action: false,
            degraded: false,
        }
    }

    fn awaiting_answer(mut self) -> Self {
        self.requires_action = true;
        self
    }

    fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// Turn-by-turn conversation orchestration across registration and farming.
///
/// Each turn holds its session's lock from load to save, so concurrent
/// messages on one session are applied one after the other.
pub struct ConversationEngine {
    history_limit: usize,
    session_ttl: Duration,
    password_hash_cost: u32,
    generator: Arc<QueryGenerator>,
    storage: Arc<dyn Storage>,
    sessions: Arc<dyn SessionStore>,
    graph: Arc<GraphStore>,
    vector: Arc<VectorStore>,
    failover: Arc<FailoverManager>,
    tracker: Arc<RegistrationTracker>,
    cache: ResponseCache<IntentAnalysis>,
    locks: SessionLocks,
    parallel: ParallelProcessor,
}

impl ConversationEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            history_limit: parts.session.history_limit.max(1),
            session_ttl: parts.session.timeout(),
            password_hash_cost: parts.session.password_hash_cost,
            generator: parts.generator,
            storage: parts.storage,
            sessions: parts.sessions,
            graph: parts.graph,
            vector: parts.vector,
            failover: parts.failover,
            tracker: parts.tracker,
            cache: ResponseCache::from_config(&parts.cache),
            locks: SessionLocks::new(),
            parallel: ParallelProcessor::new(),
        }
    }

    /// Handle one farmer message. Always returns a reply; unexpected failures
    /// become `success: false` with a generic message.
    pub async fn handle_farmer_message(&self, request: ConversationRequest) -> ConversationResponse {
        let start = Instant::now();
        let session_id = self.resolve_session_id(&request);

        let response = match self.run_turn(&request, &session_id).await {
            Ok(response) => {
                info!(
                    session_id = %session_id,
                    farmer_id = request.farmer_id,
                    conversation_type = response.conversation_type.as_str(),
                    degraded = response.degraded,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Conversation turn handled"
                );
                response
            }
            Err(e) => {
                error!(
                    session_id = %session_id,
                    farmer_id = request.farmer_id,
                    error = %e,
                    "Conversation turn failed"
                );
                ConversationResponse::failure(session_id, e.to_string())
            }
        };

        self.prune_idle_state().await;
        response
    }

    /// Drop locks nobody holds, registrations whose sessions have expired and
    /// expired cached analyses once the tables grow.
    async fn prune_idle_state(&self) {
        if self.locks.len() > PRUNE_THRESHOLD {
            let locks = self.locks.prune();
            let analyses = self.cache.prune_expired().await;
            debug!(locks, analyses, "Pruned idle session locks and expired analyses");
        }
        if self.tracker.len() > PRUNE_THRESHOLD {
            let registrations = self.tracker.prune_idle(self.session_ttl);
            debug!(registrations, "Pruned abandoned registrations");
        }
    }

    /// Stored session, if it exists and has not expired.
    pub async fn get_history(&self, session_id: &str) -> AppResult<Option<ConversationSession>> {
        self.failover
            .execute_with_failover(services::REDIS, || self.sessions.load(session_id))
            .await
            .map_err(AppError::from)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn tracker(&self) -> &RegistrationTracker {
        &self.tracker
    }

    /// Explicit id, then the farmer's in-progress registration, then a new one.
    fn resolve_session_id(&self, request: &ConversationRequest) -> String {
        request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.tracker.session_for(request.farmer_id))
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    async fn run_turn(
        &self,
        request: &ConversationRequest,
        session_id: &str,
    ) -> AppResult<ConversationResponse> {
        // Validate input
        let message = request.message.trim();
        if message.is_empty() {
            return Err(AppError::Validation {
                field: "message".to_string(),
                reason: "Message cannot be empty".to_string(),
            });
        }

        let _guard = self.locks.acquire(session_id).await;

        let channel = request.channel.unwrap_or_default();
        let mut session = self
            .load_session(session_id, request.farmer_id, channel)
            .await;
        if session.farmer_id != request.farmer_id {
            return Err(AppError::Validation {
                field: "session_id".to_string(),
                reason: "Session belongs to another farmer".to_string(),
            });
        }

        let context = session.recent_context(CONTEXT_MESSAGES);
        session.push(SessionRole::Farmer, message, self.history_limit);

        let registered = self.is_registered(request.farmer_id, &session).await;
        // Password answers never leave the process.
        let awaiting_password = !registered
            && session.registration.missing_fields().first() == Some(&RegistrationField::Password);

        let analysis = if awaiting_password {
            registration_step_analysis()
        } else {
            let conversation_type = if registered {
                session.channel.as_str()
            } else {
                ConversationType::Registration.as_str()
            };
            self.analyze(request.farmer_id, message, &context, conversation_type)
                .await
        };
        debug!(
            session_id = %session_id,
            intent = analysis.intent.as_str(),
            registered,
            "Routing turn"
        );

        let reply = if !registered || analysis.intent == Intent::Registration {
            self.registration_turn(&mut session, message, registered, awaiting_password)
                .await?
        } else if analysis.intent.is_farming() {
            self.farming_turn(&session, message, &analysis, &context).await
        } else {
            chat_turn(message)
        };

        session.push(SessionRole::Ava, reply.message.as_str(), self.history_limit);
        self.save_session(&session).await;
        self.audit(&session, &analysis, &reply).await;

        let degraded = reply.degraded
            || analysis.source.is_fallback()
            || !self.generator.is_llm_configured();
        Ok(ConversationResponse {
            success: true,
            session_id: session.session_id,
            message: reply.message,
            conversation_type: reply.conversation_type,
            analysis: Some(analysis),
            requires_action: reply.requires_action,
            degraded,
            error: None,
        })
    }

    /// Load through the session store; a miss or an unavailable store starts fresh.
    async fn load_session(
        &self,
        session_id: &str,
        farmer_id: i64,
        channel: Channel,
    ) -> ConversationSession {
        let loaded = self
            .failover
            .execute_with_failover(services::REDIS, || self.sessions.load(session_id))
            .await;
        match loaded {
            Ok(Some(session)) => session,
            Ok(None) => ConversationSession::new(session_id, farmer_id, channel),
            Err(e) => {
                warn!(
                    store = self.sessions.name(),
                    session_id = %session_id,
                    error = %e,
                    "Session load failed, starting fresh"
                );
                ConversationSession::new(session_id, farmer_id, channel)
            }
        }
    }

    async fn save_session(&self, session: &ConversationSession) {
        let saved = self
            .failover
            .call(services::REDIS, || self.sessions.save(session))
            .await;
        if let Err(e) = saved {
            warn!(
                store = self.sessions.name(),
                session_id = %session.session_id,
                error = %e,
                "Session save failed"
            );
        }
    }

    /// Registered in this session or known to storage. When storage cannot be
    /// reached, only a registration already under way keeps the farmer in it.
    async fn is_registered(&self, farmer_id: i64, session: &ConversationSession) -> bool {
        if session.registration.completed {
            return true;
        }
        match self
            .failover
            .call(services::POSTGRESQL, || self.storage.get_farmer(farmer_id))
            .await
        {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(farmer_id, error = %e, "Farmer lookup failed");
                !session.registration.in_progress()
            }
        }
    }

    /// Analysis through the response cache. Fallback analyses are not cached.
    async fn analyze(
        &self,
        farmer_id: i64,
        message: &str,
        context: &str,
        conversation_type: &str,
    ) -> IntentAnalysis {
        self.cache
            .get_or_compute(farmer_id, message, conversation_type, || async {
                let analysis = self.generator.analyze_message(message, context).await;
                if analysis.source.is_fallback() {
                    Err(analysis)
                } else {
                    Ok(analysis)
                }
            })
            .await
            .unwrap_or_else(|analysis| analysis)
    }

    async fn registration_turn(
        &self,
        session: &mut ConversationSession,
        message: &str,
        registered: bool,
        awaiting_password: bool,
    ) -> AppResult<TurnReply> {
        if registered && !session.registration.in_progress() {
            return Ok(TurnReply::new(ALREADY_REGISTERED, ConversationType::Registration));
        }
        self.tracker
            .remember(session.farmer_id, session.session_id.as_str());

        let extraction = if awaiting_password {
            heuristics::extract_registration(message, &session.registration)
        } else {
            self.generator
                .extract_registration_data(message, &session.registration)
                .await
        };
        if extraction.values.contains_key(&RegistrationField::Password) {
            session.redact_last_farmer_message();
        }
        let extraction = hash_password(extraction, self.password_hash_cost).await?;

        let applied = session.registration.apply(&extraction);
        debug!(
            session_id = %session.session_id,
            applied = ?applied,
            correction = extraction.correction,
            "Registration answers merged"
        );
        if applied.contains(&RegistrationField::WaPhoneNumber) && self.phone_taken(session).await {
            session.registration.clear_phone();
            return Ok(
                TurnReply::new(PHONE_TAKEN, ConversationType::Registration).awaiting_answer()
            );
        }

        match session.registration.next_prompt() {
            Some(prompt) => {
                Ok(TurnReply::new(prompt, ConversationType::Registration).awaiting_answer())
            }
            None => Ok(self.complete_registration(session).await),
        }
    }

    /// Whether the session's phone number already belongs to another farmer. A
    /// failed lookup is not treated as taken; storage refuses the takeover anyway.
    async fn phone_taken(&self, session: &ConversationSession) -> bool {
        let Some(phone) = session.registration.wa_phone_number.as_deref() else {
            return false;
        };
        match self
            .failover
            .call(services::POSTGRESQL, || self.storage.find_farmer_by_phone(phone))
            .await
        {
            Ok(Some(owner)) if owner.id != session.farmer_id => {
                warn!(
                    farmer_id = session.farmer_id,
                    owner = owner.id,
                    "Registration phone belongs to another farmer"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(farmer_id = session.farmer_id, error = %e, "Phone lookup failed");
                false
            }
        }
    }

    /// Persist the farmer once every field is known.
    async fn complete_registration(&self, session: &mut ConversationSession) -> TurnReply {
        let state = &session.registration;
        let (Some(full_name), Some(phone)) = (&state.full_name, &state.wa_phone_number) else {
            return TurnReply::new(TELL_ME_MORE, ConversationType::Registration).awaiting_answer();
        };
        let new_farmer = NewFarmer {
            id: Some(session.farmer_id),
            full_name: full_name.clone(),
            wa_phone_number: phone.clone(),
            password_hash: state.password_hash.clone(),
            farm_name: state.farm_name.clone(),
            country: state.country_detected.clone(),
            ..Default::default()
        };

        let farmer = match self
            .failover
            .call(services::POSTGRESQL, || self.storage.upsert_farmer(&new_farmer))
            .await
        {
            Ok(farmer) => farmer,
            Err(ResilienceError::Operation(StorageError::PhoneTaken { owner })) => {
                warn!(
                    farmer_id = session.farmer_id,
                    owner,
                    "Registration phone belongs to another farmer"
                );
                session.registration.clear_phone();
                return TurnReply::new(PHONE_TAKEN, ConversationType::Registration)
                    .awaiting_answer();
            }
            Err(e) => {
                warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Saving registered farmer failed"
                );
                return TurnReply::new(REGISTRATION_SAVE_FAILED, ConversationType::Registration)
                    .awaiting_answer()
                    .degraded();
            }
        };

        session.registration.completed = true;
        session.registration.farmer_record_id = Some(farmer.id);
        self.tracker.forget(session.farmer_id);
        info!(
            farmer_id = farmer.id,
            session_id = %session.session_id,
            country = farmer.country.as_deref().unwrap_or("unknown"),
            "Farmer registered"
        );

        self.best_effort(
            "add_farm_user",
            self.storage
                .add_farm_user(farmer.id, &farmer.wa_phone_number, FarmUserRole::Owner),
        )
        .await;
        self.best_effort(
            "log_activity",
            self.storage.log_activity(
                farmer.id,
                &farmer.wa_phone_number,
                "registered",
                Some(json!({ "session_id": session.session_id })),
            ),
        )
        .await;

        if self.graph.is_enabled() {
            let graph = self
                .failover
                .execute_with_failover(services::NEO4J, || {
                    self.graph.upsert_farmer_node(
                        farmer.id,
                        &farmer.full_name,
                        farmer.farm_name.as_deref(),
                        farmer.country.as_deref(),
                    )
                })
                .await;
            if let Err(e) = graph {
                warn!(farmer_id = farmer.id, error = %e, "Graph farmer node not written");
            }
        }

        TurnReply::new(
            session.registration.completion_message(),
            ConversationType::Registration,
        )
    }

    async fn farming_turn(
        &self,
        session: &ConversationSession,
        message: &str,
        analysis: &IntentAnalysis,
        context: &str,
    ) -> TurnReply {
        let farmer_id = session.farmer_id;
        let mut context = context.to_string();

        if self.vector.is_enabled() {
            let (similar, mood) = self
                .parallel
                .join2(self.similar_conversations(farmer_id, message), async {
                    EmotionalState::detect(message)
                })
                .await;
            let texts: Vec<&str> = similar.iter().filter_map(|s| s.text.as_deref()).collect();
            if !texts.is_empty() {
                context.push_str("\nSimilar past conversations:\n");
                context.push_str(&texts.join("\n"));
            }
            if mood != EmotionalState::Neutral {
                context.push_str(&format!("\nFarmer seems {}.", mood.as_str()));
            }
        }

        let ActionsNeeded {
            store_data,
            query_data,
            ..
        } = analysis.actions_needed;
        let reply = if store_data {
            self.store_report(farmer_id, message, analysis).await
        } else if query_data {
            self.answer_from_records(farmer_id, message, &context).await
        } else {
            match self.generator.advise(message, &context).await {
                Some(advice) => TurnReply::new(advice, ConversationType::Farming),
                None => TurnReply::new(TELL_ME_MORE, ConversationType::Farming).awaiting_answer(),
            }
        };

        if self.vector.is_enabled() {
            let id = Uuid::new_v4().to_string();
            let exchange = format!("farmer: {}\nava: {}", message, reply.message);
            let indexed = self
                .failover
                .call(services::PINECONE, || {
                    self.vector.upsert_conversation(&id, farmer_id, &exchange)
                })
                .await;
            if let Err(e) = indexed {
                warn!(farmer_id, error = %e, "Conversation not indexed");
            }
        }
        reply
    }

    async fn similar_conversations(
        &self,
        farmer_id: i64,
        message: &str,
    ) -> Vec<SimilarConversation> {
        let top_k = self.vector.top_k();
        self.failover
            .execute_with_failover(services::PINECONE, || {
                self.vector.similar_conversations(farmer_id, message, top_k)
            })
            .await
            .unwrap_or_else(|e| {
                warn!(farmer_id, error = %e, "Similar conversation lookup failed");
                Vec::new()
            })
    }

    async fn store_report(
        &self,
        farmer_id: i64,
        message: &str,
        analysis: &IntentAnalysis,
    ) -> TurnReply {
        let Some(sql) = self
            .generator
            .generate_storage_query(message, analysis, farmer_id)
            .await
        else {
            return TurnReply::new(STORE_UNCLEAR, ConversationType::Farming).awaiting_answer();
        };

        match self
            .failover
            .call(services::POSTGRESQL, || self.storage.execute_generated(farmer_id, &sql))
            .await
        {
            Ok(rows) => {
                info!(farmer_id, rows, "Farmer report recorded");
                self.best_effort(
                    "log_activity",
                    self.storage.log_activity(
                        farmer_id,
                        "ava",
                        "recorded_report",
                        Some(json!({ "message": message, "rows": rows })),
                    ),
                )
                .await;
                TurnReply::new(RECORDED, ConversationType::Farming)
            }
            Err(e) => {
                warn!(farmer_id, error = %e, "Generated storage query failed");
                TurnReply::new(STORE_FAILED, ConversationType::Farming).degraded()
            }
        }
    }

    async fn answer_from_records(&self, farmer_id: i64, question: &str, context: &str) -> TurnReply {
        let Some(sql) = self
            .generator
            .generate_read_query(question, farmer_id, context)
            .await
        else {
            return match self.generator.advise(question, context).await {
                Some(advice) => TurnReply::new(advice, ConversationType::Farming),
                None => TurnReply::new(TELL_ME_MORE, ConversationType::Farming).awaiting_answer(),
            };
        };

        let (rows, degraded) = match self
            .failover
            .call(services::POSTGRESQL, || self.storage.fetch_generated(farmer_id, &sql))
            .await
        {
            Ok(rows) => (rows, false),
            Err(e) => {
                warn!(farmer_id, error = %e, "Generated read query failed");
                (Vec::new(), true)
            }
        };

        let text = self
            .generator
            .generate_response_from_data(question, &rows, context)
            .await;
        let mut reply = TurnReply::new(text, ConversationType::Farming);
        reply.requires_action = rows.is_empty();
        reply.degraded = degraded;
        reply
    }

    /// Audit rows for the turn. Failures are logged and swallowed.
    async fn audit(&self, session: &ConversationSession, analysis: &IntentAnalysis, reply: &TurnReply) {
        let session_id = session.session_id.as_str();
        let farmer_id = session.farmer_id;
        let farmer_text = session
            .last_farmer_message()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        self.best_effort(
            "conversation_session",
            self.storage.upsert_conversation_session(
                session_id,
                farmer_id,
                reply.conversation_type.as_str(),
                2,
            ),
        )
        .await;

        let entry = IntelligenceLogEntry {
            session_id: session_id.to_string(),
            message_type: analysis.intent.as_str().to_string(),
            llm_analysis: serde_json::to_value(analysis).unwrap_or(Value::Null),
            llm_response: reply.message.clone(),
        };
        self.best_effort("intelligence_log", self.storage.log_intelligence(&entry))
            .await;

        self.best_effort(
            "chat_message",
            self.storage.append_chat_message(
                farmer_id,
                Some(session_id),
                SessionRole::Farmer.as_str(),
                farmer_text,
            ),
        )
        .await;
        self.best_effort(
            "chat_message",
            self.storage.append_chat_message(
                farmer_id,
                Some(session_id),
                SessionRole::Ava.as_str(),
                &reply.message,
            ),
        )
        .await;
    }

    async fn best_effort<T, Fut>(&self, label: &str, operation: Fut)
    where
        Fut: Future<Output = StorageResult<T>>,
    {
        if let Err(e) = self
            .failover
            .call(services::POSTGRESQL, || operation)
            .await
        {
            warn!(operation = label, error = %e, "Best-effort write failed");
        }
    }
}

/// Analysis for a turn that only answers the pending registration question.
fn registration_step_analysis() -> IntentAnalysis {
    IntentAnalysis {
        intent: Intent::Registration,
        entities: Entities::default(),
        actions_needed: ActionsNeeded::default(),
        conversation_type: ConversationType::Registration,
        confidence: 1.0,
        source: AnalysisSource::Heuristic,
    }
}

fn chat_turn(message: &str) -> TurnReply {
    let text = match heuristics::small_talk(message) {
        Some(SmallTalk::Greeting) => GREETING_REPLY,
        Some(SmallTalk::Thanks) => THANKS_REPLY,
        Some(SmallTalk::Goodbye) => GOODBYE_REPLY,
        None => CHAT_FALLBACK,
    };
    TurnReply::new(text, ConversationType::GeneralChat)
}
