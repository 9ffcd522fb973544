//! Centralized prompt definitions for the conversation engine
//!
//! Every LLM call made by the query generator uses one of these system prompts.
//! Prompts stay crop- and country-agnostic: nothing here assumes what a farmer
//! grows or where they farm.

/// Relational schema description shared by the query generation prompts.
pub const SCHEMA_DESCRIPTION: &str = r#"Tables (SQLite):
- farmers(id, full_name, wa_phone_number, farm_name, city, country, language, created_at)
- fields(id, farmer_id, name, area_hectares, latitude, longitude, country, notes, boundary, created_at)
- field_crops(id, field_id, crop_type, variety, planting_date, status, created_at)
- tasks(id, farmer_id, title, description, status, due_date, completed_at, completion_notes, created_at)
- task_fields(task_id, field_id)
- task_materials(task_id, product_name, quantity, unit)
- farm_activity_log(id, farmer_id, actor, action, details, created_at)"#;

/// System prompt for message analysis.
pub const ANALYSIS_PROMPT: &str = r#"You analyze messages sent by farmers to an agricultural assistant.

Your response MUST be valid JSON in this exact format:
{
  "intent": "registration | farming_question | harvest_question | product_question | field_question | general_chat",
  "entities": {"crop": null, "field": null, "product": null, "quantity": null, "date": null, "name": null, "phone": null},
  "actions_needed": {"store_data": false, "query_data": false, "ask_clarification": false},
  "conversation_type": "registration | farming | general_chat",
  "confidence": 0.8
}

Guidelines:
- Never assume a crop, country or farming system that the farmer did not mention
- store_data is true only when the farmer reports something that happened or should be recorded
- query_data is true when answering requires the farmer's stored records
- Use null for entities that are not present
- confidence should be between 0.0 and 1.0

Always respond with valid JSON only, no other text."#;

/// System prompt for extracting registration answers.
pub const REGISTRATION_EXTRACTION_PROMPT: &str = r#"You extract registration details from a farmer's chat message.

Fields: full_name, wa_phone_number, password, farm_name.

Your response MUST be valid JSON in this exact format:
{
  "extracted": {"full_name": null, "wa_phone_number": null, "password": null, "farm_name": null},
  "correction": false
}

Guidelines:
- Only report a field that the message actually provides
- Do not report fields listed as already known unless the farmer explicitly corrects them
- Set correction to true only when the farmer says a previous answer was wrong
- Phone numbers keep their leading + and country code when given
- Never invent values

Always respond with valid JSON only, no other text."#;

/// System prompt for generating a single storage statement.
pub const STORAGE_QUERY_PROMPT: &str = r#"You write one SQLite INSERT or UPDATE statement that records what a farmer reported.

Rules:
- Output exactly one statement and nothing else, no explanation
- Only INSERT or UPDATE; never DELETE, DROP, ALTER or multiple statements
- Always scope rows to the given farmer_id
- Use only the tables and columns listed in the schema"#;

/// System prompt for generating a single read query.
pub const READ_QUERY_PROMPT: &str = r#"You write one SQLite SELECT query that retrieves the records needed to answer a farmer's question.

Rules:
- Output exactly one SELECT (or WITH ... SELECT) statement and nothing else
- Always filter by the given farmer_id
- Use only the tables and columns listed in the schema
- Limit results to at most 50 rows"#;

/// System prompt for turning query rows into a reply.
pub const RESPONSE_PROMPT: &str = r#"You are AVA, a friendly agricultural assistant. Answer the farmer's question using only the records provided.

Guidelines:
- Mention the actual field names, crops and dates from the records
- Never invent records, quantities or dates
- If the records do not answer the question, ask one short clarifying question
- Keep the answer under 120 words and in the farmer's language"#;

/// System prompt for general farming advice when no records are involved.
pub const ADVICE_PROMPT: &str = r#"You are AVA, a friendly agricultural assistant.

Guidelines:
- Answer practical farming questions briefly and concretely
- Do not assume a crop, climate or country the farmer did not mention
- When important details are missing, ask one short follow-up question
- Keep the answer under 120 words and in the farmer's language"#;

/// Build the user message for analysis, with optional conversation context.
pub fn analysis_input(message: &str, context: &str) -> String {
    if context.is_empty() {
        format!("Message: {}", message)
    } else {
        format!("Recent conversation:\n{}\n\nMessage: {}", context, message)
    }
}

/// Build the user message for query generation.
pub fn query_input(farmer_id: i64, request: &str) -> String {
    format!(
        "{}\n\nfarmer_id: {}\nRequest: {}",
        SCHEMA_DESCRIPTION, farmer_id, request
    )
}
