//! Checks and farmer scoping for LLM-generated SQL.
//!
//! Generated statements are tokenized so words inside string literals are never
//! mistaken for keywords. Reads run against farmer-scoped CTEs that shadow the
//! real tables; writes are limited to farm record tables and pinned to the
//! farmer's rows.

use crate::error::{StorageError, StorageResult};

/// What a generated statement is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedKind {
    /// Single INSERT or UPDATE
    Write,
    /// Single SELECT (optionally WITH ... SELECT)
    Read,
}

/// Upper bound on rows returned by a generated read query.
pub const MAX_GENERATED_ROWS: usize = 200;

const ALWAYS_FORBIDDEN: &[&str] = &[
    "DROP", "DELETE", "ALTER", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "CREATE", "REPLACE",
    "TRUNCATE", "REINDEX", "ANALYZE", "BEGIN", "COMMIT", "SAVEPOINT", "RELEASE", "ROLLBACK",
    "LOAD_EXTENSION",
    // Never visible to generated queries
    "FARM_USERS", "PASSWORD_HASH", "CAVA_CONVERSATION_SESSIONS", "CAVA_INTELLIGENCE_LOG",
    // Schema qualifiers would bypass the scoped tables
    "MAIN", "TEMP", "TEMPORARY",
];

const FORBIDDEN_PREFIXES: &[&str] = &["SQLITE_", "PRAGMA_", "_SQLX"];

const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE"];

/// A write touches exactly one table with literal values.
const WRITE_FORBIDDEN: &[&str] = &[
    "SELECT", "WITH", "FROM", "JOIN", "CONFLICT", "RETURNING", "ORDER", "LIMIT", "DEFAULT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Farmer,
    Field,
    Task,
}

impl Owner {
    fn predicate(self, column: &str, farmer_id: i64) -> String {
        match self {
            Owner::Farmer => format!("{} = {}", column, farmer_id),
            Owner::Field => format!(
                "{} IN (SELECT id FROM fields WHERE farmer_id = {})",
                column, farmer_id
            ),
            Owner::Task => format!(
                "{} IN (SELECT id FROM tasks WHERE farmer_id = {})",
                column, farmer_id
            ),
        }
    }
}

/// Tables generated writes may touch, with the columns that tie a row to a farmer.
const WRITABLE: &[(&str, &[(&str, Owner)])] = &[
    ("fields", &[("farmer_id", Owner::Farmer)]),
    ("tasks", &[("farmer_id", Owner::Farmer)]),
    ("farm_activity_log", &[("farmer_id", Owner::Farmer)]),
    ("field_crops", &[("field_id", Owner::Field)]),
    ("task_materials", &[("task_id", Owner::Task)]),
    ("task_fields", &[("task_id", Owner::Task), ("field_id", Owner::Field)]),
];

/// A generated statement rewritten to touch only one farmer's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedStatement {
    pub sql: String,
    /// Fields an INSERT links to; each must belong to the farmer.
    pub field_ids: Vec<i64>,
    /// Tasks an INSERT links to; each must belong to the farmer.
    pub task_ids: Vec<i64>,
}

impl ScopedStatement {
    fn unlinked(sql: String) -> Self {
        Self {
            sql,
            field_ids: Vec::new(),
            task_ids: Vec::new(),
        }
    }
}

/// Clean up a generated statement and check it is one statement of `kind`.
///
/// Markdown code fences and a single trailing `;` are stripped. Returns the
/// cleaned statement.
pub fn validate_generated(raw: &str, kind: GeneratedKind) -> StorageResult<String> {
    let sql = strip_code_fence(raw).trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        return Err(reject("empty statement"));
    }
    let tokens = tokenize(sql)?;
    check_words(&tokens, kind)?;
    Ok(sql.to_string())
}

/// Validate a generated statement and confine it to `farmer_id`.
///
/// Reads are wrapped in CTEs named after the farm tables, each holding only the
/// farmer's rows, and capped at [`MAX_GENERATED_ROWS`]. Updates get the owner
/// predicate ANDed onto their WHERE clause. Inserts must name the owner
/// columns with literal ids; `farmer_id` has to match and linked field and task
/// ids are returned for the caller to check.
pub fn scope_generated(
    raw: &str,
    kind: GeneratedKind,
    farmer_id: i64,
) -> StorageResult<ScopedStatement> {
    let sql = validate_generated(raw, kind)?;
    let tokens = tokenize(&sql)?;
    match kind {
        GeneratedKind::Read => Ok(ScopedStatement::unlinked(format!(
            "WITH {} SELECT * FROM ({}) LIMIT {}",
            scoped_tables(farmer_id),
            sql,
            MAX_GENERATED_ROWS
        ))),
        GeneratedKind::Write if tokens.first().is_some_and(|t| t.is_word("INSERT")) => {
            scope_insert(&sql, &tokens, farmer_id)
        }
        GeneratedKind::Write => scope_update(&sql, &tokens, farmer_id),
    }
}

fn scoped_tables(farmer_id: i64) -> String {
    let own_fields = format!("SELECT id FROM main.fields WHERE farmer_id = {}", farmer_id);
    let own_tasks = format!("SELECT id FROM main.tasks WHERE farmer_id = {}", farmer_id);
    [
        format!(
            "farmers AS (SELECT id, full_name, wa_phone_number, farm_name, city, country, \
             language, created_at FROM main.farmers WHERE id = {})",
            farmer_id
        ),
        format!("fields AS (SELECT * FROM main.fields WHERE farmer_id = {})", farmer_id),
        format!(
            "field_crops AS (SELECT * FROM main.field_crops WHERE field_id IN ({}))",
            own_fields
        ),
        format!("tasks AS (SELECT * FROM main.tasks WHERE farmer_id = {})", farmer_id),
        format!(
            "task_fields AS (SELECT * FROM main.task_fields WHERE task_id IN ({}))",
            own_tasks
        ),
        format!(
            "task_materials AS (SELECT * FROM main.task_materials WHERE task_id IN ({}))",
            own_tasks
        ),
        format!(
            "farm_activity_log AS (SELECT * FROM main.farm_activity_log WHERE farmer_id = {})",
            farmer_id
        ),
        format!(
            "chat_messages AS (SELECT * FROM main.chat_messages WHERE farmer_id = {})",
            farmer_id
        ),
    ]
    .join(", ")
}

fn writable(table: &str) -> StorageResult<&'static [(&'static str, Owner)]> {
    WRITABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(table))
        .map(|(_, owners)| *owners)
        .ok_or_else(|| reject(&format!("{} is not writable", table)))
}

fn scope_insert(sql: &str, tokens: &[Token<'_>], farmer_id: i64) -> StorageResult<ScopedStatement> {
    let mut cursor = Cursor::new(tokens);
    cursor.expect_word("INSERT")?;
    cursor.skip_conflict_clause()?;
    cursor.expect_word("INTO")?;
    let table = cursor.identifier()?;
    let owners = writable(table)?;

    cursor.expect_symbol('(')?;
    let mut columns = Vec::new();
    loop {
        columns.push(cursor.identifier()?);
        if cursor.eat_symbol(',') {
            continue;
        }
        cursor.expect_symbol(')')?;
        break;
    }
    cursor.expect_word("VALUES")?;

    let mut statement = ScopedStatement::unlinked(sql.to_string());
    loop {
        let row = cursor.value_row()?;
        if row.len() != columns.len() {
            return Err(reject("VALUES row does not match the column list"));
        }
        for (owner_column, owner) in owners {
            let index = columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(owner_column))
                .ok_or_else(|| reject(&format!("{} rows must set {}", table, owner_column)))?;
            let id = literal_id(row[index])
                .ok_or_else(|| reject(&format!("{} must be a literal id", owner_column)))?;
            match owner {
                Owner::Farmer if id != farmer_id => {
                    return Err(reject(&format!("rows must belong to farmer {}", farmer_id)));
                }
                Owner::Farmer => {}
                Owner::Field => statement.field_ids.push(id),
                Owner::Task => statement.task_ids.push(id),
            }
        }
        if !cursor.eat_symbol(',') {
            break;
        }
    }
    cursor.expect_end()?;
    Ok(statement)
}

fn scope_update(sql: &str, tokens: &[Token<'_>], farmer_id: i64) -> StorageResult<ScopedStatement> {
    let mut cursor = Cursor::new(tokens);
    cursor.expect_word("UPDATE")?;
    cursor.skip_conflict_clause()?;
    let table = cursor.identifier()?;
    let owners = writable(table)?;
    cursor.expect_word("SET")?;

    // Assignments run until a top-level WHERE.
    let mut depth = 0usize;
    let mut expect_column = true;
    let mut where_at = None;
    for (i, token) in tokens.iter().enumerate().skip(cursor.pos) {
        if expect_column {
            if token.kind != TokenKind::Word {
                return Err(reject("SET must assign named columns"));
            }
            let assigns_owner = token.text.eq_ignore_ascii_case("id")
                || owners.iter().any(|(c, _)| token.text.eq_ignore_ascii_case(c));
            if assigns_owner {
                return Err(reject(&format!("{} cannot be changed", token.text)));
            }
            expect_column = false;
            continue;
        }
        match token.kind {
            TokenKind::Symbol if token.is_symbol('(') => depth += 1,
            TokenKind::Symbol if token.is_symbol(')') => depth = depth.saturating_sub(1),
            TokenKind::Symbol if token.is_symbol(',') && depth == 0 => expect_column = true,
            TokenKind::Word if token.is_word("WHERE") && depth == 0 => {
                where_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    if expect_column {
        return Err(reject("incomplete SET clause"));
    }

    let scope = owners
        .iter()
        .map(|(column, owner)| owner.predicate(column, farmer_id))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = match where_at {
        Some(i) => {
            let condition = tokens
                .get(i + 1)
                .map(|t| sql[t.start..].trim())
                .ok_or_else(|| reject("empty WHERE clause"))?;
            format!(
                "{} WHERE ({}) AND {}",
                sql[..tokens[i].start].trim_end(),
                condition,
                scope
            )
        }
        None => format!("{} WHERE {}", sql, scope),
    };
    Ok(ScopedStatement::unlinked(sql))
}

fn literal_id(value: &[Token<'_>]) -> Option<i64> {
    match value {
        [token] if token.kind == TokenKind::Number => token.text.parse().ok(),
        _ => None,
    }
}

fn check_words(tokens: &[Token<'_>], kind: GeneratedKind) -> StorageResult<()> {
    let first = tokens
        .first()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text.to_ascii_uppercase())
        .unwrap_or_default();
    let allowed = match kind {
        GeneratedKind::Write => WRITE_KEYWORDS.contains(&first.as_str()),
        GeneratedKind::Read => first == "SELECT" || first == "WITH",
    };
    if !allowed {
        return Err(reject(&format!("{} is not allowed here", first)));
    }

    for token in tokens.iter().filter(|t| t.kind == TokenKind::Word) {
        let word = token.text.to_ascii_uppercase();
        if ALWAYS_FORBIDDEN.contains(&word.as_str())
            || FORBIDDEN_PREFIXES.iter().any(|p| word.starts_with(p))
        {
            return Err(reject(&format!("{} is not allowed", word)));
        }
        let kind_forbidden = match kind {
            GeneratedKind::Read => WRITE_KEYWORDS,
            GeneratedKind::Write => WRITE_FORBIDDEN,
        };
        if kind_forbidden.contains(&word.as_str()) {
            let what = match kind {
                GeneratedKind::Read => "a read query",
                GeneratedKind::Write => "a generated write",
            };
            return Err(reject(&format!("{} is not allowed in {}", word, what)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Number,
    Literal,
    Symbol,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    start: usize,
}

impl Token<'_> {
    fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    fn is_symbol(&self, symbol: char) -> bool {
        self.kind == TokenKind::Symbol && self.text.starts_with(symbol)
    }
}

/// Split a statement into tokens. Quoted identifiers, comments, parameters and
/// statement separators are rejected outright.
fn tokenize(sql: &str) -> StorageResult<Vec<Token<'_>>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        let kind = match c {
            c if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'\'' => {
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(reject("unterminated string literal")),
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                TokenKind::Literal
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                TokenKind::Word
            }
            c if c.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                TokenKind::Number
            }
            b';' => return Err(reject("multiple statements")),
            b'"' | b'`' | b'[' => return Err(reject("quoted identifiers are not allowed")),
            b'?' | b':' | b'@' | b'$' => return Err(reject("parameters are not allowed")),
            b'-' if next == Some(b'-') => return Err(reject("comments are not allowed")),
            b'/' if next == Some(b'*') => return Err(reject("comments are not allowed")),
            c if !c.is_ascii() => {
                return Err(reject("unexpected character outside a string literal"))
            }
            _ => {
                i += 1;
                TokenKind::Symbol
            }
        };
        tokens.push(Token {
            kind,
            text: &sql[start..i],
            start,
        });
    }
    Ok(tokens)
}

struct Cursor<'t, 'a> {
    tokens: &'t [Token<'a>],
    pos: usize,
}

impl<'t, 'a> Cursor<'t, 'a> {
    fn new(tokens: &'t [Token<'a>]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'t Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn expect_word(&mut self, word: &str) -> StorageResult<()> {
        match self.peek() {
            Some(token) if token.is_word(word) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(reject(&format!("expected {}", word))),
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> StorageResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(reject(&format!("expected '{}'", symbol)))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        let found = self.peek().is_some_and(|t| t.is_symbol(symbol));
        if found {
            self.pos += 1;
        }
        found
    }

    fn identifier(&mut self) -> StorageResult<&'a str> {
        match self.peek() {
            Some(token) if token.kind == TokenKind::Word => {
                self.pos += 1;
                Ok(token.text)
            }
            _ => Err(reject("expected a table or column name")),
        }
    }

    /// `OR ABORT | FAIL | IGNORE | ROLLBACK`
    fn skip_conflict_clause(&mut self) -> StorageResult<()> {
        if self.peek().is_some_and(|t| t.is_word("OR")) {
            self.pos += 1;
            self.identifier()?;
        }
        Ok(())
    }

    /// One parenthesized VALUES row, split into its top-level expressions.
    fn value_row(&mut self) -> StorageResult<Vec<&'t [Token<'a>]>> {
        self.expect_symbol('(')?;
        let mut values = Vec::new();
        let mut depth = 0usize;
        let mut value_start = self.pos;
        while let Some(token) = self.peek() {
            if token.is_symbol('(') {
                depth += 1;
            } else if token.is_symbol(')') && depth > 0 {
                depth -= 1;
            } else if depth == 0 && (token.is_symbol(',') || token.is_symbol(')')) {
                values.push(&self.tokens[value_start..self.pos]);
                self.pos += 1;
                if token.is_symbol(')') {
                    return Ok(values);
                }
                value_start = self.pos;
                continue;
            }
            self.pos += 1;
        }
        Err(reject("unterminated VALUES row"))
    }

    fn expect_end(&self) -> StorageResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(reject(&format!("unexpected {}", token.text))),
        }
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body)
}

fn reject(message: &str) -> StorageError {
    StorageError::RejectedQuery {
        message: message.to_string(),
    }
}
