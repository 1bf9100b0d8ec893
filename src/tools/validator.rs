//! Lexical statement gate for inbound SQL.
//!
//! Every statement the `mssql_query` and `mssql_execute_write` tools accept
//! passes through this validator before it touches a connection. The gate is
//! a deterministic token classifier built on [sqlparser](https://docs.rs/sqlparser/)'s
//! tokenizer with the MS SQL dialect: no regular expressions, no AST, no
//! server round-trip. Rules run in a fixed order and the first match wins,
//! so a rejection reason always names exactly one rule.
//!
//! The gate is conservative by design: it rejects some legitimate statements
//! (for example a column literally named `exec`) in exchange for an
//! auditable, predictable policy.

use crate::error::{DbError, DbResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

/// Leading keywords accepted without write mode.
pub const DEFAULT_READ_KEYWORDS: &[&str] = &["SELECT"];

/// Leading keywords additionally accepted in write mode.
pub const DEFAULT_WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

/// Keywords rejected anywhere in a statement, whatever the mode. DDL,
/// permission changes, and every path into dynamic SQL or shell procedures.
/// INSERT/UPDATE/DELETE are deliberately absent: the leading-keyword rule
/// and write mode govern those.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "DROP",
    "TRUNCATE",
    "ALTER",
    "CREATE",
    "GRANT",
    "REVOKE",
    "EXEC",
    "EXECUTE",
    "SP_EXECUTESQL",
    "XP_CMDSHELL",
    "SP_CONFIGURE",
];

/// Outcome of validating one statement. This is also the body returned by
/// `mssql_execute_write` dry runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidationVerdict {
    pub approved: bool,
    /// The rule that rejected the statement; absent when approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The statement as it would be executed: trimmed, single trailing
    /// terminator removed.
    pub statement: String,
}

impl ValidationVerdict {
    fn approved(statement: String) -> Self {
        Self {
            approved: true,
            reason: None,
            statement,
        }
    }

    fn rejected(statement: &str, reason: String) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            statement: statement.trim().to_string(),
        }
    }
}

/// The statement safety gate. Keyword sets are fixed at construction;
/// changing policy means building a new validator.
#[derive(Debug, Clone)]
pub struct StatementValidator {
    read_keywords: Vec<String>,
    write_keywords: Vec<String>,
    denylist: Vec<String>,
}

impl Default for StatementValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementValidator {
    /// Validator with the default policy.
    pub fn new() -> Self {
        Self::with_policy(
            DEFAULT_READ_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_WRITE_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Validator with custom keyword sets; matching is case-insensitive.
    pub fn with_policy(
        read_keywords: Vec<String>,
        write_keywords: Vec<String>,
        denylist: Vec<String>,
    ) -> Self {
        let upper = |v: Vec<String>| -> Vec<String> {
            v.into_iter().map(|s| s.to_uppercase()).collect()
        };
        Self {
            read_keywords: upper(read_keywords),
            write_keywords: upper(write_keywords),
            denylist: upper(denylist),
        }
    }

    /// Run the gate and return the normalized statement, or a typed error.
    ///
    /// Rules, in order:
    /// 1. empty statements are rejected;
    /// 2. statements that do not tokenize are rejected;
    /// 3. after tolerating one trailing `;`, any further terminator token
    ///    means a multi-statement batch and is rejected (semicolons inside
    ///    string literals and comments are not terminators);
    /// 4. the leading keyword must be in the read set, or in the write set
    ///    when `write_enabled` (a write keyword without write mode is a
    ///    `WriteDisabled` error, distinct from plain rejection);
    /// 5. any denylisted word token anywhere rejects the statement.
    ///    Matching is whole-token: `dropped_items` never matches `DROP`.
    pub fn check(&self, statement: &str, write_enabled: bool) -> DbResult<String> {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            return Err(DbError::rejected("empty statement"));
        }

        let dialect = MsSqlDialect {};
        let tokens = Tokenizer::new(&dialect, trimmed)
            .tokenize()
            .map_err(|e| DbError::rejected(format!("statement could not be tokenized: {e}")))?;

        let meaningful: Vec<&Token> = tokens
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();

        // One trailing terminator is tolerated and stripped.
        let body = match meaningful.split_last() {
            Some((Token::SemiColon, rest)) => rest,
            _ => &meaningful[..],
        };
        if body.is_empty() {
            return Err(DbError::rejected("empty statement"));
        }
        if body.iter().any(|t| matches!(t, Token::SemiColon)) {
            return Err(DbError::rejected(
                "multi-statement batches are not allowed; submit one statement per call",
            ));
        }

        let leading = match body[0] {
            Token::Word(w) => w.value.to_uppercase(),
            other => {
                return Err(DbError::rejected(format!(
                    "statement must begin with a keyword, found '{other}'"
                )));
            }
        };
        if !self.read_keywords.contains(&leading) {
            if self.write_keywords.contains(&leading) {
                if !write_enabled {
                    return Err(DbError::write_disabled(leading));
                }
            } else {
                return Err(DbError::rejected(format!(
                    "leading keyword must be one of {}: found '{leading}'",
                    self.allowed_keywords(write_enabled).join(", ")
                )));
            }
        }

        for token in body {
            if let Token::Word(w) = token {
                let upper = w.value.to_uppercase();
                if self.denylist.contains(&upper) {
                    return Err(DbError::rejected(format!("denylisted keyword: {upper}")));
                }
            }
        }

        Ok(normalize(trimmed))
    }

    /// Run the gate and fold the outcome into a serializable verdict.
    pub fn validate(&self, statement: &str, write_enabled: bool) -> ValidationVerdict {
        match self.check(statement, write_enabled) {
            Ok(normalized) => ValidationVerdict::approved(normalized),
            Err(err) => ValidationVerdict::rejected(statement, err.to_string()),
        }
    }

    /// Gate for `mssql_execute_write`: the statement must pass the full
    /// check with writes enabled AND lead with a write keyword. Reads go
    /// through `mssql_query` instead.
    pub fn check_write(&self, statement: &str) -> DbResult<String> {
        let normalized = self.check(statement, true)?;
        if !self.is_write_statement(&normalized) {
            return Err(DbError::rejected(format!(
                "statement must begin with one of {}; use mssql_query for reads",
                self.write_keywords.join(", ")
            )));
        }
        Ok(normalized)
    }

    /// [`check_write`](Self::check_write) folded into a verdict; the body
    /// of a dry run.
    pub fn validate_write(&self, statement: &str) -> ValidationVerdict {
        match self.check_write(statement) {
            Ok(normalized) => ValidationVerdict::approved(normalized),
            Err(err) => ValidationVerdict::rejected(statement, err.to_string()),
        }
    }

    /// Whether the statement's leading keyword is in the write set.
    /// Used to route approved text through the transactional path.
    pub fn is_write_statement(&self, statement: &str) -> bool {
        let dialect = MsSqlDialect {};
        let Ok(tokens) = Tokenizer::new(&dialect, statement.trim()).tokenize() else {
            return false;
        };
        tokens
            .iter()
            .find(|t| !matches!(t, Token::Whitespace(_)))
            .is_some_and(|t| match t {
                Token::Word(w) => self.write_keywords.contains(&w.value.to_uppercase()),
                _ => false,
            })
    }

    fn allowed_keywords(&self, write_enabled: bool) -> Vec<String> {
        let mut allowed = self.read_keywords.clone();
        if write_enabled {
            allowed.extend(self.write_keywords.iter().cloned());
        }
        allowed
    }
}

/// Trim and drop a single trailing terminator.
fn normalize(statement: &str) -> String {
    match statement.strip_suffix(';') {
        Some(stripped) => stripped.trim_end().to_string(),
        None => statement.to_string(),
    }
}
