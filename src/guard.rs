//! Pre-execution SQL validation.
//!
//! Model-generated SQL is untrusted input. Before anything reaches the
//! analytical engine, the statement is scanned at the token level:
//!
//! 1. The top-level keyword must be `SELECT` or `WITH`; everything else is
//!    rejected outright, as is multi-statement input.
//! 2. Any write/DDL/extension keyword appearing as an identifier token
//!    (case-insensitive, outside string literals and comments) is rejected.
//!    The same word inside a quoted literal (`SELECT 'drop table' AS x`)
//!    passes.
//! 3. Every `FROM`/`JOIN` target must be the virtual table `data` or a CTE
//!    the query itself introduces. Qualified names (`other.tbl`) and table
//!    functions in `FROM` position are rejected; the latter closes the
//!    file-read primitives the engine would otherwise expose.
//!
//! This is deliberately a token scan, not a SQL parser: it layers on top of
//! the engine's single-view mount rather than replacing it.

use crate::{Error, Result};

/// Keywords rejected wherever they appear as identifier tokens.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "REPLACE", "ATTACH",
    "COPY", "PRAGMA", "LOAD", "INSTALL", "EXPORT", "IMPORT", "CALL",
];

/// Keywords that terminate a `FROM` target list.
const CLAUSE_BOUNDARY: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "WINDOW", "QUALIFY", "UNION",
    "INTERSECT", "EXCEPT", "SELECT", "ON", "USING", "JOIN", "INNER", "LEFT", "RIGHT", "FULL",
    "CROSS", "NATURAL", "LATERAL",
];

/// The single table name queries are allowed to reference.
pub const VIRTUAL_TABLE: &str = "data";

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    /// Bare identifier or keyword.
    Ident(String),
    /// Double-quoted identifier; exempt from the keyword scan.
    QuotedIdent(String),
    /// Single-quoted string literal (content irrelevant to validation).
    Literal,
    Number,
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    /// Parenthesis nesting depth at this token.
    depth: usize,
}

/// Validate one SQL statement against the read-only policy.
///
/// Returns `Ok(())` when the statement may be handed to the engine.
pub fn validate(sql: &str) -> Result<()> {
    let tokens = tokenize(sql)?;

    let first = tokens.iter().find_map(|t| match &t.kind {
        TokenKind::Ident(word) => Some(word.to_ascii_uppercase()),
        _ => None,
    });
    match first.as_deref() {
        Some("SELECT") | Some("WITH") => {}
        Some(other) => {
            return Err(Error::sql_forbidden(format!(
                "only SELECT statements are allowed, got {other}"
            )));
        }
        None => return Err(Error::sql_syntax("empty query")),
    }

    check_single_statement(&tokens)?;
    check_forbidden_keywords(&tokens)?;
    check_table_references(&tokens)?;

    Ok(())
}

/// Split a statement into tokens, skipping comments and literal contents.
fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    let mut depth = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            // Line comment
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            // Block comment (not nested)
            let mut closed = false;
            i += 2;
            while i + 1 < chars.len() {
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    closed = true;
                    break;
                }
                i += 1;
            }
            if !closed {
                return Err(Error::sql_syntax("unterminated block comment"));
            }
        } else if c == '\'' {
            // String literal; '' escapes a quote
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    closed = true;
                    break;
                }
                i += 1;
            }
            if !closed {
                return Err(Error::sql_syntax("unterminated string literal"));
            }
            tokens.push(Token { kind: TokenKind::Literal, depth });
        } else if c == '"' {
            // Quoted identifier; "" escapes a quote
            i += 1;
            let mut name = String::new();
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '"' {
                    if chars.get(i + 1) == Some(&'"') {
                        name.push('"');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    closed = true;
                    break;
                }
                name.push(chars[i]);
                i += 1;
            }
            if !closed {
                return Err(Error::sql_syntax("unterminated quoted identifier"));
            }
            tokens.push(Token { kind: TokenKind::QuotedIdent(name), depth });
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token { kind: TokenKind::Ident(word), depth });
        } else if c.is_ascii_digit() {
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_')
            {
                i += 1;
            }
            tokens.push(Token { kind: TokenKind::Number, depth });
        } else {
            // Parens carry the depth of the scope they live in, so a
            // derived table's `(` sits at the same depth as its FROM list.
            if c == '(' {
                tokens.push(Token { kind: TokenKind::Punct(c), depth });
                depth += 1;
            } else if c == ')' {
                depth = depth.saturating_sub(1);
                tokens.push(Token { kind: TokenKind::Punct(c), depth });
            } else {
                tokens.push(Token { kind: TokenKind::Punct(c), depth });
            }
            i += 1;
        }
    }

    Ok(tokens)
}

/// Reject input containing more than one statement.
///
/// Trailing semicolons are fine; any token after a semicolon is not.
fn check_single_statement(tokens: &[Token]) -> Result<()> {
    if let Some(pos) = tokens.iter().position(|t| t.kind == TokenKind::Punct(';')) {
        if tokens.len() > pos + 1 {
            return Err(Error::sql_forbidden("multiple statements are not allowed"));
        }
    }
    Ok(())
}

fn check_forbidden_keywords(tokens: &[Token]) -> Result<()> {
    for token in tokens {
        if let TokenKind::Ident(word) = &token.kind {
            let upper = word.to_ascii_uppercase();
            if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                return Err(Error::sql_forbidden(format!("{upper} is not allowed")));
            }
        }
    }
    Ok(())
}

/// Ensure every `FROM`/`JOIN` target is `data` or a CTE defined in the query.
fn check_table_references(tokens: &[Token]) -> Result<()> {
    let ctes = collect_cte_names(tokens);

    let mut i = 0;
    while i < tokens.len() {
        if let TokenKind::Ident(word) = &tokens[i].kind {
            let upper = word.to_ascii_uppercase();
            if upper == "FROM" || upper == "JOIN" {
                check_target_list(tokens, i, upper == "FROM", &ctes)?;
            }
        }
        i += 1;
    }
    Ok(())
}

/// Names introduced by `WITH name AS (...)`, lowercased.
fn collect_cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    for i in 0..tokens.len() {
        let name = match &tokens[i].kind {
            TokenKind::Ident(w) => w.as_str(),
            TokenKind::QuotedIdent(w) => w.as_str(),
            _ => continue,
        };
        let is_as = matches!(&tokens.get(i + 1).map(|t| &t.kind),
            Some(TokenKind::Ident(w)) if w.eq_ignore_ascii_case("as"));
        let opens = matches!(tokens.get(i + 2).map(|t| &t.kind), Some(TokenKind::Punct('(')));
        if is_as && opens {
            names.push(name.to_ascii_lowercase());
        }
    }
    names
}

/// Walk the target list that begins right after a `FROM`/`JOIN` token.
fn check_target_list(
    tokens: &[Token],
    keyword_idx: usize,
    continue_on_comma: bool,
    ctes: &[String],
) -> Result<()> {
    let depth = tokens[keyword_idx].depth;
    let mut expecting_target = true;
    let mut j = keyword_idx + 1;

    while j < tokens.len() {
        let token = &tokens[j];
        if token.depth < depth {
            break;
        }
        if token.depth > depth {
            // Inside a subquery or argument list; its own FROMs are
            // validated when the outer scan reaches them.
            j += 1;
            continue;
        }

        match &token.kind {
            _ if expecting_target => {
                match &token.kind {
                    // Derived table; contents checked independently.
                    TokenKind::Punct('(') => expecting_target = false,
                    TokenKind::Ident(_) | TokenKind::QuotedIdent(_) => {
                        check_target(tokens, j, ctes)?;
                        expecting_target = false;
                    }
                    // The engine reads `FROM 'path.csv'` as a file scan.
                    TokenKind::Literal => {
                        return Err(Error::sql_forbidden(
                            "file paths cannot be queried directly",
                        ));
                    }
                    _ => break,
                }
            }
            TokenKind::Punct(',') if continue_on_comma => expecting_target = true,
            TokenKind::Punct(',') => break,
            TokenKind::Ident(word)
                if CLAUSE_BOUNDARY.contains(&word.to_ascii_uppercase().as_str()) =>
            {
                break
            }
            // Alias, AS, or anything else before the next comma.
            _ => {}
        }
        j += 1;
    }

    Ok(())
}

/// Validate one named target at `idx`.
fn check_target(tokens: &[Token], idx: usize, ctes: &[String]) -> Result<()> {
    let (name, quoted) = match &tokens[idx].kind {
        TokenKind::Ident(w) => (w.clone(), false),
        TokenKind::QuotedIdent(w) => (w.clone(), true),
        _ => return Ok(()),
    };

    match tokens.get(idx + 1).map(|t| &t.kind) {
        Some(TokenKind::Punct('(')) => {
            return Err(Error::sql_forbidden(format!(
                "table function {name} is not allowed"
            )));
        }
        Some(TokenKind::Punct('.')) => {
            return Err(Error::sql_forbidden(format!(
                "qualified table name {name}.* is not allowed"
            )));
        }
        _ => {}
    }

    let lowered = name.to_ascii_lowercase();
    if lowered == VIRTUAL_TABLE || ctes.contains(&lowered) {
        return Ok(());
    }

    // A bare unquoted keyword in target position reads as a malformed query
    // rather than a table reference; report the name either way.
    let _ = quoted;
    Err(Error::sql_forbidden(format!(
        "unknown table {name}; only '{VIRTUAL_TABLE}' is available"
    )))
}
