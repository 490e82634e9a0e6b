//! Textual transforms applied to every inbound SQL string before parsing.
//!
//! Clients write postgres SQL; the engine speaks the sqlite dialect. The
//! transforms below bridge the distance for the statement shapes the
//! tested client set actually sends. They run in a fixed order and a
//! statement touched by none of them passes through byte-identical.

use std::sync::LazyLock;

use regex::Regex;

use super::kine;

static SYSTEM_IDENTIFIERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(current_catalog|current_schema|current_user|session_user|user)\b(\s*\()?")
        .unwrap()
});

static SHOW_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap());

static BYTEA_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'\\x([0-9a-fA-F]*)'").unwrap());

const KEYWORD_ENUMERATION: &str =
    "select string_agg(word, ',') from pg_catalog.pg_get_keywords()";

pub fn rewrite(sql: &str) -> String {
    let trimmed = sql.trim();

    // SET has no engine-side meaning; acknowledge and move on.
    if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("SET ") {
        return "SELECT 'SET'".to_string();
    }

    if trimmed.to_lowercase().contains(KEYWORD_ENUMERATION) {
        return "SELECT '' AS words WHERE 1 = 0".to_string();
    }

    if let Some(substituted) = kine::substitute(trimmed) {
        return substituted;
    }

    let mut out = SYSTEM_IDENTIFIERS
        .replace_all(trimmed, |caps: &regex::Captures| {
            if caps.get(2).is_some() {
                caps[0].to_string()
            } else {
                format!("{}()", &caps[1])
            }
        })
        .into_owned();

    out = out.replace("::regclass", "");

    if let Some(caps) = SHOW_STATEMENT.captures(&out) {
        out = format!("SELECT show('{}')", &caps[1]);
    }

    out = BYTEA_LITERAL
        .replace_all(&out, |caps: &regex::Captures| {
            let hex = &caps[1];
            if hex.is_empty() {
                "'0'".to_string()
            } else {
                format!("unhex('{hex}')")
            }
        })
        .into_owned();

    renumber_placeholders(&out)
}

/// Replace each `?` outside string literals with `$1`, `$2`, … in
/// textual order.
fn renumber_placeholders(sql: &str) -> String {
    if !sql.contains('?') {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut ordinal = 0usize;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    ordinal += 1;
                    out.push('$');
                    out.push_str(&ordinal.to_string());
                }
                _ => out.push(c),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_becomes_noop_select() {
        assert_eq!(rewrite("SET application_name='x'"), "SELECT 'SET'");
        assert_eq!(rewrite("set search_path = public"), "SELECT 'SET'");
    }

    #[test]
    fn test_keyword_enumeration_replaced() {
        let sql = "select string_agg(word, ',') from pg_catalog.pg_get_keywords()";
        assert_eq!(rewrite(sql), "SELECT '' AS words WHERE 1 = 0");
    }

    #[test]
    fn test_system_identifiers_become_calls() {
        assert_eq!(rewrite("SELECT current_schema"), "SELECT current_schema()");
        assert_eq!(
            rewrite("SELECT current_user, session_user"),
            "SELECT current_user(), session_user()"
        );
        // already a call: untouched
        assert_eq!(rewrite("SELECT current_schema()"), "SELECT current_schema()");
        // not a standalone word: untouched
        assert_eq!(rewrite("SELECT username FROM t"), "SELECT username FROM t");
    }

    #[test]
    fn test_regclass_cast_removed() {
        assert_eq!(
            rewrite("SELECT 'kine'::regclass"),
            "SELECT 'kine'"
        );
    }

    #[test]
    fn test_show_becomes_function() {
        assert_eq!(rewrite("SHOW server_version"), "SELECT show('server_version')");
        assert_eq!(rewrite("show transaction_isolation"), "SELECT show('transaction_isolation')");
    }

    #[test]
    fn test_bytea_hex_literals() {
        assert_eq!(
            rewrite("INSERT INTO t(v) VALUES('\\x00ff')"),
            "INSERT INTO t(v) VALUES(unhex('00ff'))"
        );
        assert_eq!(rewrite("SELECT '\\x'"), "SELECT '0'");
    }

    #[test]
    fn test_question_mark_renumbering() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        // question marks inside literals stay
        assert_eq!(
            rewrite("SELECT * FROM t WHERE a = '?' AND b = ?"),
            "SELECT * FROM t WHERE a = '?' AND b = $1"
        );
    }

    #[test]
    fn test_plain_statement_is_identity() {
        let sql = "SELECT brand, model FROM cars WHERE year = $1";
        assert_eq!(rewrite(sql), sql);
    }
}
