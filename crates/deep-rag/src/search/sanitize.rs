//! Query sanitization for the lexical (full-text) search path.
//!
//! The lexical path turns the query into a Boolean AND of tokens, so
//! operator characters coming from user input or LLM-generated refinement
//! queries must be stripped before parsing. The unsanitized query is still
//! used for the embedding path.

use regex::Regex;
use std::sync::LazyLock;

static LEADING_BULLETS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\*\-•\s]+").expect("leading bullet regex is valid"));

static OPERATOR_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[!|:*]").expect("operator char regex is valid"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Sanitize a query string for the full-text parser.
///
/// Rules: drop leading bullet/dash characters, replace literal `&` with the
/// word "and", remove the operator characters `! | : *`, strip quotes, and
/// normalize whitespace.
pub fn sanitize_query(query: &str) -> String {
    let query = LEADING_BULLETS_RE.replace(query.trim(), "");
    let query = query.replace('&', " and ");
    let query = OPERATOR_CHARS_RE.replace_all(&query, " ");
    let query = query.replace('"', "").replace('\'', "");
    WHITESPACE_RE.replace_all(&query, " ").trim().to_string()
}

/// Sanitize an LLM-produced refinement line: the same rules as
/// [`sanitize_query`] after trimming list markers the model tends to emit.
pub fn sanitize_refinement(line: &str) -> String {
    let trimmed = line.trim().trim_start_matches(['-', '•', '*', ' ']).trim();
    sanitize_query(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ampersand_becomes_and() {
        assert_eq!(
            sanitize_query("Hygiene & DX protocols"),
            "Hygiene and DX protocols"
        );
    }

    #[test]
    fn test_operator_chars_removed() {
        assert_eq!(sanitize_query("alpha|beta:gamma*delta!"), "alpha beta gamma delta");
    }

    #[test]
    fn test_quotes_stripped() {
        assert_eq!(sanitize_query("\"quoted phrase\" and 'more'"), "quoted phrase and more");
    }

    #[test]
    fn test_leading_bullets_dropped() {
        assert_eq!(sanitize_query("- bullet item"), "bullet item");
        assert_eq!(sanitize_query("• another item"), "another item");
        assert_eq!(sanitize_query("* starred"), "starred");
    }

    #[test]
    fn test_whitespace_normalized() {
        assert_eq!(sanitize_query("  too   many\tspaces "), "too many spaces");
    }

    #[test]
    fn test_plain_query_unchanged() {
        assert_eq!(sanitize_query("quarterly revenue 2024"), "quarterly revenue 2024");
    }

    #[test]
    fn test_refinement_sanitization_collapses_specials() {
        assert_eq!(
            sanitize_refinement("- What are the Hygiene & DX protocols?!"),
            "What are the Hygiene and DX protocols?"
        );
    }

    #[test]
    fn test_empty_and_only_specials() {
        assert_eq!(sanitize_query(""), "");
        assert_eq!(sanitize_query("!|:*"), "");
    }
}
