//! Parsing of text-serialized embedding vectors.
//!
//! Older ingestion versions persisted embeddings as bracketed text vectors
//! (`[0.1,0.2,...]`) inside the chunk metadata instead of the vector column.
//! Some of those rows carry broken scientific notation where the `e` was
//! lost in formatting (`3.088634-05` instead of `3.088634e-05`); those are
//! repaired before parsing. A vector that still fails to parse is a
//! [`RagError::VectorParse`], never silently substituted.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{RagError, Result};

static BROKEN_EXPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9])([+-])([0-9]+)$").expect("exponent repair regex is valid"));

/// Repair broken scientific notation in a single numeric token: a digit
/// followed by `+` or `-` followed by digits at end of token gets an `e`
/// inserted before the sign.
fn repair_exponent(token: &str) -> std::borrow::Cow<'_, str> {
    BROKEN_EXPONENT_RE.replace(token, "${1}e${2}${3}")
}

/// Parse a bracketed text vector into f32 values.
pub fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if inner.is_empty() {
        return Err(RagError::VectorParse("empty vector text".to_string()));
    }

    let mut values = Vec::new();
    for part in inner.split(',') {
        let token = part.trim();
        let repaired = repair_exponent(token);
        let value: f32 = repaired.parse().map_err(|_| {
            RagError::VectorParse(format!("could not parse component '{}'", token))
        })?;
        if !value.is_finite() {
            return Err(RagError::VectorParse(format!(
                "non-finite component '{}'",
                token
            )));
        }
        values.push(value);
    }
    Ok(values)
}

/// Parse and verify the dimension in one step.
pub fn parse_vector_checked(raw: &str, expected_dim: usize) -> Result<Vec<f32>> {
    let values = parse_vector(raw)?;
    if values.len() != expected_dim {
        return Err(RagError::VectorParse(format!(
            "expected {} dimensions, got {}",
            expected_dim,
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_vector() {
        let v = parse_vector("[0.1, 0.2, 0.3]").unwrap();
        assert_eq!(v.len(), 3);
        assert!((v[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_parse_repairs_broken_scientific_notation() {
        let v = parse_vector("[3.088634-05, 1.5+03]").unwrap();
        assert!((v[0] - 3.088634e-05).abs() < 1e-10);
        assert!((v[1] - 1.5e+03).abs() < 1e-3);
    }

    #[test]
    fn test_parse_keeps_valid_scientific_notation() {
        let v = parse_vector("[1.2e-03, -4.5E+02]").unwrap();
        assert!((v[0] - 1.2e-03).abs() < 1e-9);
        assert!((v[1] + 450.0).abs() < 1e-3);
    }

    #[test]
    fn test_parse_negative_values_not_mangled() {
        // A leading minus sign is a sign, not an exponent marker.
        let v = parse_vector("[-0.5, -1.25]").unwrap();
        assert!((v[0] + 0.5).abs() < 1e-6);
        assert!((v[1] + 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_vector("[abc, 0.1]").is_err());
        assert!(parse_vector("").is_err());
        assert!(parse_vector("[]").is_err());
    }

    #[test]
    fn test_parse_checked_dimension_mismatch() {
        let err = parse_vector_checked("[0.1, 0.2]", 3).unwrap_err();
        assert!(err.to_string().contains("expected 3 dimensions"));
    }
}
