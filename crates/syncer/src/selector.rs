//! Namespace label selectors
//!
//! Grammar: comma separated requirements, each one of `key=value`,
//! `key==value`, `key!=value`, `key in (v1, v2)`, `key notin (v1, v2)`,
//! `key` (exists) or `!key` (does not exist). All requirements must hold.
//! The empty selector matches every namespace.

use crate::error::SelectorError;
use kube::core::{Expression, Selector};
use std::collections::BTreeSet;

/// Parses a selector string. Empty input selects every namespace.
pub fn parse_selector(s: &str) -> Result<Selector, SelectorError> {
    if s.trim().is_empty() {
        return Ok(Selector::default());
    }
    split_top_level(s)?
        .into_iter()
        .map(parse_expression)
        .collect::<Result<Selector, _>>()
}

/// Splits on commas that are not inside parentheses.
fn split_top_level(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => {
                if depth > 0 {
                    return Err(SelectorError::UnbalancedParentheses);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or(SelectorError::UnbalancedParentheses)?;
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::UnbalancedParentheses);
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn parse_expression(term: &str) -> Result<Expression, SelectorError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(SelectorError::EmptyRequirement);
    }

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(key_of(key)?));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Expression::NotEqual(key_of(key)?, value_of(value)?));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Expression::Equal(key_of(key)?, value_of(value)?));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Expression::Equal(key_of(key)?, value_of(value)?));
    }

    let Some((key, rest)) = term.split_once(|c: char| c.is_whitespace() || c == '(') else {
        return Ok(Expression::Exists(key_of(term)?));
    };
    // put back a '(' consumed by the split
    let rest = if term[key.len()..].starts_with('(') {
        &term[key.len()..]
    } else {
        rest.trim_start()
    };
    let key = key_of(key)?;

    if let Some(set) = rest.strip_prefix("notin") {
        Ok(Expression::NotIn(key.clone(), value_set(&key, set)?))
    } else if let Some(set) = rest.strip_prefix("in") {
        Ok(Expression::In(key.clone(), value_set(&key, set)?))
    } else {
        Err(SelectorError::UnknownOperator(term.to_string()))
    }
}

fn value_set(key: &str, raw: &str) -> Result<BTreeSet<String>, SelectorError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| SelectorError::UnknownOperator(format!("{key} {}", raw.trim())))?;
    if inner.trim().is_empty() {
        return Err(SelectorError::EmptySet(key.to_string()));
    }
    inner.split(',').map(value_of).collect()
}

fn key_of(raw: &str) -> Result<String, SelectorError> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key.len() <= 316
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        && key.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && key.matches('/').count() <= 1;
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

fn value_of(raw: &str) -> Result<String, SelectorError> {
    let value = raw.trim();
    let valid = value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value.to_string())
    } else {
        Err(SelectorError::InvalidValue(value.to_string()))
    }
}
