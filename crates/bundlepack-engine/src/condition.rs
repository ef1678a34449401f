use anyhow::{anyhow, Result};
use bundlepack_core::Variables;

/// Evaluates install and detect conditions against the variable table.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, variables: &Variables) -> Result<bool>;
}

/// Small condition language over variables:
///
/// - `Name` is true when the variable exists and is truthy
/// - `NOT Name`
/// - `Name = value` and `Name <> value` compare rendered values; quotes around
///   `value` are optional
/// - terms joined with `AND` / `OR`, `AND` binding tighter
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableConditions;

impl ConditionEvaluator for VariableConditions {
    fn evaluate(&self, condition: &str, variables: &Variables) -> Result<bool> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        let mut any = false;
        for disjunct in split_keyword(trimmed, "OR") {
            let mut all = true;
            for term in split_keyword(&disjunct, "AND") {
                if !evaluate_term(&term, variables)? {
                    all = false;
                }
            }
            if all {
                any = true;
            }
        }
        Ok(any)
    }
}

fn evaluate_term(term: &str, variables: &Variables) -> Result<bool> {
    let term = term.trim();
    if term.is_empty() {
        return Err(anyhow!("empty condition term"));
    }

    if let Some(rest) = strip_keyword_prefix(term, "NOT") {
        return evaluate_term(rest, variables).map(|value| !value);
    }

    if let Some((name, expected)) = term.split_once("<>") {
        return Ok(!compare(name, expected, variables)?);
    }
    if let Some((name, expected)) = term.split_once('=') {
        return compare(name, expected, variables);
    }

    let name = checked_name(term)?;
    Ok(variables
        .get(name)
        .is_some_and(|value| value.is_truthy()))
}

fn compare(name: &str, expected: &str, variables: &Variables) -> Result<bool> {
    let name = checked_name(name.trim())?;
    let expected = unquote(expected.trim());
    Ok(variables
        .get(name)
        .is_some_and(|value| value.to_string() == expected))
}

fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
    {
        return Err(anyhow!("invalid variable name in condition: '{name}'"));
    }
    Ok(name)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn strip_keyword_prefix<'a>(term: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = term.strip_prefix(keyword)?;
    rest.starts_with(char::is_whitespace).then_some(rest)
}

/// Splits on a whitespace-delimited keyword outside of double quotes.
fn split_keyword(input: &str, keyword: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let words: Vec<&str> = input.split(' ').collect();

    for word in words {
        if !in_quotes && word == keyword {
            parts.push(std::mem::take(&mut current));
            continue;
        }
        if word.matches('"').count() % 2 == 1 {
            in_quotes = !in_quotes;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    parts.push(current);
    parts
}
