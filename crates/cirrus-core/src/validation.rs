//! Key, collection and query expression validation.
//!
//! Everything here runs before any backend I/O. Expression lists are checked
//! against the weakest backend's capabilities so that a query accepted here is
//! answerable by every adapter.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{Key, Operator, QueryExpression};

/// Empty or whitespace only. Applies to keys, collections, operands and
/// string values alike.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

pub fn validate_keys(key: &Key, sub_key: Option<&Key>) -> Result<(), ValidationError> {
    if is_blank(&key.collection) {
        return Err(ValidationError::BlankCollection);
    }
    if is_blank(&key.id) {
        return Err(ValidationError::BlankId);
    }
    if let Some(sub) = sub_key {
        if is_blank(&sub.collection) {
            return Err(ValidationError::BlankSubCollection);
        }
        if is_blank(&sub.id) {
            return Err(ValidationError::BlankSubId);
        }
    }
    Ok(())
}

/// Sub-collection names are not checked against any declared schema.
pub fn validate_collection(collection: &str, _subcollection: &str) -> Result<(), ValidationError> {
    if is_blank(collection) {
        return Err(ValidationError::BlankQueryCollection);
    }
    Ok(())
}

pub fn validate_expressions(expressions: &[QueryExpression]) -> Result<(), ValidationError> {
    for exp in expressions {
        validate_expression(exp)?;
    }

    // Distinct non-equality operators per operand, in first-seen order.
    let mut inequalities: BTreeMap<&str, Vec<Operator>> = BTreeMap::new();
    for exp in expressions.iter().filter(|e| e.operator.is_inequality()) {
        let ops = inequalities.entry(exp.operand.as_str()).or_default();
        if !ops.contains(&exp.operator) {
            ops.push(exp.operator);
        }
    }
    let pairs: Vec<String> = inequalities
        .iter()
        .flat_map(|(operand, ops)| ops.iter().map(move |op| format!("{operand} {op}")))
        .collect();

    if inequalities.len() > 1 {
        return Err(ValidationError::MultipleInequalities(pairs.join(", ")));
    }

    if let Some(ops) = inequalities.values().next() {
        let between = ops.len() == 2 && ops.contains(&Operator::Ge) && ops.contains(&Operator::Le);
        if ops.len() > 1 && !between {
            return Err(ValidationError::UnsupportedRange(pairs.join(", ")));
        }
    }

    Ok(())
}

fn validate_expression(exp: &QueryExpression) -> Result<(), ValidationError> {
    if is_blank(&exp.operand) {
        return Err(ValidationError::BlankOperand(exp.operand.clone()));
    }
    let described = || (exp.operand.clone(), exp.operator.to_string());
    match &exp.value {
        Value::Null => {
            let (operand, operator) = described();
            Err(ValidationError::BlankValue { operand, operator })
        }
        Value::String(s) if is_blank(s) => {
            let (operand, operator) = described();
            Err(ValidationError::BlankValue { operand, operator })
        }
        Value::Array(_) | Value::Object(_) => {
            let (operand, operator) = described();
            Err(ValidationError::UnsupportedValue { operand, operator })
        }
        Value::String(_) => Ok(()),
        Value::Number(_) | Value::Bool(_) if exp.operator == Operator::StartsWith => {
            Err(ValidationError::PrefixNotString(exp.operand.clone()))
        }
        Value::Number(_) | Value::Bool(_) => Ok(()),
    }
}

/// Order expressions by operand ascending, operator symbol descending, then
/// value ascending. The descending operator order places `>=` directly before
/// `<=` on the same operand, which the range helpers below rely on.
pub fn sort_expressions(expressions: &mut [QueryExpression]) {
    expressions.sort_by(|a, b| {
        a.operand
            .cmp(&b.operand)
            .then_with(|| b.operator.symbol().cmp(a.operator.symbol()))
            .then_with(|| a.value_text().cmp(&b.value_text()))
    });
}

/// True when `exps[index]` opens a `>=`/`<=` pair on one operand.
pub fn is_between_start(expressions: &[QueryExpression], index: usize) -> bool {
    match (expressions.get(index), expressions.get(index + 1)) {
        (Some(start), Some(end)) => {
            start.operator == Operator::Ge
                && end.operator == Operator::Le
                && start.operand == end.operand
        }
        _ => false,
    }
}

/// True when `exps[index]` closes a `>=`/`<=` pair on one operand.
pub fn is_between_end(expressions: &[QueryExpression], index: usize) -> bool {
    index > 0 && is_between_start(expressions, index - 1)
}

/// Exclusive upper bound for a prefix scan: `value` with its last character
/// replaced by the next code point.
pub fn end_range_value(value: &str) -> String {
    let Some(last) = value.chars().last() else {
        return String::new();
    };
    let next = match last as u32 {
        0xD7FF => Some('\u{E000}'),
        code => char::from_u32(code + 1),
    };
    match next {
        Some(next) => {
            let mut end = value[..value.len() - last.len_utf8()].to_string();
            end.push(next);
            end
        }
        None => value.to_string(),
    }
}
