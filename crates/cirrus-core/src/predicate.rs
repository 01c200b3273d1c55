//! Typed predicate evaluated in process against documents.
//!
//! Used by the embedded store to filter candidates after the index scan, and
//! by the backend emulators to interpret compiled filters.

use std::cmp::Ordering;

use serde_json::Value;

use crate::types::{Document, Operator, QueryExpression};
use crate::validation::end_range_value;

/// A boolean predicate over one document's top-level attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Between(String, Value, Value),
    Prefix(String, String),
    And(Vec<Predicate>),
}

impl Predicate {
    /// Build the conjunction of a validated expression list. `startsWith`
    /// expands into a half-open range ending at the prefix successor.
    pub fn from_expressions(expressions: &[QueryExpression]) -> Self {
        let mut terms = Vec::with_capacity(expressions.len());
        for exp in expressions {
            let operand = exp.operand.clone();
            let value = exp.value.clone();
            match exp.operator {
                Operator::Eq => terms.push(Predicate::Eq(operand, value)),
                Operator::Lt => terms.push(Predicate::Lt(operand, value)),
                Operator::Le => terms.push(Predicate::Le(operand, value)),
                Operator::Gt => terms.push(Predicate::Gt(operand, value)),
                Operator::Ge => terms.push(Predicate::Ge(operand, value)),
                Operator::StartsWith => {
                    let prefix = exp.value_text();
                    let end = end_range_value(&prefix);
                    terms.push(Predicate::Ge(operand.clone(), Value::String(prefix)));
                    terms.push(Predicate::Lt(operand, Value::String(end)));
                }
            }
        }
        Predicate::And(terms)
    }

    /// Evaluate against a document. Missing attributes and mismatched types
    /// never match.
    pub fn eval(&self, doc: &Document) -> bool {
        match self {
            Predicate::Eq(attr, v) => compare(doc, attr, v) == Some(Ordering::Equal),
            Predicate::Lt(attr, v) => compare(doc, attr, v) == Some(Ordering::Less),
            Predicate::Le(attr, v) => matches!(
                compare(doc, attr, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Predicate::Gt(attr, v) => compare(doc, attr, v) == Some(Ordering::Greater),
            Predicate::Ge(attr, v) => matches!(
                compare(doc, attr, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Predicate::Between(attr, low, high) => {
                matches!(
                    compare(doc, attr, low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare(doc, attr, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Predicate::Prefix(attr, prefix) => match doc.get(attr) {
                Some(Value::String(s)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Predicate::And(terms) => terms.iter().all(|t| t.eval(doc)),
        }
    }
}

fn compare(doc: &Document, attr: &str, literal: &Value) -> Option<Ordering> {
    compare_values(doc.get(attr)?, literal)
}

/// Compare two JSON values, returning an ordering if the types are comparable.
///
/// - Numbers: compared as f64
/// - Strings: compared lexicographically
/// - Booleans: false < true
/// - Null == Null
/// - Mismatched types: returns `None`
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
