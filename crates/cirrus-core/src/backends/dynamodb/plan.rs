//! Compiles validated, sorted expressions into DynamoDB Query/Scan inputs.
//!
//! Key attributes are addressed through the fixed placeholders `#pk`/`#sk`
//! and `:pk`/`:sk`. Operand placeholders are `#{operand}` and values
//! `:{operand}{index}`, sanitized to identifier characters and de-duplicated.

use std::collections::HashMap;

use super::client::{AttributeValue, ExpressionAttributes, Item, QueryInput, ScanInput};
use crate::types::{ATTRIB_PK, ATTRIB_SK, Operator, QueryExpression};
use crate::validation::{is_between_end, is_between_start};

/// How the sort key is constrained for a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum SortCondition {
    /// Top-level items: `_sk = "{collection}#"`.
    Equals(String),
    /// Sub-collection items: `begins_with(_sk, "{sub}#")`.
    BeginsWith(String),
}

impl SortCondition {
    fn clause(&self) -> &'static str {
        match self {
            SortCondition::Equals(_) => "#sk = :sk",
            SortCondition::BeginsWith(_) => "begins_with(#sk, :sk)",
        }
    }

    fn value(&self) -> &str {
        match self {
            SortCondition::Equals(v) | SortCondition::BeginsWith(v) => v,
        }
    }
}

#[derive(Default)]
struct PlaceholderBuilder {
    attributes: ExpressionAttributes,
    /// Operand -> placeholder stem (without the `#`).
    stems: HashMap<String, String>,
}

impl PlaceholderBuilder {
    fn with_keys(partition: Option<&str>, sort: &SortCondition) -> Self {
        let mut builder = Self::default();
        let attrs = &mut builder.attributes;
        attrs.names.insert("#sk".into(), ATTRIB_SK.into());
        attrs
            .values
            .insert(":sk".into(), AttributeValue::S(sort.value().to_string()));
        if let Some(pk) = partition {
            attrs.names.insert("#pk".into(), ATTRIB_PK.into());
            attrs
                .values
                .insert(":pk".into(), AttributeValue::S(pk.to_string()));
        }
        // Reserve the key stems even for scans so operands never shadow them.
        builder.stems.insert(ATTRIB_PK.into(), "pk".into());
        builder.stems.insert(ATTRIB_SK.into(), "sk".into());
        builder
    }

    fn name(&mut self, operand: &str) -> String {
        if let Some(stem) = self.stems.get(operand) {
            let placeholder = format!("#{stem}");
            self.attributes
                .names
                .entry(placeholder.clone())
                .or_insert_with(|| operand.to_string());
            return placeholder;
        }
        let base = sanitize(operand);
        let mut stem = base.clone();
        let mut n = 1;
        while self.stems.values().any(|s| *s == stem) {
            stem = format!("{base}_{n}");
            n += 1;
        }
        self.stems.insert(operand.to_string(), stem.clone());
        let placeholder = format!("#{stem}");
        self.attributes
            .names
            .insert(placeholder.clone(), operand.to_string());
        placeholder
    }

    fn value(&mut self, operand: &str, index: usize, value: &serde_json::Value) -> String {
        let stem = self
            .stems
            .get(operand)
            .cloned()
            .unwrap_or_else(|| sanitize(operand));
        let base = format!(":{stem}{index}");
        let mut placeholder = base.clone();
        let mut n = 1;
        while self.attributes.values.contains_key(&placeholder) {
            placeholder = format!("{base}_{n}");
            n += 1;
        }
        self.attributes
            .values
            .insert(placeholder.clone(), AttributeValue::from_json(value));
        placeholder
    }
}

fn sanitize(operand: &str) -> String {
    let s: String = operand
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if s.is_empty() { "_".to_string() } else { s }
}

/// Filter clauses for sorted expressions. A `>=`/`<=` pair on one operand
/// collapses into a single `BETWEEN`.
fn filter_clauses(builder: &mut PlaceholderBuilder, expressions: &[QueryExpression]) -> Vec<String> {
    let mut clauses = Vec::with_capacity(expressions.len());
    for (i, exp) in expressions.iter().enumerate() {
        if is_between_end(expressions, i) {
            continue;
        }
        let name = builder.name(&exp.operand);
        let value = builder.value(&exp.operand, i, &exp.value);
        if is_between_start(expressions, i) {
            let upper = builder.value(&exp.operand, i + 1, &expressions[i + 1].value);
            clauses.push(format!("{name} BETWEEN {value} AND {upper}"));
            continue;
        }
        clauses.push(match exp.operator {
            Operator::Eq => format!("{name} = {value}"),
            Operator::Lt => format!("{name} < {value}"),
            Operator::Le => format!("{name} <= {value}"),
            Operator::Gt => format!("{name} > {value}"),
            Operator::Ge => format!("{name} >= {value}"),
            Operator::StartsWith => format!("begins_with({name}, {value})"),
        });
    }
    clauses
}

fn join(clauses: Vec<String>) -> Option<String> {
    (!clauses.is_empty()).then(|| clauses.join(" AND "))
}

/// Query a known partition. `expressions` must already be sorted.
pub fn compile_query(
    table: &str,
    partition: &str,
    sort: &SortCondition,
    expressions: &[QueryExpression],
    limit: Option<i32>,
    exclusive_start_key: Option<Item>,
) -> QueryInput {
    let mut builder = PlaceholderBuilder::with_keys(Some(partition), sort);
    let filter = join(filter_clauses(&mut builder, expressions));
    QueryInput {
        table: table.to_string(),
        key_condition_expression: format!("#pk = :pk AND {}", sort.clause()),
        filter_expression: filter,
        attributes: builder.attributes,
        limit,
        exclusive_start_key,
    }
}

/// Scan the whole table; the sort-key constraint joins the filter.
pub fn compile_scan(
    table: &str,
    sort: &SortCondition,
    expressions: &[QueryExpression],
    limit: Option<i32>,
    exclusive_start_key: Option<Item>,
) -> ScanInput {
    let mut builder = PlaceholderBuilder::with_keys(None, sort);
    let mut clauses = vec![sort.clause().to_string()];
    clauses.extend(filter_clauses(&mut builder, expressions));
    ScanInput {
        table: table.to_string(),
        filter_expression: join(clauses),
        attributes: builder.attributes,
        limit,
        exclusive_start_key,
    }
}
