use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Opaque, backend-specific continuation token returned by a query.
pub type PagingToken = BTreeMap<String, String>;

/// Attribute holding the partition key in single-table layouts.
pub const ATTRIB_PK: &str = "_pk";
/// Attribute holding the sort key in single-table layouts.
pub const ATTRIB_SK: &str = "_sk";

/// Address of a document, or of a whole collection when `id` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub collection: String,
    #[serde(default)]
    pub id: String,
}

impl Key {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// A collection-wide key with no document id.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self::new(collection, "")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Sort-key prefix shared by every item of `collection`.
pub(crate) fn collection_prefix(collection: &str) -> String {
    format!("{collection}#")
}

/// Sort key of a top-level item (`"{Collection}#"`) or a sub-collection
/// item (`"{SubCollection}#{SubId}"`).
pub(crate) fn sort_key(key: &Key, sub_key: Option<&Key>) -> String {
    match sub_key {
        Some(sub) => format!("{}#{}", sub.collection, sub.id),
        None => collection_prefix(&key.collection),
    }
}

/// Render a key pair for log and error messages.
pub(crate) fn describe(key: &Key, sub_key: Option<&Key>) -> String {
    match sub_key {
        Some(sub) => format!("{key}/{sub}"),
        None => key.to_string(),
    }
}

/// Comparison operator of a [`QueryExpression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "startsWith")]
    StartsWith,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::StartsWith => "startsWith",
        }
    }

    pub fn is_inequality(&self) -> bool {
        !matches!(self, Operator::Eq)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(Operator::Eq),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "startsWith" => Ok(Operator::StartsWith),
            other => Err(ValidationError::InvalidOperator(other.to_string())),
        }
    }
}

/// A single `operand operator value` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExpression {
    pub operand: String,
    pub operator: Operator,
    pub value: Value,
}

impl QueryExpression {
    pub fn new(operand: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            operand: operand.into(),
            operator,
            value: value.into(),
        }
    }

    /// The value as used for ordering and token rendering: strings raw,
    /// everything else as JSON text.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for QueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.operand, self.operator, self.value)
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging_token: Option<PagingToken>,
}

/// Treat an empty token the same as no token.
pub(crate) fn non_empty(token: Option<&PagingToken>) -> Option<&PagingToken> {
    token.filter(|t| !t.is_empty())
}
