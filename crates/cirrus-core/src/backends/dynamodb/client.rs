use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Number, Value};

use crate::error::Result;
use crate::types::Document;

/// A DynamoDB attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    S(String),
    /// Numbers travel as their decimal text, as on the DynamoDB wire.
    N(String),
    Bool(bool),
    Null,
    L(Vec<AttributeValue>),
    M(HashMap<String, AttributeValue>),
}

pub type Item = HashMap<String, AttributeValue>;

impl AttributeValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => AttributeValue::N(n.to_string()),
            Value::String(s) => AttributeValue::S(s.clone()),
            Value::Array(items) => {
                AttributeValue::L(items.iter().map(AttributeValue::from_json).collect())
            }
            Value::Object(map) => AttributeValue::M(
                map.iter()
                    .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::S(s) => Value::String(s.clone()),
            AttributeValue::N(n) => number_to_json(n),
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Null => Value::Null,
            AttributeValue::L(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            AttributeValue::M(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }
}

fn number_to_json(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(u) = text.parse::<u64>() {
        return Value::Number(u.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

pub fn item_from_document(doc: &Document) -> Item {
    doc.iter()
        .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
        .collect()
}

pub fn document_from_item(item: &Item) -> Document {
    item.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetItemInput {
    pub table: String,
    pub key: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutItemInput {
    pub table: String,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteItemInput {
    pub table: String,
    pub key: Item,
}

/// Placeholder maps shared by key condition and filter expressions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionAttributes {
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryInput {
    pub table: String,
    pub key_condition_expression: String,
    pub filter_expression: Option<String>,
    pub attributes: ExpressionAttributes,
    pub limit: Option<i32>,
    pub exclusive_start_key: Option<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanInput {
    pub table: String,
    pub filter_expression: Option<String>,
    pub attributes: ExpressionAttributes,
    pub limit: Option<i32>,
    pub exclusive_start_key: Option<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

/// The slice of the DynamoDB API the document adapter needs.
#[async_trait]
pub trait DynamoApi: Send + Sync {
    async fn get_item(&self, input: GetItemInput) -> Result<Option<Item>>;
    async fn put_item(&self, input: PutItemInput) -> Result<()>;
    async fn delete_item(&self, input: DeleteItemInput) -> Result<()>;
    async fn query(&self, input: QueryInput) -> Result<Page>;
    async fn scan(&self, input: ScanInput) -> Result<Page>;
}
