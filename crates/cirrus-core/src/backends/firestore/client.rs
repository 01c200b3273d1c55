use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::predicate::compare_values;
use crate::types::Document;

/// Slash-separated document path, e.g. `customers/1000/orders/501`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentPath(Vec<String>);

impl DocumentPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a `collection/id[/collection/id...]` path.
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<String> = path.split('/').map(str::to_string).collect();
        let well_formed = segments.len() >= 2
            && segments.len() % 2 == 0
            && segments.iter().all(|s| !s.is_empty());
        well_formed.then_some(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn id(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    pub fn collection_id(&self) -> &str {
        self.0
            .len()
            .checked_sub(2)
            .and_then(|i| self.0.get(i))
            .map_or("", String::as_str)
    }

    /// Segments of the document owning this document's collection.
    pub fn parent_segments(&self) -> &[String] {
        &self.0[..self.0.len().saturating_sub(2)]
    }

    pub fn child(&self, collection: &str, id: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(collection.to_string());
        segments.push(id.to_string());
        Self(segments)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// A stored document and its path.
#[derive(Debug, Clone, PartialEq)]
pub struct FsDocument {
    pub path: DocumentPath,
    pub data: Document,
}

/// A filter operand or cursor position.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Value(Value),
    Reference(DocumentPath),
}

impl QueryValue {
    /// Firestore's cross-type ordering: null, bool, number, string, then
    /// references; values of one type compare naturally.
    pub fn cmp_order(&self, other: &QueryValue) -> Ordering {
        fn rank(v: &QueryValue) -> u8 {
            match v {
                QueryValue::Value(Value::Null) => 0,
                QueryValue::Value(Value::Bool(_)) => 1,
                QueryValue::Value(Value::Number(_)) => 2,
                QueryValue::Value(Value::String(_)) => 3,
                QueryValue::Reference(_) => 4,
                QueryValue::Value(Value::Array(_)) => 5,
                QueryValue::Value(Value::Object(_)) => 6,
            }
        }
        match (self, other) {
            (QueryValue::Reference(a), QueryValue::Reference(b)) => a.cmp(b),
            (QueryValue::Value(a), QueryValue::Value(b)) => compare_values(a, b)
                .unwrap_or_else(|| rank(self).cmp(&rank(other))),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    Field(String),
    /// `__name__`
    DocumentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl FieldOp {
    pub fn is_inequality(&self) -> bool {
        !matches!(self, FieldOp::Equal)
    }

    pub fn accepts(&self, ord: Ordering) -> bool {
        match self {
            FieldOp::Equal => ord == Ordering::Equal,
            FieldOp::LessThan => ord == Ordering::Less,
            FieldOp::LessThanOrEqual => ord != Ordering::Greater,
            FieldOp::GreaterThan => ord == Ordering::Greater,
            FieldOp::GreaterThanOrEqual => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: FieldOp,
    pub value: QueryValue,
}

/// A collection or collection-group query. Ordering is always ascending.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredQuery {
    /// Owning document, or `None` for the database root.
    pub parent: Option<DocumentPath>,
    pub collection_id: String,
    /// Match `collection_id` at any depth below `parent`.
    pub all_descendants: bool,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<FieldPath>,
    pub start_after: Option<Vec<QueryValue>>,
    pub limit: Option<usize>,
}

impl StructuredQuery {
    pub fn collection(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: FieldPath, op: FieldOp, value: QueryValue) -> Self {
        self.filters.push(FieldFilter { field, op, value });
        self
    }
}

/// The slice of the Firestore API the document adapter needs.
#[async_trait]
pub trait FirestoreApi: Send + Sync {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<FsDocument>>;
    async fn set_document(&self, path: &DocumentPath, data: &Document) -> Result<()>;
    async fn delete_document(&self, path: &DocumentPath) -> Result<()>;
    async fn run_query(&self, query: &StructuredQuery) -> Result<Vec<FsDocument>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_path() {
        let path = DocumentPath::parse("customers/1000/orders/501").unwrap();
        assert_eq!(path.id(), "501");
        assert_eq!(path.collection_id(), "orders");
        assert_eq!(path.parent_segments(), ["customers", "1000"]);
        assert_eq!(path.to_string(), "customers/1000/orders/501");
        assert!(DocumentPath::parse("customers").is_none());
        assert!(DocumentPath::parse("customers//x/y").is_none());
    }

    #[test]
    fn test_cross_type_ordering() {
        let n = QueryValue::Value(json!(5));
        let s = QueryValue::Value(json!("5"));
        assert_eq!(n.cmp_order(&s), Ordering::Less);
        assert_eq!(
            QueryValue::Value(json!("a")).cmp_order(&QueryValue::Value(json!("b"))),
            Ordering::Less
        );
    }
}
