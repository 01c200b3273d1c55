//! Firestore backend over native hierarchical collections.
//!
//! Top-level documents live at `{collection}/{id}` and sub-collection items at
//! `{collection}/{id}/{sub}/{subId}`. Queries page with `startAfter` cursors:
//! the token carries the last document's path, preceded by the ordering
//! attribute's value when an inequality forces an order. The two are encoded
//! together as a JSON array `[value, path]`.

mod client;
mod memory;
#[cfg(feature = "gcp")]
mod auth;
#[cfg(feature = "gcp")]
mod rest;

pub use client::{
    DocumentPath, FieldFilter, FieldOp, FieldPath, FirestoreApi, FsDocument, QueryValue,
    StructuredQuery,
};
pub use memory::MemoryFirestore;
#[cfg(feature = "gcp")]
pub use auth::TokenSource;
#[cfg(feature = "gcp")]
pub use rest::RestFirestore;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::backends::BackendKind;
use crate::context::RequestContext;
use crate::error::{Error, Result, ValidationError};
use crate::service::DocumentService;
use crate::types::{
    Document, Key, Operator, PagingToken, QueryExpression, QueryResult, describe, non_empty,
};
use crate::validation::{end_range_value, validate_collection, validate_expressions, validate_keys};

/// Paging token key holding the encoded cursor.
pub const CURSOR_TOKEN: &str = "pagingTokens";

pub struct FirestoreDocumentService {
    client: Arc<dyn FirestoreApi>,
}

impl FirestoreDocumentService {
    pub fn new(client: Arc<dyn FirestoreApi>) -> Self {
        Self { client }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFirestore::new()))
    }
}

fn document_path(key: &Key, sub_key: Option<&Key>) -> DocumentPath {
    let path = DocumentPath::new([key.collection.as_str(), key.id.as_str()]);
    match sub_key {
        Some(sub) => path.child(&sub.collection, &sub.id),
        None => path,
    }
}

/// Pick the collection (or collection group) a query runs against.
fn query_target(key: &Key, subcollection: &str) -> StructuredQuery {
    match (key.id.is_empty(), subcollection.is_empty()) {
        (false, false) => StructuredQuery {
            parent: Some(document_path(key, None)),
            ..StructuredQuery::collection(subcollection)
        },
        (true, false) => StructuredQuery {
            all_descendants: true,
            ..StructuredQuery::collection(subcollection)
        },
        (true, true) => StructuredQuery::collection(&key.collection),
        (false, true) => StructuredQuery::collection(&key.collection).filter(
            FieldPath::DocumentId,
            FieldOp::Equal,
            QueryValue::Reference(document_path(key, None)),
        ),
    }
}

/// Translate expressions into field filters. Returns the first operand
/// carrying an inequality, which must lead the ordering.
fn apply_expressions(query: &mut StructuredQuery, expressions: &[QueryExpression]) -> Option<String> {
    let mut order_by_attrib = None;
    for exp in expressions {
        let field = FieldPath::Field(exp.operand.clone());
        let value = QueryValue::Value(exp.value.clone());
        match exp.operator {
            Operator::StartsWith => {
                let end = end_range_value(&exp.value_text());
                query.filters.push(FieldFilter {
                    field: field.clone(),
                    op: FieldOp::GreaterThanOrEqual,
                    value,
                });
                query.filters.push(FieldFilter {
                    field,
                    op: FieldOp::LessThan,
                    value: QueryValue::Value(Value::String(end)),
                });
            }
            op => query.filters.push(FieldFilter {
                field,
                op: field_op(op),
                value,
            }),
        }
        if exp.operator.is_inequality() && order_by_attrib.is_none() {
            order_by_attrib = Some(exp.operand.clone());
        }
    }
    order_by_attrib
}

fn field_op(op: Operator) -> FieldOp {
    match op {
        Operator::Eq => FieldOp::Equal,
        Operator::Lt => FieldOp::LessThan,
        Operator::Le => FieldOp::LessThanOrEqual,
        Operator::Gt => FieldOp::GreaterThan,
        Operator::Ge | Operator::StartsWith => FieldOp::GreaterThanOrEqual,
    }
}

fn encode_cursor(last: &FsDocument, order_by_attrib: Option<&str>) -> Result<PagingToken> {
    let path = last.path.to_string();
    let cursor = match order_by_attrib {
        Some(attr) => {
            let value = last.data.get(attr).unwrap_or(&Value::Null);
            serde_json::to_string(&(value, &path))
                .map_err(|e| Error::request("encode paging token", e))?
        }
        None => path,
    };
    Ok(PagingToken::from([(CURSOR_TOKEN.to_string(), cursor)]))
}

fn decode_cursor(token: &PagingToken, has_order_attrib: bool) -> Result<Vec<QueryValue>> {
    let invalid = |msg: &str| Error::from(ValidationError::InvalidPagingToken(msg.to_string()));
    let raw = token
        .get(CURSOR_TOKEN)
        .ok_or_else(|| invalid("missing cursor entry"))?;

    let mut cursor = Vec::with_capacity(2);
    let path = if has_order_attrib {
        let (value, path): (Value, String) = serde_json::from_str(raw)
            .map_err(|_| invalid("cursor is not a [value, path] pair"))?;
        cursor.push(QueryValue::Value(value));
        path
    } else {
        raw.clone()
    };
    let path = DocumentPath::parse(&path).ok_or_else(|| invalid("cursor path is malformed"))?;
    cursor.push(QueryValue::Reference(path));
    Ok(cursor)
}

#[async_trait]
impl DocumentService for FirestoreDocumentService {
    fn backend(&self) -> BackendKind {
        BackendKind::Firestore
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
    ) -> Result<Document> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "firestore get");

        let path = document_path(key, sub_key);
        match ctx.run(self.client.get_document(&path)).await? {
            Some(doc) => Ok(doc.data),
            None => Err(Error::NotFound(format!("{path} not found"))),
        }
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
        value: &Document,
    ) -> Result<()> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "firestore set");

        let path = document_path(key, sub_key);
        ctx.run(self.client.set_document(&path, value)).await
    }

    async fn delete(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>) -> Result<()> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "firestore delete");

        // TODO: remove documents in sub-collections of a deleted parent.
        let path = document_path(key, sub_key);
        ctx.run(self.client.delete_document(&path)).await
    }

    async fn query(
        &self,
        ctx: &RequestContext,
        key: &Key,
        subcollection: &str,
        expressions: &[QueryExpression],
        limit: usize,
        paging_token: Option<&PagingToken>,
    ) -> Result<QueryResult> {
        validate_collection(&key.collection, subcollection)?;
        validate_expressions(expressions)?;
        debug!(
            collection = %key.collection,
            id = %key.id,
            subcollection,
            expressions = expressions.len(),
            limit,
            "firestore query"
        );

        if !key.id.is_empty() && subcollection.is_empty() && expressions.is_empty() {
            let path = document_path(key, None);
            let documents = ctx
                .run(self.client.get_document(&path))
                .await?
                .map(|doc| vec![doc.data])
                .unwrap_or_default();
            return Ok(QueryResult {
                documents,
                paging_token: None,
            });
        }

        let mut query = query_target(key, subcollection);
        let order_by_attrib = apply_expressions(&mut query, expressions);
        if let Some(attr) = &order_by_attrib {
            query.order_by.push(FieldPath::Field(attr.clone()));
        }
        if limit > 0 {
            query.limit = Some(limit);
        }
        if let Some(token) = non_empty(paging_token) {
            query.order_by.push(FieldPath::DocumentId);
            query.start_after = Some(decode_cursor(token, order_by_attrib.is_some())?);
        }

        let docs = ctx.run(self.client.run_query(&query)).await?;
        let paging_token = match docs.last() {
            Some(last) if limit > 0 && docs.len() == limit => {
                Some(encode_cursor(last, order_by_attrib.as_deref())?)
            }
            _ => None,
        };
        Ok(QueryResult {
            documents: docs.into_iter().map(|d| d.data).collect(),
            paging_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fs_doc(path: &str, data: Value) -> FsDocument {
        FsDocument {
            path: DocumentPath::parse(path).unwrap(),
            data: data.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_query_targets() {
        let sub = query_target(&Key::new("customers", "1000"), "orders");
        assert_eq!(sub.parent, DocumentPath::parse("customers/1000"));
        assert_eq!(sub.collection_id, "orders");
        assert!(!sub.all_descendants);

        let group = query_target(&Key::collection("customers"), "orders");
        assert!(group.all_descendants);
        assert!(group.parent.is_none());

        let point = query_target(&Key::new("customers", "1000"), "");
        assert_eq!(point.filters[0].field, FieldPath::DocumentId);
    }

    #[test]
    fn test_starts_with_becomes_range_and_orders() {
        let mut query = StructuredQuery::collection("customers");
        let attr = apply_expressions(
            &mut query,
            &[
                QueryExpression::new("country", Operator::Eq, "US"),
                QueryExpression::new("name", Operator::StartsWith, "Jo"),
            ],
        );
        assert_eq!(attr.as_deref(), Some("name"));
        assert_eq!(query.filters.len(), 3);
        assert_eq!(query.filters[2].op, FieldOp::LessThan);
        assert_eq!(query.filters[2].value, QueryValue::Value(json!("Jp")));
    }

    #[test]
    fn test_cursor_with_string_value() {
        let last = fs_doc("items/07", json!({"letter": "a|b"}));
        let token = encode_cursor(&last, Some("letter")).unwrap();
        assert_eq!(token[CURSOR_TOKEN], r#"["a|b","items/07"]"#);

        let cursor = decode_cursor(&token, true).unwrap();
        assert_eq!(
            cursor,
            vec![
                QueryValue::Value(json!("a|b")),
                QueryValue::Reference(DocumentPath::parse("items/07").unwrap()),
            ]
        );
    }

    #[test]
    fn test_cursor_with_scalar_values() {
        for value in [json!(3), json!(2.5), json!(true), json!(null)] {
            let last = fs_doc("items/03", json!({ "n": value.clone() }));
            let token = encode_cursor(&last, Some("n")).unwrap();
            let cursor = decode_cursor(&token, true).unwrap();
            assert_eq!(cursor[0], QueryValue::Value(value));
            assert_eq!(
                cursor[1],
                QueryValue::Reference(DocumentPath::parse("items/03").unwrap())
            );
        }

        let missing = fs_doc("items/04", json!({}));
        let token = encode_cursor(&missing, Some("n")).unwrap();
        assert_eq!(token[CURSOR_TOKEN], r#"[null,"items/04"]"#);
    }

    #[test]
    fn test_cursor_without_order_attribute() {
        let last = fs_doc("customers/1000/orders/501", json!({}));
        let token = encode_cursor(&last, None).unwrap();
        assert_eq!(token[CURSOR_TOKEN], "customers/1000/orders/501");
        assert_eq!(decode_cursor(&token, false).unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_cursor() {
        let token = PagingToken::from([(CURSOR_TOKEN.to_string(), "not json".to_string())]);
        assert!(decode_cursor(&token, true).is_err());
        let token = PagingToken::from([(CURSOR_TOKEN.to_string(), "3|items/1".to_string())]);
        assert!(decode_cursor(&token, true).is_err());
        let token = PagingToken::from([(CURSOR_TOKEN.to_string(), r#"[3,"items"]"#.to_string())]);
        assert!(decode_cursor(&token, true).is_err());
        assert!(decode_cursor(&PagingToken::new(), false).is_err());
    }
}
