//! DynamoDB backend using a single-table layout.
//!
//! Each top-level collection is a table. Items carry `_pk` (the document id)
//! and `_sk` (`"{collection}#"` for top-level documents,
//! `"{sub}#{subId}"` for sub-collection items); both are stripped before a
//! document is returned.

#[cfg(feature = "aws")]
mod aws;
mod client;
mod memory;
pub mod plan;

#[cfg(feature = "aws")]
pub use aws::AwsDynamo;
pub use client::{
    AttributeValue, DeleteItemInput, DynamoApi, ExpressionAttributes, GetItemInput, Item, Page,
    PutItemInput, QueryInput, ScanInput, document_from_item, item_from_document,
};
pub use memory::MemoryDynamo;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backends::BackendKind;
use crate::context::RequestContext;
use crate::error::{Error, Result, ValidationError};
use crate::service::DocumentService;
use crate::types::{
    ATTRIB_PK, ATTRIB_SK, Document, Key, PagingToken, QueryExpression, QueryResult,
    collection_prefix, describe, non_empty, sort_key,
};
use crate::validation::{sort_expressions, validate_collection, validate_expressions, validate_keys};
use plan::{SortCondition, compile_query, compile_scan};

pub struct DynamoDocumentService {
    client: Arc<dyn DynamoApi>,
}

impl DynamoDocumentService {
    pub fn new(client: Arc<dyn DynamoApi>) -> Self {
        Self { client }
    }

    /// A service backed by a fresh in-process table set.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDynamo::new()))
    }

    fn key_item(key: &Key, sub_key: Option<&Key>) -> Item {
        Item::from([
            (ATTRIB_PK.to_string(), AttributeValue::S(key.id.clone())),
            (
                ATTRIB_SK.to_string(),
                AttributeValue::S(sort_key(key, sub_key)),
            ),
        ])
    }

    async fn fetch_page(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sort: &SortCondition,
        expressions: &[QueryExpression],
        limit: Option<i32>,
        start: Option<Item>,
    ) -> Result<client::Page> {
        if key.id.is_empty() {
            let input = compile_scan(&key.collection, sort, expressions, limit, start);
            ctx.run(self.client.scan(input)).await
        } else {
            let input = compile_query(&key.collection, &key.id, sort, expressions, limit, start);
            ctx.run(self.client.query(input)).await
        }
    }
}

#[async_trait]
impl DocumentService for DynamoDocumentService {
    fn backend(&self) -> BackendKind {
        BackendKind::DynamoDb
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
    ) -> Result<Document> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "dynamodb get");

        let input = GetItemInput {
            table: key.collection.clone(),
            key: Self::key_item(key, sub_key),
        };
        match ctx.run(self.client.get_item(input)).await? {
            Some(item) => Ok(strip_keys(&item)),
            None => Err(Error::NotFound(format!(
                "{} value not found",
                describe(key, sub_key)
            ))),
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
        debug!(key = %describe(key, sub_key), "dynamodb set");

        let mut item = item_from_document(value);
        item.extend(Self::key_item(key, sub_key));
        let input = PutItemInput {
            table: key.collection.clone(),
            item,
        };
        ctx.run(self.client.put_item(input)).await
    }

    async fn delete(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>) -> Result<()> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "dynamodb delete");

        // TODO: remove sub-collection items stored under a deleted parent.
        let input = DeleteItemInput {
            table: key.collection.clone(),
            key: Self::key_item(key, sub_key),
        };
        ctx.run(self.client.delete_item(input)).await
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

        let mut sorted = expressions.to_vec();
        sort_expressions(&mut sorted);
        let sort = if subcollection.is_empty() {
            SortCondition::Equals(collection_prefix(&key.collection))
        } else {
            SortCondition::BeginsWith(collection_prefix(subcollection))
        };
        debug!(
            table = %key.collection,
            id = %key.id,
            subcollection,
            expressions = sorted.len(),
            limit,
            "dynamodb query"
        );

        let mut documents = Vec::new();
        let mut start = non_empty(paging_token).map(token_to_item);
        loop {
            let remaining = match limit {
                0 => None,
                n => Some(i32::try_from(n - documents.len()).unwrap_or(i32::MAX)),
            };
            let page = self
                .fetch_page(ctx, key, &sort, &sorted, remaining, start.take())
                .await?;
            documents.extend(page.items.iter().map(strip_keys));
            start = page.last_evaluated_key.filter(|k| !k.is_empty());

            if limit == 0 || documents.len() >= limit || start.is_none() {
                break;
            }
            ctx.check()?;
        }

        let paging_token = start.map(|k| item_to_token(&k)).transpose()?;
        Ok(QueryResult {
            documents,
            paging_token,
        })
    }
}

fn strip_keys(item: &Item) -> Document {
    let mut doc = document_from_item(item);
    doc.remove(ATTRIB_PK);
    doc.remove(ATTRIB_SK);
    doc
}

fn token_to_item(token: &PagingToken) -> Item {
    token
        .iter()
        .map(|(k, v)| (k.clone(), AttributeValue::S(v.clone())))
        .collect()
}

fn item_to_token(item: &Item) -> Result<PagingToken> {
    item.iter()
        .map(|(k, v)| match v.as_s() {
            Some(s) => Ok((k.clone(), s.to_string())),
            None => Err(ValidationError::InvalidPagingToken(format!(
                "non-string key attribute {k} in LastEvaluatedKey"
            ))
            .into()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operator;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_items_carry_single_table_keys() {
        let db = Arc::new(MemoryDynamo::new());
        let svc = DynamoDocumentService::new(db.clone());
        let ctx = RequestContext::new();
        svc.set(
            &ctx,
            &Key::new("customers", "1000"),
            Some(&Key::new("orders", "501")),
            &doc(json!({"type": "bike"})),
        )
        .await
        .unwrap();

        let raw = db.raw_item("customers", "1000", "orders#501").unwrap();
        assert_eq!(raw[ATTRIB_PK], AttributeValue::S("1000".into()));
        assert_eq!(raw["type"], AttributeValue::S("bike".into()));

        let got = svc
            .get(
                &ctx,
                &Key::new("customers", "1000"),
                Some(&Key::new("orders", "501")),
            )
            .await
            .unwrap();
        assert_eq!(got, doc(json!({"type": "bike"})));
    }

    #[tokio::test]
    async fn test_loops_past_filtered_pages() {
        let svc = DynamoDocumentService::in_memory();
        let ctx = RequestContext::new();
        // Only the last of 6 items matches, so every page but the last is empty.
        for i in 0..6 {
            let kind = if i == 5 { "bike" } else { "scooter" };
            svc.set(
                &ctx,
                &Key::new("vehicles", format!("{i}")),
                None,
                &doc(json!({"type": kind})),
            )
            .await
            .unwrap();
        }
        let exps = [QueryExpression::new("type", Operator::Eq, "bike")];
        let result = svc
            .query(&ctx, &Key::collection("vehicles"), "", &exps, 1, None)
            .await
            .unwrap();
        assert_eq!(result.documents, vec![doc(json!({"type": "bike"}))]);
        assert!(result.paging_token.is_none());
    }

    #[tokio::test]
    async fn test_token_is_last_evaluated_key() {
        let svc = DynamoDocumentService::in_memory();
        let ctx = RequestContext::new();
        for i in 0..3 {
            svc.set(
                &ctx,
                &Key::new("users", format!("u{i}")),
                None,
                &doc(json!({"n": i})),
            )
            .await
            .unwrap();
        }
        let first = svc
            .query(&ctx, &Key::collection("users"), "", &[], 2, None)
            .await
            .unwrap();
        let token = first.paging_token.unwrap();
        assert_eq!(token[ATTRIB_PK], "u1");
        assert_eq!(token[ATTRIB_SK], "users#");
    }

    #[tokio::test]
    async fn test_missing_item_message() {
        let svc = DynamoDocumentService::in_memory();
        let err = svc
            .get(&RequestContext::new(), &Key::new("users", "x"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "users/x value not found");
    }
}
