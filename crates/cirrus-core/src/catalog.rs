//! Declared top-level collections.
//!
//! [`Cataloged`] wraps a service so that requests naming an undeclared
//! collection fail before reaching the backend.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::backends::BackendKind;
use crate::context::RequestContext;
use crate::error::{Result, ValidationError};
use crate::service::DocumentService;
use crate::types::{Document, Key, PagingToken, QueryExpression, QueryResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionCatalog {
    collections: BTreeSet<String>,
}

impl CollectionCatalog {
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declare(&mut self, collection: impl Into<String>) {
        self.collections.insert(collection.into());
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    /// Blank names pass through so the backend reports them as blank.
    pub fn check(&self, collection: &str) -> std::result::Result<(), ValidationError> {
        if collection.is_empty() || self.contains(collection) {
            Ok(())
        } else {
            Err(ValidationError::UnknownCollection(collection.to_string()))
        }
    }
}

pub struct Cataloged<S> {
    inner: S,
    catalog: CollectionCatalog,
}

impl<S: DocumentService> Cataloged<S> {
    pub fn new(inner: S, catalog: CollectionCatalog) -> Self {
        Self { inner, catalog }
    }

    pub fn catalog(&self) -> &CollectionCatalog {
        &self.catalog
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: DocumentService> DocumentService for Cataloged<S> {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
    ) -> Result<Document> {
        self.catalog.check(&key.collection)?;
        self.inner.get(ctx, key, sub_key).await
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
        value: &Document,
    ) -> Result<()> {
        self.catalog.check(&key.collection)?;
        self.inner.set(ctx, key, sub_key, value).await
    }

    async fn delete(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>) -> Result<()> {
        self.catalog.check(&key.collection)?;
        self.inner.delete(ctx, key, sub_key).await
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
        self.catalog.check(&key.collection)?;
        self.inner
            .query(ctx, key, subcollection, expressions, limit, paging_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::dynamodb::DynamoDocumentService;
    use crate::error::{Error, ErrorKind};

    #[test]
    fn test_check() {
        let catalog = CollectionCatalog::new(["customers", "items"]);
        assert!(catalog.check("customers").is_ok());
        assert!(catalog.check("").is_ok());
        assert_eq!(
            catalog.check("orders"),
            Err(ValidationError::UnknownCollection("orders".into()))
        );
    }

    #[tokio::test]
    async fn test_rejects_before_delegating() {
        let svc = Cataloged::new(
            DynamoDocumentService::in_memory(),
            CollectionCatalog::new(["customers"]),
        );
        let ctx = RequestContext::new();

        let err = svc
            .set(&ctx, &Key::new("orders", "1"), None, &Document::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "unknown collection: orders");

        svc.set(&ctx, &Key::new("customers", "1"), None, &Document::new())
            .await
            .unwrap();
        let err = svc
            .query(&ctx, &Key::collection(""), "", &[], 0, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::BlankQueryCollection)
        ));
    }
}
