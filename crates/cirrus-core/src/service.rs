use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::BackendKind;
use crate::context::RequestContext;
use crate::error::Result;
use crate::types::{Document, Key, PagingToken, QueryExpression, QueryResult};

/// Uniform document storage contract implemented by every backend.
///
/// `sub_key`, when present, addresses an item of a sub-collection nested
/// under the document named by `key`.
#[async_trait]
pub trait DocumentService: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Fetch one document. Fails with `NotFound` when nothing is stored at
    /// the address.
    async fn get(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>)
    -> Result<Document>;

    /// Create or wholesale replace a document.
    async fn set(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
        value: &Document,
    ) -> Result<()>;

    /// Remove a document. Children in sub-collections are left in place.
    async fn delete(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>) -> Result<()>;

    /// Return at most `limit` matching documents (0 = unlimited) and a token
    /// resuming after the last one, if more may exist.
    async fn query(
        &self,
        ctx: &RequestContext,
        key: &Key,
        subcollection: &str,
        expressions: &[QueryExpression],
        limit: usize,
        paging_token: Option<&PagingToken>,
    ) -> Result<QueryResult>;
}

const DEFAULT_PAGE_SIZE: usize = 100;

/// Pull-based iteration over every document a query matches, fetched page by
/// page through [`DocumentService::query`].
pub struct QueryStream {
    service: Arc<dyn DocumentService>,
    ctx: RequestContext,
    key: Key,
    subcollection: String,
    expressions: Vec<QueryExpression>,
    limit: usize,
    page_size: usize,
    buffer: VecDeque<Document>,
    token: Option<PagingToken>,
    yielded: usize,
    exhausted: bool,
}

impl QueryStream {
    /// `limit` caps the total number of documents yielded (0 = unlimited).
    pub fn new(
        service: Arc<dyn DocumentService>,
        ctx: RequestContext,
        key: Key,
        subcollection: impl Into<String>,
        expressions: Vec<QueryExpression>,
        limit: usize,
    ) -> Self {
        Self {
            service,
            ctx,
            key,
            subcollection: subcollection.into(),
            expressions,
            limit,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            token: None,
            yielded: 0,
            exhausted: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Next document, or `None` once the query is exhausted.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.limit > 0 && self.yielded >= self.limit {
            return Ok(None);
        }
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        let next = self.buffer.pop_front();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }

    /// Drain the remaining documents.
    pub async fn collect(mut self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        while let Some(doc) = self.next().await? {
            docs.push(doc);
        }
        Ok(docs)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        self.ctx.check()?;
        let page_limit = if self.limit > 0 {
            self.page_size.min(self.limit - self.yielded)
        } else {
            self.page_size
        };
        let page = self
            .service
            .query(
                &self.ctx,
                &self.key,
                &self.subcollection,
                &self.expressions,
                page_limit,
                self.token.as_ref(),
            )
            .await?;
        self.buffer.extend(page.documents);
        self.token = page.paging_token.filter(|t| !t.is_empty());
        if self.token.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}
