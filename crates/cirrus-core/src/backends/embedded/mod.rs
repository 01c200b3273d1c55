//! Embedded backend.
//!
//! Each top-level collection lives in its own key/value database,
//! `{collection}.db` (lowercased), under a base directory. Sub-collection
//! items share their parent collection's database, addressed by
//! `(partition_key, sort_key)` exactly like the single-table layout used for
//! DynamoDB.
//!
//! A collection's database is opened on first use and kept open for the life
//! of the service. Filtering beyond the key indexes happens in process via
//! [`Predicate`], and pagination is offset based: the token records how many
//! candidates earlier pages consumed.

mod lock;
mod store;

pub use lock::StoreLock;
pub use store::{CollectionStore, IndexScan, SortMatch};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::backends::BackendKind;
use crate::config::EmbeddedConfig;
use crate::context::RequestContext;
use crate::error::{BackendError, Error, Result, ValidationError};
use crate::predicate::Predicate;
use crate::service::DocumentService;
use crate::types::{
    Document, Key, PagingToken, QueryExpression, QueryResult, collection_prefix, describe,
    non_empty, sort_key,
};
use crate::validation::{end_range_value, validate_collection, validate_expressions, validate_keys};

/// Paging token key holding the number of candidates already consumed.
pub const SKIP_TOKEN: &str = "skip";

type OpenStores = Arc<Mutex<HashMap<PathBuf, CollectionStore>>>;

pub struct EmbeddedDocumentService {
    dir: PathBuf,
    open_timeout: Duration,
    stores: OpenStores,
}

impl EmbeddedDocumentService {
    pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Use `dir` as the base directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
            stores: OpenStores::default(),
        })
    }

    pub fn from_config(config: &EmbeddedConfig) -> Result<Self> {
        Ok(Self::new(&config.dir)?.with_open_timeout(config.open_timeout()))
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Database backing `collection`.
    pub fn store_path(&self, collection: &str) -> Result<PathBuf> {
        let name = collection.to_lowercase();
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::Unsupported(format!(
                "collection name {collection:?} cannot be used as a store file name"
            )));
        }
        Ok(self.dir.join(format!("{name}.db")))
    }

    /// Run `op` against the collection store on the blocking pool.
    ///
    /// The task is always awaited, so the returned result reflects what
    /// happened to the store. The context is checked once the store is open,
    /// and the store's write methods check it again before applying.
    async fn with_store<T, F>(&self, ctx: &RequestContext, collection: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CollectionStore, &RequestContext) -> Result<T> + Send + 'static,
    {
        ctx.check()?;
        let path = self.store_path(collection)?;
        let stores = Arc::clone(&self.stores);
        let timeout = self.open_timeout;
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let store = open_store(&stores, &path, timeout)?;
            ctx.check()?;
            op(&store, &ctx)
        })
        .await
        .map_err(|e| Error::request("embedded store task", e))?
    }
}

fn open_store(
    stores: &OpenStores,
    path: &Path,
    timeout: Duration,
) -> std::result::Result<CollectionStore, BackendError> {
    let mut open = stores.lock();
    if let Some(store) = open.get(path) {
        return Ok(store.clone());
    }
    let store = CollectionStore::open(path, timeout)?;
    open.insert(path.to_path_buf(), store.clone());
    Ok(store)
}

#[async_trait]
impl DocumentService for EmbeddedDocumentService {
    fn backend(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
    ) -> Result<Document> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "embedded get");

        let pk = key.id.clone();
        let sk = sort_key(key, sub_key);
        let address = describe(key, sub_key);
        self.with_store(ctx, &key.collection, move |store, _| {
            store
                .get(&pk, &sk)?
                .ok_or_else(|| Error::NotFound(format!("{address} not found")))
        })
        .await
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &Key,
        sub_key: Option<&Key>,
        value: &Document,
    ) -> Result<()> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "embedded set");

        let pk = key.id.clone();
        let sk = sort_key(key, sub_key);
        let value = value.clone();
        self.with_store(ctx, &key.collection, move |store, ctx| {
            store.put(ctx, &pk, &sk, &value)
        })
        .await
    }

    async fn delete(&self, ctx: &RequestContext, key: &Key, sub_key: Option<&Key>) -> Result<()> {
        validate_keys(key, sub_key)?;
        debug!(key = %describe(key, sub_key), "embedded delete");

        // TODO: remove sub-collection records stored under a deleted parent.
        let pk = key.id.clone();
        let sk = sort_key(key, sub_key);
        let address = describe(key, sub_key);
        self.with_store(ctx, &key.collection, move |store, ctx| {
            if store.remove(ctx, &pk, &sk)? {
                Ok(())
            } else {
                Err(Error::NotFound(format!("{address} not found")))
            }
        })
        .await
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
        let skip = parse_skip(non_empty(paging_token))?;
        debug!(
            collection = %key.collection,
            id = %key.id,
            subcollection,
            expressions = expressions.len(),
            limit,
            skip,
            "embedded query"
        );

        let scan = index_scan(key, subcollection);
        let predicate = Predicate::from_expressions(expressions);
        self.with_store(ctx, &key.collection, move |store, _| {
            scan_page(store, &scan, &predicate, limit, skip)
        })
        .await
    }
}

fn index_scan(key: &Key, subcollection: &str) -> IndexScan {
    let partition = (!key.id.is_empty()).then(|| key.id.clone());
    let sort = if subcollection.is_empty() {
        SortMatch::Eq(collection_prefix(&key.collection))
    } else {
        let start = collection_prefix(subcollection);
        let end = end_range_value(&start);
        SortMatch::Range { start, end }
    };
    IndexScan { partition, sort }
}

fn parse_skip(token: Option<&PagingToken>) -> Result<usize> {
    let Some(token) = token else {
        return Ok(0);
    };
    let raw = token.get(SKIP_TOKEN).ok_or_else(|| {
        ValidationError::InvalidPagingToken(format!("missing {SKIP_TOKEN:?} entry"))
    })?;
    raw.parse::<usize>().map_err(|_| {
        ValidationError::InvalidPagingToken(format!("{SKIP_TOKEN:?} is not a count: {raw}")).into()
    })
}

/// Skip `skip` candidates, then collect up to `limit` matches. A token is
/// returned only when the page filled up.
fn scan_page(
    store: &CollectionStore,
    scan: &IndexScan,
    predicate: &Predicate,
    limit: usize,
    skip: usize,
) -> Result<QueryResult> {
    let mut documents = Vec::new();
    let mut scanned = 0;
    for entry in store.scan(scan).skip(skip) {
        let (_, doc) = entry?;
        scanned += 1;
        if predicate.eval(&doc) {
            documents.push(doc);
            if limit > 0 && documents.len() == limit {
                break;
            }
        }
    }

    let paging_token = (limit > 0 && documents.len() == limit).then(|| {
        PagingToken::from([(SKIP_TOKEN.to_string(), (skip + scanned).to_string())])
    });
    Ok(QueryResult {
        documents,
        paging_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operator;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn service() -> (tempfile::TempDir, EmbeddedDocumentService) {
        let dir = tempdir().unwrap();
        let svc = EmbeddedDocumentService::new(dir.path().join("collections")).unwrap();
        (dir, svc)
    }

    #[tokio::test]
    async fn test_one_file_per_collection() {
        let (_dir, svc) = service();
        let ctx = RequestContext::new();
        svc.set(&ctx, &Key::new("Customers", "1"), None, &doc(json!({"a": 1})))
            .await
            .unwrap();
        svc.set(
            &ctx,
            &Key::new("Customers", "1"),
            Some(&Key::new("orders", "9")),
            &doc(json!({"b": 2})),
        )
        .await
        .unwrap();

        assert!(svc.dir().join("customers.db").exists());
        assert!(!svc.dir().join("orders.db").exists());
    }

    #[tokio::test]
    async fn test_delete_absent_is_not_found() {
        let (_dir, svc) = service();
        let err = svc
            .delete(&RequestContext::new(), &Key::new("users", "nobody"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_locked_store_times_out() {
        let (_dir, svc) = service();
        let svc = svc.with_open_timeout(Duration::from_millis(30));
        let path = svc.store_path("users").unwrap();
        let _held = StoreLock::try_acquire(&path.with_extension("lock")).unwrap();

        let err = svc
            .get(&RequestContext::new(), &Key::new("users", "1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
        assert!(err.to_string().contains("locked"));
    }

    #[tokio::test]
    async fn test_second_service_is_locked_out() {
        let (dir, svc) = service();
        let ctx = RequestContext::new();
        let key = Key::new("users", "1");
        svc.set(&ctx, &key, None, &doc(json!({"name": "Ada"})))
            .await
            .unwrap();

        let other = EmbeddedDocumentService::new(dir.path().join("collections"))
            .unwrap()
            .with_open_timeout(Duration::from_millis(30));
        let err = other.get(&ctx, &key, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);

        assert_eq!(svc.get(&ctx, &key, None).await.unwrap()["name"], "Ada");
    }

    #[tokio::test]
    async fn test_expired_write_is_not_applied() {
        let (_dir, svc) = service();
        let svc = svc.with_open_timeout(Duration::from_secs(2));
        let path = svc.store_path("users").unwrap();
        let held = StoreLock::try_acquire(&path.with_extension("lock")).unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            drop(held);
        });

        let key = Key::new("users", "1");
        let err = svc
            .set(
                &RequestContext::with_timeout(Duration::from_millis(50)),
                &key,
                None,
                &doc(json!({"name": "Ada"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeadlineExceeded);
        release.join().unwrap();

        let err = svc
            .get(&RequestContext::new(), &key, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_skip_token_offsets() {
        let (_dir, svc) = service();
        let ctx = RequestContext::new();
        for i in 1..=5 {
            svc.set(
                &ctx,
                &Key::new("items", format!("{i:02}")),
                None,
                &doc(json!({"n": i})),
            )
            .await
            .unwrap();
        }

        let key = Key::collection("items");
        let exps = [QueryExpression::new("n", Operator::Gt, 1)];
        let first = svc.query(&ctx, &key, "", &exps, 2, None).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        // Item 01 is scanned but filtered out.
        assert_eq!(first.paging_token.as_ref().unwrap()[SKIP_TOKEN], "3");

        let second = svc
            .query(&ctx, &key, "", &exps, 2, first.paging_token.as_ref())
            .await
            .unwrap();
        assert_eq!(second.documents[0]["n"], 4);
        assert_eq!(second.paging_token.as_ref().unwrap()[SKIP_TOKEN], "5");
    }

    #[tokio::test]
    async fn test_invalid_skip_token() {
        let (_dir, svc) = service();
        let token = PagingToken::from([(SKIP_TOKEN.to_string(), "many".to_string())]);
        let err = svc
            .query(
                &RequestContext::new(),
                &Key::collection("items"),
                "",
                &[],
                10,
                Some(&token),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rejects_path_like_collections() {
        let (_dir, svc) = service();
        assert!(svc.store_path("../etc").is_err());
        assert!(svc.store_path("a/b").is_err());
        assert!(svc.store_path("Users").unwrap().ends_with("users.db"));
    }
}
