//! In-process Firestore stand-in with Firestore's query rules: documents
//! lacking an ordered or filtered field are excluded, results are ordered by
//! the order fields with `__name__` as the final tiebreak, and an inequality
//! filter must be on the first order field.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::client::{
    DocumentPath, FieldFilter, FieldPath, FirestoreApi, FsDocument, QueryValue, StructuredQuery,
};
use crate::error::{Error, Result};
use crate::predicate::compare_values;
use crate::types::Document;

#[derive(Default)]
pub struct MemoryFirestore {
    documents: RwLock<BTreeMap<DocumentPath, Document>>,
}

impl MemoryFirestore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

fn in_scope(query: &StructuredQuery, path: &DocumentPath) -> bool {
    if path.collection_id() != query.collection_id {
        return false;
    }
    let parent = query
        .parent
        .as_ref()
        .map(DocumentPath::segments)
        .unwrap_or_default();
    if query.all_descendants {
        path.parent_segments().starts_with(parent)
    } else {
        path.parent_segments() == parent
    }
}

fn field_value(path: &DocumentPath, data: &Document, field: &FieldPath) -> Option<QueryValue> {
    match field {
        FieldPath::Field(name) => data.get(name).cloned().map(QueryValue::Value),
        FieldPath::DocumentId => Some(QueryValue::Reference(path.clone())),
    }
}

/// Filters only match values of the same type as the operand.
fn matches(filter: &FieldFilter, path: &DocumentPath, data: &Document) -> bool {
    let Some(actual) = field_value(path, data, &filter.field) else {
        return false;
    };
    let comparable = matches!(
        (&actual, &filter.value),
        (QueryValue::Reference(_), QueryValue::Reference(_))
    ) || matches!(
        (&actual, &filter.value),
        (QueryValue::Value(a), QueryValue::Value(b))
            if compare_values(a, b).is_some()
    );
    comparable && filter.op.accepts(actual.cmp_order(&filter.value))
}

fn check_query(query: &StructuredQuery) -> Result<()> {
    let inequality = query
        .filters
        .iter()
        .find(|f| f.op.is_inequality())
        .map(|f| &f.field);
    if let (Some(field), Some(first)) = (inequality, query.order_by.first()) {
        if field != first {
            return Err(Error::request(
                "runQuery",
                "INVALID_ARGUMENT: inequality filter property and first sort order must be the same",
            ));
        }
    }
    Ok(())
}

fn cmp_keys(a: &[QueryValue], b: &[QueryValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.cmp_order(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[async_trait]
impl FirestoreApi for MemoryFirestore {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<FsDocument>> {
        Ok(self.documents.read().get(path).map(|data| FsDocument {
            path: path.clone(),
            data: data.clone(),
        }))
    }

    async fn set_document(&self, path: &DocumentPath, data: &Document) -> Result<()> {
        self.documents.write().insert(path.clone(), data.clone());
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        self.documents.write().remove(path);
        Ok(())
    }

    async fn run_query(&self, query: &StructuredQuery) -> Result<Vec<FsDocument>> {
        check_query(query)?;

        let mut order = query.order_by.clone();
        if !order.contains(&FieldPath::DocumentId) {
            order.push(FieldPath::DocumentId);
        }

        let documents = self.documents.read();
        let mut rows: Vec<(Vec<QueryValue>, &DocumentPath, &Document)> = documents
            .iter()
            .filter(|(path, data)| {
                in_scope(query, path) && query.filters.iter().all(|f| matches(f, path, data))
            })
            .filter_map(|(path, data)| {
                let key: Option<Vec<QueryValue>> = order
                    .iter()
                    .map(|field| field_value(path, data, field))
                    .collect();
                key.map(|key| (key, path, data))
            })
            .collect();
        rows.sort_by(|a, b| cmp_keys(&a.0, &b.0));

        let results = rows
            .into_iter()
            .filter(|(key, _, _)| {
                query
                    .start_after
                    .as_ref()
                    .is_none_or(|cursor| cmp_keys(key, cursor) == Ordering::Greater)
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(_, path, data)| FsDocument {
                path: path.clone(),
                data: data.clone(),
            })
            .collect();
        Ok(results)
    }
}
