//! [`FirestoreApi`] over the Firestore v1 REST API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::auth::{DEFAULT_METADATA_HOST, TokenSource};
use super::client::{
    DocumentPath, FieldFilter, FieldOp, FieldPath, FirestoreApi, FsDocument, QueryValue,
    StructuredQuery,
};
use crate::config::FirestoreConfig;
use crate::error::{ConfigError, Error, Result};
use crate::types::Document;

const PRODUCTION_HOST: &str = "https://firestore.googleapis.com";

pub struct RestFirestore {
    http: Client,
    base_url: String,
    /// `projects/{project}/databases/{database}/documents`
    root: String,
    tokens: Option<TokenSource>,
}

impl RestFirestore {
    pub fn new(
        base_url: impl Into<String>,
        project_id: &str,
        database: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            root: format!("projects/{project_id}/databases/{database}/documents"),
            tokens: token.map(TokenSource::Static),
        }
    }

    pub fn with_token_source(mut self, tokens: TokenSource) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// The emulator accepts the fixed `owner` token. Production uses the
    /// configured access token, or else tokens from the ambient metadata
    /// server.
    pub fn from_config(config: &FirestoreConfig) -> Result<Self> {
        let project_id = config.project_id.as_deref().ok_or(ConfigError::Invalid {
            field: "firestore.project_id",
            value: String::new(),
        })?;
        if let Some(host) = &config.emulator_host {
            info!(%host, "using firestore emulator");
            return Ok(Self::new(
                format!("http://{host}"),
                project_id,
                &config.database,
                Some("owner".to_string()),
            ));
        }

        let client = Self::new(PRODUCTION_HOST, project_id, &config.database, None);
        let tokens = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => {
                let host = config
                    .metadata_host
                    .as_deref()
                    .unwrap_or(DEFAULT_METADATA_HOST);
                info!(%host, "firestore credentials from metadata server");
                TokenSource::metadata(host)
            }
        };
        Ok(client.with_token_source(tokens))
    }

    fn document_url(&self, path: &DocumentPath) -> String {
        format!("{}/v1/{}/{}", self.base_url, self.root, path)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match &self.tokens {
            Some(tokens) => Ok(request.bearer_auth(tokens.token(&self.http).await?)),
            None => Ok(request),
        }
    }

    fn reference(&self, path: &DocumentPath) -> String {
        format!("{}/{}", self.root, path)
    }

    fn parse_name(&self, name: &str) -> Option<DocumentPath> {
        name.strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(DocumentPath::parse)
    }

    fn decode_document(&self, doc: WireDocument) -> Result<FsDocument> {
        let path = self
            .parse_name(&doc.name)
            .ok_or_else(|| Error::request("decode document", format!("bad name {}", doc.name)))?;
        let data = doc
            .fields
            .into_iter()
            .map(|(k, v)| Ok((k, decode_value(&v)?)))
            .collect::<Result<Document>>()?;
        Ok(FsDocument { path, data })
    }

    fn encode_query(&self, query: &StructuredQuery) -> Value {
        let mut body = Map::new();
        body.insert(
            "from".into(),
            json!([{
                "collectionId": query.collection_id,
                "allDescendants": query.all_descendants,
            }]),
        );

        let filters: Vec<Value> = query
            .filters
            .iter()
            .map(|f| self.encode_filter(f))
            .collect();
        match filters.len() {
            0 => {}
            1 => {
                body.insert("where".into(), filters.into_iter().next().unwrap_or_default());
            }
            _ => {
                body.insert(
                    "where".into(),
                    json!({"compositeFilter": {"op": "AND", "filters": filters}}),
                );
            }
        }

        if !query.order_by.is_empty() {
            let order: Vec<Value> = query
                .order_by
                .iter()
                .map(|f| json!({"field": {"fieldPath": field_path(f)}, "direction": "ASCENDING"}))
                .collect();
            body.insert("orderBy".into(), Value::Array(order));
        }
        if let Some(cursor) = &query.start_after {
            let values: Vec<Value> = cursor.iter().map(|v| self.encode_query_value(v)).collect();
            body.insert("startAt".into(), json!({"values": values, "before": false}));
        }
        if let Some(limit) = query.limit {
            body.insert("limit".into(), json!(limit));
        }
        json!({ "structuredQuery": body })
    }

    fn encode_filter(&self, filter: &FieldFilter) -> Value {
        let op = match filter.op {
            FieldOp::Equal => "EQUAL",
            FieldOp::LessThan => "LESS_THAN",
            FieldOp::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FieldOp::GreaterThan => "GREATER_THAN",
            FieldOp::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        };
        json!({"fieldFilter": {
            "field": {"fieldPath": field_path(&filter.field)},
            "op": op,
            "value": self.encode_query_value(&filter.value),
        }})
    }

    fn encode_query_value(&self, value: &QueryValue) -> Value {
        match value {
            QueryValue::Value(v) => encode_value(v),
            QueryValue::Reference(path) => json!({"referenceValue": self.reference(path)}),
        }
    }
}

#[derive(Deserialize)]
struct WireDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RunQueryItem {
    document: Option<WireDocument>,
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::request(operation, format!("{status}: {body}")))
}

#[async_trait]
impl FirestoreApi for RestFirestore {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<FsDocument>> {
        let op = format!("error getting {path}");
        let response = self
            .authorized(self.http.get(self.document_url(path)))
            .await?
            .send()
            .await
            .map_err(|e| Error::request(&op, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: WireDocument = check_status(&op, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::request(&op, e))?;
        self.decode_document(doc).map(Some)
    }

    async fn set_document(&self, path: &DocumentPath, data: &Document) -> Result<()> {
        let op = format!("error setting {path}");
        let fields: Map<String, Value> =
            data.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect();
        let response = self
            .authorized(self.http.patch(self.document_url(path)))
            .await?
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .map_err(|e| Error::request(&op, e))?;
        check_status(&op, response).await?;
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        let op = format!("error deleting {path}");
        let response = self
            .authorized(self.http.delete(self.document_url(path)))
            .await?
            .send()
            .await
            .map_err(|e| Error::request(&op, e))?;
        check_status(&op, response).await?;
        Ok(())
    }

    async fn run_query(&self, query: &StructuredQuery) -> Result<Vec<FsDocument>> {
        let op = format!("error querying {}", query.collection_id);
        let url = match &query.parent {
            Some(parent) => format!("{}:runQuery", self.document_url(parent)),
            None => format!("{}/v1/{}:runQuery", self.base_url, self.root),
        };
        let body = self.encode_query(query);
        debug!(%url, "firestore runQuery");

        let response = self
            .authorized(self.http.post(url))
            .await?
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::request(&op, e))?;
        let items: Vec<RunQueryItem> = check_status(&op, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::request(&op, e))?;
        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|doc| self.decode_document(doc))
            .collect()
    }
}

/// Quote a field path segment unless it is a simple identifier.
fn field_path(field: &FieldPath) -> String {
    let name = match field {
        FieldPath::DocumentId => return "__name__".to_string(),
        FieldPath::Field(name) => name,
    };
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.clone()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({"nullValue": null}),
        Value::Bool(b) => json!({"booleanValue": b}),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({"integerValue": i.to_string()}),
            None => json!({"doubleValue": n.as_f64()}),
        },
        Value::String(s) => json!({"stringValue": s}),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({"arrayValue": {"values": values}})
        }
        Value::Object(map) => {
            let fields: Map<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect();
            json!({"mapValue": {"fields": fields}})
        }
    }
}

fn decode_value(value: &Value) -> Result<Value> {
    let bad = || Error::request("decode value", value.to_string());
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Err(bad());
    };
    let decoded = match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().ok_or_else(bad)?),
        "integerValue" => {
            let i: i64 = match inner {
                Value::String(s) => s.parse().map_err(|_| bad())?,
                other => other.as_i64().ok_or_else(bad)?,
            };
            Value::from(i)
        }
        "doubleValue" => Value::from(inner.as_f64().ok_or_else(bad)?),
        "stringValue" | "referenceValue" | "timestampValue" | "bytesValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<_>>())
                .transpose()?
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(|fields| {
                    fields
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                        .collect::<Result<Map<_, _>>>()
                })
                .transpose()?
                .unwrap_or_default(),
        ),
        _ => return Err(bad()),
    };
    Ok(decoded)
}
