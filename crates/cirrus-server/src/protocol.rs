//! Wire protocol: one JSON object per line in each direction.

use std::time::Duration;

use cirrus_core::{
    BackendKind, Document, Error, Key, Operator, PagingToken, QueryExpression, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        key: Key,
        #[serde(default)]
        sub_key: Option<Key>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Set {
        key: Key,
        #[serde(default)]
        sub_key: Option<Key>,
        value: Document,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Delete {
        key: Key,
        #[serde(default)]
        sub_key: Option<Key>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Query {
        key: Key,
        #[serde(default)]
        subcollection: String,
        #[serde(default)]
        expressions: Vec<ExpressionWire>,
        #[serde(default)]
        limit: usize,
        #[serde(default)]
        paging_token: Option<PagingToken>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Backend,
}

impl Request {
    pub fn timeout(&self) -> Option<Duration> {
        let ms = match self {
            Request::Get { timeout_ms, .. }
            | Request::Set { timeout_ms, .. }
            | Request::Delete { timeout_ms, .. }
            | Request::Query { timeout_ms, .. } => *timeout_ms,
            Request::Backend => None,
        };
        ms.map(Duration::from_millis)
    }
}

/// Query expression as sent by clients. The operator stays a string until
/// dispatch so an unknown symbol is reported as an invalid argument rather
/// than a parse error.
#[derive(Debug, Deserialize)]
pub struct ExpressionWire {
    pub operand: String,
    pub operator: String,
    pub value: Value,
}

impl TryFrom<ExpressionWire> for QueryExpression {
    type Error = ValidationError;

    fn try_from(wire: ExpressionWire) -> Result<Self, Self::Error> {
        let operator: Operator = wire.operator.parse()?;
        Ok(QueryExpression::new(wire.operand, operator, wire.value))
    }
}

/// A response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok(OkResponse),
    Error(ErrorResponse),
}

/// Successful response variants.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OkResponse {
    Document {
        ok: bool,
        document: Document,
    },
    Documents {
        ok: bool,
        documents: Vec<Document>,
        #[serde(skip_serializing_if = "Option::is_none")]
        paging_token: Option<PagingToken>,
    },
    Backend {
        ok: bool,
        backend: BackendKind,
    },
    Empty {
        ok: bool,
    },
}

/// Error response. `error` is an [`cirrus_core::ErrorKind`] name or
/// `ParseError`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl Response {
    pub fn ok_empty() -> Self {
        Response::Ok(OkResponse::Empty { ok: true })
    }

    pub fn ok_document(document: Document) -> Self {
        Response::Ok(OkResponse::Document { ok: true, document })
    }

    pub fn ok_documents(documents: Vec<Document>, paging_token: Option<PagingToken>) -> Self {
        Response::Ok(OkResponse::Documents {
            ok: true,
            documents,
            paging_token,
        })
    }

    pub fn ok_backend(backend: BackendKind) -> Self {
        Response::Ok(OkResponse::Backend { ok: true, backend })
    }

    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            error: error.into(),
            message: message.into(),
        })
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        Response::error(err.kind().as_str(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_query_request() {
        let req: Request = serde_json::from_value(json!({
            "op": "query",
            "key": {"collection": "customers"},
            "subcollection": "orders",
            "expressions": [{"operand": "number", "operator": ">=", "value": 2}],
            "limit": 10,
            "timeout_ms": 250
        }))
        .unwrap();
        assert_eq!(req.timeout(), Some(Duration::from_millis(250)));
        let Request::Query {
            key, expressions, ..
        } = req
        else {
            panic!("expected query");
        };
        assert_eq!(key, Key::collection("customers"));
        let exp = QueryExpression::try_from(expressions.into_iter().next().unwrap()).unwrap();
        assert_eq!(exp.operator, Operator::Ge);
    }

    #[test]
    fn test_unknown_operator() {
        let wire = ExpressionWire {
            operand: "n".into(),
            operator: "!=".into(),
            value: json!(1),
        };
        assert_eq!(
            QueryExpression::try_from(wire).unwrap_err(),
            ValidationError::InvalidOperator("!=".into())
        );
    }

    #[test]
    fn test_response_shapes() {
        let resp = Response::ok_documents(vec![], None);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"ok": true, "documents": []})
        );
        let resp = Response::ok_backend(BackendKind::DynamoDb);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"ok": true, "backend": "dynamodb"})
        );
        let resp = Response::from(Error::NotFound("users/x not found".into()));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"error": "NotFound", "message": "users/x not found"})
        );
    }
}
