//! # cirrus
//!
//! One document storage contract (`get`, `set`, `delete`, `query`) over an
//! embedded key/value store, DynamoDB and Firestore.
//!
//! Keys, expressions and paging tokens are validated the same way for every
//! backend before any I/O happens; each backend then compiles the query into
//! its native form and pages through results until `limit` is met.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cirrus_core::backends::embedded::EmbeddedDocumentService;
//! use cirrus_core::{DocumentService, Key, Operator, QueryExpression, RequestContext};
//! use serde_json::json;
//!
//! # async fn demo() -> cirrus_core::Result<()> {
//! let svc = EmbeddedDocumentService::new("collections")?;
//! let ctx = RequestContext::new();
//!
//! let customer = json!({"name": "Ada", "country": "AU"});
//! svc.set(&ctx, &Key::new("customers", "1000"), None, customer.as_object().unwrap())
//!     .await?;
//!
//! let exps = [QueryExpression::new("country", Operator::Eq, "AU")];
//! let page = svc
//!     .query(&ctx, &Key::collection("customers"), "", &exps, 10, None)
//!     .await?;
//! assert_eq!(page.documents.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod predicate;
pub mod registry;
pub mod service;
pub mod types;
pub mod validation;

pub use backends::BackendKind;
pub use catalog::{Cataloged, CollectionCatalog};
pub use config::{Config, build_registry};
pub use context::RequestContext;
pub use error::{BackendError, ConfigError, Error, ErrorKind, Result, ValidationError};
pub use registry::ServiceRegistry;
pub use service::{DocumentService, QueryStream};
pub use types::{Document, Key, Operator, PagingToken, QueryExpression, QueryResult};
