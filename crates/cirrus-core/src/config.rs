//! TOML configuration with environment overrides.
//!
//! ```toml
//! backend = "dynamodb"
//! collections = ["customers", "items"]
//!
//! [embedded]
//! dir = "nitric/collections/"
//!
//! [dynamodb]
//! mode = "aws"
//! region = "us-east-1"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backends::BackendKind;
use crate::backends::dynamodb::DynamoDocumentService;
use crate::backends::embedded::EmbeddedDocumentService;
use crate::backends::firestore::FirestoreDocumentService;
use crate::catalog::{Cataloged, CollectionCatalog};
use crate::error::{ConfigError, Error, Result};
use crate::registry::ServiceRegistry;
use crate::service::DocumentService;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend served by default.
    pub backend: BackendKind,
    /// Further backends to register alongside the default one.
    pub enable: Vec<BackendKind>,
    /// Declared top-level collections. When set, other names are rejected.
    pub collections: Option<Vec<String>>,
    pub embedded: EmbeddedConfig,
    pub dynamodb: DynamoConfig,
    pub firestore: FirestoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    pub dir: PathBuf,
    pub open_timeout_ms: u64,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("nitric/collections/"),
            open_timeout_ms: 1000,
        }
    }
}

impl EmbeddedConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamoMode {
    /// In-process emulator. Data does not survive a restart.
    Memory,
    /// AWS SDK client from ambient credentials and region.
    #[default]
    Aws,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamoConfig {
    pub mode: DynamoMode,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirestoreMode {
    /// In-process emulator. Data does not survive a restart.
    Memory,
    /// REST client against production or `emulator_host`.
    #[default]
    Rest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirestoreConfig {
    pub mode: FirestoreMode,
    pub project_id: Option<String>,
    pub database: String,
    pub emulator_host: Option<String>,
    /// Static bearer token. Without one, production tokens come from the
    /// metadata server.
    pub access_token: Option<String>,
    pub metadata_host: Option<String>,
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            mode: FirestoreMode::default(),
            project_id: None,
            database: "(default)".to_string(),
            emulator_host: None,
            access_token: None,
            metadata_host: None,
        }
    }
}

impl Config {
    /// Read a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.into()))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its
    /// value. Empty values are ignored.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(backend) = var("CIRRUS_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(dir) = var("LOCAL_DB_DIR") {
            self.embedded.dir = PathBuf::from(dir);
        }
        if let Some(region) = var("AWS_REGION") {
            self.dynamodb.region = Some(region);
        }
        if let Some(endpoint) = var("AWS_ENDPOINT_URL") {
            self.dynamodb.endpoint = Some(endpoint);
        }
        if let Some(project) = var("GOOGLE_CLOUD_PROJECT") {
            self.firestore.project_id = Some(project);
        }
        if let Some(host) = var("FIRESTORE_EMULATOR_HOST") {
            self.firestore.emulator_host = Some(host);
        }
        if let Some(token) = var("FIRESTORE_ACCESS_TOKEN") {
            self.firestore.access_token = Some(token);
        }
        if let Some(host) = var("GCE_METADATA_HOST") {
            self.firestore.metadata_host = Some(host);
        }
        Ok(())
    }

    /// The default backend followed by every other enabled one.
    pub fn backends(&self) -> Vec<BackendKind> {
        let mut kinds = vec![self.backend];
        for kind in &self.enable {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    pub fn catalog(&self) -> Option<CollectionCatalog> {
        self.collections
            .as_ref()
            .map(|names| CollectionCatalog::new(names.iter().cloned()))
    }
}

/// Construct every enabled backend and register it, with `config.backend`
/// as the default.
pub async fn build_registry(config: &Config) -> Result<ServiceRegistry> {
    let catalog = config.catalog();
    let mut registry = ServiceRegistry::new(config.backend);

    for kind in config.backends() {
        let service = match kind {
            BackendKind::Embedded => {
                with_catalog(EmbeddedDocumentService::from_config(&config.embedded)?, &catalog)
            }
            BackendKind::DynamoDb => with_catalog(dynamo_service(&config.dynamodb).await?, &catalog),
            BackendKind::Firestore => with_catalog(firestore_service(&config.firestore)?, &catalog),
        };
        info!(backend = %kind, cataloged = catalog.is_some(), "registered document service");
        registry.register(service);
    }
    Ok(registry)
}

fn with_catalog<S>(service: S, catalog: &Option<CollectionCatalog>) -> Arc<dyn DocumentService>
where
    S: DocumentService + 'static,
{
    match catalog {
        Some(catalog) => Arc::new(Cataloged::new(service, catalog.clone())),
        None => Arc::new(service),
    }
}

async fn dynamo_service(config: &DynamoConfig) -> Result<DynamoDocumentService> {
    match config.mode {
        DynamoMode::Memory => {
            warn!("dynamodb mode \"memory\": documents are kept in process and lost on restart");
            Ok(DynamoDocumentService::in_memory())
        }
        #[cfg(feature = "aws")]
        DynamoMode::Aws => {
            use crate::backends::dynamodb::AwsDynamo;
            let client = AwsDynamo::from_config(config).await;
            Ok(DynamoDocumentService::new(Arc::new(client)))
        }
        #[cfg(not(feature = "aws"))]
        DynamoMode::Aws => Err(Error::Unsupported(
            "dynamodb mode \"aws\" requires the `aws` feature".to_string(),
        )),
    }
}

fn firestore_service(config: &FirestoreConfig) -> Result<FirestoreDocumentService> {
    match config.mode {
        FirestoreMode::Memory => {
            warn!("firestore mode \"memory\": documents are kept in process and lost on restart");
            Ok(FirestoreDocumentService::in_memory())
        }
        #[cfg(feature = "gcp")]
        FirestoreMode::Rest => {
            use crate::backends::firestore::RestFirestore;
            let client = RestFirestore::from_config(config)?;
            Ok(FirestoreDocumentService::new(Arc::new(client)))
        }
        #[cfg(not(feature = "gcp"))]
        FirestoreMode::Rest => Err(Error::Unsupported(
            "firestore mode \"rest\" requires the `gcp` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend, BackendKind::Embedded);
        assert_eq!(config.embedded.dir, PathBuf::from("nitric/collections/"));
        assert_eq!(config.embedded.open_timeout(), Duration::from_secs(1));
        assert_eq!(config.firestore.database, "(default)");
        assert_eq!(config.dynamodb.mode, DynamoMode::Aws);
        assert_eq!(config.firestore.mode, FirestoreMode::Rest);
        assert!(config.catalog().is_none());
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
            backend = "firestore"
            enable = ["dynamodb", "firestore"]
            collections = ["customers"]

            [dynamodb]
            mode = "aws"
            region = "ap-southeast-2"

            [firestore]
            mode = "memory"
            project_id = "demo"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Firestore);
        assert_eq!(
            config.backends(),
            vec![BackendKind::Firestore, BackendKind::DynamoDb]
        );
        assert_eq!(config.dynamodb.mode, DynamoMode::Aws);
        assert_eq!(config.dynamodb.region.as_deref(), Some("ap-southeast-2"));
        assert_eq!(config.firestore.mode, FirestoreMode::Memory);
        assert_eq!(config.firestore.project_id.as_deref(), Some("demo"));
        assert!(config.catalog().unwrap().contains("customers"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::parse("backend = 3").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("CIRRUS_BACKEND", "dynamo"),
            ("LOCAL_DB_DIR", "/tmp/cirrus"),
            ("AWS_ENDPOINT_URL", "http://localhost:8000"),
            ("FIRESTORE_EMULATOR_HOST", ""),
        ]);
        let mut config = Config::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend, BackendKind::DynamoDb);
        assert_eq!(config.embedded.dir, PathBuf::from("/tmp/cirrus"));
        assert_eq!(
            config.dynamodb.endpoint.as_deref(),
            Some("http://localhost:8000")
        );
        assert!(config.firestore.emulator_host.is_none());

        let bad = HashMap::from([("CIRRUS_BACKEND", "mongo")]);
        let err = config
            .apply_vars(|name| bad.get(name).map(|v| v.to_string()))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid config value for backend: mongo");
    }

    #[tokio::test]
    async fn test_build_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            enable: vec![BackendKind::Firestore],
            collections: Some(vec!["customers".to_string()]),
            ..Config::default()
        };
        config.embedded.dir = dir.path().join("collections");
        config.firestore.mode = FirestoreMode::Memory;

        let registry = build_registry(&config).await.unwrap();
        assert_eq!(
            registry.backends(),
            vec![BackendKind::Embedded, BackendKind::Firestore]
        );
        assert!(dir.path().join("collections").is_dir());
        assert_eq!(
            registry.default_service().unwrap().backend(),
            BackendKind::Embedded
        );
        assert!(registry.get(BackendKind::DynamoDb).is_err());
    }

    #[cfg(not(feature = "aws"))]
    #[tokio::test]
    async fn test_default_dynamodb_needs_aws_feature() {
        let config = Config {
            backend: BackendKind::DynamoDb,
            ..Config::default()
        };
        let err = build_registry(&config).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[cfg(not(feature = "gcp"))]
    #[tokio::test]
    async fn test_default_firestore_needs_gcp_feature() {
        let config = Config {
            backend: BackendKind::Firestore,
            ..Config::default()
        };
        let err = build_registry(&config).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_memory_modes_are_opt_in() {
        let config = Config::parse(
            r#"
            backend = "dynamodb"
            enable = ["firestore"]

            [dynamodb]
            mode = "memory"

            [firestore]
            mode = "memory"
            "#,
        )
        .unwrap();
        let registry = build_registry(&config).await.unwrap();
        assert_eq!(
            registry.backends(),
            vec![BackendKind::DynamoDb, BackendKind::Firestore]
        );
    }
}
