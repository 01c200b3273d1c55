//! Bearer tokens for the Firestore REST client.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const TOKEN_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/token";

/// Cached tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub enum TokenSource {
    /// The emulator's `owner` token or a configured access token.
    Static(String),
    /// The metadata server of the ambient GCP environment (GCE, GKE, Cloud
    /// Run), which hands out tokens for the attached service account.
    Metadata {
        url: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

pub struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl TokenSource {
    pub fn metadata(host: &str) -> Self {
        TokenSource::Metadata {
            url: format!("http://{host}/{TOKEN_PATH}"),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self, http: &Client) -> Result<String> {
        let (url, cached) = match self {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url, cached } => (url, cached),
        };

        let mut cached = cached.lock().await;
        if let Some(current) = cached
            .as_ref()
            .filter(|c| Instant::now() + EXPIRY_MARGIN < c.expires_at)
        {
            return Ok(current.token.clone());
        }

        let op = "error fetching access token from metadata server";
        let fresh: MetadataToken = http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::request(op, e))?
            .json()
            .await
            .map_err(|e| Error::request(op, e))?;
        debug!(expires_in = fresh.expires_in, "refreshed firestore access token");

        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(fresh.expires_in),
        });
        Ok(fresh.access_token)
    }
}
