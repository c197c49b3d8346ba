//! Model discovery against `GET /api/tags`.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ModelInfo, TagsResponse, TAGS_PATH};
use crate::error::{ErrorKind, TransportError};
use crate::transport::Transport;

/// Opaque backend model identifier (e.g. `llama3:latest`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ModelId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Lists the models the backend has available.
///
/// The last successful listing is cached until [`invalidate`](Self::invalidate)
/// is called. Nothing refreshes it in the background.
pub struct ModelCatalog {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    cache: RwLock<Option<Vec<ModelInfo>>>,
}

impl ModelCatalog {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            cache: RwLock::new(None),
        }
    }

    /// Asks the backend for its models and replaces the cached listing.
    ///
    /// Order is the backend's order. An empty list is a valid result. On
    /// failure the previous listing stays cached.
    pub async fn list_models(&self) -> Result<Vec<ModelId>, ErrorKind> {
        let models = self.fetch().await?;
        let ids = models.iter().map(|m| m.name.clone()).collect();
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(models);
        Ok(ids)
    }

    /// Serves the cached listing when present, otherwise lists.
    pub async fn cached_or_list(&self) -> Result<Vec<ModelId>, ErrorKind> {
        match self.cached() {
            Some(ids) => Ok(ids),
            None => self.list_models().await,
        }
    }

    /// Drops the cached listing; the next `cached_or_list` hits the backend.
    pub fn invalidate(&self) {
        debug!("model catalog invalidated");
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn cached(&self) -> Option<Vec<ModelId>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|models| models.iter().map(|m| m.name.clone()).collect())
    }

    pub fn cached_info(&self) -> Option<Vec<ModelInfo>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The whole exchange, body included, shares one deadline.
    async fn fetch(&self) -> Result<Vec<ModelInfo>, ErrorKind> {
        tokio::time::timeout(self.timeout, self.request())
            .await
            .map_err(|_| {
                warn!(timeout = ?self.timeout, "model listing timed out");
                ErrorKind::from(TransportError::Timeout)
            })?
    }

    async fn request(&self) -> Result<Vec<ModelInfo>, ErrorKind> {
        let reply = self.transport.get(TAGS_PATH, self.timeout).await.map_err(|e| {
            warn!(error = %e, "model listing failed");
            ErrorKind::from(e)
        })?;

        if !reply.is_success() {
            let status = reply.status;
            let reason = reply.error_text().await;
            warn!(status, %reason, "model listing rejected");
            return Err(ErrorKind::Unreachable {
                status: Some(status),
                reason,
            });
        }

        let body = reply.collect().await.map_err(ErrorKind::from)?;
        let tags: TagsResponse = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "model listing payload could not be decoded");
            ErrorKind::MalformedResponse(e.to_string())
        })?;
        debug!(count = tags.models.len(), "models fetched");
        Ok(tags.models)
    }
}
