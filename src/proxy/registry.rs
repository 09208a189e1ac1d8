//! One pooled client, connection limiter, and token manager per target.
//!
//! Built once at startup and handed around inside `AppState`; tests build
//! their own registry against mock servers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::clock::Clock;
use crate::errors::GatewayError;
use crate::middleware::metrics::GatewayMetrics;
use crate::models::target::BackendTarget;
use crate::proxy::token::TokenManager;
use crate::proxy::upstream;

pub struct BackendClient {
    pub target: Arc<BackendTarget>,
    pub http: reqwest::Client,
    pub tokens: TokenManager,
    connections: Semaphore,
}

impl BackendClient {
    /// Wait for a free connection slot. The permit is held for the whole
    /// outbound call, response body included.
    pub async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, GatewayError> {
        self.connections.acquire().await.map_err(|_| {
            GatewayError::Internal(anyhow::anyhow!(
                "connection limiter for '{}' closed",
                self.target.name
            ))
        })
    }

    pub fn available_slots(&self) -> usize {
        self.connections.available_permits()
    }
}

pub struct BackendRegistry {
    clients: BTreeMap<String, Arc<BackendClient>>,
}

impl BackendRegistry {
    pub fn from_targets(
        targets: Vec<BackendTarget>,
        clock: Arc<dyn Clock>,
        margin: chrono::Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        let mut clients = BTreeMap::new();
        for target in targets {
            if clients.contains_key(&target.name) {
                return Err(GatewayError::Internal(anyhow::anyhow!(
                    "duplicate backend target '{}'",
                    target.name
                )));
            }
            let http = upstream::build_client(&target)?;
            let target = Arc::new(target);
            let tokens = TokenManager::new(
                target.clone(),
                http.clone(),
                clock.clone(),
                margin,
                metrics.clone(),
            );
            tracing::debug!(
                backend = %target.name,
                base_url = %target.base_url,
                max_connections = target.max_connections,
                "registered backend target"
            );
            clients.insert(
                target.name.clone(),
                Arc::new(BackendClient {
                    connections: Semaphore::new(target.max_connections.max(1)),
                    target,
                    http,
                    tokens,
                }),
            );
        }
        Ok(Self { clients })
    }

    pub fn get(&self, name: &str) -> Result<Arc<BackendClient>, GatewayError> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTarget(name.to_string()))
    }

    /// Target descriptors in name order.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<BackendTarget>> {
        self.clients.values().map(|c| &c.target)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
