//! Fetches subgraph SDL, composes it, and keeps the published schema fresh.
//!
//! The current schema lives in a `watch` channel. Requests read whatever is
//! published when they start; a refresh only replaces it after a complete,
//! successful composition, so in-flight requests never see a mix.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::StartupConfig,
    error::{CompositionError, FetchError},
    subgraph_registry::{SubgraphDescriptor, SubgraphRegistry},
    supergraph::ComposedSchema,
};

pub const SERVICE_DEFINITION_QUERY: &str =
    "query __ApolloGetServiceDefinition__ { _service { sdl } }";

pub type SchemaReceiver = watch::Receiver<Option<Arc<ComposedSchema>>>;

#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch_sdl(&self, subgraph: &SubgraphDescriptor) -> Result<String, FetchError>;
}

/// Reads a subgraph's SDL through its `_service` introspection field.
pub struct HttpSchemaFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSchemaFetcher {
    pub fn new(timeout: Duration) -> Self {
        HttpSchemaFetcher {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct ServiceResponse {
    data: Option<ServiceData>,
    #[serde(default)]
    errors: Vec<ServiceError>,
}

#[derive(Deserialize)]
struct ServiceData {
    #[serde(rename = "_service")]
    service: Option<ServiceSdl>,
}

#[derive(Deserialize)]
struct ServiceSdl {
    sdl: Option<String>,
}

#[derive(Deserialize)]
struct ServiceError {
    message: String,
}

#[async_trait]
impl SchemaFetcher for HttpSchemaFetcher {
    async fn fetch_sdl(&self, subgraph: &SubgraphDescriptor) -> Result<String, FetchError> {
        let response = self
            .client
            .post(subgraph.endpoint().clone())
            .timeout(self.timeout)
            .json(&json!({ "query": SERVICE_DEFINITION_QUERY }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let response: ServiceResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if !response.errors.is_empty() {
            let messages: Vec<_> = response.errors.into_iter().map(|error| error.message).collect();
            return Err(FetchError::GraphQL(messages.join("; ")));
        }

        response
            .data
            .and_then(|data| data.service)
            .and_then(|service| service.sdl)
            .ok_or_else(|| FetchError::Malformed("missing `_service.sdl`".to_string()))
    }
}

pub struct SchemaComposer {
    registry: SubgraphRegistry,
    fetcher: Arc<dyn SchemaFetcher>,
    current: watch::Sender<Option<Arc<ComposedSchema>>>,
}

impl SchemaComposer {
    pub fn new(registry: SubgraphRegistry, fetcher: Arc<dyn SchemaFetcher>) -> Self {
        let (current, _) = watch::channel(None);
        SchemaComposer {
            registry,
            fetcher,
            current,
        }
    }

    pub fn registry(&self) -> &SubgraphRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> SchemaReceiver {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<Arc<ComposedSchema>> {
        self.current.borrow().clone()
    }

    /// Fetches every subgraph concurrently and composes the results in
    /// registry order.
    pub async fn compose_once(&self) -> Result<Arc<ComposedSchema>, CompositionError> {
        let fetches = self.registry.list_subgraphs().iter().map(|subgraph| async move {
            let sdl = self
                .fetcher
                .fetch_sdl(subgraph)
                .await
                .map_err(|cause| CompositionError::Fetch {
                    subgraph: subgraph.name().to_string(),
                    cause,
                })?;
            Ok::<_, CompositionError>((Arc::clone(subgraph), sdl))
        });

        let sources = try_join_all(fetches).await?;
        Ok(Arc::new(ComposedSchema::compose(&sources)?))
    }

    /// Composes and publishes the result. Returns `false` when the composed
    /// SDL is identical to the published one, which is then kept.
    pub async fn refresh(&self) -> Result<bool, CompositionError> {
        let schema = self.compose_once().await?;
        Ok(self.publish(schema))
    }

    fn publish(&self, schema: Arc<ComposedSchema>) -> bool {
        self.current.send_if_modified(|current| {
            if current.as_ref().is_some_and(|current| current.sdl() == schema.sdl()) {
                return false;
            }
            *current = Some(schema);
            true
        })
    }

    /// First composition. Retried with exponential backoff; the last error
    /// is returned once every attempt has failed.
    pub async fn bootstrap(
        &self,
        startup: &StartupConfig,
    ) -> Result<Arc<ComposedSchema>, CompositionError> {
        let mut attempt = 1;

        loop {
            match self.compose_once().await {
                Ok(schema) => {
                    self.publish(Arc::clone(&schema));
                    for subgraph in self.registry.list_subgraphs() {
                        tracing::info!(
                            "Service {} federated from: {}",
                            subgraph.name(),
                            subgraph.endpoint()
                        );
                    }
                    return Ok(schema);
                }
                Err(e) if attempt < startup.max_attempts => {
                    let delay = startup.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = startup.max_attempts,
                        subgraph = e.subgraph(),
                        error = %e,
                        "initial composition failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        subgraph = e.subgraph(),
                        error = %e,
                        "initial composition failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Re-composes every `interval` until the returned handle is stopped.
    /// Refreshes never overlap and a failed one keeps the current schema.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> PollingHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let composer = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    result = composer.refresh() => match result {
                        Ok(true) => tracing::info!("supergraph schema updated"),
                        Ok(false) => tracing::debug!("supergraph schema unchanged"),
                        Err(e) => tracing::warn!(
                            subgraph = e.subgraph(),
                            error = %e,
                            "schema refresh failed, keeping the current schema"
                        ),
                    },
                }
            }

            tracing::debug!("schema polling stopped");
        });

        PollingHandle { token, task }
    }
}

pub struct PollingHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "schema polling task ended abnormally");
        }
    }
}
