use super::CoordinationClient;
use crate::error::{NetcfgError, NetcfgResult};
use crate::metrics::{names, MetricsRegistry};
use crate::patterns::retry::{retry, RetryConfig};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type BoxedCall<T> = Pin<Box<dyn Future<Output = NetcfgResult<T>> + Send>>;

/// Wraps a coordination client so that session loss is never surfaced
///
/// A call failing with a transient error triggers `reconnect()` and is
/// retried under the configured backoff. Only the final outcome reaches the
/// caller.
pub struct ResilientCoordinator {
    inner: Arc<dyn CoordinationClient>,
    retry: RetryConfig,
    metrics: MetricsRegistry,
}

impl ResilientCoordinator {
    pub fn new(inner: Arc<dyn CoordinationClient>, retry: RetryConfig, metrics: MetricsRegistry) -> Self {
        Self {
            inner,
            retry,
            metrics,
        }
    }

    async fn call<T, F>(&self, operation: &str, path: &str, f: F) -> NetcfgResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn CoordinationClient>, String) -> BoxedCall<T> + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let path = path.to_string();
        let metrics = self.metrics.clone();
        let f = Arc::new(f);
        let config = self
            .retry
            .clone()
            .with_operation_name(format!("{} {}", operation, path));

        retry(config, move || {
            let inner = inner.clone();
            let path = path.clone();
            let metrics = metrics.clone();
            let f = f.clone();
            Box::pin(async move {
                match f(inner.clone(), path.clone()).await {
                    Err(e) if e.is_transient() => {
                        metrics.increment_counter(names::COORDINATION_RECONNECTS);
                        if let Err(reconnect_err) = inner.reconnect().await {
                            warn!("Reconnect after '{}' failed: {}", e, reconnect_err);
                        }
                        Err(e)
                    }
                    other => other,
                }
            })
        })
        .await
    }
}

#[async_trait]
impl CoordinationClient for ResilientCoordinator {
    async fn create_node(&self, path: &str, value: &str) -> NetcfgResult<()> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let seen = interrupted.clone();
        let owned_value = value.to_string();

        let result = self
            .call("create_node", path, move |inner, path| {
                let value = owned_value.clone();
                let seen = seen.clone();
                Box::pin(async move {
                    let res = inner.create_node(&path, &value).await;
                    if matches!(&res, Err(e) if e.is_transient()) {
                        seen.store(true, Ordering::SeqCst);
                    }
                    res
                })
            })
            .await;

        match result {
            // A lost reply may hide our own successful create.
            Err(NetcfgError::AlreadyExists { resource }) if interrupted.load(Ordering::SeqCst) => {
                match self.read_node(path).await? {
                    Some(existing) if existing == value => {
                        debug!("Create of {} completed before session loss", path);
                        Ok(())
                    }
                    _ => Err(NetcfgError::AlreadyExists { resource }),
                }
            }
            other => other,
        }
    }

    async fn delete_node(&self, path: &str) -> NetcfgResult<()> {
        self.call("delete_node", path, |inner, path| {
            Box::pin(async move { inner.delete_node(&path).await })
        })
        .await
    }

    async fn read_node(&self, path: &str) -> NetcfgResult<Option<String>> {
        self.call("read_node", path, |inner, path| {
            Box::pin(async move { inner.read_node(&path).await })
        })
        .await
    }

    async fn list_children(&self, path: &str) -> NetcfgResult<Vec<String>> {
        self.call("list_children", path, |inner, path| {
            Box::pin(async move { inner.list_children(&path).await })
        })
        .await
    }

    async fn delete_recursive(&self, path: &str) -> NetcfgResult<()> {
        self.call("delete_recursive", path, |inner, path| {
            Box::pin(async move { inner.delete_recursive(&path).await })
        })
        .await
    }

    async fn reconnect(&self) -> NetcfgResult<()> {
        self.inner.reconnect().await
    }
}
