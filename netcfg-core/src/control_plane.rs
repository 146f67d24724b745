//! Process-wide startup context
//!
//! Wires configuration, the coordination client, the allocator registry,
//! address management, the object store, the notification bus, the hook
//! registry and the mutation pipeline, and runs the listener that applies
//! change events from other instances.

use crate::allocator::{AllocatorRegistry, AllocatorSettings};
use crate::audit::{audit_all, clean_stale, IdAuditReport};
use crate::config::{BackendKind, Config};
use crate::coordination::{CoordinationClient, MemoryCoordinator, RedbCoordinator, ResilientCoordinator};
use crate::error::NetcfgResult;
use crate::ipam::AddressManager;
use crate::metrics::{names, MetricsRegistry};
use crate::notify::{BroadcastBus, ChangeEvent, ChangeOperation, NotificationBus};
use crate::patterns::RetryConfig;
use crate::pipeline::{HookEnv, HookRegistry, MutationOutcome, MutationPipeline};
use crate::resource::{Resource, ResourceType, ResourceUpdate};
use crate::resources::{default_hooks, PREDEFINED_TAG_TYPES};
use crate::store::{MemoryObjectStore, ObjectStore, RedbObjectStore};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builder for a [`ControlPlane`]; unset collaborators come from the config
pub struct ControlPlaneBuilder {
    config: Config,
    coordinator: Option<Arc<dyn CoordinationClient>>,
    store: Option<Arc<dyn ObjectStore>>,
    bus: Option<Arc<dyn NotificationBus>>,
    hooks: Option<HookRegistry>,
    metrics: Option<MetricsRegistry>,
}

impl ControlPlaneBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            coordinator: None,
            store: None,
            bus: None,
            hooks: None,
            metrics: None,
        }
    }

    /// Raw coordination client; it is still wrapped for session retry
    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinationClient>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> NetcfgResult<ControlPlane> {
        let config = self.config;
        config.validate()?;
        let metrics = self.metrics.unwrap_or_default();

        let raw_coordinator: Arc<dyn CoordinationClient> = match self.coordinator {
            Some(coordinator) => coordinator,
            None => match config.coordination.backend {
                BackendKind::Memory => Arc::new(MemoryCoordinator::new()),
                BackendKind::Redb => Arc::new(RedbCoordinator::open(config.coordination_db_path())?),
            },
        };
        let retry = RetryConfig::for_coordination(
            "coordination",
            config.coordination.session_retry_attempts,
            config.coordination.session_retry_base_delay,
            config.coordination.session_retry_max_delay,
        );
        let coordinator: Arc<dyn CoordinationClient> =
            Arc::new(ResilientCoordinator::new(raw_coordinator, retry, metrics.clone()));

        let allocators = Arc::new(AllocatorRegistry::new(
            coordinator.clone(),
            AllocatorSettings {
                max_conflict_retries: config.allocator.max_conflict_retries,
                metrics: metrics.clone(),
            },
        ));
        allocators.initialize().await?;

        let store: Arc<dyn ObjectStore> = match self.store {
            Some(store) => store,
            None => match config.store.backend {
                BackendKind::Memory => Arc::new(MemoryObjectStore::new()),
                BackendKind::Redb => Arc::new(RedbObjectStore::open(config.store_db_path())?),
            },
        };
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(BroadcastBus::new(config.pipeline.notification_capacity)));

        let env = HookEnv {
            store,
            addresses: Arc::new(AddressManager::new(allocators.clone())),
            allocators,
            policy: config.policy.clone(),
            metrics: metrics.clone(),
        };
        let pipeline = Arc::new(MutationPipeline::new(
            env,
            self.hooks.unwrap_or_else(default_hooks),
            bus.clone(),
            config.pipeline.clone(),
            config.node.instance_id.clone(),
        ));

        // Subscribe before any mutation so no event of ours is missed
        let events = bus.subscribe();
        let listener = tokio::spawn(run_listener(pipeline.clone(), events));

        let control_plane = ControlPlane {
            config: Arc::new(config),
            pipeline,
            coordinator,
            metrics,
            listener: Some(listener),
        };
        control_plane.ensure_predefined_tag_types().await?;

        info!(
            "Control plane {} started",
            control_plane.config.node.instance_id
        );
        Ok(control_plane)
    }
}

/// One control-plane instance
pub struct ControlPlane {
    config: Arc<Config>,
    pipeline: Arc<MutationPipeline>,
    coordinator: Arc<dyn CoordinationClient>,
    metrics: MetricsRegistry,
    listener: Option<JoinHandle<()>>,
}

impl ControlPlane {
    pub fn builder(config: Config) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config)
    }

    pub async fn start(config: Config) -> NetcfgResult<Self> {
        ControlPlaneBuilder::new(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.config.node.instance_id
    }

    pub fn pipeline(&self) -> &Arc<MutationPipeline> {
        &self.pipeline
    }

    pub fn allocators(&self) -> &Arc<AllocatorRegistry> {
        &self.pipeline.env().allocators
    }

    pub fn addresses(&self) -> &Arc<AddressManager> {
        &self.pipeline.env().addresses
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.pipeline.env().store
    }

    /// The session-retrying coordination client
    pub fn coordinator(&self) -> &Arc<dyn CoordinationClient> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub async fn create(&self, resource: Resource) -> NetcfgResult<MutationOutcome> {
        self.pipeline.create(resource).await
    }

    pub async fn update(
        &self,
        resource_type: ResourceType,
        uuid: Uuid,
        update: ResourceUpdate,
    ) -> NetcfgResult<MutationOutcome> {
        self.pipeline.update(resource_type, uuid, update).await
    }

    pub async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<MutationOutcome> {
        self.pipeline.delete(resource_type, uuid).await
    }

    /// Audit every id family, optionally deleting stale nodes
    pub async fn audit(&self, clean: bool) -> NetcfgResult<Vec<IdAuditReport>> {
        let registry = self.allocators();
        let reports = audit_all(registry, self.store().as_ref()).await?;
        if clean {
            for report in &reports {
                clean_stale(registry, report).await?;
            }
        }
        Ok(reports)
    }

    /// Stop the notification listener
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            info!("Control plane {} stopped", self.config.node.instance_id);
        }
    }

    /// Stop the listener and wait for it to release its collaborators
    ///
    /// Required before reopening the same redb files in this process.
    pub async fn close(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
            info!("Control plane {} closed", self.config.node.instance_id);
        }
    }

    async fn ensure_predefined_tag_types(&self) -> NetcfgResult<()> {
        for (name, _) in PREDEFINED_TAG_TYPES {
            let fq_name = vec![name.to_string()];
            if self
                .store()
                .fq_name_to_uuid(ResourceType::TagType, &fq_name)
                .await?
                .is_some()
            {
                continue;
            }
            match self.create(Resource::new(ResourceType::TagType, fq_name)).await {
                Ok(_) => debug!("Created predefined tag type {}", name),
                // another instance created it first
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_listener(pipeline: Arc<MutationPipeline>, mut events: broadcast::Receiver<ChangeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = apply_notification(&pipeline, &event).await {
                    warn!(
                        "Failed to apply {} of {} {} from {}: {}",
                        event.operation,
                        event.resource_type(),
                        event.resource.fq_name_str(),
                        event.origin,
                        e
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Notification listener lagged, {} events skipped", skipped);
                pipeline
                    .env()
                    .metrics
                    .increment_counter_by(names::NOTIFICATIONS_LAGGED, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Notification listener exited");
}

/// Mirror another instance's allocations in the local bitmaps
///
/// Returns whether the event was applied; events from this instance and
/// updates are ignored.
pub async fn apply_notification(pipeline: &MutationPipeline, event: &ChangeEvent) -> NetcfgResult<bool> {
    if event.origin == pipeline.origin() {
        return Ok(false);
    }
    let hooks = pipeline.hooks().get(event.resource_type());
    match event.operation {
        ChangeOperation::Create => hooks.on_create_notification(pipeline.env(), &event.resource).await?,
        ChangeOperation::Delete => hooks.on_delete_notification(pipeline.env(), &event.resource).await?,
        ChangeOperation::Update => return Ok(false),
    }
    pipeline
        .env()
        .metrics
        .increment_counter(names::NOTIFICATIONS_APPLIED);
    debug!(
        "Applied {} of {} from {}",
        event.operation,
        event.resource.fq_name_str(),
        event.origin
    );
    Ok(true)
}
