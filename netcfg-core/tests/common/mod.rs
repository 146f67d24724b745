// Common test utilities and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use netcfg_core::{
    config::Config,
    coordination::CoordinationClient,
    error::{NetcfgError, NetcfgResult},
    notify::{BroadcastBus, ChangeEvent, NotificationBus},
    store::{ListFilter, MemoryObjectStore, ObjectStore},
    ControlPlane, Resource, ResourceType,
};
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default configuration with a fixed instance id
pub fn test_config(instance_id: &str) -> Config {
    let mut config = Config::default();
    config.node.instance_id = instance_id.to_string();
    config.coordination.session_retry_base_delay = Duration::from_millis(1);
    config.coordination.session_retry_max_delay = Duration::from_millis(5);
    config
}

/// Object store that fails the next create of a chosen type
///
/// Everything else is delegated to an in-memory store.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryObjectStore,
    fail_next_create: Mutex<Option<ResourceType>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self, resource_type: ResourceType) {
        *self.fail_next_create.lock() = Some(resource_type);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn read(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<Resource> {
        self.inner.read(resource_type, uuid).await
    }

    async fn fq_name_to_uuid(
        &self,
        resource_type: ResourceType,
        fq_name: &[String],
    ) -> NetcfgResult<Option<Uuid>> {
        self.inner.fq_name_to_uuid(resource_type, fq_name).await
    }

    async fn create(&self, resource: &Resource) -> NetcfgResult<Uuid> {
        let fail = {
            let mut armed = self.fail_next_create.lock();
            if *armed == Some(resource.resource_type) {
                armed.take();
                true
            } else {
                false
            }
        };
        if fail {
            return Err(NetcfgError::storage(
                "create",
                std::io::Error::new(std::io::ErrorKind::Other, "injected store failure"),
            ));
        }
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &Resource) -> NetcfgResult<()> {
        self.inner.update(resource).await
    }

    async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<()> {
        self.inner.delete(resource_type, uuid).await
    }

    async fn list(&self, resource_type: ResourceType, filter: &ListFilter) -> NetcfgResult<Vec<Resource>> {
        self.inner.list(resource_type, filter).await
    }
}

/// Bus whose publish always fails; subscribers never see anything
pub struct FailingBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl FailingBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }
}

#[async_trait]
impl NotificationBus for FailingBus {
    async fn publish(&self, _event: ChangeEvent) -> NetcfgResult<()> {
        Err(NetcfgError::temporary("message bus unavailable"))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

/// A control plane over shared collaborators, like one replica of a cluster
pub async fn replica(
    instance_id: &str,
    coordinator: Arc<dyn CoordinationClient>,
    store: Arc<dyn ObjectStore>,
    bus: Arc<BroadcastBus>,
) -> ControlPlane {
    ControlPlane::builder(test_config(instance_id))
        .with_coordinator(coordinator)
        .with_store(store)
        .with_bus(bus)
        .build()
        .await
        .unwrap()
}

/// Create `default-domain:<project>` and return the project's fq name
pub async fn create_project(plane: &ControlPlane, project: &str) -> Vec<String> {
    let domain = vec!["default-domain".to_string()];
    if plane
        .store()
        .fq_name_to_uuid(ResourceType::Domain, &domain)
        .await
        .unwrap()
        .is_none()
    {
        plane
            .create(Resource::new(ResourceType::Domain, domain.clone()))
            .await
            .unwrap();
    }
    let fq_name = vec!["default-domain".to_string(), project.to_string()];
    plane
        .create(Resource::new(ResourceType::Project, fq_name.clone()).with_parent(ResourceType::Domain))
        .await
        .unwrap();
    fq_name
}

/// Subnet entry as a client would send it
pub fn subnet(prefix: &str, subnet_uuid: &str) -> serde_json::Value {
    json!({ "prefix": prefix, "subnet_uuid": subnet_uuid })
}

/// Create a virtual network under `project` with the given subnets
pub async fn create_network(
    plane: &ControlPlane,
    project: &[String],
    name: &str,
    subnets: Vec<serde_json::Value>,
) -> Resource {
    let mut fq_name = project.to_vec();
    fq_name.push(name.to_string());
    plane
        .create(
            Resource::new(ResourceType::VirtualNetwork, fq_name)
                .with_parent(ResourceType::Project)
                .with_field("subnets", serde_json::Value::Array(subnets)),
        )
        .await
        .unwrap()
        .resource
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
