//! Resource-type hooks and the registry that resolves them

use crate::allocator::AllocatorRegistry;
use crate::config::PolicyConfig;
use crate::error::NetcfgResult;
use crate::ipam::AddressManager;
use crate::metrics::MetricsRegistry;
use crate::resource::{Resource, ResourceType, ResourceUpdate};
use crate::store::ObjectStore;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Collaborators a hook may use
///
/// Everything is shared behind `Arc` so undo actions can hold clones past
/// the lifetime of the hook call.
#[derive(Clone)]
pub struct HookEnv {
    pub store: Arc<dyn ObjectStore>,
    pub allocators: Arc<AllocatorRegistry>,
    pub addresses: Arc<AddressManager>,
    pub policy: PolicyConfig,
    pub metrics: MetricsRegistry,
}

/// Per-type behaviour around a mutation
///
/// Every method defaults to a pass-through, so a type only overrides what
/// it needs. Pre hooks may reject the mutation and must push an undo for
/// every side effect they perform. Post hooks run after the commit; their
/// errors become warnings.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    /// Whether a create whose name is taken may be retried under a
    /// suffixed name. Types whose name carries meaning opt out.
    fn allow_name_retry(&self) -> bool {
        true
    }

    /// Derive names or display fields before anything durable happens
    fn pre_alloc(&self, _resource: &mut Resource) -> NetcfgResult<()> {
        Ok(())
    }

    async fn pre_create(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        _resource: &mut Resource,
    ) -> NetcfgResult<()> {
        Ok(())
    }

    async fn post_create(&self, _env: &HookEnv, _resource: &Resource) -> NetcfgResult<()> {
        Ok(())
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        _current: &Resource,
        _update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        Ok(())
    }

    async fn post_update(
        &self,
        _env: &HookEnv,
        _previous: &Resource,
        _resource: &Resource,
    ) -> NetcfgResult<()> {
        Ok(())
    }

    async fn pre_delete(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        _resource: &Resource,
    ) -> NetcfgResult<()> {
        Ok(())
    }

    async fn post_delete(&self, _env: &HookEnv, _resource: &Resource) -> NetcfgResult<()> {
        Ok(())
    }

    /// Another instance created `resource`; mirror its allocations locally
    async fn on_create_notification(&self, _env: &HookEnv, _resource: &Resource) -> NetcfgResult<()> {
        Ok(())
    }

    /// Another instance deleted `resource`
    async fn on_delete_notification(&self, _env: &HookEnv, _resource: &Resource) -> NetcfgResult<()> {
        Ok(())
    }
}

/// Hooks for types with no special behaviour
pub struct PassThrough;

impl ResourceHooks for PassThrough {}

/// Maps each resource type to its hooks, built once at startup
#[derive(Clone)]
pub struct HookRegistry {
    hooks: HashMap<ResourceType, Arc<dyn ResourceHooks>>,
    default: Arc<dyn ResourceHooks>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            default: Arc::new(PassThrough),
        }
    }

    pub fn register(&mut self, resource_type: ResourceType, hooks: Arc<dyn ResourceHooks>) -> &mut Self {
        self.hooks.insert(resource_type, hooks);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Arc<dyn ResourceHooks> {
        self.hooks
            .get(&resource_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn has_hooks(&self, resource_type: ResourceType) -> bool {
        self.hooks.contains_key(&resource_type)
    }
}
