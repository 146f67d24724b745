use super::counter::{CounterAllocator, ScopeKey};
use super::index::{AllocatorSettings, AllocatorSpec, IndexAllocator};
use crate::coordination::{dir_prefix, CoordinationClient};
use crate::error::NetcfgResult;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const VN_ID_ALLOC_PATH: &str = "/id/virtual-networks/";
pub const VN_ID_MIN: u64 = 1;
pub const VN_ID_SPACE: u64 = 1 << 24;

pub const SG_ID_ALLOC_PATH: &str = "/id/security-groups/id/";
pub const SG_ID_MIN: u64 = 8_000_000;
pub const SG_ID_SPACE: u64 = (1 << 32) - SG_ID_MIN;
pub const SG_ID_RESERVED_OWNER: &str = "__reserved__";

pub const TAG_TYPE_ID_ALLOC_PATH: &str = "/id/tags/types/";
/// Type codes below this are assigned statically
pub const TAG_TYPE_RESERVED: u64 = 255;
pub const TAG_TYPE_MAX_ID: u64 = 0xffff;

pub const TAG_VALUE_ID_ALLOC_PATH: &str = "/id/tags/values/";
pub const TAG_VALUE_SPACE: u64 = 0xffff;

pub const SUBNET_ALLOC_PATH: &str = "/api-server/subnets/";

/// Scarce integer families with a fixed allocator path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdFamily {
    VirtualNetwork,
    SecurityGroup,
    TagType,
}

impl IdFamily {
    pub fn spec(&self) -> AllocatorSpec {
        match self {
            IdFamily::VirtualNetwork => {
                AllocatorSpec::new(VN_ID_ALLOC_PATH, VN_ID_SPACE - VN_ID_MIN, VN_ID_MIN)
            }
            IdFamily::SecurityGroup => AllocatorSpec::new(SG_ID_ALLOC_PATH, SG_ID_SPACE, SG_ID_MIN),
            IdFamily::TagType => AllocatorSpec::new(
                TAG_TYPE_ID_ALLOC_PATH,
                TAG_TYPE_MAX_ID - TAG_TYPE_RESERVED,
                TAG_TYPE_RESERVED,
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IdFamily::VirtualNetwork => "virtual-network id",
            IdFamily::SecurityGroup => "security-group id",
            IdFamily::TagType => "tag-type id",
        }
    }
}

/// Process-wide owner of every allocator
///
/// Allocators are created on first use and cached by path, so hook code
/// reaching for the same path shares one bitmap. Built once by the
/// control plane and handed to hooks by reference.
pub struct AllocatorRegistry {
    client: Arc<dyn CoordinationClient>,
    settings: AllocatorSettings,
    allocators: DashMap<String, Arc<IndexAllocator>>,
    tag_values: CounterAllocator,
}

impl AllocatorRegistry {
    pub fn new(client: Arc<dyn CoordinationClient>, settings: AllocatorSettings) -> Self {
        let tag_values = CounterAllocator::new(
            client.clone(),
            TAG_VALUE_ID_ALLOC_PATH,
            TAG_VALUE_SPACE,
            0,
            settings.clone(),
        );
        Self {
            client,
            settings,
            allocators: DashMap::new(),
            tag_values,
        }
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn settings(&self) -> &AllocatorSettings {
        &self.settings
    }

    /// Open the fixed families and claim reserved indices
    pub async fn initialize(&self) -> NetcfgResult<()> {
        for family in [IdFamily::VirtualNetwork, IdFamily::SecurityGroup, IdFamily::TagType] {
            self.family(family).await?;
        }

        let sg = self.family(IdFamily::SecurityGroup).await?;
        match sg.read(SG_ID_MIN).await?.as_deref() {
            Some(SG_ID_RESERVED_OWNER) => {}
            Some(other) => {
                warn!(
                    "Security-group id {} held by '{}', reclaiming as reserved",
                    SG_ID_MIN, other
                );
                sg.delete(SG_ID_MIN).await?;
                sg.reserve(SG_ID_MIN, SG_ID_RESERVED_OWNER).await?;
            }
            None => {
                sg.reserve(SG_ID_MIN, SG_ID_RESERVED_OWNER).await?;
            }
        }

        info!("Allocator registry initialized");
        Ok(())
    }

    /// Allocator for `spec`, created and cached on first use
    pub async fn allocator(&self, spec: AllocatorSpec) -> NetcfgResult<Arc<IndexAllocator>> {
        if let Some(existing) = self.allocators.get(&spec.path) {
            return Ok(existing.clone());
        }
        let path = spec.path.clone();
        let created =
            Arc::new(IndexAllocator::new(self.client.clone(), spec, self.settings.clone()).await?);
        Ok(self.allocators.entry(path).or_insert(created).clone())
    }

    pub async fn family(&self, family: IdFamily) -> NetcfgResult<Arc<IndexAllocator>> {
        self.allocator(family.spec()).await
    }

    /// Delete an allocator namespace and drop it from the cache
    pub async fn forget(&self, path: &str) -> NetcfgResult<()> {
        IndexAllocator::delete_all(self.client.as_ref(), path).await?;
        self.allocators.remove(&dir_prefix(path));
        Ok(())
    }

    pub fn cached_allocators(&self) -> usize {
        self.allocators.len()
    }

    pub async fn alloc_id(&self, family: IdFamily, owner: &str) -> NetcfgResult<u64> {
        self.family(family).await?.alloc(owner).await
    }

    pub async fn reserve_id(&self, family: IdFamily, id: u64, owner: &str) -> NetcfgResult<Option<u64>> {
        self.family(family).await?.reserve(id, owner).await
    }

    pub async fn free_id(&self, family: IdFamily, id: u64, owner: &str) -> NetcfgResult<bool> {
        self.family(family).await?.delete_if_owner(id, owner).await
    }

    pub async fn id_owner(&self, family: IdFamily, id: u64) -> NetcfgResult<Option<String>> {
        self.family(family).await?.read(id).await
    }

    /// Replica path: mark an id allocated by another instance
    pub async fn lock_id(&self, family: IdFamily, id: u64) -> NetcfgResult<()> {
        self.family(family).await?.set_in_use(id);
        Ok(())
    }

    pub async fn unlock_id(&self, family: IdFamily, id: u64) -> NetcfgResult<()> {
        self.family(family).await?.reset_in_use(id);
        Ok(())
    }

    /// Scoped tag-value sequences
    pub fn tag_values(&self) -> &CounterAllocator {
        &self.tag_values
    }

    pub async fn alloc_tag_value_id(&self, scope: &ScopeKey, owner: &str) -> NetcfgResult<u64> {
        self.tag_values.alloc_value(scope, owner).await
    }

    pub async fn free_tag_value_id(&self, scope: &ScopeKey, seq: u64, owner: &str) -> NetcfgResult<bool> {
        self.tag_values.free_value(scope, seq, owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;

    fn registry(zk: Arc<MemoryCoordinator>) -> AllocatorRegistry {
        AllocatorRegistry::new(zk, AllocatorSettings::default())
    }

    #[tokio::test]
    async fn test_allocators_are_cached_by_path() {
        let zk = Arc::new(MemoryCoordinator::new());
        let registry = registry(zk);
        let a = registry.allocator(AllocatorSpec::new("/x", 4, 0)).await.unwrap();
        let b = registry.allocator(AllocatorSpec::new("/x/", 4, 0)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cached_allocators(), 1);
    }

    #[tokio::test]
    async fn test_family_ranges() {
        let zk = Arc::new(MemoryCoordinator::new());
        let registry = registry(zk);
        registry.initialize().await.unwrap();

        assert_eq!(registry.alloc_id(IdFamily::VirtualNetwork, "vn").await.unwrap(), 1);
        assert_eq!(registry.alloc_id(IdFamily::TagType, "color").await.unwrap(), 255);
        assert_eq!(
            registry.alloc_id(IdFamily::SecurityGroup, "sg").await.unwrap(),
            SG_ID_MIN + 1
        );
        assert_eq!(
            registry.id_owner(IdFamily::SecurityGroup, SG_ID_MIN).await.unwrap().as_deref(),
            Some(SG_ID_RESERVED_OWNER)
        );
    }

    #[tokio::test]
    async fn test_initialize_is_repeatable() {
        let zk = Arc::new(MemoryCoordinator::new());
        registry(zk.clone()).initialize().await.unwrap();
        let second = registry(zk);
        second.initialize().await.unwrap();
        assert_eq!(
            second.alloc_id(IdFamily::SecurityGroup, "sg").await.unwrap(),
            SG_ID_MIN + 1
        );
    }

    #[tokio::test]
    async fn test_free_id_checks_owner() {
        let zk = Arc::new(MemoryCoordinator::new());
        let registry = registry(zk);
        let id = registry.alloc_id(IdFamily::VirtualNetwork, "a:b:c").await.unwrap();
        assert!(!registry.free_id(IdFamily::VirtualNetwork, id, "a:b:d").await.unwrap());
        assert!(registry.free_id(IdFamily::VirtualNetwork, id, "a:b:c").await.unwrap());
    }

    #[tokio::test]
    async fn test_forget_drops_namespace() {
        let zk = Arc::new(MemoryCoordinator::new());
        let registry = registry(zk.clone());
        let alloc = registry
            .allocator(AllocatorSpec::new("/api-server/subnets/vn:10.0.0.0_24", 254, 1))
            .await
            .unwrap();
        alloc.alloc("ip").await.unwrap();
        registry.forget("/api-server/subnets/vn:10.0.0.0_24").await.unwrap();
        assert_eq!(zk.node_count(), 0);
        assert_eq!(registry.cached_allocators(), 0);
    }
}
