use super::index::{AllocatorSettings, AllocatorSpec, IndexAllocator};
use crate::coordination::{dir_prefix, CoordinationClient};
use crate::error::NetcfgResult;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Partition key of a [`CounterAllocator`]
///
/// Persisted on the owning resource at allocation time so that the free
/// uses exactly the same namespace even if ancestors are renamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Scope derived from a qualified name, e.g. `default-domain:proj1`
    pub fn from_fq_name<S: AsRef<str>>(fq_name: &[S]) -> Self {
        Self(
            fq_name
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Node-safe form: `/` and `%` are percent-escaped
    fn node_segment(&self) -> String {
        self.0.replace('%', "%25").replace('/', "%2F")
    }

    /// Inverse of the node-safe form, for scopes found by listing
    pub fn from_node_segment(segment: &str) -> Self {
        Self(segment.replace("%2F", "/").replace("%25", "%"))
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One independent sequence per [`ScopeKey`]
///
/// Each scope is an [`IndexAllocator`] at `base/<scope>/`, created on first
/// use and cached for the life of the counter.
pub struct CounterAllocator {
    client: Arc<dyn CoordinationClient>,
    base_path: String,
    size: u64,
    start: u64,
    settings: AllocatorSettings,
    scopes: DashMap<ScopeKey, Arc<IndexAllocator>>,
}

impl CounterAllocator {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        base_path: &str,
        size: u64,
        start: u64,
        settings: AllocatorSettings,
    ) -> Self {
        Self {
            client,
            base_path: dir_prefix(base_path),
            size,
            start,
            settings,
            scopes: DashMap::new(),
        }
    }

    pub fn scope_path(&self, scope: &ScopeKey) -> String {
        format!("{}{}/", self.base_path, scope.node_segment())
    }

    async fn scope(&self, scope: &ScopeKey) -> NetcfgResult<Arc<IndexAllocator>> {
        if let Some(existing) = self.scopes.get(scope) {
            return Ok(existing.clone());
        }

        let spec = AllocatorSpec::new(self.scope_path(scope), self.size, self.start);
        let created = Arc::new(
            IndexAllocator::new(self.client.clone(), spec, self.settings.clone()).await?,
        );
        // A racing first use may have inserted already; either copy is
        // rebuilt from the same nodes.
        let allocator = self.scopes.entry(scope.clone()).or_insert(created).clone();
        debug!("Opened counter scope {}", allocator.path());
        Ok(allocator)
    }

    pub async fn alloc_value(&self, scope: &ScopeKey, owner: &str) -> NetcfgResult<u64> {
        self.scope(scope).await?.alloc(owner).await
    }

    pub async fn reserve_value(
        &self,
        scope: &ScopeKey,
        seq: u64,
        owner: &str,
    ) -> NetcfgResult<Option<u64>> {
        self.scope(scope).await?.reserve(seq, owner).await
    }

    /// Free `seq` if it is still recorded for `owner`
    pub async fn free_value(&self, scope: &ScopeKey, seq: u64, owner: &str) -> NetcfgResult<bool> {
        self.scope(scope).await?.delete_if_owner(seq, owner).await
    }

    pub async fn read_value(&self, scope: &ScopeKey, seq: u64) -> NetcfgResult<Option<String>> {
        self.scope(scope).await?.read(seq).await
    }

    pub async fn lock_value(&self, scope: &ScopeKey, seq: u64) -> NetcfgResult<()> {
        self.scope(scope).await?.set_in_use(seq);
        Ok(())
    }

    pub async fn unlock_value(&self, scope: &ScopeKey, seq: u64) -> NetcfgResult<()> {
        self.scope(scope).await?.reset_in_use(seq);
        Ok(())
    }

    pub async fn allocations(&self, scope: &ScopeKey) -> NetcfgResult<Vec<(u64, String)>> {
        self.scope(scope).await?.allocations().await
    }

    /// Delete a whole scope namespace and forget its cached allocator
    pub async fn drop_scope(&self, scope: &ScopeKey) -> NetcfgResult<()> {
        IndexAllocator::delete_all(self.client.as_ref(), &self.scope_path(scope)).await?;
        self.scopes.remove(scope);
        Ok(())
    }

    pub fn cached_scopes(&self) -> usize {
        self.scopes.len()
    }
}
