use super::bitmap::Bitmap;
use crate::coordination::{dir_prefix, index_node_name, CoordinationClient};
use crate::error::{NetcfgError, NetcfgResult};
use crate::metrics::{names, MetricsRegistry};
use crate::observability::allocator_span;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

/// Where an allocator lives and which integers it hands out
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatorSpec {
    pub path: String,
    pub size: u64,
    pub start: u64,
    pub reverse: bool,
}

impl AllocatorSpec {
    pub fn new(path: impl AsRef<str>, size: u64, start: u64) -> Self {
        Self {
            path: dir_prefix(path.as_ref()),
            size,
            start,
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Externally visible index for a zero-based offset
    pub fn to_index(&self, offset: u64) -> u64 {
        if self.reverse {
            self.start + self.size - offset
        } else {
            self.start + offset
        }
    }

    /// Offset for an index, if it lies in `start..=start + size`
    pub fn to_offset(&self, index: u64) -> Option<u64> {
        let end = self.start.checked_add(self.size)?;
        if index < self.start || index > end {
            return None;
        }
        if self.reverse {
            Some(end - index)
        } else {
            Some(index - self.start)
        }
    }
}

/// Knobs shared by every allocator of a control-plane instance
#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    pub max_conflict_retries: u32,
    pub metrics: MetricsRegistry,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            max_conflict_retries: 4096,
            metrics: MetricsRegistry::new(),
        }
    }
}

/// Allocates small integers from a bounded range
///
/// Every in-use index is a coordination node named
/// `path + format!("{:010}", index)` whose value records the owner. The
/// local bitmap is only a hint for where to look; uniqueness comes from the
/// conditional create, so any number of instances (in any number of
/// processes) may share a path.
pub struct IndexAllocator {
    client: Arc<dyn CoordinationClient>,
    spec: AllocatorSpec,
    in_use: Mutex<Bitmap>,
    settings: AllocatorSettings,
}

impl std::fmt::Debug for IndexAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexAllocator")
            .field("spec", &self.spec)
            .field("in_use", &self.in_use.lock().count_ones())
            .finish()
    }
}

impl IndexAllocator {
    /// Open an allocator and rebuild its bitmap from the nodes under `path`
    pub async fn new(
        client: Arc<dyn CoordinationClient>,
        spec: AllocatorSpec,
        settings: AllocatorSettings,
    ) -> NetcfgResult<Self> {
        let children = client.list_children(&spec.path).await?;
        let mut bitmap = Bitmap::new();
        for child in children {
            let Ok(index) = child.parse::<u64>() else {
                // nested allocator namespaces share the parent path
                continue;
            };
            match spec.to_offset(index) {
                Some(offset) => bitmap.set(offset),
                None => warn!(
                    "Ignoring allocation {} under {}: outside {}..={}",
                    index,
                    spec.path,
                    spec.start,
                    spec.start + spec.size
                ),
            }
        }
        debug!(
            "Allocator {} recovered {} in-use indices",
            spec.path,
            bitmap.count_ones()
        );

        Ok(Self {
            client,
            spec,
            in_use: Mutex::new(bitmap),
            settings,
        })
    }

    pub fn spec(&self) -> &AllocatorSpec {
        &self.spec
    }

    pub fn path(&self) -> &str {
        &self.spec.path
    }

    fn node_path(&self, index: u64) -> String {
        format!("{}{}", self.spec.path, index_node_name(index))
    }

    /// Allocate the lowest free index and record `value` as its owner
    pub async fn alloc(&self, value: &str) -> NetcfgResult<u64> {
        let span = allocator_span("alloc", &self.spec.path);
        async {
            for _ in 0..=self.settings.max_conflict_retries {
                let offset = {
                    let mut bitmap = self.in_use.lock();
                    let offset = bitmap.first_clear();
                    if offset >= self.spec.size {
                        self.settings.metrics.increment_counter(names::ALLOC_EXHAUSTED);
                        return Err(NetcfgError::exhausted(format!(
                            "allocator {} (size {})",
                            self.spec.path, self.spec.size
                        )));
                    }
                    bitmap.set(offset);
                    offset
                };

                let index = self.spec.to_index(offset);
                match self.client.create_node(&self.node_path(index), value).await {
                    Ok(()) => {
                        tracing::Span::current().record("index", index);
                        self.settings.metrics.increment_counter(names::ALLOC_TOTAL);
                        return Ok(index);
                    }
                    Err(e) if e.is_already_exists() => {
                        // Another instance holds it; the bit stays set.
                        debug!("Index {} under {} taken concurrently", index, self.spec.path);
                        self.settings
                            .metrics
                            .increment_counter(names::ALLOC_CONFLICT_RETRIES);
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        self.in_use.lock().clear(offset);
                        return Err(e);
                    }
                }
            }

            Err(NetcfgError::conflict(
                self.spec.path.clone(),
                format!(
                    "gave up after {} allocation conflicts",
                    self.settings.max_conflict_retries
                ),
            ))
        }
        .instrument(span)
        .await
    }

    /// Claim a caller-chosen index
    ///
    /// Returns `None` when the index is outside the range or already taken.
    pub async fn reserve(&self, index: u64, value: &str) -> NetcfgResult<Option<u64>> {
        let Some(offset) = self.spec.to_offset(index) else {
            return Ok(None);
        };

        match self.client.create_node(&self.node_path(index), value).await {
            Ok(()) => {
                self.in_use.lock().set(offset);
                self.settings.metrics.increment_counter(names::ALLOC_RESERVED);
                Ok(Some(index))
            }
            Err(e) if e.is_already_exists() => {
                self.in_use.lock().set(offset);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release an index; releasing a free index is a no-op
    pub async fn delete(&self, index: u64) -> NetcfgResult<()> {
        self.client.delete_node(&self.node_path(index)).await?;
        if let Some(offset) = self.spec.to_offset(index) {
            self.in_use.lock().clear(offset);
        }
        self.settings.metrics.increment_counter(names::ALLOC_FREED);
        Ok(())
    }

    /// Release an index only while it is still recorded for `owner`
    ///
    /// Returns whether a node was deleted. An absent node counts as released.
    pub async fn delete_if_owner(&self, index: u64, owner: &str) -> NetcfgResult<bool> {
        match self.read(index).await? {
            Some(current) if current == owner => {
                self.delete(index).await?;
                Ok(true)
            }
            Some(current) => {
                warn!(
                    "Not freeing {} under {}: owned by '{}', expected '{}'",
                    index, self.spec.path, current, owner
                );
                self.settings.metrics.increment_counter(names::ALLOC_FREE_SKIPPED);
                Ok(false)
            }
            None => {
                self.reset_in_use(index);
                Ok(false)
            }
        }
    }

    /// Owner recorded for `index`
    pub async fn read(&self, index: u64) -> NetcfgResult<Option<String>> {
        self.client.read_node(&self.node_path(index)).await
    }

    pub fn empty(&self) -> bool {
        !self.in_use.lock().any()
    }

    /// Mark an index allocated elsewhere without touching the coordination service
    pub fn set_in_use(&self, index: u64) {
        if let Some(offset) = self.spec.to_offset(index) {
            self.in_use.lock().set(offset);
        }
    }

    pub fn reset_in_use(&self, index: u64) {
        if let Some(offset) = self.spec.to_offset(index) {
            self.in_use.lock().clear(offset);
        }
    }

    pub fn is_in_use(&self, index: u64) -> bool {
        self.spec
            .to_offset(index)
            .map(|offset| self.in_use.lock().is_set(offset))
            .unwrap_or(false)
    }

    /// Indices currently marked in the local bitmap, ascending by offset
    pub fn in_use(&self) -> Vec<u64> {
        let bitmap = self.in_use.lock();
        bitmap.iter_ones().map(|o| self.spec.to_index(o)).collect()
    }

    /// Every allocation recorded in the coordination service with its owner
    pub async fn allocations(&self) -> NetcfgResult<Vec<(u64, String)>> {
        let mut out = Vec::new();
        for child in self.client.list_children(&self.spec.path).await? {
            let Ok(index) = child.parse::<u64>() else {
                continue;
            };
            if let Some(owner) = self.read(index).await? {
                out.push((index, owner));
            }
        }
        Ok(out)
    }

    /// Remove every node of the allocator namespace at `path`
    pub async fn delete_all(client: &dyn CoordinationClient, path: &str) -> NetcfgResult<()> {
        client.delete_recursive(&dir_prefix(path)).await
    }
}
