//! Object-store seam
//!
//! The pipeline only relies on this contract: reads by uuid or name, a
//! create that distinguishes "already exists", update, delete and list.

mod memory;
mod redb_backend;

pub use self::memory::MemoryObjectStore;
pub use self::redb_backend::RedbObjectStore;

use crate::error::NetcfgResult;
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Equality filters for [`ObjectStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub parent_uuid: Option<Uuid>,
    pub field_equals: Vec<(String, Value)>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parent(uuid: Uuid) -> Self {
        Self {
            parent_uuid: Some(uuid),
            ..Default::default()
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.field_equals.push((key.to_string(), value.into()));
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(parent) = self.parent_uuid {
            if resource.parent_uuid != Some(parent) {
                return false;
            }
        }
        self.field_equals
            .iter()
            .all(|(k, v)| resource.fields.get(k) == Some(v))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read by uuid; `NotFound` if absent
    async fn read(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<Resource>;

    async fn fq_name_to_uuid(
        &self,
        resource_type: ResourceType,
        fq_name: &[String],
    ) -> NetcfgResult<Option<Uuid>>;

    /// Persist a new resource; `AlreadyExists` if its name or uuid is taken
    async fn create(&self, resource: &Resource) -> NetcfgResult<Uuid>;

    /// Overwrite an existing resource; `NotFound` if absent
    async fn update(&self, resource: &Resource) -> NetcfgResult<()>;

    /// Remove a resource; `NotFound` if absent
    async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<()>;

    async fn list(&self, resource_type: ResourceType, filter: &ListFilter) -> NetcfgResult<Vec<Resource>>;

    async fn read_by_name(
        &self,
        resource_type: ResourceType,
        fq_name: &[String],
    ) -> NetcfgResult<Option<Resource>> {
        match self.fq_name_to_uuid(resource_type, fq_name).await? {
            Some(uuid) => Ok(Some(self.read(resource_type, uuid).await?)),
            None => Ok(None),
        }
    }

    /// Every resource holding a reference to `uuid`
    async fn referrers(&self, uuid: Uuid) -> NetcfgResult<Vec<Resource>> {
        let mut out = Vec::new();
        for resource_type in ResourceType::ALL {
            out.extend(
                self.list(resource_type, &ListFilter::all())
                    .await?
                    .into_iter()
                    .filter(|r| r.references(uuid)),
            );
        }
        Ok(out)
    }

    /// Every resource whose parent is `uuid`
    async fn children(&self, uuid: Uuid) -> NetcfgResult<Vec<Resource>> {
        let mut out = Vec::new();
        let filter = ListFilter::parent(uuid);
        for resource_type in ResourceType::ALL {
            out.extend(self.list(resource_type, &filter).await?);
        }
        Ok(out)
    }
}
