use super::{ListFilter, ObjectStore};
use crate::error::{NetcfgError, NetcfgResult};
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    objects: BTreeMap<(ResourceType, Uuid), Resource>,
    names: HashMap<(ResourceType, Vec<String>), Uuid>,
}

/// Object store kept in process memory
#[derive(Default)]
pub struct MemoryObjectStore {
    tables: RwLock<Tables>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<Resource> {
        self.tables
            .read()
            .objects
            .get(&(resource_type, uuid))
            .cloned()
            .ok_or_else(|| NetcfgError::not_found(format!("{} {}", resource_type, uuid)))
    }

    async fn fq_name_to_uuid(
        &self,
        resource_type: ResourceType,
        fq_name: &[String],
    ) -> NetcfgResult<Option<Uuid>> {
        Ok(self
            .tables
            .read()
            .names
            .get(&(resource_type, fq_name.to_vec()))
            .copied())
    }

    async fn create(&self, resource: &Resource) -> NetcfgResult<Uuid> {
        let uuid = resource.uuid()?;
        let mut tables = self.tables.write();
        let name_key = (resource.resource_type, resource.fq_name.clone());
        if tables.names.contains_key(&name_key) {
            return Err(NetcfgError::already_exists(format!(
                "{} {}",
                resource.resource_type,
                resource.fq_name_str()
            )));
        }
        if tables.objects.contains_key(&(resource.resource_type, uuid)) {
            return Err(NetcfgError::already_exists(format!(
                "{} {}",
                resource.resource_type, uuid
            )));
        }
        tables.names.insert(name_key, uuid);
        tables
            .objects
            .insert((resource.resource_type, uuid), resource.clone());
        Ok(uuid)
    }

    async fn update(&self, resource: &Resource) -> NetcfgResult<()> {
        let uuid = resource.uuid()?;
        let mut tables = self.tables.write();
        match tables.objects.get_mut(&(resource.resource_type, uuid)) {
            Some(existing) => {
                *existing = resource.clone();
                Ok(())
            }
            None => Err(NetcfgError::not_found(format!(
                "{} {}",
                resource.resource_type, uuid
            ))),
        }
    }

    async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<()> {
        let mut tables = self.tables.write();
        let removed = tables
            .objects
            .remove(&(resource_type, uuid))
            .ok_or_else(|| NetcfgError::not_found(format!("{} {}", resource_type, uuid)))?;
        tables.names.remove(&(resource_type, removed.fq_name));
        Ok(())
    }

    async fn list(&self, resource_type: ResourceType, filter: &ListFilter) -> NetcfgResult<Vec<Resource>> {
        let tables = self.tables.read();
        Ok(tables
            .objects
            .range((resource_type, Uuid::nil())..=(resource_type, Uuid::from_u128(u128::MAX)))
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}
