use super::{ListFilter, ObjectStore};
use crate::error::{NetcfgError, NetcfgResult};
use crate::patterns::ErrorContext;
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const OBJECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");
const NAMES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("object_names");

fn object_key(resource_type: ResourceType, uuid: Uuid) -> String {
    format!("{}/{}", resource_type, uuid)
}

fn name_key(resource_type: ResourceType, fq_name: &[String]) -> NetcfgResult<String> {
    let encoded = serde_json::to_string(fq_name).serialization_context("encode fq_name")?;
    Ok(format!("{}/{}", resource_type, encoded))
}

/// Durable object store on redb; resources are stored as JSON
#[derive(Clone)]
pub struct RedbObjectStore {
    database: Arc<Database>,
}

impl RedbObjectStore {
    pub fn open(path: impl AsRef<Path>) -> NetcfgResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let database = Database::create(path.as_ref())?;

        let write_txn = database.begin_write()?;
        {
            write_txn.open_table(OBJECTS_TABLE)?;
            write_txn.open_table(NAMES_TABLE)?;
        }
        write_txn.commit()?;

        info!("Opened object store at {}", path.as_ref().display());
        Ok(Self {
            database: Arc::new(database),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> NetcfgResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> NetcfgResult<T> + Send + 'static,
    {
        let db = self.database.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| NetcfgError::internal(format!("Task join error: {}", e)))?
    }
}

fn decode(bytes: &[u8]) -> NetcfgResult<Resource> {
    serde_json::from_slice(bytes).serialization_context("decode resource")
}

#[async_trait]
impl ObjectStore for RedbObjectStore {
    async fn read(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<Resource> {
        let key = object_key(resource_type, uuid);
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(OBJECTS_TABLE)?;
            let bytes = table.get(key.as_str())?;
            match bytes {
                Some(bytes) => decode(bytes.value()),
                None => Err(NetcfgError::not_found(key)),
            }
        })
        .await
    }

    async fn fq_name_to_uuid(
        &self,
        resource_type: ResourceType,
        fq_name: &[String],
    ) -> NetcfgResult<Option<Uuid>> {
        let key = name_key(resource_type, fq_name)?;
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(NAMES_TABLE)?;
            let uuid = table.get(key.as_str())?;
            match uuid {
                Some(uuid) => Ok(Some(Uuid::parse_str(uuid.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn create(&self, resource: &Resource) -> NetcfgResult<Uuid> {
        let uuid = resource.uuid()?;
        let key = object_key(resource.resource_type, uuid);
        let names_key = name_key(resource.resource_type, &resource.fq_name)?;
        let label = format!("{} {}", resource.resource_type, resource.fq_name_str());
        let bytes = serde_json::to_vec(resource).serialization_context("encode resource")?;

        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut names = write_txn.open_table(NAMES_TABLE)?;
                if names.get(names_key.as_str())?.is_some() {
                    return Err(NetcfgError::already_exists(label));
                }
                let mut objects = write_txn.open_table(OBJECTS_TABLE)?;
                if objects.get(key.as_str())?.is_some() {
                    return Err(NetcfgError::already_exists(key));
                }
                let uuid_text = uuid.to_string();
                names.insert(names_key.as_str(), uuid_text.as_str())?;
                objects.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(uuid)
        })
        .await
    }

    async fn update(&self, resource: &Resource) -> NetcfgResult<()> {
        let key = object_key(resource.resource_type, resource.uuid()?);
        let bytes = serde_json::to_vec(resource).serialization_context("encode resource")?;

        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut objects = write_txn.open_table(OBJECTS_TABLE)?;
                if objects.get(key.as_str())?.is_none() {
                    return Err(NetcfgError::not_found(key));
                }
                objects.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<()> {
        let key = object_key(resource_type, uuid);
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut objects = write_txn.open_table(OBJECTS_TABLE)?;
                let removed = match objects.remove(key.as_str())? {
                    Some(bytes) => decode(bytes.value())?,
                    None => return Err(NetcfgError::not_found(key)),
                };
                let mut names = write_txn.open_table(NAMES_TABLE)?;
                names.remove(name_key(resource_type, &removed.fq_name)?.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn list(&self, resource_type: ResourceType, filter: &ListFilter) -> NetcfgResult<Vec<Resource>> {
        let prefix = format!("{}/", resource_type);
        let filter = filter.clone();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(OBJECTS_TABLE)?;
            let mut out = Vec::new();
            for entry in table.range::<&str>(prefix.as_str()..)? {
                let (key, bytes) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                let resource = decode(bytes.value())?;
                if filter.matches(&resource) {
                    out.push(resource);
                }
            }
            Ok(out)
        })
        .await
    }
}
