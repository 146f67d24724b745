use super::{child_names, dir_prefix, CoordinationClient};
use crate::error::{NetcfgError, NetcfgResult};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const NODES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("coordination_nodes");

/// Durable single-host coordination backend
///
/// redb serializes write transactions, which makes the existence check and
/// insert in `create_node` atomic.
#[derive(Clone)]
pub struct RedbCoordinator {
    database: Arc<Database>,
}

impl RedbCoordinator {
    pub fn open(path: impl AsRef<Path>) -> NetcfgResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let database = Database::create(path.as_ref())?;

        let write_txn = database.begin_write()?;
        {
            write_txn.open_table(NODES_TABLE)?;
        }
        write_txn.commit()?;

        info!("Opened coordination database at {}", path.as_ref().display());
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

#[async_trait]
impl CoordinationClient for RedbCoordinator {
    async fn create_node(&self, path: &str, value: &str) -> NetcfgResult<()> {
        let path = path.to_string();
        let value = value.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(NODES_TABLE)?;
                if table.get(path.as_str())?.is_some() {
                    return Err(NetcfgError::already_exists(path));
                }
                table.insert(path.as_str(), value.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_node(&self, path: &str) -> NetcfgResult<()> {
        let path = path.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(NODES_TABLE)?;
                table.remove(path.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn read_node(&self, path: &str) -> NetcfgResult<Option<String>> {
        let path = path.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(NODES_TABLE)?;
            let value = table.get(path.as_str())?.map(|v| v.value().to_string());
            Ok(value)
        })
        .await
    }

    async fn list_children(&self, path: &str) -> NetcfgResult<Vec<String>> {
        let prefix = dir_prefix(path);
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(NODES_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.range::<&str>(prefix.as_str()..)? {
                let (key, _) = entry?;
                let key = key.value().to_string();
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key);
            }
            Ok(child_names(&prefix, keys.iter().map(String::as_str)))
        })
        .await
    }

    async fn delete_recursive(&self, path: &str) -> NetcfgResult<()> {
        let node = path.trim_end_matches('/').to_string();
        let prefix = dir_prefix(path);
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(NODES_TABLE)?;
                let mut doomed = vec![node.clone()];
                for entry in table.range::<&str>(prefix.as_str()..)? {
                    let (key, _) = entry?;
                    let key = key.value().to_string();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    doomed.push(key);
                }
                for key in doomed {
                    table.remove(key.as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }
}
