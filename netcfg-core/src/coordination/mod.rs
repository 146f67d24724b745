//! Coordination-service seam
//!
//! Allocators persist every in-use index as a node under their path and use
//! conditional create as the only mutual-exclusion primitive. Paths are
//! `/`-separated; parents exist implicitly.

mod memory;
mod redb_backend;
mod resilient;

pub use self::memory::MemoryCoordinator;
pub use self::redb_backend::RedbCoordinator;
pub use self::resilient::ResilientCoordinator;

use crate::error::NetcfgResult;
use async_trait::async_trait;

/// Client contract of the coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create `path` holding `value`; fails with `AlreadyExists` if present
    async fn create_node(&self, path: &str, value: &str) -> NetcfgResult<()>;

    /// Delete `path`; an absent node is not an error
    async fn delete_node(&self, path: &str) -> NetcfgResult<()>;

    async fn read_node(&self, path: &str) -> NetcfgResult<Option<String>>;

    /// Names (last path segment) of the direct children of `path`
    async fn list_children(&self, path: &str) -> NetcfgResult<Vec<String>>;

    /// Delete `path` and everything below it
    async fn delete_recursive(&self, path: &str) -> NetcfgResult<()>;

    /// Re-establish the session after a transient failure
    async fn reconnect(&self) -> NetcfgResult<()> {
        Ok(())
    }
}

/// `path` with exactly one trailing separator
pub fn dir_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

/// Node name for an allocator index; fixed width keeps listing order numeric
pub fn index_node_name(index: u64) -> String {
    format!("{:010}", index)
}

/// Distinct first segments of the keys under `prefix`
pub(crate) fn child_names<'a, I>(prefix: &str, keys: I) -> Vec<String>
where
    I: Iterator<Item = &'a str>,
{
    let mut names: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            break;
        };
        let name = rest.split('/').next().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        if names.last().map(String::as_str) != Some(name) {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_node_name_is_zero_padded() {
        assert_eq!(index_node_name(7), "0000000007");
        assert_eq!(index_node_name(4294967295), "4294967295");
        assert!(index_node_name(9) < index_node_name(10));
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix("/id/tags/types"), "/id/tags/types/");
        assert_eq!(dir_prefix("/id/tags/types/"), "/id/tags/types/");
    }

    #[test]
    fn test_child_names_dedups_nested_nodes() {
        let keys = [
            "/a/0000000001",
            "/a/0000000002",
            "/a/sub/0000000001",
            "/a/sub/0000000002",
            "/b/0000000001",
        ];
        let names = child_names("/a/", keys.iter().copied());
        assert_eq!(names, vec!["0000000001", "0000000002", "sub"]);
    }
}
