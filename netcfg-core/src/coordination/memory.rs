use super::{child_names, dir_prefix, CoordinationClient};
use crate::error::{NetcfgError, NetcfgResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// In-process coordination service
///
/// Shared through an `Arc` it behaves like one service that several
/// allocator instances point at. Session loss can be injected for tests of
/// the retry path.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    nodes: Mutex<BTreeMap<String, String>>,
    fail_before_apply: AtomicU32,
    fail_after_apply: AtomicU32,
    reconnects: AtomicU64,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `calls` operations fail with `SessionExpired` without effect
    pub fn inject_session_loss(&self, calls: u32) {
        self.fail_before_apply.store(calls, Ordering::SeqCst);
    }

    /// The next `calls` mutating operations take effect, then report
    /// `SessionExpired`, as when a connection drops before the reply
    pub fn inject_lost_reply(&self, calls: u32) {
        self.fail_after_apply.store(calls, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_session(&self) -> NetcfgResult<()> {
        if Self::take_fault(&self.fail_before_apply) {
            return Err(NetcfgError::session_expired("injected session loss"));
        }
        Ok(())
    }

    fn check_reply(&self) -> NetcfgResult<()> {
        if Self::take_fault(&self.fail_after_apply) {
            return Err(NetcfgError::session_expired("injected lost reply"));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn create_node(&self, path: &str, value: &str) -> NetcfgResult<()> {
        self.check_session()?;
        {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(path) {
                return Err(NetcfgError::already_exists(path));
            }
            nodes.insert(path.to_string(), value.to_string());
        }
        self.check_reply()
    }

    async fn delete_node(&self, path: &str) -> NetcfgResult<()> {
        self.check_session()?;
        self.nodes.lock().remove(path);
        self.check_reply()
    }

    async fn read_node(&self, path: &str) -> NetcfgResult<Option<String>> {
        self.check_session()?;
        Ok(self.nodes.lock().get(path).cloned())
    }

    async fn list_children(&self, path: &str) -> NetcfgResult<Vec<String>> {
        self.check_session()?;
        let prefix = dir_prefix(path);
        let nodes = self.nodes.lock();
        Ok(child_names(
            &prefix,
            nodes.range(prefix.clone()..).map(|(k, _)| k.as_str()),
        ))
    }

    async fn delete_recursive(&self, path: &str) -> NetcfgResult<()> {
        self.check_session()?;
        let node = path.trim_end_matches('/');
        let prefix = dir_prefix(path);
        self.nodes
            .lock()
            .retain(|k, _| k != node && !k.starts_with(&prefix));
        self.check_reply()
    }

    async fn reconnect(&self) -> NetcfgResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
