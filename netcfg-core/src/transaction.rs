//! Per-request transaction context and undo stack

use crate::error::{NetcfgError, NetcfgResult};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Stages a mutation passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Alloc,
    PreValidate,
    Commit,
    PostNotify,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Alloc => "alloc",
            PipelineState::PreValidate => "pre-validate",
            PipelineState::Commit => "commit",
            PipelineState::PostNotify => "post-notify",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A compensating step registered right after the side effect it reverses
pub struct UndoAction {
    description: String,
    action: Box<dyn FnOnce() -> BoxFuture<'static, NetcfgResult<()>> + Send>,
}

impl UndoAction {
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoAction")
            .field("description", &self.description)
            .finish()
    }
}

/// Outcome of unwinding an undo stack
#[derive(Debug, Default)]
pub struct UndoReport {
    pub executed: usize,
    pub failures: Vec<(String, NetcfgError)>,
}

impl UndoReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_error(&self) -> Option<&NetcfgError> {
        self.failures.first().map(|(_, e)| e)
    }

    pub fn into_result(mut self) -> NetcfgResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self.failures.remove(0).1)
        }
    }
}

/// State of one create/update/delete request
///
/// Owned by a single request and never shared. On success the undo stack
/// is discarded; on failure it runs in reverse order of registration.
#[derive(Debug)]
pub struct TransactionContext {
    request_id: Uuid,
    state: PipelineState,
    undo_stack: Vec<UndoAction>,
    warnings: Vec<String>,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            state: PipelineState::Alloc,
            undo_stack: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn advance(&mut self, state: PipelineState) {
        debug!(request_id = %self.request_id, "{} -> {}", self.state, state);
        self.state = state;
    }

    pub fn push_undo<F, Fut>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = NetcfgResult<()>> + Send + 'static,
    {
        let description = description.into();
        debug!(request_id = %self.request_id, "undo registered: {}", description);
        self.undo_stack.push(UndoAction {
            description,
            action: Box::new(move || Box::pin(action())),
        });
    }

    pub fn pending_undo(&self) -> usize {
        self.undo_stack.len()
    }

    /// Descriptions in registration order
    pub fn undo_descriptions(&self) -> Vec<&str> {
        self.undo_stack.iter().map(|a| a.description()).collect()
    }

    /// Execute every registered action, newest first
    ///
    /// A failing action is logged and recorded; the rest still run.
    pub async fn run_undo(&mut self) -> UndoReport {
        let mut report = UndoReport::default();
        while let Some(undo) = self.undo_stack.pop() {
            report.executed += 1;
            match (undo.action)().await {
                Ok(()) => debug!(request_id = %self.request_id, "undo ok: {}", undo.description),
                Err(e) => {
                    error!(
                        request_id = %self.request_id,
                        "undo failed, allocation may leak: {}: {}", undo.description, e
                    );
                    report.failures.push((undo.description, e));
                }
            }
        }
        report
    }

    /// Forget every compensating action after a successful commit
    pub fn discard_undo(&mut self) {
        self.undo_stack.clear();
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        warn!(request_id = %self.request_id, "post-commit warning: {}", warning);
        self.warnings.push(warning);
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() -> BoxFuture<'static, NetcfgResult<()>> {
        let log = log.clone();
        move || {
            Box::pin(async move {
                log.lock().push(name);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_undo_runs_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TransactionContext::new();
        ctx.push_undo("a", recorder(&log, "a"));
        ctx.push_undo("b", recorder(&log, "b"));
        ctx.push_undo("c", recorder(&log, "c"));
        assert_eq!(ctx.undo_descriptions(), vec!["a", "b", "c"]);

        let report = ctx.run_undo().await;
        assert!(report.is_ok());
        assert_eq!(report.executed, 3);
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);
        assert_eq!(ctx.pending_undo(), 0);
    }

    #[tokio::test]
    async fn test_failing_undo_does_not_stop_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TransactionContext::new();
        ctx.push_undo("first", recorder(&log, "first"));
        ctx.push_undo("broken", || async { Err(NetcfgError::internal("boom")) });
        ctx.push_undo("last", || async { Err(NetcfgError::internal("bang")) });

        let report = ctx.run_undo().await;
        assert_eq!(report.executed, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, "last");
        assert!(report.first_error().unwrap().to_string().contains("bang"));
        assert_eq!(*log.lock(), vec!["first"]);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_discard_after_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TransactionContext::new();
        ctx.push_undo("a", recorder(&log, "a"));
        ctx.discard_undo();
        let report = ctx.run_undo().await;
        assert_eq!(report.executed, 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_state_and_warnings() {
        let mut ctx = TransactionContext::new();
        assert_eq!(ctx.state(), PipelineState::Alloc);
        ctx.advance(PipelineState::Done);
        assert!(ctx.state().is_terminal());
        ctx.add_warning("notify failed");
        assert_eq!(ctx.take_warnings(), vec!["notify failed".to_string()]);
        assert!(ctx.take_warnings().is_empty());
    }
}
