//! The mutation pipeline
//!
//! Every create, update and delete runs through the same stages:
//!
//! ```text
//! Alloc -> PreValidate -> Commit -> PostNotify -> Done
//!    \__________\___________\______________________-> Failed
//! ```
//!
//! A failure up to and including Commit unwinds the request's undo stack
//! and surfaces the original error. Once Commit succeeds the resource is
//! authoritative: post hooks and the change notification can only add
//! warnings to the outcome.

mod hooks;

pub use self::hooks::{HookEnv, HookRegistry, PassThrough, ResourceHooks};

use crate::config::PipelineConfig;
use crate::error::{NetcfgError, NetcfgResult};
use crate::metrics::names;
use crate::notify::{ChangeEvent, ChangeOperation, NotificationBus};
use crate::observability::mutation_span;
use crate::resource::{Reference, Resource, ResourceType, ResourceUpdate};
use crate::transaction::{PipelineState, TransactionContext};
use std::sync::Arc;
use tracing::{field, info, warn, Instrument, Span};
use uuid::Uuid;

/// Result of a successful mutation
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub uuid: Uuid,
    /// The resource as committed (for delete, as it was before removal)
    pub resource: Resource,
    /// Post-commit failures for operator follow-up
    pub warnings: Vec<String>,
}

impl MutationOutcome {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub struct MutationPipeline {
    env: HookEnv,
    hooks: HookRegistry,
    bus: Arc<dyn NotificationBus>,
    config: PipelineConfig,
    origin: String,
}

impl MutationPipeline {
    pub fn new(
        env: HookEnv,
        hooks: HookRegistry,
        bus: Arc<dyn NotificationBus>,
        config: PipelineConfig,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            env,
            hooks,
            bus,
            config,
            origin: origin.into(),
        }
    }

    pub fn env(&self) -> &HookEnv {
        &self.env
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Instance id stamped on published change events
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub async fn create(&self, resource: Resource) -> NetcfgResult<MutationOutcome> {
        let mut ctx = TransactionContext::new();
        let span = mutation_span("create", resource.resource_type.as_str(), ctx.request_id());
        let _timer = self.env.metrics.timer(names::PIPELINE_CREATE_DURATION);
        self.run_create(&mut ctx, resource).instrument(span).await
    }

    pub async fn update(
        &self,
        resource_type: ResourceType,
        uuid: Uuid,
        update: ResourceUpdate,
    ) -> NetcfgResult<MutationOutcome> {
        let mut ctx = TransactionContext::new();
        let span = mutation_span("update", resource_type.as_str(), ctx.request_id());
        let _timer = self.env.metrics.timer(names::PIPELINE_UPDATE_DURATION);
        self.run_update(&mut ctx, resource_type, uuid, update)
            .instrument(span)
            .await
    }

    pub async fn delete(&self, resource_type: ResourceType, uuid: Uuid) -> NetcfgResult<MutationOutcome> {
        let mut ctx = TransactionContext::new();
        let span = mutation_span("delete", resource_type.as_str(), ctx.request_id());
        let _timer = self.env.metrics.timer(names::PIPELINE_DELETE_DURATION);
        self.run_delete(&mut ctx, resource_type, uuid)
            .instrument(span)
            .await
    }

    async fn run_create(
        &self,
        ctx: &mut TransactionContext,
        resource: Resource,
    ) -> NetcfgResult<MutationOutcome> {
        let hooks = self.hooks.get(resource.resource_type);

        let resource = match self.prepare_create(ctx, hooks.as_ref(), resource).await {
            Ok(resource) => resource,
            Err(e) => return Err(self.abort(ctx, e).await),
        };

        ctx.advance(PipelineState::Commit);
        let resource = match self.commit_create(resource).await {
            Ok(resource) => resource,
            Err(e) => {
                self.env.metrics.increment_counter(names::PIPELINE_COMMIT_FAILED);
                return Err(self.abort(ctx, e).await);
            }
        };
        ctx.discard_undo();

        ctx.advance(PipelineState::PostNotify);
        if let Err(e) = hooks.post_create(&self.env, &resource).await {
            ctx.add_warning(format!("post-create of {} failed: {}", resource.fq_name_str(), e));
        }
        self.notify(ctx, ChangeOperation::Create, resource.clone()).await;

        info!("Created {} {}", resource.resource_type, resource.fq_name_str());
        self.finish(ctx, resource)
    }

    async fn prepare_create(
        &self,
        ctx: &mut TransactionContext,
        hooks: &dyn ResourceHooks,
        mut resource: Resource,
    ) -> NetcfgResult<Resource> {
        ctx.advance(PipelineState::Alloc);
        hooks.pre_alloc(&mut resource)?;
        if resource.fq_name.is_empty() || resource.fq_name.iter().any(|part| part.is_empty()) {
            return Err(NetcfgError::validation("fq_name", "qualified name has an empty element"));
        }
        if resource.uuid.is_none() {
            resource.uuid = Some(Uuid::new_v4());
        }
        self.claim_name(hooks, &mut resource).await?;

        ctx.advance(PipelineState::PreValidate);
        self.resolve_parent(&mut resource).await?;
        self.resolve_refs(&mut resource.refs).await?;
        hooks.pre_create(ctx, &self.env, &mut resource).await?;
        Ok(resource)
    }

    /// Settle the final name before any hook allocates under it
    ///
    /// A taken name is rejected, or made unique with a uuid suffix when the
    /// pipeline and the type both allow renaming.
    async fn claim_name(&self, hooks: &dyn ResourceHooks, resource: &mut Resource) -> NetcfgResult<()> {
        let taken = self
            .env
            .store
            .fq_name_to_uuid(resource.resource_type, &resource.fq_name)
            .await?
            .is_some();
        if !taken {
            return Ok(());
        }
        if !self.config.retry_on_name_collision || !hooks.allow_name_retry() {
            return Err(NetcfgError::already_exists(format!(
                "{} {}",
                resource.resource_type,
                resource.fq_name_str()
            )));
        }

        let suffix = Uuid::new_v4();
        if let Some(last) = resource.fq_name.last_mut() {
            last.push_str(&format!("-{}", suffix));
        }
        if resource.field("name").is_some() {
            let name = resource.name().to_string();
            resource.set_field("name", name);
        }
        self.env.metrics.increment_counter(names::PIPELINE_NAME_RETRIES);
        info!("Name taken, creating as {}", resource.fq_name_str());
        Ok(())
    }

    /// Write a new resource under the name settled during Alloc
    ///
    /// A concurrent create that took the name in the meantime surfaces as
    /// `AlreadyExists` and unwinds like any other commit failure.
    async fn commit_create(&self, resource: Resource) -> NetcfgResult<Resource> {
        self.env.store.create(&resource).await?;
        Ok(resource)
    }

    async fn run_update(
        &self,
        ctx: &mut TransactionContext,
        resource_type: ResourceType,
        uuid: Uuid,
        mut update: ResourceUpdate,
    ) -> NetcfgResult<MutationOutcome> {
        let hooks = self.hooks.get(resource_type);

        ctx.advance(PipelineState::PreValidate);
        let prepared = async {
            let current = self.env.store.read(resource_type, uuid).await?;
            if let Some(refs) = update.refs.as_mut() {
                self.resolve_refs(refs).await?;
            }
            hooks.pre_update(ctx, &self.env, &current, &mut update).await?;
            Ok::<_, NetcfgError>(current)
        }
        .await;
        let current = match prepared {
            Ok(current) => current,
            Err(e) => return Err(self.abort(ctx, e).await),
        };

        ctx.advance(PipelineState::Commit);
        let mut resource = current.clone();
        resource.apply(&update);
        if let Err(e) = self.env.store.update(&resource).await {
            self.env.metrics.increment_counter(names::PIPELINE_COMMIT_FAILED);
            return Err(self.abort(ctx, e).await);
        }
        ctx.discard_undo();

        ctx.advance(PipelineState::PostNotify);
        if let Err(e) = hooks.post_update(&self.env, &current, &resource).await {
            ctx.add_warning(format!("post-update of {} failed: {}", resource.fq_name_str(), e));
        }
        self.notify(ctx, ChangeOperation::Update, resource.clone()).await;

        info!("Updated {} {}", resource.resource_type, resource.fq_name_str());
        self.finish(ctx, resource)
    }

    async fn run_delete(
        &self,
        ctx: &mut TransactionContext,
        resource_type: ResourceType,
        uuid: Uuid,
    ) -> NetcfgResult<MutationOutcome> {
        let hooks = self.hooks.get(resource_type);

        ctx.advance(PipelineState::PreValidate);
        let prepared = async {
            let current = self.env.store.read(resource_type, uuid).await?;
            self.check_unreferenced(&current, uuid).await?;
            hooks.pre_delete(ctx, &self.env, &current).await?;
            Ok::<_, NetcfgError>(current)
        }
        .await;
        let resource = match prepared {
            Ok(current) => current,
            Err(e) => return Err(self.abort(ctx, e).await),
        };

        ctx.advance(PipelineState::Commit);
        if let Err(e) = self.env.store.delete(resource_type, uuid).await {
            self.env.metrics.increment_counter(names::PIPELINE_COMMIT_FAILED);
            return Err(self.abort(ctx, e).await);
        }
        ctx.discard_undo();

        ctx.advance(PipelineState::PostNotify);
        if let Err(e) = hooks.post_delete(&self.env, &resource).await {
            ctx.add_warning(format!("post-delete of {} failed: {}", resource.fq_name_str(), e));
        }
        self.notify(ctx, ChangeOperation::Delete, resource.clone()).await;

        info!("Deleted {} {}", resource.resource_type, resource.fq_name_str());
        self.finish(ctx, resource)
    }

    async fn resolve_parent(&self, resource: &mut Resource) -> NetcfgResult<()> {
        let Some(parent_type) = resource.parent_type else {
            return Ok(());
        };
        let parent_fq_name = resource.parent_fq_name().to_vec();
        let parent_uuid = self
            .env
            .store
            .fq_name_to_uuid(parent_type, &parent_fq_name)
            .await?
            .ok_or_else(|| {
                NetcfgError::not_found(format!("{} {}", parent_type, parent_fq_name.join(":")))
            })?;

        if let Some(given) = resource.parent_uuid {
            if given != parent_uuid {
                return Err(NetcfgError::validation(
                    "parent_uuid",
                    format!("{} does not match parent {}", given, parent_fq_name.join(":")),
                ));
            }
        }
        resource.parent_uuid = Some(parent_uuid);
        Ok(())
    }

    /// Fill in reference uuids and check every target exists
    async fn resolve_refs(&self, refs: &mut [Reference]) -> NetcfgResult<()> {
        for reference in refs.iter_mut() {
            match reference.uuid {
                Some(uuid) => {
                    self.env.store.read(reference.target_type, uuid).await?;
                }
                None => {
                    let uuid = self
                        .env
                        .store
                        .fq_name_to_uuid(reference.target_type, &reference.to)
                        .await?
                        .ok_or_else(|| {
                            NetcfgError::not_found(format!(
                                "{} {}",
                                reference.target_type,
                                reference.to.join(":")
                            ))
                        })?;
                    reference.uuid = Some(uuid);
                }
            }
        }
        Ok(())
    }

    async fn check_unreferenced(&self, resource: &Resource, uuid: Uuid) -> NetcfgResult<()> {
        let children = self.env.store.children(uuid).await?;
        if let Some(child) = children.first() {
            return Err(NetcfgError::conflict(
                resource.fq_name_str(),
                format!(
                    "has {} children, e.g. {} {}",
                    children.len(),
                    child.resource_type,
                    child.fq_name_str()
                ),
            ));
        }

        let referrers = self.env.store.referrers(uuid).await?;
        if let Some(referrer) = referrers.first() {
            return Err(NetcfgError::conflict(
                resource.fq_name_str(),
                format!(
                    "referenced by {} resources, e.g. {} {}",
                    referrers.len(),
                    referrer.resource_type,
                    referrer.fq_name_str()
                ),
            ));
        }
        Ok(())
    }

    async fn notify(&self, ctx: &mut TransactionContext, operation: ChangeOperation, resource: Resource) {
        let event = ChangeEvent {
            operation,
            resource,
            origin: self.origin.clone(),
            request_id: ctx.request_id(),
        };
        if let Err(e) = self.bus.publish(event).await {
            ctx.add_warning(format!("{} notification not published: {}", operation, e));
        }
    }

    /// Unwind the undo stack and hand back the error that caused it
    async fn abort(&self, ctx: &mut TransactionContext, error: NetcfgError) -> NetcfgError {
        let failed_in = ctx.state();
        ctx.advance(PipelineState::Failed);
        Span::current().record("state", field::display(PipelineState::Failed));
        self.env.metrics.increment_counter(names::PIPELINE_FAILED);

        let report = ctx.run_undo().await;
        self.env
            .metrics
            .increment_counter_by(names::UNDO_EXECUTED, report.executed as u64);
        if !report.is_ok() {
            self.env
                .metrics
                .increment_counter_by(names::UNDO_FAILED, report.failures.len() as u64);
            warn!(
                "{} of {} undo actions failed; first: {}",
                report.failures.len(),
                report.executed,
                report
                    .first_error()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
        }

        warn!("Mutation failed during {}: {}", failed_in, error);
        error
    }

    fn finish(&self, ctx: &mut TransactionContext, resource: Resource) -> NetcfgResult<MutationOutcome> {
        ctx.advance(PipelineState::Done);
        Span::current().record("state", field::display(PipelineState::Done));
        let warnings = ctx.take_warnings();
        if !warnings.is_empty() {
            self.env
                .metrics
                .increment_counter_by(names::PIPELINE_POST_COMMIT_WARNINGS, warnings.len() as u64);
        }
        Ok(MutationOutcome {
            uuid: resource.uuid()?,
            resource,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocatorRegistry, AllocatorSettings};
    use crate::config::PolicyConfig;
    use crate::coordination::MemoryCoordinator;
    use crate::ipam::AddressManager;
    use crate::metrics::MetricsRegistry;
    use crate::notify::BroadcastBus;
    use crate::store::{MemoryObjectStore, ObjectStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        fail_pre_create: bool,
        fail_post_create: bool,
    }

    #[async_trait]
    impl ResourceHooks for Recording {
        async fn pre_create(
            &self,
            ctx: &mut TransactionContext,
            _env: &HookEnv,
            _resource: &mut Resource,
        ) -> NetcfgResult<()> {
            for name in ["A", "B"] {
                let log = self.log.clone();
                ctx.push_undo(format!("undo {}", name), move || async move {
                    log.lock().push(name.to_string());
                    Ok(())
                });
            }
            if self.fail_pre_create {
                return Err(NetcfgError::validation("test", "rejected"));
            }
            Ok(())
        }

        async fn post_create(&self, _env: &HookEnv, _resource: &Resource) -> NetcfgResult<()> {
            if self.fail_post_create {
                return Err(NetcfgError::temporary("index unavailable"));
            }
            Ok(())
        }
    }

    fn pipeline(hooks: Recording) -> (MutationPipeline, Arc<MemoryObjectStore>) {
        pipeline_with(hooks, PipelineConfig::default())
    }

    fn pipeline_with(hooks: Recording, config: PipelineConfig) -> (MutationPipeline, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        let allocators = Arc::new(AllocatorRegistry::new(
            Arc::new(MemoryCoordinator::new()),
            AllocatorSettings::default(),
        ));
        let env = HookEnv {
            store: store.clone(),
            addresses: Arc::new(AddressManager::new(allocators.clone())),
            allocators,
            policy: PolicyConfig::default(),
            metrics: MetricsRegistry::new(),
        };
        let mut registry = HookRegistry::new();
        registry.register(ResourceType::Project, Arc::new(hooks));
        let pipeline = MutationPipeline::new(
            env,
            registry,
            Arc::new(BroadcastBus::new(16)),
            config,
            "test",
        );
        (pipeline, store)
    }

    fn recording(fail_pre_create: bool, fail_post_create: bool) -> (Recording, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Recording {
                log: log.clone(),
                fail_pre_create,
                fail_post_create,
            },
            log,
        )
    }

    #[tokio::test]
    async fn test_undo_runs_newest_first() {
        let (hooks, log) = recording(true, false);
        let (pipeline, store) = pipeline(hooks);

        let err = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetcfgError::Validation { .. }));
        assert_eq!(*log.lock(), vec!["B".to_string(), "A".to_string()]);
        assert!(store.is_empty());
        assert_eq!(pipeline.env().metrics.get_counter(names::UNDO_EXECUTED), 2);
    }

    #[tokio::test]
    async fn test_success_discards_undo() {
        let (hooks, log) = recording(false, false);
        let (pipeline, _store) = pipeline(hooks);

        let outcome = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap();
        assert!(log.lock().is_empty());
        assert!(!outcome.has_warnings());
    }

    #[tokio::test]
    async fn test_post_create_failure_is_a_warning() {
        let (hooks, log) = recording(false, true);
        let (pipeline, store) = pipeline(hooks);

        let outcome = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(log.lock().is_empty());
        assert!(store.read(ResourceType::Project, outcome.uuid).await.is_ok());
    }

    #[tokio::test]
    async fn test_name_collision_retries_with_suffix() {
        let (hooks, _log) = recording(false, false);
        let (pipeline, _store) = pipeline(hooks);

        let first = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap();
        let second = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]).with_field("name", "p"))
            .await
            .unwrap();

        assert_ne!(first.uuid, second.uuid);
        assert!(second.resource.name().starts_with("p-"));
        assert_eq!(second.resource.field_str("name"), Some(second.resource.name()));
    }

    #[tokio::test]
    async fn test_taken_name_rejected_before_hooks_run() {
        let (hooks, log) = recording(false, false);
        let config = PipelineConfig {
            retry_on_name_collision: false,
            ..PipelineConfig::default()
        };
        let (pipeline, store) = pipeline_with(hooks, config);

        pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap();
        let err = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        // pre_create never ran, so there was nothing to unwind
        assert!(log.lock().is_empty());
        assert_eq!(pipeline.env().metrics.get_counter(names::UNDO_EXECUTED), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let (hooks, _log) = recording(false, false);
        let (pipeline, _store) = pipeline(hooks);

        let err = pipeline
            .create(
                Resource::new(ResourceType::VirtualNetwork, vec!["d", "missing", "vn"])
                    .with_parent(ResourceType::Project),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_refused_while_children_exist() {
        let (hooks, _log) = recording(false, false);
        let (pipeline, _store) = pipeline(hooks);

        let project = pipeline
            .create(Resource::new(ResourceType::Project, vec!["p"]))
            .await
            .unwrap();
        pipeline
            .create(Resource::new(ResourceType::SecurityGroup, vec!["p", "sg"]).with_parent(ResourceType::Project))
            .await
            .unwrap();

        let err = pipeline
            .delete(ResourceType::Project, project.uuid)
            .await
            .unwrap_err();
        assert!(matches!(err, NetcfgError::Conflict { .. }));
    }
}
