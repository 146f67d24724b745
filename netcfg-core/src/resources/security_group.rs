use crate::allocator::IdFamily;
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Resource, ResourceUpdate};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use tracing::debug;

pub const SECURITY_GROUP_ID: &str = "security_group_id";

fn security_group_id(resource: &Resource) -> NetcfgResult<u64> {
    resource.field_u64(SECURITY_GROUP_ID).ok_or_else(|| {
        NetcfgError::internal(format!("security group {} has no id", resource.fq_name_str()))
    })
}

pub struct SecurityGroupHooks;

#[async_trait]
impl ResourceHooks for SecurityGroupHooks {
    async fn pre_create(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        if resource.field(SECURITY_GROUP_ID).is_some() {
            return Err(NetcfgError::validation(
                SECURITY_GROUP_ID,
                "security group id is allocated by the system",
            ));
        }

        let owner = resource.fq_name_str();
        let id = env.allocators.alloc_id(IdFamily::SecurityGroup, &owner).await?;
        let allocators = env.allocators.clone();
        ctx.push_undo(format!("free security group id {}", id), move || async move {
            allocators
                .free_id(IdFamily::SecurityGroup, id, &owner)
                .await
                .map(|_| ())
        });

        debug!("Security group {} gets id {}", resource.fq_name_str(), id);
        resource.set_field(SECURITY_GROUP_ID, id);
        Ok(())
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        if update.touches(SECURITY_GROUP_ID) && update.field(SECURITY_GROUP_ID) != current.field(SECURITY_GROUP_ID) {
            return Err(NetcfgError::validation(
                SECURITY_GROUP_ID,
                "security group id cannot be changed",
            ));
        }
        Ok(())
    }

    async fn post_delete(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        env.allocators
            .free_id(IdFamily::SecurityGroup, security_group_id(resource)?, &resource.fq_name_str())
            .await
            .map(|_| ())
    }

    async fn on_create_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        env.allocators
            .lock_id(IdFamily::SecurityGroup, security_group_id(resource)?)
            .await
    }

    async fn on_delete_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        env.allocators
            .unlock_id(IdFamily::SecurityGroup, security_group_id(resource)?)
            .await
    }
}
