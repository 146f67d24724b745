use crate::error::{NetcfgError, NetcfgResult};
use crate::ipam::{allocate_floating_ip, locate_floating_ip, release_floating_ip, FLOATING_IP_ADDRESS};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Resource, ResourceUpdate};
use crate::transaction::TransactionContext;
use async_trait::async_trait;

pub struct FloatingIpHooks;

#[async_trait]
impl ResourceHooks for FloatingIpHooks {
    async fn pre_create(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        allocate_floating_ip(ctx, &env.addresses, env.store.as_ref(), resource).await
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        if update.touches(FLOATING_IP_ADDRESS) && update.field(FLOATING_IP_ADDRESS) != current.field(FLOATING_IP_ADDRESS) {
            return Err(NetcfgError::validation(
                FLOATING_IP_ADDRESS,
                "floating ip address cannot be changed",
            ));
        }
        Ok(())
    }

    async fn post_delete(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        release_floating_ip(&env.addresses, env.store.as_ref(), resource)
            .await
            .map(|_| ())
    }

    async fn on_create_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        if let Some(at) = locate_floating_ip(env.store.as_ref(), resource).await? {
            env.addresses
                .lock_address(&at.vn_fq_name, &at.subnet, at.from_start, &at.address)
                .await?;
        }
        Ok(())
    }

    async fn on_delete_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        if let Some(at) = locate_floating_ip(env.store.as_ref(), resource).await? {
            env.addresses
                .unlock_address(&at.vn_fq_name, &at.subnet, at.from_start, &at.address)
                .await?;
        }
        Ok(())
    }
}
