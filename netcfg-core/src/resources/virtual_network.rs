use super::{check_route_targets, global_system_config, route_targets, AUTONOMOUS_SYSTEM, ROUTE_TARGET_LIST};
use crate::allocator::IdFamily;
use crate::error::{NetcfgError, NetcfgResult};
use crate::ipam::{
    addr_from_start, normalize_subnets, parse_subnet_value, parse_subnets, subnets_to_value,
    AddressManager, SubnetInfo, ADDR_FROM_START_FIELD, SUBNETS_FIELD,
};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Resource, ResourceUpdate};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NETWORK_ID: &str = "virtual_network_network_id";

fn network_id(resource: &Resource) -> NetcfgResult<u64> {
    resource.field_u64(NETWORK_ID).ok_or_else(|| {
        NetcfgError::internal(format!("virtual network {} has no network id", resource.fq_name_str()))
    })
}

async fn check_targets(env: &HookEnv, owner: &str, targets: &[String]) -> NetcfgResult<()> {
    let asn = global_system_config(env)
        .await?
        .and_then(|gsc| gsc.field_u64(AUTONOMOUS_SYSTEM));
    check_route_targets(owner, targets, asn, &env.policy)
}

fn push_delete_subnet(
    ctx: &mut TransactionContext,
    addresses: &Arc<AddressManager>,
    vn_fq_name: &[String],
    subnet: &SubnetInfo,
) {
    let addresses = addresses.clone();
    let vn_fq_name = vn_fq_name.to_vec();
    let subnet = subnet.clone();
    ctx.push_undo(format!("delete address allocator of {}", subnet.label()), move || async move {
        addresses.delete_subnet(&vn_fq_name, &subnet).await
    });
}

pub struct VirtualNetworkHooks;

#[async_trait]
impl ResourceHooks for VirtualNetworkHooks {
    async fn pre_create(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        let mut subnets = parse_subnets(resource)?;
        normalize_subnets(&mut subnets)?;
        resource.set_field(SUBNETS_FIELD, subnets_to_value(&subnets)?);

        let owner = resource.fq_name_str();
        check_targets(env, &owner, &route_targets(resource.field(ROUTE_TARGET_LIST))).await?;

        let id = match resource.field(NETWORK_ID) {
            Some(value) => {
                let requested = value.as_u64().ok_or_else(|| {
                    NetcfgError::validation(NETWORK_ID, "network id must be an unsigned integer")
                })?;
                env.allocators
                    .reserve_id(IdFamily::VirtualNetwork, requested, &owner)
                    .await?
                    .ok_or_else(|| {
                        NetcfgError::conflict(
                            format!("network id {}", requested),
                            "already in use or out of range",
                        )
                    })?
            }
            None => env.allocators.alloc_id(IdFamily::VirtualNetwork, &owner).await?,
        };
        {
            let allocators = env.allocators.clone();
            let owner = owner.clone();
            ctx.push_undo(format!("free network id {}", id), move || async move {
                allocators
                    .free_id(IdFamily::VirtualNetwork, id, &owner)
                    .await
                    .map(|_| ())
            });
        }
        resource.set_field(NETWORK_ID, id);

        let from_start = addr_from_start(resource);
        for subnet in &subnets {
            if env
                .addresses
                .create_subnet(&resource.fq_name, subnet, from_start)
                .await?
            {
                push_delete_subnet(ctx, &env.addresses, &resource.fq_name, subnet);
            }
        }

        debug!("Virtual network {} gets id {}", owner, id);
        Ok(())
    }

    async fn pre_update(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        for key in [NETWORK_ID, ADDR_FROM_START_FIELD] {
            if update.touches(key) && update.field(key) != current.field(key) {
                return Err(NetcfgError::validation(key, format!("{} cannot be changed", key)));
            }
        }

        if update.touches(ROUTE_TARGET_LIST) {
            check_targets(
                env,
                &current.fq_name_str(),
                &route_targets(update.field(ROUTE_TARGET_LIST)),
            )
            .await?;
        }

        let Some(value) = update.field(SUBNETS_FIELD) else {
            return Ok(());
        };
        let mut subnets = parse_subnet_value(value)?;
        normalize_subnets(&mut subnets)?;
        let existing = parse_subnets(current)?;
        let from_start = addr_from_start(current);

        for old in &existing {
            if subnets.iter().any(|s| s.prefix == old.prefix) {
                continue;
            }
            let in_use = env
                .addresses
                .allocated_addresses(&current.fq_name, old, from_start)
                .await?;
            if !in_use.is_empty() {
                return Err(NetcfgError::conflict(
                    old.label(),
                    format!("cannot remove subnet with {} allocated addresses", in_use.len()),
                ));
            }
        }

        for subnet in subnets.iter_mut() {
            match existing.iter().find(|s| s.prefix == subnet.prefix) {
                // keep identity of subnets that stay
                Some(old) => *subnet = old.clone(),
                None => {
                    if env
                        .addresses
                        .create_subnet(&current.fq_name, subnet, from_start)
                        .await?
                    {
                        push_delete_subnet(ctx, &env.addresses, &current.fq_name, subnet);
                    }
                }
            }
        }
        update.fields.insert(SUBNETS_FIELD.to_string(), subnets_to_value(&subnets)?);
        Ok(())
    }

    async fn post_update(&self, env: &HookEnv, previous: &Resource, resource: &Resource) -> NetcfgResult<()> {
        let remaining = parse_subnets(resource)?;
        for old in parse_subnets(previous)? {
            if !remaining.iter().any(|s| s.prefix == old.prefix) {
                env.addresses.delete_subnet(&resource.fq_name, &old).await?;
                info!("Removed subnet {} from {}", old.prefix, resource.fq_name_str());
            }
        }
        Ok(())
    }

    async fn post_delete(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        let id = network_id(resource)?;
        if !env
            .allocators
            .free_id(IdFamily::VirtualNetwork, id, &resource.fq_name_str())
            .await?
        {
            warn!("Network id {} of {} was not released", id, resource.fq_name_str());
        }
        for subnet in parse_subnets(resource)? {
            env.addresses.delete_subnet(&resource.fq_name, &subnet).await?;
        }
        Ok(())
    }

    async fn on_create_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        env.allocators
            .lock_id(IdFamily::VirtualNetwork, network_id(resource)?)
            .await
    }

    async fn on_delete_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        env.allocators
            .unlock_id(IdFamily::VirtualNetwork, network_id(resource)?)
            .await
    }
}
