use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Reference, Resource, ResourceType, ResourceUpdate};
use crate::store::ListFilter;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const VLAN_TAG: &str = "logical_interface_vlan_tag";
pub const ESI: &str = "ethernet_segment_identifier";
const MAX_VLAN_TAG: u64 = 4094;

fn is_zero_esi(esi: &str) -> bool {
    esi.chars().all(|c| c == '0' || c == ':')
}

fn vlan_tag(resource: &Resource) -> NetcfgResult<Option<u64>> {
    match resource.field(VLAN_TAG) {
        None => Ok(None),
        Some(v) => {
            let tag = v
                .as_u64()
                .ok_or_else(|| NetcfgError::validation(VLAN_TAG, "VLAN tag must be an unsigned integer"))?;
            if tag > MAX_VLAN_TAG {
                return Err(NetcfgError::validation(
                    VLAN_TAG,
                    format!("VLAN tag {} out of range 0..={}", tag, MAX_VLAN_TAG),
                ));
            }
            Ok(Some(tag))
        }
    }
}

fn vmi_set(refs: &[Reference]) -> BTreeSet<Uuid> {
    refs.iter()
        .filter(|r| r.target_type == ResourceType::VirtualMachineInterface)
        .filter_map(|r| r.uuid)
        .collect()
}

/// A VLAN tag must be unique among logical interfaces on physical
/// interfaces sharing one Ethernet segment, unless both attach the same
/// virtual-machine-interfaces
async fn check_esi_vlan(env: &HookEnv, li: &Resource, vlan: u64, refs: &[Reference]) -> NetcfgResult<()> {
    if li.parent_type != Some(ResourceType::PhysicalInterface) {
        return Ok(());
    }
    let Some(parent_uuid) = li.parent_uuid else {
        return Ok(());
    };
    let parent = env.store.read(ResourceType::PhysicalInterface, parent_uuid).await?;
    let esi = match parent.field_str(ESI) {
        Some(esi) if !esi.is_empty() && !is_zero_esi(esi) => esi.to_string(),
        _ => return Ok(()),
    };

    let mine = vmi_set(refs);
    let peers = env
        .store
        .list(ResourceType::PhysicalInterface, &ListFilter::all().field(ESI, esi.as_str()))
        .await?;
    for peer in peers {
        let siblings = env
            .store
            .list(ResourceType::LogicalInterface, &ListFilter::parent(peer.uuid()?))
            .await?;
        for other in siblings {
            if other.uuid == li.uuid || other.field_u64(VLAN_TAG) != Some(vlan) {
                continue;
            }
            if vmi_set(&other.refs) != mine {
                return Err(NetcfgError::conflict(
                    li.fq_name_str(),
                    format!(
                        "VLAN tag {} already used by {} on Ethernet segment {}",
                        vlan,
                        other.fq_name_str(),
                        esi
                    ),
                ));
            }
        }
    }
    Ok(())
}

pub struct LogicalInterfaceHooks;

#[async_trait]
impl ResourceHooks for LogicalInterfaceHooks {
    async fn pre_create(
        &self,
        _ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        if let Some(vlan) = vlan_tag(resource)? {
            check_esi_vlan(env, resource, vlan, &resource.refs).await?;
        }
        Ok(())
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        if update.touches(VLAN_TAG) && update.field(VLAN_TAG) != current.field(VLAN_TAG) {
            return Err(NetcfgError::validation(VLAN_TAG, "VLAN tag cannot be changed"));
        }
        if let (Some(refs), Some(vlan)) = (&update.refs, vlan_tag(current)?) {
            check_esi_vlan(env, current, vlan, refs).await?;
        }
        Ok(())
    }
}
