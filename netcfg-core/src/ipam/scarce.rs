//! Floating-IP allocation over an ordered list of candidate subnets

use super::{addr_from_start, parse_subnets, AddressManager, SubnetInfo};
use crate::error::{NetcfgError, NetcfgResult};
use crate::resource::{Resource, ResourceType};
use crate::store::ObjectStore;
use crate::transaction::TransactionContext;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub const FLOATING_IP_ADDRESS: &str = "floating_ip_address";
pub const FLOATING_IP_SUBNET: &str = "floating_ip_subnet_uuid";
/// Pool field restricting allocation to these subnet uuids, in order
pub const POOL_SUBNETS: &str = "floating_ip_pool_subnets";

/// Where a floating IP's address lives
pub struct FloatingIpLocation {
    pub vn_fq_name: Vec<String>,
    pub subnet: SubnetInfo,
    pub from_start: bool,
    pub address: IpAddr,
}

/// A floating IP under an instance-ip mirrors a fixed address
pub fn shadows_instance_ip(fip: &Resource) -> bool {
    fip.parent_type == Some(ResourceType::InstanceIp)
}

/// Qualified name of the network: the floating IP sits under a pool,
/// which sits under the network
fn network_fq_name(fip: &Resource) -> NetcfgResult<Vec<String>> {
    if fip.fq_name.len() < 3 {
        return Err(NetcfgError::validation(
            "fq_name",
            "floating-ip must live under a floating-ip-pool of a virtual network",
        ));
    }
    Ok(fip.fq_name[..fip.fq_name.len() - 2].to_vec())
}

fn requested_address(fip: &Resource) -> NetcfgResult<Option<IpAddr>> {
    match fip.field_str(FLOATING_IP_ADDRESS) {
        None => Ok(None),
        Some(text) => Ok(Some(text.parse().map_err(|_| {
            NetcfgError::validation(FLOATING_IP_ADDRESS, format!("'{}' is not an IP address", text))
        })?)),
    }
}

/// Subnets to try, in order
fn candidate_subnets(pool: Option<&Resource>, subnets: &[SubnetInfo]) -> NetcfgResult<Vec<SubnetInfo>> {
    let declared: Vec<String> = match pool.and_then(|p| p.field(POOL_SUBNETS)) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    if declared.is_empty() {
        return Ok(subnets.to_vec());
    }

    declared
        .iter()
        .map(|id| {
            subnets
                .iter()
                .find(|s| s.subnet_uuid.as_deref() == Some(id.as_str()))
                .cloned()
                .ok_or_else(|| {
                    NetcfgError::validation(POOL_SUBNETS, format!("subnet {} is not on the network", id))
                })
        })
        .collect()
}

/// Allocate an address for a floating IP being created
///
/// Walks the candidate subnets in order, skipping exhausted ones. The
/// address is recorded on `fip` and an undo that releases it is pushed
/// before returning.
pub async fn allocate_floating_ip(
    ctx: &mut TransactionContext,
    addresses: &Arc<AddressManager>,
    store: &dyn ObjectStore,
    fip: &mut Resource,
) -> NetcfgResult<()> {
    if shadows_instance_ip(fip) {
        debug!("Floating IP {} shadows an instance-ip, no allocation", fip.fq_name_str());
        return Ok(());
    }

    let vn_fq_name = network_fq_name(fip)?;
    let vn = store
        .read_by_name(ResourceType::VirtualNetwork, &vn_fq_name)
        .await?
        .ok_or_else(|| NetcfgError::not_found(format!("virtual-network {}", vn_fq_name.join(":"))))?;
    let subnets = parse_subnets(&vn)?;
    let from_start = addr_from_start(&vn);
    let requested = requested_address(fip)?;

    if let Some(addr) = requested {
        if addresses.is_allocated(&vn_fq_name, &subnets, from_start, &addr).await? {
            return Err(NetcfgError::conflict(addr.to_string(), "address in use"));
        }
    }

    let pool = store
        .read_by_name(ResourceType::FloatingIpPool, fip.parent_fq_name())
        .await?;
    let mut candidates = candidate_subnets(pool.as_ref(), &subnets)?;
    if let Some(addr) = requested {
        candidates.retain(|s| s.contains(&addr));
        if candidates.is_empty() {
            return Err(NetcfgError::validation(
                FLOATING_IP_ADDRESS,
                format!("{} is not in any candidate subnet", addr),
            ));
        }
    }

    let owner = fip.uuid()?.to_string();
    let mut tried = Vec::new();
    let mut allocated = None;
    for subnet in candidates {
        match addresses
            .alloc_in_subnet(&vn_fq_name, &subnet, from_start, requested, &owner)
            .await?
        {
            Ok(addr) => {
                allocated = Some((subnet, addr));
                break;
            }
            Err(exhausted) => {
                debug!("Subnet {} exhausted, trying next candidate", exhausted.subnet);
                tried.push(exhausted.subnet);
            }
        }
    }

    let Some((subnet, addr)) = allocated else {
        return Err(NetcfgError::SubnetExhausted {
            network: vn_fq_name.join(":"),
            tried,
        });
    };

    {
        let addresses = addresses.clone();
        let vn_fq_name = vn_fq_name.clone();
        let subnet = subnet.clone();
        let owner = owner.clone();
        ctx.push_undo(
            format!("free floating ip {} in {}", addr, subnet.label()),
            move || async move {
                addresses
                    .free_address(&vn_fq_name, &subnet, from_start, &addr, &owner)
                    .await
                    .map(|_| ())
            },
        );
    }

    info!("Allocated floating ip {} for {}", addr, fip.fq_name_str());
    fip.set_field(FLOATING_IP_ADDRESS, addr.to_string());
    if let Some(id) = &subnet.subnet_uuid {
        fip.set_field(FLOATING_IP_SUBNET, id.clone());
    }
    Ok(())
}

/// Find the network, subnet and address of a stored floating IP
pub async fn locate_floating_ip(
    store: &dyn ObjectStore,
    fip: &Resource,
) -> NetcfgResult<Option<FloatingIpLocation>> {
    if shadows_instance_ip(fip) {
        return Ok(None);
    }
    let Some(address) = requested_address(fip)? else {
        return Ok(None);
    };
    let vn_fq_name = network_fq_name(fip)?;
    let Some(vn) = store
        .read_by_name(ResourceType::VirtualNetwork, &vn_fq_name)
        .await?
    else {
        return Ok(None);
    };
    let subnets = parse_subnets(&vn)?;
    let Some(subnet) = AddressManager::find_subnet(&subnets, &address).cloned() else {
        return Ok(None);
    };
    Ok(Some(FloatingIpLocation {
        vn_fq_name,
        subnet,
        from_start: addr_from_start(&vn),
        address,
    }))
}

/// Return a deleted floating IP's address to its subnet
pub async fn release_floating_ip(
    addresses: &AddressManager,
    store: &dyn ObjectStore,
    fip: &Resource,
) -> NetcfgResult<bool> {
    let Some(location) = locate_floating_ip(store, fip).await? else {
        return Ok(false);
    };
    addresses
        .free_address(
            &location.vn_fq_name,
            &location.subnet,
            location.from_start,
            &location.address,
            &fip.uuid()?.to_string(),
        )
        .await
}
