//! Address management for virtual-network subnets
//!
//! Every subnet of a virtual network gets its own [`IndexAllocator`] whose
//! indices are host offsets from the subnet's network address. Index 1 is
//! the first usable host; the network and broadcast addresses are never
//! handed out.

mod scarce;

pub use self::scarce::{
    allocate_floating_ip, locate_floating_ip, release_floating_ip, shadows_instance_ip,
    FloatingIpLocation, FLOATING_IP_ADDRESS, FLOATING_IP_SUBNET, POOL_SUBNETS,
};

use crate::allocator::{AllocatorRegistry, AllocatorSpec, IndexAllocator, SUBNET_ALLOC_PATH};
use crate::error::{NetcfgError, NetcfgResult};
use crate::resource::Resource;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Field on a virtual network holding its subnet list
pub const SUBNETS_FIELD: &str = "subnets";
/// Field selecting allocation direction; `false` allocates from the top
pub const ADDR_FROM_START_FIELD: &str = "addr_from_start";

/// Owner recorded on the gateway's allocation node
pub const GATEWAY_OWNER: &str = "__gateway__";

/// Per-subnet host indices are capped so the bitmap stays small
const MAX_HOSTS: u64 = 65535;

/// One subnet entry as stored on a virtual network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    #[serde(default)]
    pub subnet_uuid: Option<String>,
    pub prefix: IpNet,
    #[serde(default)]
    pub default_gateway: Option<IpAddr>,
}

impl SubnetInfo {
    pub fn label(&self) -> String {
        match &self.subnet_uuid {
            Some(id) => format!("{} ({})", self.prefix, id),
            None => self.prefix.to_string(),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.prefix.contains(addr)
    }

    /// Usable host indices are `1..=host_count()`
    pub fn host_count(&self) -> u64 {
        let host_bits = u32::from(self.prefix.max_prefix_len() - self.prefix.prefix_len());
        if host_bits >= 17 {
            MAX_HOSTS
        } else {
            (1u64 << host_bits).saturating_sub(2)
        }
    }

    pub fn index_of(&self, addr: &IpAddr) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }
        let offset = ip_to_u128(addr).checked_sub(ip_to_u128(&self.prefix.network()))?;
        let offset = u64::try_from(offset).ok()?;
        (1..=self.host_count()).contains(&offset).then_some(offset)
    }

    pub fn address_at(&self, index: u64) -> IpAddr {
        u128_to_ip(
            ip_to_u128(&self.prefix.network()) + u128::from(index),
            self.prefix.network().is_ipv4(),
        )
    }

    fn first_host(&self) -> IpAddr {
        self.address_at(1)
    }
}

impl fmt::Display for SubnetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn ip_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn u128_to_ip(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

/// The candidate subnet had no free address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetExhausted {
    pub subnet: String,
}

/// Parse the subnet list of a virtual network
pub fn parse_subnets(vn: &Resource) -> NetcfgResult<Vec<SubnetInfo>> {
    match vn.field(SUBNETS_FIELD) {
        None => Ok(Vec::new()),
        Some(value) => parse_subnet_value(value),
    }
}

pub fn parse_subnet_value(value: &Value) -> NetcfgResult<Vec<SubnetInfo>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| NetcfgError::validation(SUBNETS_FIELD, format!("invalid subnet list: {}", e)))
}

/// Validate a subnet list and fill in generated uuids and default gateways
pub fn normalize_subnets(subnets: &mut [SubnetInfo]) -> NetcfgResult<()> {
    let mut seen_uuids = HashSet::new();
    let mut seen_prefixes = HashSet::new();
    for subnet in subnets.iter_mut() {
        subnet.prefix = subnet.prefix.trunc();
        if subnet.host_count() == 0 {
            return Err(NetcfgError::validation(
                SUBNETS_FIELD,
                format!("subnet {} has no usable host addresses", subnet.prefix),
            ));
        }
        if !seen_prefixes.insert(subnet.prefix) {
            return Err(NetcfgError::validation(
                SUBNETS_FIELD,
                format!("subnet {} listed twice", subnet.prefix),
            ));
        }

        let id = subnet
            .subnet_uuid
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        if !seen_uuids.insert(id.clone()) {
            return Err(NetcfgError::validation(
                SUBNETS_FIELD,
                format!("subnet uuid {} is not unique", id),
            ));
        }

        match subnet.default_gateway {
            Some(gw) if subnet.index_of(&gw).is_none() => {
                return Err(NetcfgError::validation(
                    SUBNETS_FIELD,
                    format!("gateway {} is not a host address of {}", gw, subnet.prefix),
                ));
            }
            Some(_) => {}
            None => subnet.default_gateway = Some(subnet.first_host()),
        }
    }
    Ok(())
}

pub fn subnets_to_value(subnets: &[SubnetInfo]) -> NetcfgResult<Value> {
    Ok(serde_json::to_value(subnets)?)
}

pub fn addr_from_start(vn: &Resource) -> bool {
    vn.field_bool(ADDR_FROM_START_FIELD).unwrap_or(true)
}

/// Per-subnet address allocators
pub struct AddressManager {
    allocators: Arc<AllocatorRegistry>,
}

impl AddressManager {
    pub fn new(allocators: Arc<AllocatorRegistry>) -> Self {
        Self { allocators }
    }

    /// `/api-server/subnets/<vn fq>:<prefix>/` with `/` escaped
    pub fn subnet_path(vn_fq_name: &[String], subnet: &SubnetInfo) -> String {
        let key = format!("{}:{}", vn_fq_name.join(":"), subnet.prefix);
        format!("{}{}/", SUBNET_ALLOC_PATH, key.replace('/', "_"))
    }

    fn spec(vn_fq_name: &[String], subnet: &SubnetInfo, from_start: bool) -> AllocatorSpec {
        let path = Self::subnet_path(vn_fq_name, subnet);
        if from_start {
            AllocatorSpec::new(path, subnet.host_count(), 1)
        } else {
            AllocatorSpec::new(path, subnet.host_count(), 0).reversed()
        }
    }

    async fn allocator(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
    ) -> NetcfgResult<Arc<IndexAllocator>> {
        self.allocators
            .allocator(Self::spec(vn_fq_name, subnet, from_start))
            .await
    }

    /// Open a subnet's allocator and claim its gateway
    ///
    /// Returns false when the namespace already held allocations; the caller
    /// did not create it and must not remove it on rollback.
    pub async fn create_subnet(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
    ) -> NetcfgResult<bool> {
        let allocator = self.allocator(vn_fq_name, subnet, from_start).await?;
        let created = allocator.allocations().await?.is_empty();
        if let Some(index) = subnet.default_gateway.and_then(|gw| subnet.index_of(&gw)) {
            if allocator.reserve(index, GATEWAY_OWNER).await?.is_none()
                && allocator.read(index).await?.as_deref() != Some(GATEWAY_OWNER)
            {
                return Err(NetcfgError::conflict(
                    subnet.label(),
                    "gateway address already allocated",
                ));
            }
        }
        if created {
            info!("Created address allocator for {}", subnet.label());
        } else {
            debug!("Address allocator for {} already holds allocations", subnet.label());
        }
        Ok(created)
    }

    /// Remove a subnet's allocator namespace
    pub async fn delete_subnet(&self, vn_fq_name: &[String], subnet: &SubnetInfo) -> NetcfgResult<()> {
        self.allocators
            .forget(&Self::subnet_path(vn_fq_name, subnet))
            .await
    }

    /// Addresses allocated in a subnet other than its gateway
    pub async fn allocated_addresses(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
    ) -> NetcfgResult<Vec<(IpAddr, String)>> {
        let allocator = self.allocator(vn_fq_name, subnet, from_start).await?;
        Ok(allocator
            .allocations()
            .await?
            .into_iter()
            .filter(|(_, owner)| owner != GATEWAY_OWNER)
            .map(|(index, owner)| (subnet.address_at(index), owner))
            .collect())
    }

    /// Allocate in one subnet
    ///
    /// The outer result carries infrastructure failures and a requested
    /// address that is already taken; the inner one says whether the subnet
    /// had room.
    pub async fn alloc_in_subnet(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
        requested: Option<IpAddr>,
        owner: &str,
    ) -> NetcfgResult<Result<IpAddr, SubnetExhausted>> {
        let allocator = self.allocator(vn_fq_name, subnet, from_start).await?;

        if let Some(addr) = requested {
            let index = subnet.index_of(&addr).ok_or_else(|| {
                NetcfgError::validation(
                    "ip_address",
                    format!("{} is not a host address of {}", addr, subnet.prefix),
                )
            })?;
            return match allocator.reserve(index, owner).await? {
                Some(_) => Ok(Ok(addr)),
                None => Err(NetcfgError::conflict(addr.to_string(), "address in use")),
            };
        }

        match allocator.alloc(owner).await {
            Ok(index) => {
                let addr = subnet.address_at(index);
                debug!("Allocated {} from {}", addr, subnet.label());
                Ok(Ok(addr))
            }
            Err(NetcfgError::ResourceExhausted { .. }) => Ok(Err(SubnetExhausted {
                subnet: subnet.label(),
            })),
            Err(e) => Err(e),
        }
    }

    /// Find the subnet owning `addr`
    pub fn find_subnet<'a>(subnets: &'a [SubnetInfo], addr: &IpAddr) -> Option<&'a SubnetInfo> {
        subnets.iter().find(|s| s.contains(addr))
    }

    pub async fn is_allocated(
        &self,
        vn_fq_name: &[String],
        subnets: &[SubnetInfo],
        from_start: bool,
        addr: &IpAddr,
    ) -> NetcfgResult<bool> {
        let Some(subnet) = Self::find_subnet(subnets, addr) else {
            return Ok(false);
        };
        let Some(index) = subnet.index_of(addr) else {
            return Ok(false);
        };
        let allocator = self.allocator(vn_fq_name, subnet, from_start).await?;
        Ok(allocator.read(index).await?.is_some())
    }

    /// Release `addr` if it is still recorded for `owner`
    pub async fn free_address(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
        addr: &IpAddr,
        owner: &str,
    ) -> NetcfgResult<bool> {
        let Some(index) = subnet.index_of(addr) else {
            return Ok(false);
        };
        let allocator = self.allocator(vn_fq_name, subnet, from_start).await?;
        let freed = allocator.delete_if_owner(index, owner).await?;
        if freed {
            debug!("Freed {} in {}", addr, subnet.label());
        }
        Ok(freed)
    }

    /// Mark an address allocated by another instance
    pub async fn lock_address(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
        addr: &IpAddr,
    ) -> NetcfgResult<()> {
        if let Some(index) = subnet.index_of(addr) {
            self.allocator(vn_fq_name, subnet, from_start)
                .await?
                .set_in_use(index);
        }
        Ok(())
    }

    pub async fn unlock_address(
        &self,
        vn_fq_name: &[String],
        subnet: &SubnetInfo,
        from_start: bool,
        addr: &IpAddr,
    ) -> NetcfgResult<()> {
        if let Some(index) = subnet.index_of(addr) {
            self.allocator(vn_fq_name, subnet, from_start)
                .await?
                .reset_in_use(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorSettings;
    use crate::coordination::MemoryCoordinator;

    fn subnet(prefix: &str) -> SubnetInfo {
        SubnetInfo {
            subnet_uuid: None,
            prefix: prefix.parse().unwrap(),
            default_gateway: None,
        }
    }

    fn manager() -> AddressManager {
        let registry = AllocatorRegistry::new(
            Arc::new(MemoryCoordinator::new()),
            AllocatorSettings::default(),
        );
        AddressManager::new(Arc::new(registry))
    }

    fn vn() -> Vec<String> {
        vec!["default-domain".into(), "admin".into(), "public".into()]
    }

    #[test]
    fn test_host_indices() {
        let s = subnet("10.0.0.0/29");
        assert_eq!(s.host_count(), 6);
        assert_eq!(s.index_of(&"10.0.0.1".parse().unwrap()), Some(1));
        assert_eq!(s.index_of(&"10.0.0.6".parse().unwrap()), Some(6));
        assert_eq!(s.index_of(&"10.0.0.7".parse().unwrap()), None);
        assert_eq!(s.index_of(&"10.0.0.0".parse().unwrap()), None);
        assert_eq!(s.address_at(3), "10.0.0.3".parse::<IpAddr>().unwrap());

        assert_eq!(subnet("fd00::/64").host_count(), MAX_HOSTS);
        assert_eq!(subnet("10.0.0.0/31").host_count(), 0);
    }

    #[test]
    fn test_normalize_fills_gateway_and_uuid() {
        let mut subnets = vec![subnet("10.1.0.0/24")];
        normalize_subnets(&mut subnets).unwrap();
        assert_eq!(subnets[0].default_gateway, Some("10.1.0.1".parse().unwrap()));
        assert!(subnets[0].subnet_uuid.is_some());
    }

    #[test]
    fn test_normalize_rejects_gateway_outside_prefix() {
        let mut s = subnet("10.1.0.0/24");
        s.default_gateway = Some("10.2.0.1".parse().unwrap());
        assert!(normalize_subnets(&mut [s]).is_err());
    }

    #[test]
    fn test_normalize_rejects_duplicate_prefix() {
        let mut subnets = vec![subnet("10.1.0.0/24"), subnet("10.1.0.0/24")];
        assert!(normalize_subnets(&mut subnets).is_err());
    }

    #[tokio::test]
    async fn test_gateway_is_skipped() {
        let ipam = manager();
        let mut subnets = vec![subnet("192.168.1.0/30")];
        normalize_subnets(&mut subnets).unwrap();
        ipam.create_subnet(&vn(), &subnets[0], true).await.unwrap();

        let first = ipam
            .alloc_in_subnet(&vn(), &subnets[0], true, None, "fip-1")
            .await
            .unwrap();
        assert_eq!(first, Ok("192.168.1.2".parse().unwrap()));

        let second = ipam
            .alloc_in_subnet(&vn(), &subnets[0], true, None, "fip-2")
            .await
            .unwrap();
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_reverse_allocation_starts_at_top() {
        let ipam = manager();
        let mut subnets = vec![subnet("10.0.0.0/29")];
        normalize_subnets(&mut subnets).unwrap();
        ipam.create_subnet(&vn(), &subnets[0], false).await.unwrap();

        let addr = ipam
            .alloc_in_subnet(&vn(), &subnets[0], false, None, "fip-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr, "10.0.0.6".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_requested_address_in_use_is_conflict() {
        let ipam = manager();
        let mut subnets = vec![subnet("10.0.0.0/24")];
        normalize_subnets(&mut subnets).unwrap();
        ipam.create_subnet(&vn(), &subnets[0], true).await.unwrap();

        let wanted: IpAddr = "10.0.0.20".parse().unwrap();
        ipam.alloc_in_subnet(&vn(), &subnets[0], true, Some(wanted), "a")
            .await
            .unwrap()
            .unwrap();
        assert!(ipam.is_allocated(&vn(), &subnets, true, &wanted).await.unwrap());

        let err = ipam
            .alloc_in_subnet(&vn(), &subnets[0], true, Some(wanted), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, NetcfgError::Conflict { .. }));

        assert!(!ipam.free_address(&vn(), &subnets[0], true, &wanted, "b").await.unwrap());
        assert!(ipam.free_address(&vn(), &subnets[0], true, &wanted, "a").await.unwrap());
        assert!(!ipam.is_allocated(&vn(), &subnets, true, &wanted).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopening_a_subnet_is_not_a_create() {
        let ipam = manager();
        let mut subnets = vec![subnet("10.0.0.0/29")];
        normalize_subnets(&mut subnets).unwrap();

        assert!(ipam.create_subnet(&vn(), &subnets[0], true).await.unwrap());
        assert!(!ipam.create_subnet(&vn(), &subnets[0], true).await.unwrap());
    }
}
