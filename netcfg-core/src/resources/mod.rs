//! Hooks for the resource types that need more than a plain write

mod bgp_router;
mod floating_ip;
mod global_system_config;
mod logical_interface;
mod security_group;
mod tag;
mod tag_type;
mod virtual_network;

pub use self::bgp_router::{BgpRouterHooks, CONTROL_NODE, ROUTER_TYPE};
pub use self::floating_ip::FloatingIpHooks;
pub use self::global_system_config::GlobalSystemConfigHooks;
pub use self::logical_interface::{LogicalInterfaceHooks, ESI, VLAN_TAG};
pub use self::security_group::{SecurityGroupHooks, SECURITY_GROUP_ID};
pub use self::tag::{TagHooks, TAG_ID, TAG_TYPE_NAME, TAG_VALUE, TAG_VALUE_OWNER, TAG_VALUE_SCOPE};
pub use self::tag_type::{predefined_type_code, TagTypeHooks, PREDEFINED_TAG_TYPES, TAG_TYPE_ID};
pub use self::virtual_network::{VirtualNetworkHooks, NETWORK_ID};

use crate::config::PolicyConfig;
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, HookRegistry};
use crate::resource::{Resource, ResourceType};
use crate::store::ListFilter;
use serde_json::Value;
use std::sync::Arc;

pub const AUTONOMOUS_SYSTEM: &str = "autonomous_system";
pub const ENABLE_4BYTE_AS: &str = "enable_4byte_as";
pub const ROUTE_TARGET_LIST: &str = "route_target_list";

/// Hook registry with every built-in resource type registered
pub fn default_hooks() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry
        .register(ResourceType::TagType, Arc::new(TagTypeHooks))
        .register(ResourceType::Tag, Arc::new(TagHooks))
        .register(ResourceType::FloatingIp, Arc::new(FloatingIpHooks))
        .register(ResourceType::VirtualNetwork, Arc::new(VirtualNetworkHooks))
        .register(ResourceType::SecurityGroup, Arc::new(SecurityGroupHooks))
        .register(ResourceType::GlobalSystemConfig, Arc::new(GlobalSystemConfigHooks))
        .register(ResourceType::BgpRouter, Arc::new(BgpRouterHooks))
        .register(ResourceType::LogicalInterface, Arc::new(LogicalInterfaceHooks));
    registry
}

/// Check an autonomous system number against the accepted range
pub fn validate_asn(asn: u64, four_byte: bool) -> NetcfgResult<()> {
    let max = if four_byte {
        u32::MAX as u64
    } else {
        u16::MAX as u64
    };
    if asn == 0 || asn > max {
        return Err(NetcfgError::validation(
            AUTONOMOUS_SYSTEM,
            format!("ASN {} out of range 1..={}", asn, max),
        ));
    }
    Ok(())
}

/// Autonomous-system part and number of `target:<asn>:<n>`
///
/// `None` for the `target:<ip>:<n>` form. Anything else is malformed.
pub fn parse_route_target(text: &str) -> NetcfgResult<Option<(u64, u64)>> {
    let malformed = || NetcfgError::validation(ROUTE_TARGET_LIST, format!("malformed route target '{}'", text));
    let mut parts = text.split(':');
    if parts.next() != Some("target") {
        return Err(malformed());
    }
    let (Some(admin), Some(number), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed());
    };
    let number: u64 = number.parse().map_err(|_| malformed())?;
    if admin.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(None);
    }
    let asn: u64 = admin.parse().map_err(|_| malformed())?;
    Ok(Some((asn, number)))
}

pub(crate) fn route_targets(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Reject route targets in the automatically allocated range of `asn`
pub(crate) fn check_route_targets(
    owner: &str,
    targets: &[String],
    asn: Option<u64>,
    policy: &PolicyConfig,
) -> NetcfgResult<()> {
    for target in targets {
        if let Some((target_asn, number)) = parse_route_target(target)? {
            if Some(target_asn) == asn && number >= policy.bgp_rtgt_min_id {
                return Err(NetcfgError::conflict(
                    owner.to_string(),
                    format!(
                        "route target {} collides with automatically allocated targets (>= {})",
                        target, policy.bgp_rtgt_min_id
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// The single global-system-config, if created
pub(crate) async fn global_system_config(env: &HookEnv) -> NetcfgResult<Option<Resource>> {
    Ok(env
        .store
        .list(ResourceType::GlobalSystemConfig, &ListFilter::all())
        .await?
        .into_iter()
        .next())
}

pub(crate) async fn four_byte_enabled(env: &HookEnv) -> NetcfgResult<bool> {
    let configured = global_system_config(env)
        .await?
        .and_then(|gsc| gsc.field_bool(ENABLE_4BYTE_AS));
    Ok(configured.unwrap_or(env.policy.enable_4byte_as))
}

/// Hook collaborators over in-memory backends
#[cfg(test)]
pub(crate) fn test_env() -> HookEnv {
    use crate::allocator::{AllocatorRegistry, AllocatorSettings};
    use crate::coordination::MemoryCoordinator;
    use crate::ipam::AddressManager;
    use crate::metrics::MetricsRegistry;
    use crate::store::MemoryObjectStore;

    let allocators = Arc::new(AllocatorRegistry::new(
        Arc::new(MemoryCoordinator::new()),
        AllocatorSettings::default(),
    ));
    HookEnv {
        store: Arc::new(MemoryObjectStore::new()),
        addresses: Arc::new(AddressManager::new(allocators.clone())),
        allocators,
        policy: PolicyConfig::default(),
        metrics: MetricsRegistry::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asn_range() {
        assert!(validate_asn(64512, false).is_ok());
        assert!(validate_asn(0, false).is_err());
        assert!(validate_asn(70000, false).is_err());
        assert!(validate_asn(70000, true).is_ok());
    }

    #[test]
    fn test_route_target_forms() {
        assert_eq!(parse_route_target("target:64512:8000001").unwrap(), Some((64512, 8_000_001)));
        assert_eq!(parse_route_target("target:10.0.0.1:5").unwrap(), None);
        assert!(parse_route_target("64512:1").is_err());
        assert!(parse_route_target("target:64512").is_err());
        assert!(parse_route_target("target:64512:x").is_err());
    }

    #[test]
    fn test_route_target_collision() {
        let policy = PolicyConfig::default();
        let targets = vec!["target:64512:8000000".to_string()];
        assert!(check_route_targets("vn", &targets, Some(64512), &policy).is_err());
        assert!(check_route_targets("vn", &targets, Some(64513), &policy).is_ok());
        let low = vec!["target:64512:100".to_string()];
        assert!(check_route_targets("vn", &low, Some(64512), &policy).is_ok());
    }
}
