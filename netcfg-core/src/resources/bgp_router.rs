use super::{four_byte_enabled, validate_asn, AUTONOMOUS_SYSTEM};
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Reference, Resource, ResourceType, ResourceUpdate};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use serde_json::Value;

pub const ROUTER_TYPE: &str = "router_type";
pub const CONTROL_NODE: &str = "control-node";

async fn validate(
    env: &HookEnv,
    fq_name: &str,
    router_type: Option<&str>,
    asn: Option<&Value>,
    refs: &[Reference],
) -> NetcfgResult<()> {
    let zones = refs
        .iter()
        .filter(|r| r.target_type == ResourceType::ControlNodeZone)
        .count();
    match router_type {
        Some(CONTROL_NODE) if zones > 1 => {
            return Err(NetcfgError::validation(
                "control_node_zone_refs",
                format!("control node {} may reference at most one control-node-zone", fq_name),
            ));
        }
        Some(CONTROL_NODE) => {}
        _ if zones > 0 => {
            return Err(NetcfgError::validation(
                "control_node_zone_refs",
                format!("only control nodes may reference a control-node-zone ({})", fq_name),
            ));
        }
        _ => {}
    }

    if let Some(value) = asn.filter(|v| !v.is_null()) {
        let asn = value
            .as_u64()
            .ok_or_else(|| NetcfgError::validation(AUTONOMOUS_SYSTEM, "ASN must be an unsigned integer"))?;
        validate_asn(asn, four_byte_enabled(env).await?)?;
    }
    Ok(())
}

pub struct BgpRouterHooks;

#[async_trait]
impl ResourceHooks for BgpRouterHooks {
    async fn pre_create(
        &self,
        _ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        validate(
            env,
            &resource.fq_name_str(),
            resource.field_str(ROUTER_TYPE),
            resource.field(AUTONOMOUS_SYSTEM),
            &resource.refs,
        )
        .await
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        let router_type = match update.field(ROUTER_TYPE) {
            Some(v) => v.as_str(),
            None => current.field_str(ROUTER_TYPE),
        };
        let asn = if update.touches(AUTONOMOUS_SYSTEM) {
            update.field(AUTONOMOUS_SYSTEM)
        } else {
            None
        };
        let refs = update.refs.as_deref().unwrap_or(&current.refs);
        validate(env, &current.fq_name_str(), router_type, asn, refs).await
    }
}
