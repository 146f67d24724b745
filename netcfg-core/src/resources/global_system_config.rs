use super::{check_route_targets, route_targets, validate_asn, AUTONOMOUS_SYSTEM, ENABLE_4BYTE_AS, ROUTE_TARGET_LIST};
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Resource, ResourceType, ResourceUpdate};
use crate::store::ListFilter;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use serde_json::Value;

/// Reject an ASN that would collide with a manually configured route target
async fn check_networks(env: &HookEnv, asn: u64) -> NetcfgResult<()> {
    let networks = env
        .store
        .list(ResourceType::VirtualNetwork, &ListFilter::all())
        .await?;
    for vn in networks {
        check_route_targets(
            &vn.fq_name_str(),
            &route_targets(vn.field(ROUTE_TARGET_LIST)),
            Some(asn),
            &env.policy,
        )?;
    }
    Ok(())
}

fn asn_value(value: Option<&Value>) -> NetcfgResult<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| NetcfgError::validation(AUTONOMOUS_SYSTEM, "ASN must be an unsigned integer")),
    }
}

/// The one global configuration object: ASN and 4-byte ASN policy
pub struct GlobalSystemConfigHooks;

#[async_trait]
impl ResourceHooks for GlobalSystemConfigHooks {
    fn allow_name_retry(&self) -> bool {
        false
    }

    async fn pre_create(
        &self,
        _ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        let existing = env
            .store
            .list(ResourceType::GlobalSystemConfig, &ListFilter::all())
            .await?;
        if let Some(other) = existing.first() {
            return Err(NetcfgError::conflict(
                other.fq_name_str(),
                "only one global-system-config may exist",
            ));
        }

        let four_byte = resource
            .field_bool(ENABLE_4BYTE_AS)
            .unwrap_or(env.policy.enable_4byte_as);
        if let Some(asn) = asn_value(resource.field(AUTONOMOUS_SYSTEM))? {
            validate_asn(asn, four_byte)?;
            check_networks(env, asn).await?;
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
        if !update.touches(AUTONOMOUS_SYSTEM) && !update.touches(ENABLE_4BYTE_AS) {
            return Ok(());
        }

        let four_byte = match update.field(ENABLE_4BYTE_AS) {
            Some(v) => v.as_bool().unwrap_or(env.policy.enable_4byte_as),
            None => current
                .field_bool(ENABLE_4BYTE_AS)
                .unwrap_or(env.policy.enable_4byte_as),
        };
        let asn = if update.touches(AUTONOMOUS_SYSTEM) {
            asn_value(update.field(AUTONOMOUS_SYSTEM))?
        } else {
            asn_value(current.field(AUTONOMOUS_SYSTEM))?
        };

        if let Some(asn) = asn {
            validate_asn(asn, four_byte)?;
            if Some(asn) != current.field_u64(AUTONOMOUS_SYSTEM) {
                check_networks(env, asn).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_env;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_asn_value() {
        assert_eq!(asn_value(None).unwrap(), None);
        assert_eq!(asn_value(Some(&Value::Null)).unwrap(), None);
        assert_eq!(asn_value(Some(&json!(64512))).unwrap(), Some(64512));
        assert!(asn_value(Some(&json!("64512"))).is_err());
    }

    #[tokio::test]
    async fn test_asn_checked_against_every_network() {
        let env = test_env();
        for (name, target) in [("a", "target:64512:100"), ("b", "target:64513:8000005")] {
            env.store
                .create(
                    &Resource::new(ResourceType::VirtualNetwork, vec![name])
                        .with_uuid(Uuid::new_v4())
                        .with_field(ROUTE_TARGET_LIST, json!([target])),
                )
                .await
                .unwrap();
        }

        assert!(check_networks(&env, 64512).await.is_ok());
        assert!(matches!(
            check_networks(&env, 64513).await.unwrap_err(),
            NetcfgError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_four_byte_flag_on_create() {
        let env = test_env();
        let mut ctx = TransactionContext::new();
        let mut gsc = Resource::new(ResourceType::GlobalSystemConfig, vec!["gsc"]).with_field(AUTONOMOUS_SYSTEM, 100_000);
        assert!(GlobalSystemConfigHooks.pre_create(&mut ctx, &env, &mut gsc).await.is_err());

        let mut gsc = gsc.with_field(ENABLE_4BYTE_AS, true);
        assert!(GlobalSystemConfigHooks.pre_create(&mut ctx, &env, &mut gsc).await.is_ok());
    }
}
