use crate::allocator::{IdFamily, ScopeKey};
use crate::composite::{format_type_code, parse_int};
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Resource, ResourceType, ResourceUpdate};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

pub const TAG_TYPE_ID: &str = "tag_type_id";
pub const DISPLAY_NAME: &str = "display_name";

/// Tag types with a fixed code; they are never allocated nor released
pub const PREDEFINED_TAG_TYPES: [(&str, u16); 6] = [
    ("label", 0),
    ("application", 1),
    ("tier", 2),
    ("deployment", 3),
    ("site", 4),
    ("neutron_fwaas", 5),
];

pub fn predefined_type_code(name: &str) -> Option<u16> {
    PREDEFINED_TAG_TYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
}

pub(crate) fn type_code_of(tag_type: &Resource) -> NetcfgResult<u16> {
    let text = tag_type.field_str(TAG_TYPE_ID).ok_or_else(|| {
        NetcfgError::internal(format!("tag-type {} has no {}", tag_type.fq_name_str(), TAG_TYPE_ID))
    })?;
    let code = parse_int(text)?;
    u16::try_from(code).map_err(|_| NetcfgError::validation(TAG_TYPE_ID, format!("{} exceeds 16 bits", text)))
}

/// Allocate a type code for a non-predefined tag type
async fn allocate_type_code(env: &HookEnv, tag_type: &mut Resource) -> NetcfgResult<u64> {
    let owner = tag_type.fq_name_str();
    let code = env.allocators.alloc_id(IdFamily::TagType, &owner).await?;
    tag_type.set_field(TAG_TYPE_ID, format_type_code(code as u16));
    debug!("Allocated tag type code {:#06x} for {}", code, owner);
    Ok(code)
}

fn push_free_type_code(ctx: &mut TransactionContext, env: &HookEnv, code: u64, owner: String) {
    let allocators = env.allocators.clone();
    ctx.push_undo(format!("free tag type code {:#06x}", code), move || async move {
        allocators
            .free_id(IdFamily::TagType, code, &owner)
            .await
            .map(|_| ())
    });
}

/// Release a deleted tag type's code and its value namespace
pub(crate) async fn release_tag_type(env: &HookEnv, tag_type: &Resource) -> NetcfgResult<()> {
    let name = tag_type.name().to_string();
    if predefined_type_code(&name).is_none() {
        let code = type_code_of(tag_type)?;
        env.allocators
            .free_id(IdFamily::TagType, u64::from(code), &tag_type.fq_name_str())
            .await?;
    }
    env.allocators
        .tag_values()
        .drop_scope(&ScopeKey::new(name.as_str()))
        .await?;
    info!("Released tag type {}", name);
    Ok(())
}

/// Find a tag type by name, creating it inside the caller's transaction
///
/// Returns the type code and the tag type's uuid. A tag type created here
/// is deleted again on rollback; an allocated code is freed after that.
pub(crate) async fn ensure_tag_type(
    ctx: &mut TransactionContext,
    env: &HookEnv,
    type_name: &str,
) -> NetcfgResult<(u16, Uuid)> {
    let fq_name = vec![type_name.to_string()];
    if let Some(existing) = env.store.read_by_name(ResourceType::TagType, &fq_name).await? {
        return Ok((type_code_of(&existing)?, existing.uuid()?));
    }

    let uuid = Uuid::new_v4();
    let mut tag_type = Resource::new(ResourceType::TagType, fq_name.clone())
        .with_uuid(uuid)
        .with_field(DISPLAY_NAME, type_name);

    let allocated = match predefined_type_code(type_name) {
        Some(code) => {
            tag_type.set_field(TAG_TYPE_ID, format_type_code(code));
            None
        }
        None => Some(allocate_type_code(env, &mut tag_type).await?),
    };
    let owner = tag_type.fq_name_str();

    if let Err(e) = env.store.create(&tag_type).await {
        if let Some(code) = allocated {
            env.allocators.free_id(IdFamily::TagType, code, &owner).await?;
        }
        if !e.is_already_exists() {
            return Err(e);
        }
        // Lost a race with another request creating the same type
        let existing = env
            .store
            .read_by_name(ResourceType::TagType, &fq_name)
            .await?
            .ok_or(e)?;
        return Ok((type_code_of(&existing)?, existing.uuid()?));
    }

    if let Some(code) = allocated {
        push_free_type_code(ctx, env, code, owner);
    }
    let store = env.store.clone();
    ctx.push_undo(format!("delete tag type {}", type_name), move || async move {
        match store.delete(ResourceType::TagType, uuid).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    });
    info!("Created tag type {}", type_name);
    Ok((type_code_of(&tag_type)?, uuid))
}

pub struct TagTypeHooks;

#[async_trait]
impl ResourceHooks for TagTypeHooks {
    fn allow_name_retry(&self) -> bool {
        false
    }

    fn pre_alloc(&self, resource: &mut Resource) -> NetcfgResult<()> {
        let Some(last) = resource.fq_name.last_mut() else {
            return Ok(());
        };
        *last = last.to_lowercase();
        let name = last.clone();
        if resource.field(DISPLAY_NAME).is_none() {
            resource.set_field(DISPLAY_NAME, name);
        }
        Ok(())
    }

    async fn pre_create(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        if resource.field(TAG_TYPE_ID).is_some() {
            return Err(NetcfgError::validation(TAG_TYPE_ID, "tag type id is allocated by the system"));
        }
        match predefined_type_code(resource.name()) {
            Some(code) => resource.set_field(TAG_TYPE_ID, format_type_code(code)),
            None => {
                let code = allocate_type_code(env, resource).await?;
                push_free_type_code(ctx, env, code, resource.fq_name_str());
            }
        }
        Ok(())
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        for key in [TAG_TYPE_ID, DISPLAY_NAME] {
            if update.touches(key) && update.field(key) != current.field(key) {
                return Err(NetcfgError::validation(key, format!("{} cannot be changed", key)));
            }
        }
        Ok(())
    }

    async fn post_delete(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        release_tag_type(env, resource).await
    }

    async fn on_create_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        if predefined_type_code(resource.name()).is_none() {
            let code = type_code_of(resource)?;
            env.allocators.lock_id(IdFamily::TagType, u64::from(code)).await?;
        }
        Ok(())
    }

    async fn on_delete_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        if predefined_type_code(resource.name()).is_none() {
            let code = type_code_of(resource)?;
            env.allocators.unlock_id(IdFamily::TagType, u64::from(code)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_env;

    #[tokio::test]
    async fn test_created_predefined_type_is_rolled_back() {
        let env = test_env();
        let mut ctx = TransactionContext::new();

        let (code, _) = ensure_tag_type(&mut ctx, &env, "application").await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(ctx.pending_undo(), 1);

        assert!(ctx.run_undo().await.is_ok());
        let fq_name = vec!["application".to_string()];
        assert!(env.store.read_by_name(ResourceType::TagType, &fq_name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_created_custom_type_is_rolled_back() {
        let env = test_env();
        let mut ctx = TransactionContext::new();

        let (code, _) = ensure_tag_type(&mut ctx, &env, "color").await.unwrap();
        assert_eq!(u64::from(code), crate::allocator::TAG_TYPE_RESERVED);
        assert_eq!(
            ctx.undo_descriptions(),
            vec!["free tag type code 0x00ff", "delete tag type color"]
        );

        assert!(ctx.run_undo().await.is_ok());
        let fq_name = vec!["color".to_string()];
        assert!(env.store.read_by_name(ResourceType::TagType, &fq_name).await.unwrap().is_none());
        assert_eq!(env.allocators.id_owner(IdFamily::TagType, u64::from(code)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_type_pushes_no_undo() {
        let env = test_env();
        let mut ctx = TransactionContext::new();
        let (_, first) = ensure_tag_type(&mut ctx, &env, "color").await.unwrap();
        ctx.discard_undo();

        let (_, again) = ensure_tag_type(&mut ctx, &env, "color").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(ctx.pending_undo(), 0);
    }

    #[tokio::test]
    async fn test_type_id_is_not_caller_supplied() {
        let env = test_env();
        let mut ctx = TransactionContext::new();
        let mut tag_type = Resource::new(ResourceType::TagType, vec!["shape"]).with_field(TAG_TYPE_ID, "0x0100");

        let err = TagTypeHooks.pre_create(&mut ctx, &env, &mut tag_type).await.unwrap_err();
        assert!(matches!(err, NetcfgError::Validation { .. }));
    }
}
