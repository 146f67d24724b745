use super::tag_type::{ensure_tag_type, predefined_type_code, release_tag_type};
use crate::allocator::{IdFamily, ScopeKey};
use crate::composite::CompositeId;
use crate::error::{NetcfgError, NetcfgResult};
use crate::pipeline::{HookEnv, ResourceHooks};
use crate::resource::{Reference, Resource, ResourceType, ResourceUpdate};
use crate::store::ListFilter;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use tracing::{debug, info};

pub const TAG_TYPE_NAME: &str = "tag_type_name";
pub const TAG_VALUE: &str = "tag_value";
pub const TAG_ID: &str = "tag_id";
/// Counter namespace the value sequence came from
pub const TAG_VALUE_SCOPE: &str = "tag_value_scope";
/// Owner recorded on the value sequence node
pub const TAG_VALUE_OWNER: &str = "tag_value_owner";

const IMMUTABLE: [&str; 6] = [
    "name",
    TAG_TYPE_NAME,
    TAG_VALUE,
    TAG_ID,
    TAG_VALUE_SCOPE,
    TAG_VALUE_OWNER,
];

fn required<'a>(resource: &'a Resource, key: &str) -> NetcfgResult<&'a str> {
    match resource.field_str(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(NetcfgError::validation(key, format!("tag requires {}", key))),
    }
}

/// Value-sequence location persisted on a tag
struct TagValueSlot {
    scope: ScopeKey,
    owner: String,
    id: CompositeId,
}

impl TagValueSlot {
    fn of(tag: &Resource) -> NetcfgResult<Self> {
        let id: CompositeId = required(tag, TAG_ID)?.parse()?;
        Ok(Self {
            scope: ScopeKey::new(required(tag, TAG_VALUE_SCOPE)?),
            owner: required(tag, TAG_VALUE_OWNER)?.to_string(),
            id,
        })
    }

    fn seq(&self) -> u64 {
        u64::from(self.id.value)
    }
}

pub struct TagHooks;

#[async_trait]
impl ResourceHooks for TagHooks {
    /// A tag's name is its type and value; a suffixed copy would be a
    /// different tag
    fn allow_name_retry(&self) -> bool {
        false
    }

    fn pre_alloc(&self, resource: &mut Resource) -> NetcfgResult<()> {
        let type_name = required(resource, TAG_TYPE_NAME)?.to_lowercase();
        let value = required(resource, TAG_VALUE)?.to_string();
        let name = format!("{}={}", type_name, value);

        resource.set_field(TAG_TYPE_NAME, type_name);
        resource.set_field("name", name.clone());
        resource.set_field("display_name", name.clone());
        match resource.fq_name.last_mut() {
            Some(last) => *last = name,
            None => resource.fq_name.push(name),
        }
        Ok(())
    }

    async fn pre_create(
        &self,
        ctx: &mut TransactionContext,
        env: &HookEnv,
        resource: &mut Resource,
    ) -> NetcfgResult<()> {
        if resource.field(TAG_ID).is_some() {
            return Err(NetcfgError::validation(TAG_ID, "tag id is allocated by the system"));
        }
        if resource.refs_of(ResourceType::TagType).next().is_some() {
            return Err(NetcfgError::validation(
                "tag_type_refs",
                "tag type reference is set by the system",
            ));
        }

        let type_name = required(resource, TAG_TYPE_NAME)?.to_string();
        let (type_code, type_uuid) = ensure_tag_type(ctx, env, &type_name).await?;

        let scope = ScopeKey::new(type_name.as_str());
        let owner = resource.fq_name_str();
        let seq = env.allocators.alloc_tag_value_id(&scope, &owner).await?;
        {
            let allocators = env.allocators.clone();
            let scope = scope.clone();
            let owner = owner.clone();
            ctx.push_undo(format!("free tag value {} in {}", seq, scope), move || async move {
                allocators
                    .free_tag_value_id(&scope, seq, &owner)
                    .await
                    .map(|_| ())
            });
        }

        let id = CompositeId::new(u64::from(type_code), seq)?;
        debug!("Tag {} gets id {}", owner, id);
        resource.set_field(TAG_ID, id.to_string());
        resource.set_field(TAG_VALUE_SCOPE, scope.as_str());
        resource.set_field(TAG_VALUE_OWNER, owner);
        resource.refs.push(Reference::new(ResourceType::TagType, vec![type_name]).with_uuid(type_uuid));
        Ok(())
    }

    async fn pre_update(
        &self,
        _ctx: &mut TransactionContext,
        _env: &HookEnv,
        current: &Resource,
        update: &mut ResourceUpdate,
    ) -> NetcfgResult<()> {
        for key in IMMUTABLE {
            if update.touches(key) && update.field(key) != current.field(key) {
                return Err(NetcfgError::validation(key, format!("tag {} cannot be changed", key)));
            }
        }
        if let Some(refs) = &update.refs {
            let before: Vec<_> = current.refs_of(ResourceType::TagType).map(|r| r.uuid).collect();
            let after: Vec<_> = refs
                .iter()
                .filter(|r| r.target_type == ResourceType::TagType)
                .map(|r| r.uuid)
                .collect();
            if before != after {
                return Err(NetcfgError::validation("tag_type_refs", "tag type reference cannot be changed"));
            }
        }
        Ok(())
    }

    async fn post_delete(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        let slot = TagValueSlot::of(resource)?;
        env.allocators
            .free_tag_value_id(&slot.scope, slot.seq(), &slot.owner)
            .await?;

        let type_name = required(resource, TAG_TYPE_NAME)?;
        if predefined_type_code(type_name).is_some() {
            return Ok(());
        }

        let remaining = env
            .store
            .list(
                ResourceType::Tag,
                &ListFilter::all().field(TAG_TYPE_NAME, type_name),
            )
            .await?;
        if !remaining.is_empty() {
            return Ok(());
        }

        let fq_name = vec![type_name.to_string()];
        let Some(tag_type) = env.store.read_by_name(ResourceType::TagType, &fq_name).await? else {
            return Ok(());
        };
        let tag_type_uuid = tag_type.uuid()?;
        if !env.store.referrers(tag_type_uuid).await?.is_empty() {
            return Ok(());
        }
        env.store.delete(ResourceType::TagType, tag_type_uuid).await?;
        release_tag_type(env, &tag_type).await?;
        info!("Deleted unused tag type {}", type_name);
        Ok(())
    }

    async fn on_create_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        let slot = TagValueSlot::of(resource)?;
        env.allocators
            .tag_values()
            .lock_value(&slot.scope, slot.seq())
            .await?;

        let type_name = required(resource, TAG_TYPE_NAME)?;
        if predefined_type_code(type_name).is_none() {
            env.allocators
                .lock_id(IdFamily::TagType, u64::from(slot.id.type_code))
                .await?;
        }
        Ok(())
    }

    async fn on_delete_notification(&self, env: &HookEnv, resource: &Resource) -> NetcfgResult<()> {
        let slot = TagValueSlot::of(resource)?;
        env.allocators
            .tag_values()
            .unlock_value(&slot.scope, slot.seq())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_composed_from_type_and_value() {
        let mut tag = Resource::new(ResourceType::Tag, vec!["d", "p", "anything"])
            .with_field(TAG_TYPE_NAME, "Tier")
            .with_field(TAG_VALUE, "Web");
        TagHooks.pre_alloc(&mut tag).unwrap();

        assert_eq!(tag.name(), "tier=Web");
        assert_eq!(tag.field_str("display_name"), Some("tier=Web"));
        assert_eq!(tag.field_str(TAG_TYPE_NAME), Some("tier"));
        assert_eq!(tag.fq_name[..2], ["d".to_string(), "p".to_string()]);
    }

    #[test]
    fn test_type_and_value_required() {
        let mut tag = Resource::new(ResourceType::Tag, vec!["t"]).with_field(TAG_TYPE_NAME, "tier");
        assert!(TagHooks.pre_alloc(&mut tag).is_err());
        let mut tag = Resource::new(ResourceType::Tag, vec!["t"])
            .with_field(TAG_TYPE_NAME, "")
            .with_field(TAG_VALUE, "web");
        assert!(TagHooks.pre_alloc(&mut tag).is_err());
    }

    #[test]
    fn test_value_slot_read_back() {
        let tag = Resource::new(ResourceType::Tag, vec!["t"])
            .with_field(TAG_ID, "0x00ff0003")
            .with_field(TAG_VALUE_SCOPE, "color")
            .with_field(TAG_VALUE_OWNER, "color=red");
        let slot = TagValueSlot::of(&tag).unwrap();
        assert_eq!(slot.seq(), 3);
        assert_eq!(slot.id.type_code, 0xff);
        assert_eq!(slot.owner, "color=red");
    }
}
