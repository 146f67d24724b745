//! Consistency audit between allocator nodes and stored objects
//!
//! An allocation node without an object is stale (a crash between
//! allocation and commit, or a lost free). An object whose id has no node
//! can be handed out twice. Both are reported; only stale nodes can be
//! cleaned automatically.

use crate::allocator::{AllocatorRegistry, IdFamily, ScopeKey, SG_ID_RESERVED_OWNER, TAG_VALUE_ID_ALLOC_PATH};
use crate::composite::CompositeId;
use crate::error::NetcfgResult;
use crate::resource::ResourceType;
use crate::resources::{NETWORK_ID, SECURITY_GROUP_ID, TAG_ID, TAG_VALUE_SCOPE};
use crate::store::{ListFilter, ObjectStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditFamily {
    VirtualNetwork,
    SecurityGroup,
    Tag,
}

impl fmt::Display for AuditFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditFamily::VirtualNetwork => f.write_str("virtual-network ids"),
            AuditFamily::SecurityGroup => f.write_str("security-group ids"),
            AuditFamily::Tag => f.write_str("tag value ids"),
        }
    }
}

/// One id slot; `scope` is set for scoped counters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Allocation {
    pub scope: Option<String>,
    pub index: u64,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateId {
    pub scope: Option<String>,
    pub index: u64,
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdAuditReport {
    pub family: AuditFamily,
    /// Nodes with no object carrying their id
    pub extra: Vec<Allocation>,
    /// Object ids with no node; `owner` is the object's name
    pub missing: Vec<Allocation>,
    pub duplicates: Vec<DuplicateId>,
    pub objects_without_id: Vec<String>,
}

impl IdAuditReport {
    pub fn is_clean(&self) -> bool {
        self.extra.is_empty()
            && self.missing.is_empty()
            && self.duplicates.is_empty()
            && self.objects_without_id.is_empty()
    }
}

type Slot = (Option<String>, u64);

fn compare(
    family: AuditFamily,
    allocations: Vec<Allocation>,
    objects: Vec<(String, Option<Slot>)>,
) -> IdAuditReport {
    let mut by_slot: BTreeMap<Slot, Vec<String>> = BTreeMap::new();
    let mut objects_without_id = Vec::new();
    for (name, slot) in objects {
        match slot {
            Some(slot) => by_slot.entry(slot).or_default().push(name),
            None => objects_without_id.push(name),
        }
    }

    let allocated: BTreeMap<Slot, &Allocation> = allocations
        .iter()
        .map(|a| ((a.scope.clone(), a.index), a))
        .collect();

    let extra = allocations
        .iter()
        .filter(|a| !by_slot.contains_key(&(a.scope.clone(), a.index)))
        .cloned()
        .collect();

    let mut missing = Vec::new();
    let mut duplicates = Vec::new();
    for ((scope, index), owners) in &by_slot {
        if !allocated.contains_key(&(scope.clone(), *index)) {
            for owner in owners {
                missing.push(Allocation {
                    scope: scope.clone(),
                    index: *index,
                    owner: owner.clone(),
                });
            }
        }
        if owners.len() > 1 {
            duplicates.push(DuplicateId {
                scope: scope.clone(),
                index: *index,
                owners: owners.clone(),
            });
        }
    }

    let report = IdAuditReport {
        family,
        extra,
        missing,
        duplicates,
        objects_without_id,
    };
    if report.is_clean() {
        info!("Audit of {}: clean", family);
    } else {
        warn!(
            "Audit of {}: {} stale, {} missing, {} duplicate, {} without id",
            family,
            report.extra.len(),
            report.missing.len(),
            report.duplicates.len(),
            report.objects_without_id.len()
        );
    }
    report
}

async fn family_allocations(
    registry: &AllocatorRegistry,
    family: IdFamily,
    skip_owner: Option<&str>,
) -> NetcfgResult<Vec<Allocation>> {
    Ok(registry
        .family(family)
        .await?
        .allocations()
        .await?
        .into_iter()
        .filter(|(_, owner)| Some(owner.as_str()) != skip_owner)
        .map(|(index, owner)| Allocation {
            scope: None,
            index,
            owner,
        })
        .collect())
}

async fn numbered_objects(
    store: &dyn ObjectStore,
    resource_type: ResourceType,
    field: &str,
) -> NetcfgResult<Vec<(String, Option<Slot>)>> {
    Ok(store
        .list(resource_type, &ListFilter::all())
        .await?
        .into_iter()
        .map(|r| (r.fq_name_str(), r.field_u64(field).map(|id| (None, id))))
        .collect())
}

pub async fn audit_virtual_network_ids(
    registry: &AllocatorRegistry,
    store: &dyn ObjectStore,
) -> NetcfgResult<IdAuditReport> {
    let allocations = family_allocations(registry, IdFamily::VirtualNetwork, None).await?;
    let objects = numbered_objects(store, ResourceType::VirtualNetwork, NETWORK_ID).await?;
    Ok(compare(AuditFamily::VirtualNetwork, allocations, objects))
}

pub async fn audit_security_group_ids(
    registry: &AllocatorRegistry,
    store: &dyn ObjectStore,
) -> NetcfgResult<IdAuditReport> {
    let allocations =
        family_allocations(registry, IdFamily::SecurityGroup, Some(SG_ID_RESERVED_OWNER)).await?;
    let objects = numbered_objects(store, ResourceType::SecurityGroup, SECURITY_GROUP_ID).await?;
    Ok(compare(AuditFamily::SecurityGroup, allocations, objects))
}

pub async fn audit_tag_ids(
    registry: &AllocatorRegistry,
    store: &dyn ObjectStore,
) -> NetcfgResult<IdAuditReport> {
    let counter = registry.tag_values();
    let mut allocations = Vec::new();
    for segment in registry.client().list_children(TAG_VALUE_ID_ALLOC_PATH).await? {
        let scope = ScopeKey::from_node_segment(&segment);
        for (index, owner) in counter.allocations(&scope).await? {
            allocations.push(Allocation {
                scope: Some(scope.to_string()),
                index,
                owner,
            });
        }
    }

    let objects = store
        .list(ResourceType::Tag, &ListFilter::all())
        .await?
        .into_iter()
        .map(|tag| {
            let slot = match (tag.field_str(TAG_VALUE_SCOPE), tag.field_str(TAG_ID)) {
                (Some(scope), Some(id)) => id
                    .parse::<CompositeId>()
                    .ok()
                    .map(|id| (Some(scope.to_string()), u64::from(id.value))),
                _ => None,
            };
            (tag.fq_name_str(), slot)
        })
        .collect();

    Ok(compare(AuditFamily::Tag, allocations, objects))
}

pub async fn audit_all(
    registry: &AllocatorRegistry,
    store: &dyn ObjectStore,
) -> NetcfgResult<Vec<IdAuditReport>> {
    Ok(vec![
        audit_virtual_network_ids(registry, store).await?,
        audit_security_group_ids(registry, store).await?,
        audit_tag_ids(registry, store).await?,
    ])
}

/// Delete the stale nodes of a report
///
/// Each node is only removed while it still records the owner seen by the
/// audit. Returns how many were deleted.
pub async fn clean_stale(registry: &AllocatorRegistry, report: &IdAuditReport) -> NetcfgResult<usize> {
    let mut cleaned = 0;
    for stale in &report.extra {
        let freed = match (report.family, &stale.scope) {
            (AuditFamily::VirtualNetwork, _) => {
                registry
                    .free_id(IdFamily::VirtualNetwork, stale.index, &stale.owner)
                    .await?
            }
            (AuditFamily::SecurityGroup, _) => {
                registry
                    .free_id(IdFamily::SecurityGroup, stale.index, &stale.owner)
                    .await?
            }
            (AuditFamily::Tag, Some(scope)) => {
                registry
                    .free_tag_value_id(&ScopeKey::new(scope.as_str()), stale.index, &stale.owner)
                    .await?
            }
            (AuditFamily::Tag, None) => false,
        };
        if freed {
            cleaned += 1;
        }
    }
    info!("Cleaned {} stale {}", cleaned, report.family);
    Ok(cleaned)
}
