//! Typed configuration objects and their references

use crate::error::{NetcfgError, NetcfgResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type FieldMap = serde_json::Map<String, Value>;

/// Resource types the pipeline knows how to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Domain,
    Project,
    GlobalSystemConfig,
    VirtualNetwork,
    FloatingIpPool,
    FloatingIp,
    InstanceIp,
    SecurityGroup,
    TagType,
    Tag,
    BgpRouter,
    ControlNodeZone,
    PhysicalRouter,
    PhysicalInterface,
    LogicalInterface,
    VirtualMachineInterface,
}

impl ResourceType {
    pub const ALL: [ResourceType; 16] = [
        ResourceType::Domain,
        ResourceType::Project,
        ResourceType::GlobalSystemConfig,
        ResourceType::VirtualNetwork,
        ResourceType::FloatingIpPool,
        ResourceType::FloatingIp,
        ResourceType::InstanceIp,
        ResourceType::SecurityGroup,
        ResourceType::TagType,
        ResourceType::Tag,
        ResourceType::BgpRouter,
        ResourceType::ControlNodeZone,
        ResourceType::PhysicalRouter,
        ResourceType::PhysicalInterface,
        ResourceType::LogicalInterface,
        ResourceType::VirtualMachineInterface,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Domain => "domain",
            ResourceType::Project => "project",
            ResourceType::GlobalSystemConfig => "global-system-config",
            ResourceType::VirtualNetwork => "virtual-network",
            ResourceType::FloatingIpPool => "floating-ip-pool",
            ResourceType::FloatingIp => "floating-ip",
            ResourceType::InstanceIp => "instance-ip",
            ResourceType::SecurityGroup => "security-group",
            ResourceType::TagType => "tag-type",
            ResourceType::Tag => "tag",
            ResourceType::BgpRouter => "bgp-router",
            ResourceType::ControlNodeZone => "control-node-zone",
            ResourceType::PhysicalRouter => "physical-router",
            ResourceType::PhysicalInterface => "physical-interface",
            ResourceType::LogicalInterface => "logical-interface",
            ResourceType::VirtualMachineInterface => "virtual-machine-interface",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = NetcfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| NetcfgError::validation("resource_type", format!("unknown type '{}'", s)))
    }
}

/// Typed link to another resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub target_type: ResourceType,
    /// Qualified name of the target
    pub to: Vec<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub attr: Option<Value>,
}

impl Reference {
    pub fn new<S: Into<String>>(target_type: ResourceType, to: Vec<S>) -> Self {
        Self {
            target_type,
            to: to.into_iter().map(Into::into).collect(),
            uuid: None,
            attr: None,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_attr(mut self, attr: Value) -> Self {
        self.attr = Some(attr);
        self
    }
}

/// A typed, named object identified by `(type, fq_name, uuid)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub parent_type: Option<ResourceType>,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub refs: Vec<Reference>,
}

impl Resource {
    pub fn new<S: Into<String>>(resource_type: ResourceType, fq_name: Vec<S>) -> Self {
        Self {
            resource_type,
            fq_name: fq_name.into_iter().map(Into::into).collect(),
            uuid: None,
            parent_type: None,
            parent_uuid: None,
            fields: FieldMap::new(),
            refs: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_type: ResourceType) -> Self {
        self.parent_type = Some(parent_type);
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_ref(mut self, reference: Reference) -> Self {
        self.refs.push(reference);
        self
    }

    /// Last element of the qualified name
    pub fn name(&self) -> &str {
        self.fq_name.last().map(String::as_str).unwrap_or_default()
    }

    pub fn fq_name_str(&self) -> String {
        self.fq_name.join(":")
    }

    pub fn parent_fq_name(&self) -> &[String] {
        match self.fq_name.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }

    pub fn uuid(&self) -> NetcfgResult<Uuid> {
        self.uuid.ok_or_else(|| {
            NetcfgError::internal(format!("{} {} has no uuid", self.resource_type, self.fq_name_str()))
        })
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn refs_of(&self, target_type: ResourceType) -> impl Iterator<Item = &Reference> {
        self.refs.iter().filter(move |r| r.target_type == target_type)
    }

    pub fn references(&self, uuid: Uuid) -> bool {
        self.refs.iter().any(|r| r.uuid == Some(uuid))
    }

    /// Merge an update into this resource
    ///
    /// A `null` field value removes the field; `refs` replaces the whole set.
    pub fn apply(&mut self, update: &ResourceUpdate) {
        for (key, value) in &update.fields {
            if value.is_null() {
                self.fields.remove(key);
            } else {
                self.fields.insert(key.clone(), value.clone());
            }
        }
        if let Some(refs) = &update.refs {
            self.refs = refs.clone();
        }
    }
}

/// Partial change to an existing resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub refs: Option<Vec<Reference>>,
}

impl ResourceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_refs(mut self, refs: Vec<Reference>) -> Self {
        self.refs = Some(refs);
        self
    }

    pub fn touches(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
