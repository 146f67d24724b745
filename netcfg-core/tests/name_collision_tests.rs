//! Creates whose name is already taken

mod common;

use common::{create_network, create_project, subnet, test_config};
use netcfg_core::allocator::IdFamily;
use netcfg_core::ipam::{parse_subnets, FLOATING_IP_ADDRESS};
use netcfg_core::resources::{NETWORK_ID, SECURITY_GROUP_ID};
use netcfg_core::{ControlPlane, Resource, ResourceType};
use pretty_assertions::assert_eq;
use std::net::IpAddr;

async fn floating_ip(plane: &ControlPlane, vn: &Resource, name: &str) -> Resource {
    let mut pool = vn.fq_name.clone();
    pool.push(format!("{}-pool", name));
    plane
        .create(Resource::new(ResourceType::FloatingIpPool, pool.clone()).with_parent(ResourceType::VirtualNetwork))
        .await
        .unwrap();
    let mut fq_name = pool;
    fq_name.push(name.to_string());
    plane
        .create(Resource::new(ResourceType::FloatingIp, fq_name).with_parent(ResourceType::FloatingIpPool))
        .await
        .unwrap()
        .resource
}

#[tokio::test]
async fn test_renamed_security_group_owns_its_id() {
    let plane = ControlPlane::start(test_config("rename")).await.unwrap();
    let original = plane
        .create(Resource::new(ResourceType::SecurityGroup, vec!["sg"]))
        .await
        .unwrap();
    let copy = plane
        .create(Resource::new(ResourceType::SecurityGroup, vec!["sg"]))
        .await
        .unwrap();
    assert!(copy.resource.name().starts_with("sg-"));

    let id = copy.resource.field_u64(SECURITY_GROUP_ID).unwrap();
    assert_eq!(
        plane.allocators().id_owner(IdFamily::SecurityGroup, id).await.unwrap(),
        Some(copy.resource.fq_name_str())
    );

    plane.delete(ResourceType::SecurityGroup, copy.uuid).await.unwrap();
    assert_eq!(plane.allocators().id_owner(IdFamily::SecurityGroup, id).await.unwrap(), None);

    plane.delete(ResourceType::SecurityGroup, original.uuid).await.unwrap();
    let remaining = plane
        .allocators()
        .family(IdFamily::SecurityGroup)
        .await
        .unwrap()
        .allocations()
        .await
        .unwrap();
    // only the reserved first id is left
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_renamed_network_owns_its_id_and_addresses() {
    let plane = ControlPlane::start(test_config("rename")).await.unwrap();
    let project = create_project(&plane, "proj").await;
    let original = create_network(&plane, &project, "vn", vec![subnet("10.5.0.0/29", "s1")]).await;
    let copy = create_network(&plane, &project, "vn", vec![subnet("10.5.0.0/29", "s2")]).await;
    assert_ne!(copy.fq_name, original.fq_name);

    let id = copy.field_u64(NETWORK_ID).unwrap();
    assert_eq!(
        plane.allocators().id_owner(IdFamily::VirtualNetwork, id).await.unwrap(),
        Some(copy.fq_name_str())
    );

    // the copy's gateway was reserved in its own namespace
    let fip = floating_ip(&plane, &copy, "fip").await;
    assert_eq!(fip.field_str(FLOATING_IP_ADDRESS), Some("10.5.0.2"));

    let fip_uuid = fip.uuid.unwrap();
    let pool_uuid = fip.parent_uuid.unwrap();
    plane.delete(ResourceType::FloatingIp, fip_uuid).await.unwrap();
    plane.delete(ResourceType::FloatingIpPool, pool_uuid).await.unwrap();
    plane
        .delete(ResourceType::VirtualNetwork, copy.uuid.unwrap())
        .await
        .unwrap();

    let ids = plane
        .allocators()
        .family(IdFamily::VirtualNetwork)
        .await
        .unwrap()
        .allocations()
        .await
        .unwrap();
    assert_eq!(ids, vec![(original.field_u64(NETWORK_ID).unwrap(), original.fq_name_str())]);
}

#[tokio::test]
async fn test_rejected_duplicate_keeps_existing_addresses() {
    let mut config = test_config("no-rename");
    config.pipeline.retry_on_name_collision = false;
    let plane = ControlPlane::start(config).await.unwrap();
    let project = create_project(&plane, "proj").await;
    let vn = create_network(&plane, &project, "vn", vec![subnet("10.6.0.0/29", "s1")]).await;
    let fip = floating_ip(&plane, &vn, "fip").await;

    let err = plane
        .create(
            Resource::new(ResourceType::VirtualNetwork, vn.fq_name.clone())
                .with_parent(ResourceType::Project)
                .with_field("subnets", serde_json::json!([subnet("10.6.0.0/29", "s1")])),
        )
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    let subnets = parse_subnets(&vn).unwrap();
    let in_use = plane
        .addresses()
        .allocated_addresses(&vn.fq_name, &subnets[0], true)
        .await
        .unwrap();
    assert_eq!(in_use, vec![("10.6.0.2".parse::<IpAddr>().unwrap(), fip.uuid.unwrap().to_string())]);

    let ids = plane
        .allocators()
        .family(IdFamily::VirtualNetwork)
        .await
        .unwrap()
        .allocations()
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    // the next address is still handed out past the existing one
    let next = floating_ip(&plane, &vn, "fip2").await;
    assert_eq!(next.field_str(FLOATING_IP_ADDRESS), Some("10.6.0.3"));
}
