//! Integration tests for the coordination-backed index allocators

mod common;

use netcfg_core::allocator::{
    AllocatorRegistry, AllocatorSettings, AllocatorSpec, IdFamily, IndexAllocator, VN_ID_MIN,
};
use netcfg_core::coordination::{CoordinationClient, MemoryCoordinator, ResilientCoordinator};
use netcfg_core::error::NetcfgError;
use netcfg_core::metrics::{names, MetricsRegistry};
use netcfg_core::patterns::RetryConfig;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

async fn open(client: Arc<dyn CoordinationClient>, spec: AllocatorSpec) -> IndexAllocator {
    IndexAllocator::new(client, spec, AllocatorSettings::default())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_are_unique() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let allocator = Arc::new(open(zk, AllocatorSpec::new("/id/concurrent", 1000, 0)).await);

    let mut handles = Vec::new();
    for worker in 0..8 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..25 {
                ids.push(allocator.alloc(&format!("w{}-{}", worker, i)).await.unwrap());
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(id < 1000);
            assert!(seen.insert(id), "index {} handed out twice", id);
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instances_sharing_a_path_never_collide() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let a = Arc::new(AllocatorRegistry::new(zk.clone(), AllocatorSettings::default()));
    let b = Arc::new(AllocatorRegistry::new(zk, AllocatorSettings::default()));
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let spawn = |registry: Arc<AllocatorRegistry>, name: &'static str| {
        tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..50 {
                ids.push(
                    registry
                        .alloc_id(IdFamily::VirtualNetwork, &format!("{}-{}", name, i))
                        .await
                        .unwrap(),
                );
            }
            ids
        })
    };
    let (from_a, from_b) = tokio::join!(spawn(a.clone(), "a"), spawn(b.clone(), "b"));

    let mut all: Vec<u64> = from_a.unwrap();
    all.extend(from_b.unwrap());
    let unique: BTreeSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), 100);
    assert!(unique.iter().all(|id| *id >= VN_ID_MIN));
}

#[tokio::test]
async fn test_stale_bitmap_conflict_moves_to_next_index() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let metrics = MetricsRegistry::new();
    let settings = AllocatorSettings {
        max_conflict_retries: 16,
        metrics: metrics.clone(),
    };
    let spec = AllocatorSpec::new("/id/race", 10, 0);
    let first = IndexAllocator::new(zk.clone(), spec.clone(), settings.clone()).await.unwrap();
    let second = IndexAllocator::new(zk, spec, settings).await.unwrap();

    assert_eq!(first.alloc("first").await.unwrap(), 0);
    // second's bitmap predates the allocation above
    assert_eq!(second.alloc("second").await.unwrap(), 1);
    assert_eq!(metrics.get_counter(names::ALLOC_CONFLICT_RETRIES), 1);
    assert_eq!(second.read(0).await.unwrap().as_deref(), Some("first"));
}

#[tokio::test]
async fn test_bitmap_recovered_from_nodes() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let spec = AllocatorSpec::new("/id/recover", 10, 0);
    {
        let allocator = open(zk.clone(), spec.clone()).await;
        for index in [2, 5, 7] {
            assert_eq!(allocator.reserve(index, "held").await.unwrap(), Some(index));
        }
    }

    let reopened = open(zk, spec).await;
    assert_eq!(reopened.in_use(), vec![2, 5, 7]);
    assert_eq!(reopened.alloc("next").await.unwrap(), 0);
    assert_eq!(reopened.alloc("next").await.unwrap(), 1);
    assert_eq!(reopened.alloc("next").await.unwrap(), 3);
}

#[tokio::test]
async fn test_reverse_allocator_counts_down() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let allocator = open(zk, AllocatorSpec::new("/id/reverse", 100, 50).reversed()).await;

    assert_eq!(allocator.alloc("a").await.unwrap(), 150);
    assert_eq!(allocator.alloc("b").await.unwrap(), 149);
    assert_eq!(allocator.reserve(50, "low").await.unwrap(), Some(50));
    assert_eq!(allocator.reserve(49, "below").await.unwrap(), None);
    assert_eq!(allocator.reserve(151, "above").await.unwrap(), None);
}

#[tokio::test]
async fn test_exhaustion_and_reuse() {
    let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
    let allocator = open(zk, AllocatorSpec::new("/id/small", 3, 0)).await;

    for expected in 0..3 {
        assert_eq!(allocator.alloc("x").await.unwrap(), expected);
    }
    let err = allocator.alloc("x").await.unwrap_err();
    assert!(matches!(err, NetcfgError::ResourceExhausted { .. }));

    allocator.delete(1).await.unwrap();
    assert_eq!(allocator.alloc("y").await.unwrap(), 1);
}

#[tokio::test]
async fn test_session_loss_is_invisible_to_callers() {
    let memory = Arc::new(MemoryCoordinator::new());
    let client: Arc<dyn CoordinationClient> = Arc::new(ResilientCoordinator::new(
        memory.clone(),
        RetryConfig::fixed(5, Duration::from_millis(1)),
        MetricsRegistry::new(),
    ));
    let allocator = open(client, AllocatorSpec::new("/id/flaky", 10, 0)).await;

    memory.inject_session_loss(2);
    assert_eq!(allocator.alloc("a").await.unwrap(), 0);
    assert_eq!(memory.reconnect_count(), 2);

    // the create lands but its reply is lost
    memory.inject_lost_reply(1);
    assert_eq!(allocator.alloc("b").await.unwrap(), 1);
    assert_eq!(allocator.read(1).await.unwrap().as_deref(), Some("b"));
    assert_eq!(memory.node_count(), 2);
}

#[derive(Debug, Clone)]
enum Op {
    Alloc,
    Free(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Alloc),
        1 => (0u64..16).prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_alloc_returns_lowest_free_index(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let zk: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinator::new());
            let allocator = open(zk, AllocatorSpec::new("/id/prop", 16, 0)).await;
            let mut model = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Alloc => {
                        let expected = (0..16).find(|i| !model.contains(i));
                        match (allocator.alloc("p").await, expected) {
                            (Ok(index), Some(expected)) => {
                                prop_assert_eq!(index, expected);
                                model.insert(index);
                            }
                            (Err(NetcfgError::ResourceExhausted { .. }), None) => {}
                            (other, expected) => {
                                prop_assert!(false, "alloc gave {:?}, model expected {:?}", other, expected);
                            }
                        }
                    }
                    Op::Free(index) => {
                        allocator.delete(index).await.unwrap();
                        model.remove(&index);
                    }
                }
                let in_use: BTreeSet<u64> = allocator.in_use().into_iter().collect();
                prop_assert_eq!(&in_use, &model);
            }
            Ok(())
        })?;
    }
}
