use std::sync::Arc;

use common::{hp, memory_router, random_str};
use rust_shard_lock::{
    config::LockOptions,
    lock::{DistributedLock, KEY_PREFIX},
    topology::{Continuum, ShardTopology},
};
mod common;

#[tokio::test]
async fn equal_topology_rebuild_causes_no_reconnects() {
    let (cluster, router) = memory_router(3);
    let lock = DistributedLock::new(Arc::clone(&router), random_str(10), LockOptions::default())
        .expect("lock");
    let handle = lock.try_lock().await.expect("store").expect("free lock");
    let pool_ids = router.pool_ids();
    let connects = cluster.connect_count();

    let same = ShardTopology::new(vec![hp(7001), hp(7002), hp(7003)]);
    assert!(!router.rebuild_topology(same.clone()).expect("rebuild"));
    assert!(!router.rebuild_topology(same).expect("rebuild"));

    assert_eq!(router.pool_ids(), pool_ids);
    assert!(lock.unlock(handle).await.expect("store"));
    assert_eq!(cluster.connect_count(), connects);
}

#[tokio::test]
async fn keys_spread_over_all_shards() {
    let (_cluster, router) = memory_router(4);
    let mut seen = [0usize; 4];
    for i in 0..1_000 {
        let mut key = KEY_PREFIX.to_vec();
        key.extend_from_slice(format!("job-{i}").as_bytes());
        seen[router.resolve(&key).index()] += 1;
    }
    assert!(seen.iter().all(|count| *count > 100), "unbalanced: {seen:?}");
}

#[test]
fn continuum_is_deterministic() {
    let a = Continuum::new(5);
    let b = Continuum::new(5);
    for i in 0..500 {
        let key = format!("shard-lock:{i}");
        assert_eq!(a.locate(key.as_bytes()), b.locate(key.as_bytes()));
    }
}

#[tokio::test]
async fn failover_moves_connections_but_not_keys() {
    let (cluster, router) = memory_router(2);
    let replacement = cluster.add_node(hp(7101));
    let lock = DistributedLock::new(Arc::clone(&router), random_str(10), LockOptions::default())
        .expect("lock");
    let shard = router.resolve(lock.key());

    assert!(router.update_master(shard.index(), hp(7101)).expect("update"));
    assert_eq!(router.resolve(lock.key()).index(), shard.index());

    let handle = lock.try_lock().await.expect("store").expect("free lock");
    assert_eq!(
        replacement.raw_get(lock.key()).as_deref(),
        Some(handle.token().as_bytes())
    );
}
