use std::sync::Arc;

use common::{hp, init_tracing, memory_router, memory_sentinel, random_str, sentinel_config};
use rust_shard_lock::{
    client::LockClient,
    config::ConfigError,
    failover::ListenerState,
    topology::TopologyError,
};
mod common;

#[tokio::test]
async fn client_follows_master_switch() {
    init_tracing();
    let (cluster, _) = memory_router(2);
    let replacement = cluster.add_node(hp(7101));
    let (sentinel, peers) = memory_sentinel(2, 2);

    let client = LockClient::connect(
        sentinel_config(2, peers),
        Arc::new(cluster.clone()),
        Some(Arc::new(sentinel.clone())),
    )
    .await
    .expect("client");
    client.wait_until_listening().await;

    let lock = client.get_lock(&random_str(10)).expect("lock");
    let handle = lock.try_lock().await.expect("store").expect("free lock");
    let shard = client.router().resolve(lock.key());

    let mut topology_rx = client.router().subscribe();
    sentinel.failover(shard.name(), hp(7101));
    topology_rx.changed().await.expect("topology published");
    assert_eq!(client.router().topology().master(shard.index()), Some(&hp(7101)));

    // The new master never saw the old token.
    assert!(!lock.unlock(handle).await.expect("store"));
    let handle = lock.try_lock().await.expect("store").expect("free lock");
    assert_eq!(
        replacement.raw_get(lock.key()).as_deref(),
        Some(handle.token().as_bytes())
    );

    client.shutdown().await;
}

#[tokio::test]
async fn startup_fails_when_no_peer_is_reachable() {
    let (cluster, _) = memory_router(1);
    let (sentinel, peers) = memory_sentinel(1, 2);
    for peer in &peers {
        sentinel.set_peer_reachable(peer, false);
    }
    let mut config = sentinel_config(1, peers);
    config.failover.startup_retries = 3;

    let result = LockClient::connect(config, Arc::new(cluster), Some(Arc::new(sentinel))).await;
    assert!(matches!(
        result,
        Err(ConfigError::Topology(TopologyError::DiscoveryExhausted { attempts: 4, .. }))
    ));
}

#[tokio::test]
async fn one_lost_peer_does_not_stop_failover() {
    let (cluster, _) = memory_router(1);
    cluster.add_node(hp(7101));
    let (sentinel, peers) = memory_sentinel(1, 2);

    let client = LockClient::connect(
        sentinel_config(1, peers.clone()),
        Arc::new(cluster),
        Some(Arc::new(sentinel.clone())),
    )
    .await
    .expect("client");
    client.wait_until_listening().await;

    sentinel.set_peer_reachable(&peers[0], false);
    let mut topology_rx = client.router().subscribe();
    sentinel.failover("shard-0", hp(7101));
    topology_rx.changed().await.expect("topology published");
    assert_eq!(client.router().topology().masters(), &[hp(7101)]);

    client.shutdown().await;
    assert_eq!(sentinel.subscriber_count(&peers[1]), 0);
}

#[tokio::test]
async fn shutdown_stops_listeners_and_pools() {
    let (cluster, _) = memory_router(1);
    let (sentinel, peers) = memory_sentinel(1, 3);
    let client = LockClient::connect(
        sentinel_config(1, peers.clone()),
        Arc::new(cluster),
        Some(Arc::new(sentinel.clone())),
    )
    .await
    .expect("client");
    client.wait_until_listening().await;
    assert!(client
        .listener_states()
        .iter()
        .all(|(_, state)| *state == ListenerState::Listening));

    let router = Arc::clone(client.router());
    let lock = client.get_lock("after-shutdown").expect("lock");
    client.shutdown().await;

    for peer in &peers {
        assert_eq!(sentinel.subscriber_count(peer), 0);
    }
    assert_eq!(router.pool_ids().len(), 1);
    assert!(lock.try_lock().await.is_err());
}
