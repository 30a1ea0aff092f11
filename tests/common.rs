#![allow(dead_code)]

use std::sync::Arc;

use rust_shard_lock::{
    config::{ClientConfig, LockOptions, PoolConfig, TopologyConfig},
    router::ShardRouter,
    store::memory::{MemoryCluster, MemorySentinel},
    topology::{HostAndPort, ShardTopology},
};

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn hp(port: u16) -> HostAndPort {
    HostAndPort::new("127.0.0.1", port)
}

pub fn shard_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("shard-{i}")).collect()
}

///
/// A cluster with one master per shard on ports 7001.., and a router over it.
///
pub fn memory_router(shards: usize) -> (MemoryCluster, Arc<ShardRouter>) {
    let cluster = MemoryCluster::new();
    let masters: Vec<HostAndPort> = (0..shards).map(|i| hp(7001 + i as u16)).collect();
    for master in &masters {
        cluster.add_node(master.clone());
    }
    let router = ShardRouter::new(
        shard_names(shards),
        ShardTopology::new(masters),
        Arc::new(cluster.clone()),
        PoolConfig::default(),
    )
    .expect("router");
    (cluster, Arc::new(router))
}

///
/// A sentinel with peers on ports 26379.. that knows the masters of `memory_router`.
///
pub fn memory_sentinel(shards: usize, peers: usize) -> (MemorySentinel, Vec<HostAndPort>) {
    let sentinel = MemorySentinel::new();
    let peers: Vec<HostAndPort> = (0..peers).map(|i| hp(26379 + i as u16)).collect();
    for peer in &peers {
        sentinel.add_peer(peer.clone());
    }
    for (i, name) in shard_names(shards).into_iter().enumerate() {
        sentinel.set_master(name, hp(7001 + i as u16));
    }
    (sentinel, peers)
}

pub fn sentinel_config(shards: usize, peers: Vec<HostAndPort>) -> ClientConfig {
    let mut config = ClientConfig::new(shard_names(shards), TopologyConfig::Sentinel { peers });
    config.failover.startup_backoff_ms = 1;
    config.failover.resubscribe_backoff_ms = 10;
    config
}

pub fn fast_lock_options(hold_timeout_secs: i64) -> LockOptions {
    LockOptions::new(hold_timeout_secs, 10)
}
