use {
    crate::{
        config::PoolConfig,
        pool::{PooledConnection, ShardPool},
        store::{Connector, StoreError},
        topology::{Continuum, HostAndPort, ShardTopology, TopologyError},
    },
    parking_lot::{Mutex, RwLock},
    std::sync::Arc,
    tokio::sync::watch,
    tracing::{info, trace},
};

struct RoutingTable {
    topology: Arc<ShardTopology>,
    pools: Vec<Arc<ShardPool>>,
}

///
/// The shard a key resolved to, together with the pool serving it at resolution time.
///
#[derive(Clone)]
pub struct ShardHandle {
    index: usize,
    name: String,
    pool: Arc<ShardPool>,
}

impl ShardHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &HostAndPort {
        self.pool.endpoint()
    }

    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        self.pool.acquire().await
    }
}

///
/// Routes keys to shards and owns one connection pool per shard.
///
/// The routing table (topology + pools) is replaced whole on failover: a new table is built off to the
/// side and published with a single pointer swap, so readers see either the old or the new table.
///
pub struct ShardRouter {
    names: Vec<String>,
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    continuum: Continuum,
    table: RwLock<Arc<RoutingTable>>,
    // Serializes topology writers; readers never take it.
    writer: Mutex<()>,
    topology_tx: watch::Sender<Arc<ShardTopology>>,
}

impl ShardRouter {
    pub fn new(
        names: Vec<String>,
        topology: ShardTopology,
        connector: Arc<dyn Connector>,
        pool_config: PoolConfig,
    ) -> Result<Self, TopologyError> {
        if topology.len() != names.len() {
            return Err(TopologyError::CardinalityMismatch {
                expected: names.len(),
                actual: topology.len(),
            });
        }
        let topology = Arc::new(topology);
        let pools = topology
            .masters()
            .iter()
            .map(|master| ShardPool::new(master.clone(), Arc::clone(&connector), pool_config.clone()))
            .collect();
        info!("created shard pools to masters at {topology}");
        let (topology_tx, _) = watch::channel(Arc::clone(&topology));
        Ok(Self {
            continuum: Continuum::new(names.len()),
            names,
            connector,
            pool_config,
            table: RwLock::new(Arc::new(RoutingTable { topology, pools })),
            writer: Mutex::new(()),
            topology_tx,
        })
    }

    pub fn shard_names(&self) -> &[String] {
        &self.names
    }

    pub fn shard_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn topology(&self) -> Arc<ShardTopology> {
        Arc::clone(&self.table.read().topology)
    }

    ///
    /// Observe topology snapshots as they get published.
    ///
    pub fn subscribe(&self) -> watch::Receiver<Arc<ShardTopology>> {
        self.topology_tx.subscribe()
    }

    ///
    /// Identifiers of the active pools, in shard order.
    ///
    pub fn pool_ids(&self) -> Vec<u64> {
        self.table.read().pools.iter().map(|p| p.id()).collect()
    }

    ///
    /// Deterministically maps `key` to a shard.
    ///
    pub fn resolve(&self, key: &[u8]) -> ShardHandle {
        let index = self.continuum.locate(key);
        let table = Arc::clone(&self.table.read());
        ShardHandle {
            index,
            name: self.names[index].clone(),
            pool: Arc::clone(&table.pools[index]),
        }
    }

    ///
    /// Check out a connection to the shard owning `key`.
    ///
    pub async fn acquire(&self, key: &[u8]) -> Result<PooledConnection, StoreError> {
        let shard = self.resolve(key);
        trace!("key routed to shard {} at {}", shard.name(), shard.endpoint());
        shard.acquire().await
    }

    ///
    /// Replace the topology.
    ///
    /// Returns `Ok(false)` without touching anything when `topology` equals the current one. Pools of
    /// shards whose master did not change are carried over; the others are rebuilt and the replaced
    /// ones closed after the swap.
    ///
    pub fn rebuild_topology(&self, topology: ShardTopology) -> Result<bool, TopologyError> {
        let _guard = self.writer.lock();
        self.rebuild_locked(topology)
    }

    ///
    /// Point shard `index` at `master`, leaving other shards untouched.
    ///
    pub fn update_master(&self, index: usize, master: HostAndPort) -> Result<bool, TopologyError> {
        let _guard = self.writer.lock();
        let next = self.topology().with_master(index, master)?;
        self.rebuild_locked(next)
    }

    fn rebuild_locked(&self, topology: ShardTopology) -> Result<bool, TopologyError> {
        if topology.len() != self.names.len() {
            return Err(TopologyError::CardinalityMismatch {
                expected: self.names.len(),
                actual: topology.len(),
            });
        }
        let current = Arc::clone(&self.table.read());
        if *current.topology == topology {
            trace!("topology unchanged, skipping rebuild");
            return Ok(false);
        }

        let mut retired = Vec::new();
        let pools = topology
            .masters()
            .iter()
            .zip(current.pools.iter())
            .map(|(master, pool)| {
                if pool.endpoint() == master && !pool.is_closed() {
                    Arc::clone(pool)
                } else {
                    retired.push(Arc::clone(pool));
                    ShardPool::new(master.clone(), Arc::clone(&self.connector), self.pool_config.clone())
                }
            })
            .collect();

        let topology = Arc::new(topology);
        info!("switching shard masters from {} to {}", current.topology, topology);
        *self.table.write() = Arc::new(RoutingTable {
            topology: Arc::clone(&topology),
            pools,
        });
        for pool in retired {
            pool.close();
        }
        self.topology_tx.send_replace(topology);
        Ok(true)
    }

    ///
    /// Close every pool. Subsequent checkouts fail with [`StoreError::PoolClosed`].
    ///
    pub fn shutdown(&self) {
        let _guard = self.writer.lock();
        let table = Arc::clone(&self.table.read());
        for pool in &table.pools {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::store::memory::MemoryCluster};

    fn hp(port: u16) -> HostAndPort {
        HostAndPort::new("127.0.0.1", port)
    }

    fn router(cluster: &MemoryCluster, ports: &[u16]) -> ShardRouter {
        let names = (0..ports.len()).map(|i| format!("shard-{i}")).collect();
        let topology = ShardTopology::new(ports.iter().map(|p| hp(*p)).collect());
        for port in ports {
            cluster.add_node(hp(*port));
        }
        ShardRouter::new(names, topology, Arc::new(cluster.clone()), PoolConfig::default())
            .expect("router")
    }

    #[test]
    fn it_should_reject_topology_with_wrong_cardinality() {
        let cluster = MemoryCluster::new();
        let result = ShardRouter::new(
            vec!["a".into(), "b".into()],
            ShardTopology::new(vec![hp(1)]),
            Arc::new(cluster),
            PoolConfig::default(),
        );
        assert!(matches!(
            result,
            Err(TopologyError::CardinalityMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn resolve_is_stable_across_routers_and_failover() {
        let cluster = MemoryCluster::new();
        let r1 = router(&cluster, &[7001, 7002, 7003]);
        let r2 = router(&cluster, &[7001, 7002, 7003]);
        let keys: Vec<String> = (0..200).map(|i| format!("shard-lock:{i}")).collect();
        let before: Vec<usize> = keys.iter().map(|k| r1.resolve(k.as_bytes()).index()).collect();
        let other: Vec<usize> = keys.iter().map(|k| r2.resolve(k.as_bytes()).index()).collect();
        assert_eq!(before, other);

        cluster.add_node(hp(7004));
        assert!(r1.update_master(1, hp(7004)).expect("update"));
        let after: Vec<usize> = keys.iter().map(|k| r1.resolve(k.as_bytes()).index()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn rebuild_with_equal_topology_is_a_noop() {
        let cluster = MemoryCluster::new();
        let r = router(&cluster, &[7001, 7002]);
        let ids = r.pool_ids();
        let same = ShardTopology::new(vec![hp(7001), hp(7002)]);
        assert!(!r.rebuild_topology(same.clone()).expect("rebuild"));
        assert!(!r.rebuild_topology(same).expect("rebuild"));
        assert_eq!(r.pool_ids(), ids);
    }

    #[tokio::test]
    async fn rebuild_only_replaces_changed_shards() {
        let cluster = MemoryCluster::new();
        let r = router(&cluster, &[7001, 7002]);
        cluster.add_node(hp(7003));
        let ids = r.pool_ids();
        let mut rx = r.subscribe();

        let old_shard = r.resolve(b"x");
        let changed = r
            .rebuild_topology(ShardTopology::new(vec![hp(7001), hp(7003)]))
            .expect("rebuild");
        assert!(changed);

        let new_ids = r.pool_ids();
        assert_eq!(new_ids[0], ids[0]);
        assert_ne!(new_ids[1], ids[1]);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().master(1), Some(&hp(7003)));

        if old_shard.index() == 1 {
            assert!(matches!(old_shard.acquire().await, Err(StoreError::PoolClosed(_))));
        }
    }

    #[tokio::test]
    async fn acquire_routes_to_the_current_master() {
        let cluster = MemoryCluster::new();
        let r = router(&cluster, &[7001]);
        cluster.add_node(hp(7009));
        assert_eq!(r.acquire(b"k").await.expect("acquire").endpoint(), &hp(7001));
        r.update_master(0, hp(7009)).expect("update");
        assert_eq!(r.acquire(b"k").await.expect("acquire").endpoint(), &hp(7009));
    }

    #[tokio::test]
    async fn shutdown_closes_every_pool() {
        let cluster = MemoryCluster::new();
        let r = router(&cluster, &[7001, 7002]);
        r.shutdown();
        assert!(matches!(r.acquire(b"k").await, Err(StoreError::PoolClosed(_))));
    }
}
