use {
    crate::{
        config::{ClientConfig, ConfigError, LockOptions, TopologyConfig},
        failover::{discover_masters, FailoverMonitor, ListenerState},
        lock::{DistributedLock, LockError},
        router::ShardRouter,
        store::{
            etcd::EtcdConnector,
            redis::{RedisConnector, SentinelDiscovery},
            Connector, DiscoveryClient,
        },
        topology::{HostAndPort, ShardTopology},
    },
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc},
    tracing::{debug, info},
};

///
/// Entry point: owns the shard router, the failover monitor and the registry of named locks.
///
/// Examples
///
/// ```no_run
/// use rust_shard_lock::{client::LockClient, config::ClientConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::from_json_file("shard-lock.json")?;
/// let client = LockClient::connect_redis(config).await?;
///
/// let lock = client.get_lock("reindex")?;
/// let handle = lock.lock().await;
/// // ... critical section
/// lock.unlock(handle).await?;
///
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
pub struct LockClient {
    router: Arc<ShardRouter>,
    monitor: Option<FailoverMonitor>,
    defaults: LockOptions,
    locks: Mutex<HashMap<String, Arc<DistributedLock>>>,
}

impl LockClient {
    ///
    /// Connect using explicit store backends.
    ///
    /// A sentinel topology requires `discovery`: masters are resolved through it and a failover monitor
    /// is spawned. A static topology uses its masters as given.
    ///
    pub async fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        discovery: Option<Arc<dyn DiscoveryClient>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (topology, monitor_setup) = match &config.topology {
            TopologyConfig::Static { masters } => (ShardTopology::new(masters.clone()), None),
            TopologyConfig::Sentinel { peers } => {
                let discovery = discovery.ok_or_else(|| {
                    ConfigError::Invalid("a sentinel topology requires a discovery client".into())
                })?;
                let topology =
                    discover_masters(discovery.as_ref(), peers, &config.shards, &config.failover)
                        .await?;
                (topology, Some((discovery, peers.clone())))
            }
        };

        let router = Arc::new(ShardRouter::new(
            config.shards.clone(),
            topology,
            connector,
            config.pool.clone(),
        )?);
        let monitor = monitor_setup.map(|(discovery, peers)| {
            FailoverMonitor::spawn(Arc::clone(&router), discovery, peers, config.failover)
        });
        info!("lock client ready for shards {:?}", config.shards);
        Ok(Self {
            router,
            monitor,
            defaults: config.lock,
            locks: Mutex::new(HashMap::new()),
        })
    }

    ///
    /// Connect to Redis masters, discovered through Redis Sentinel unless the topology is static.
    ///
    pub async fn connect_redis(config: ClientConfig) -> Result<Self, ConfigError> {
        let connector = Arc::new(RedisConnector::from_config(&config));
        let discovery: Arc<dyn DiscoveryClient> =
            Arc::new(SentinelDiscovery::new(config.connect_timeout()));
        Self::connect(config, connector, Some(discovery)).await
    }

    ///
    /// Connect to etcd endpoints, one per shard. Only static topologies are supported.
    ///
    pub async fn connect_etcd(config: ClientConfig) -> Result<Self, ConfigError> {
        if !matches!(config.topology, TopologyConfig::Static { .. }) {
            return Err(ConfigError::Invalid(
                "etcd shards require a static topology".into(),
            ));
        }
        let connector = Arc::new(EtcdConnector::from_config(&config));
        Self::connect(config, connector, None).await
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    ///
    /// The lock registered under `name`, created with the client's default options on first use.
    ///
    pub fn get_lock(&self, name: &str) -> Result<Arc<DistributedLock>, LockError> {
        self.get_lock_with(name, self.defaults)
    }

    ///
    /// Like [`LockClient::get_lock`], with explicit options for a lock that is not registered yet.
    /// The first registration of a name wins; later calls return it unchanged.
    ///
    pub fn get_lock_with(
        &self,
        name: &str,
        options: LockOptions,
    ) -> Result<Arc<DistributedLock>, LockError> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(name) {
            return Ok(Arc::clone(lock));
        }
        let lock = Arc::new(DistributedLock::new(Arc::clone(&self.router), name, options)?);
        debug!("registered lock {lock:?}");
        locks.insert(name.to_string(), Arc::clone(&lock));
        Ok(lock)
    }

    pub fn listener_states(&self) -> Vec<(HostAndPort, ListenerState)> {
        self.monitor
            .as_ref()
            .map(FailoverMonitor::listener_states)
            .unwrap_or_default()
    }

    ///
    /// Wait until every discovery listener is subscribed. Returns immediately for static topologies.
    ///
    pub async fn wait_until_listening(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.wait_until_listening().await;
        }
    }

    ///
    /// Stop the failover monitor and close every pool.
    ///
    pub async fn shutdown(self) {
        if let Some(monitor) = self.monitor {
            monitor.shutdown().await;
        }
        self.router.shutdown();
        info!("lock client shut down");
    }
}
