use {
    crate::{
        config::PoolConfig,
        store::{Connector, ShardConnection, StoreError, TxnOp, TxnReply},
        topology::HostAndPort,
    },
    parking_lot::Mutex,
    std::{
        ops::{Deref, DerefMut},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
    },
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
    tracing::{debug, info, warn},
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

///
/// Health reported by the caller when checking a connection back in.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    Broken,
}

///
/// Bounded pool of connections to a single shard master.
///
/// At most `max_size` connections are checked out at once; checked-in healthy connections are kept
/// up to `max_idle`. Broken connections are never returned to the pool.
///
pub struct ShardPool {
    id: u64,
    endpoint: HostAndPort,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    idle: Mutex<Vec<Box<dyn ShardConnection>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ShardPool {
    pub fn new(endpoint: HostAndPort, connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        let max_size = config.max_size.max(1);
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            connector,
            config,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_size)),
            closed: AtomicBool::new(false),
        })
    }

    ///
    /// Process-unique identifier of this pool, changes whenever a pool is rebuilt.
    ///
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &HostAndPort {
        &self.endpoint
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    ///
    /// Check out a connection, reusing an idle one when it answers a ping.
    ///
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        if self.is_closed() {
            return Err(StoreError::PoolClosed(self.endpoint.clone()));
        }
        let permit = tokio::time::timeout(
            self.config.checkout_timeout(),
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::PoolExhausted(self.endpoint.clone()))?
        .map_err(|_| StoreError::PoolClosed(self.endpoint.clone()))?;

        loop {
            let candidate = self.idle.lock().pop();
            let Some(mut conn) = candidate else {
                break;
            };
            if !self.config.test_on_borrow {
                return Ok(self.wrap(conn, permit));
            }
            match conn.ping().await {
                Ok(()) => return Ok(self.wrap(conn, permit)),
                Err(e) => {
                    warn!("evicting pooled connection to {} after failed ping: {e}", self.endpoint);
                }
            }
        }

        debug!("opening new connection to {}", self.endpoint);
        let conn = self.connector.connect(&self.endpoint).await?;
        Ok(self.wrap(conn, permit))
    }

    fn wrap(self: &Arc<Self>, conn: Box<dyn ShardConnection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            health: ConnectionHealth::Healthy,
            watching: false,
            _permit: permit,
        }
    }

    fn check_in(&self, conn: Box<dyn ShardConnection>, health: ConnectionHealth) {
        if health == ConnectionHealth::Broken {
            debug!("discarding broken connection to {}", self.endpoint);
            return;
        }
        if self.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        }
    }

    ///
    /// Retire the pool: idle connections are dropped, pending and future checkouts fail and
    /// connections still in use are discarded when checked back in.
    ///
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        info!(
            "closed connection pool {} to {}, dropped {} idle connections",
            self.id,
            self.endpoint,
            drained.len()
        );
    }
}

///
/// A checked-out connection. Dropping it checks the connection back in according to its health.
///
/// A connection dropped while a watch is pending (e.g. a lock attempt cancelled between `watch` and
/// `exec`) is discarded: its watch would otherwise leak into the next caller's transaction.
///
pub struct PooledConnection {
    conn: Option<Box<dyn ShardConnection>>,
    pool: Arc<ShardPool>,
    health: ConnectionHealth,
    // Set by `watch`, cleared once `exec` or `unwatch` completed.
    watching: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &HostAndPort {
        self.pool.endpoint()
    }

    ///
    /// Flag the connection as broken so it is discarded instead of reused.
    ///
    pub fn mark_broken(&mut self) {
        self.health = ConnectionHealth::Broken;
    }

    pub fn release(mut self, health: ConnectionHealth) {
        self.health = health;
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub async fn watch(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.watching = true;
        (**self).watch(key).await
    }

    pub async fn unwatch(&mut self) -> Result<(), StoreError> {
        (**self).unwatch().await?;
        self.watching = false;
        Ok(())
    }

    pub async fn exec(&mut self, ops: Vec<TxnOp>) -> Result<Option<Vec<TxnReply>>, StoreError> {
        let replies = (**self).exec(ops).await?;
        self.watching = false;
        Ok(replies)
    }
}

impl Deref for PooledConnection {
    type Target = dyn ShardConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let health = if self.watching {
                debug!("connection to {} dropped with a pending watch", self.pool.endpoint);
                ConnectionHealth::Broken
            } else {
                self.health
            };
            self.pool.check_in(conn, health);
        }
    }
}
