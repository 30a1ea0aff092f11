use {
    crate::topology::HostAndPort,
    futures::stream::BoxStream,
    std::time::Duration,
    thiserror::Error,
};

///
/// In-process store with real watch/transaction semantics, used by tests and single-process setups.
pub mod memory;

///
/// Redis masters and Redis Sentinel discovery.
pub mod redis;

///
/// etcd endpoints expressing the same optimistic-transaction contract.
pub mod etcd;

/// Pub/sub channel on which discovery peers announce a master switch.
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("endpoint {0} is unreachable")]
    Unreachable(HostAndPort),
    #[error("timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout {
        endpoint: HostAndPort,
        timeout: Duration,
    },
    #[error("no pooled connection to {0} became available in time")]
    PoolExhausted(HostAndPort),
    #[error("connection pool for {0} is closed")]
    PoolClosed(HostAndPort),
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

///
/// Operation queued inside an optimistic transaction (see [`ShardConnection::exec`]).
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Set `key` to `value`, replying with the value it overwrote.
    GetSet { key: Vec<u8>, value: Vec<u8> },
    /// Delete `key`, replying with the number of deleted keys.
    Del { key: Vec<u8> },
    /// Expire `key` after `seconds`, replying `1` if the key exists.
    Expire { key: Vec<u8>, seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnReply {
    Value(Option<Vec<u8>>),
    Integer(i64),
}

///
/// A single connection to one shard master.
///
/// A connection is used by one caller at a time (the pool hands it out exclusively), which is what
/// makes `watch` / `exec` meaningful: the watch is scoped to the connection.
///
#[async_trait::async_trait]
pub trait ShardConnection: Send {
    ///
    /// Atomically create `key` with `value` if it does not exist. Returns `true` when created.
    ///
    async fn set_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    ///
    /// Expire `key` after `seconds`. Returns `false` if the key does not exist.
    ///
    async fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool, StoreError>;

    ///
    /// Mark `key` as watched: the next [`ShardConnection::exec`] aborts if any writer touched it in between.
    ///
    async fn watch(&mut self, key: &[u8]) -> Result<(), StoreError>;

    async fn unwatch(&mut self) -> Result<(), StoreError>;

    ///
    /// Run `ops` atomically, conditioned on the watched key being untouched since [`ShardConnection::watch`].
    ///
    /// Returns `None` when the transaction was aborted, otherwise one reply per operation.
    /// Executing always clears the watch.
    ///
    async fn exec(&mut self, ops: Vec<TxnOp>) -> Result<Option<Vec<TxnReply>>, StoreError>;

    ///
    /// Lightweight liveness check used before handing a pooled connection out again.
    ///
    async fn ping(&mut self) -> Result<(), StoreError>;
}

///
/// Opens connections to shard masters.
///
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &HostAndPort) -> Result<Box<dyn ShardConnection>, StoreError>;
}

///
/// Talks to discovery peers: resolves current masters and streams failover notifications.
///
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync + 'static {
    ///
    /// Ask `peer` for the current master of the logical shard `name`. `None` if the peer does not know it.
    ///
    async fn master_addr(
        &self,
        peer: &HostAndPort,
        name: &str,
    ) -> Result<Option<HostAndPort>, StoreError>;

    ///
    /// Subscribe to `channel` on `peer`.
    ///
    /// The stream ends (or yields an error) when the connection to the peer is lost.
    /// Dropping the stream closes the underlying connection.
    ///
    async fn subscribe(
        &self,
        peer: &HostAndPort,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError>;
}
