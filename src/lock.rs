use {
    crate::{
        config::LockOptions,
        pool::PooledConnection,
        router::ShardRouter,
        store::{StoreError, TxnOp, TxnReply},
    },
    core::fmt,
    std::{
        sync::Arc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
    thiserror::Error,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

/// Namespace prepended to every lock name to form its store key.
pub const KEY_PREFIX: &[u8] = b"shard-lock:";

pub const TOKEN_LEN: usize = 24;

// How many times one attempt restarts when the lock vanishes between the create and the read.
const MAX_VANISHED_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock name cannot be empty")]
    InvalidLockName,
    #[error("lock acquisition cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

///
/// Ownership proof written into a lock key.
///
/// Layout (24 bytes, big-endian): 16 bytes of random owner id followed by the expiry as epoch millis.
///
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken([u8; TOKEN_LEN]);

impl LockToken {
    pub fn new(owner: u128, expiry_millis: u64) -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes[..16].copy_from_slice(&owner.to_be_bytes());
        bytes[16..].copy_from_slice(&expiry_millis.to_be_bytes());
        Self(bytes)
    }

    ///
    /// A token with a fresh random owner id.
    ///
    pub fn generate(expiry_millis: u64) -> Self {
        Self::new(rand::random::<u128>(), expiry_millis)
    }

    ///
    /// Decodes a stored value; `None` unless it is exactly [`TOKEN_LEN`] bytes.
    ///
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn owner(&self) -> u128 {
        u128::from_be_bytes(self.0[..16].try_into().expect("16 bytes"))
    }

    pub fn expiry_millis(&self) -> u64 {
        u64::from_be_bytes(self.0[16..].try_into().expect("8 bytes"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    ///
    /// Whether a lock carrying this token may be taken over at `now_millis`.
    ///
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        now_millis > self.expiry_millis()
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({:032x}@{})", self.owner(), self.expiry_millis())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Values that are not a token cannot belong to a live holder.
fn is_stale(value: &[u8], now_millis: u64) -> bool {
    match LockToken::from_bytes(value) {
        Some(token) => token.is_expired_at(now_millis),
        None => {
            warn!("lock value of {} bytes is not a lock token, treating it as stale", value.len());
            true
        }
    }
}

///
/// Proof of a successful acquisition. Must be handed back to [`DistributedLock::unlock`].
///
#[derive(Debug)]
pub struct LockHandle {
    key: Vec<u8>,
    token: LockToken,
}

impl LockHandle {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }
}

///
/// A named lock living on one shard of the store.
///
/// Acquisition is optimistic: create-if-absent first, otherwise take over the key inside a watched
/// transaction when the current holder's token expired. There is no fairness between contenders.
///
/// ```no_run
/// # use rust_shard_lock::lock::DistributedLock;
/// # async fn run(lock: DistributedLock) -> Result<(), rust_shard_lock::lock::LockError> {
/// if let Some(handle) = lock.try_lock().await? {
///     // ... critical section
///     lock.unlock(handle).await?;
/// }
/// # Ok(())
/// # }
/// ```
///
pub struct DistributedLock {
    router: Arc<ShardRouter>,
    name: String,
    key: Vec<u8>,
    hold_timeout: Duration,
    retry_sleep: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("hold_timeout", &self.hold_timeout)
            .field("retry_sleep", &self.retry_sleep)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(
        router: Arc<ShardRouter>,
        name: impl AsRef<str>,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(LockError::InvalidLockName);
        }
        let mut key = Vec::with_capacity(KEY_PREFIX.len() + name.len());
        key.extend_from_slice(KEY_PREFIX);
        key.extend_from_slice(name.as_bytes());
        Ok(Self {
            router,
            name: name.to_string(),
            key,
            hold_timeout: options.hold_timeout(),
            retry_sleep: options.retry_sleep(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hold_timeout(&self) -> Duration {
        self.hold_timeout
    }

    pub fn retry_sleep(&self) -> Duration {
        self.retry_sleep
    }

    fn fresh_token(&self) -> LockToken {
        LockToken::generate(now_millis() + self.hold_timeout.as_millis() as u64)
    }

    fn handle(&self, token: LockToken) -> LockHandle {
        LockHandle {
            key: self.key.clone(),
            token,
        }
    }

    ///
    /// Single acquisition attempt. `Ok(None)` when the lock is validly held by someone else.
    ///
    pub async fn try_lock(&self) -> Result<Option<LockHandle>, LockError> {
        let mut conn = self.router.acquire(&self.key).await?;
        let result = self.try_lock_on(&mut conn).await;
        if result.is_err() {
            conn.mark_broken();
        }
        Ok(result?)
    }

    async fn try_lock_on(&self, conn: &mut PooledConnection) -> Result<Option<LockHandle>, StoreError> {
        let hold_secs = self.hold_timeout.as_secs();
        for _ in 0..=MAX_VANISHED_RETRIES {
            let token = self.fresh_token();
            if conn.set_if_absent(&self.key, token.as_bytes()).await? {
                conn.expire(&self.key, hold_secs).await?;
                trace!("acquired lock {}", self.name);
                return Ok(Some(self.handle(token)));
            }

            conn.watch(&self.key).await?;
            let Some(current) = conn.get(&self.key).await? else {
                conn.unwatch().await?;
                trace!("lock {} vanished before it could be read, retrying", self.name);
                continue;
            };
            if !is_stale(&current, now_millis()) {
                conn.unwatch().await?;
                trace!("lock {} is held", self.name);
                return Ok(None);
            }

            let token = self.fresh_token();
            let replies = conn
                .exec(vec![
                    TxnOp::GetSet {
                        key: self.key.clone(),
                        value: token.as_bytes().to_vec(),
                    },
                    TxnOp::Expire {
                        key: self.key.clone(),
                        seconds: hold_secs,
                    },
                ])
                .await?;
            // Committing is not enough: the value we overwrote must be the stale one we read.
            let won = matches!(
                replies.as_deref(),
                Some([TxnReply::Value(Some(prev)), ..]) if *prev == current
            );
            if won {
                info!("took over stale lock {}", self.name);
                return Ok(Some(self.handle(token)));
            }
            trace!("lost the race for stale lock {}", self.name);
            return Ok(None);
        }
        debug!("lock {} kept vanishing, giving up this attempt", self.name);
        Ok(None)
    }

    // Only returns `Err(LockError::Cancelled)`; store errors count as failed attempts.
    async fn acquire_loop(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<LockHandle>, LockError> {
        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(LockError::Cancelled);
            }
            match self.try_lock().await {
                Ok(Some(handle)) => return Ok(Some(handle)),
                Ok(None) => {}
                Err(e) => warn!("attempt to lock {} failed: {e}", self.name),
            }
            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.retry_sleep.min(remaining)
                }
                None => self.retry_sleep,
            };
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LockError::Cancelled),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }
    }

    ///
    /// Wait until the lock is acquired, retrying forever.
    ///
    pub async fn lock(&self) -> LockHandle {
        match self.acquire_loop(None, None).await {
            Ok(Some(handle)) => handle,
            _ => unreachable!("unbounded acquisition without cancellation only returns the lock"),
        }
    }

    ///
    /// Wait until the lock is acquired or `cancel` fires.
    ///
    pub async fn lock_cancellable(&self, cancel: &CancellationToken) -> Result<LockHandle, LockError> {
        match self.acquire_loop(None, Some(cancel)).await? {
            Some(handle) => Ok(handle),
            None => Err(LockError::Cancelled),
        }
    }

    ///
    /// Keep trying for at most `timeout`. `Ok(None)` once the time is up.
    ///
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<Option<LockHandle>, LockError> {
        self.acquire_loop(Some(Instant::now() + timeout), None).await
    }

    pub async fn try_lock_for_cancellable(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>, LockError> {
        self.acquire_loop(Some(Instant::now() + timeout), Some(cancel))
            .await
    }

    ///
    /// Release the lock if `handle` still owns it.
    ///
    /// Returns `Ok(false)` and leaves the store untouched when the lock expired and was taken by
    /// someone else, or when `handle` belongs to another lock.
    ///
    pub async fn unlock(&self, handle: LockHandle) -> Result<bool, LockError> {
        if handle.key != self.key {
            debug!("handle does not belong to lock {}, ignoring unlock", self.name);
            return Ok(false);
        }
        let mut conn = self.router.acquire(&self.key).await?;
        let result = self.unlock_on(&mut conn, &handle.token).await;
        if result.is_err() {
            conn.mark_broken();
        }
        Ok(result?)
    }

    async fn unlock_on(&self, conn: &mut PooledConnection, token: &LockToken) -> Result<bool, StoreError> {
        conn.watch(&self.key).await?;
        let current = conn.get(&self.key).await?;
        if current.as_deref() != Some(token.as_bytes()) {
            conn.unwatch().await?;
            debug!("lock {} is not held by this handle, nothing to release", self.name);
            return Ok(false);
        }
        let replies = conn
            .exec(vec![TxnOp::Del {
                key: self.key.clone(),
            }])
            .await?;
        let released = replies.is_some();
        if released {
            trace!("released lock {}", self.name);
        } else {
            warn!("lock {} changed while releasing it", self.name);
        }
        Ok(released)
    }

    ///
    /// Whether any caller currently holds the lock.
    ///
    pub async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.current_value().await?.is_some())
    }

    ///
    /// Whether `handle` still owns the lock. Never mutates the store.
    ///
    pub async fn is_held_by(&self, handle: &LockHandle) -> Result<bool, LockError> {
        if handle.key != self.key {
            return Ok(false);
        }
        let current = self.current_value().await?;
        Ok(current.as_deref() == Some(handle.token.as_bytes()))
    }

    async fn current_value(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.router.acquire(&self.key).await?;
        let result = conn.get(&self.key).await;
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::PoolConfig,
            store::memory::MemoryCluster,
            topology::{HostAndPort, ShardTopology},
        },
    };

    fn router() -> Arc<ShardRouter> {
        let cluster = MemoryCluster::new();
        let endpoint = HostAndPort::new("127.0.0.1", 6379);
        cluster.add_node(endpoint.clone());
        Arc::new(
            ShardRouter::new(
                vec!["only".into()],
                ShardTopology::new(vec![endpoint]),
                Arc::new(cluster),
                PoolConfig::default(),
            )
            .expect("router"),
        )
    }

    #[test]
    fn token_layout_is_owner_then_big_endian_expiry() {
        let token = LockToken::new(0x0102030405060708090a0b0c0d0e0f10, 0x1112131415161718);
        assert_eq!(
            token.as_bytes(),
            &[
                1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 0x11, 0x12, 0x13, 0x14,
                0x15, 0x16, 0x17, 0x18
            ]
        );
        assert_eq!(token.owner(), 0x0102030405060708090a0b0c0d0e0f10);
        assert_eq!(token.expiry_millis(), 0x1112131415161718);
    }

    #[test]
    fn token_expiry_survives_decoding_at_the_bounds() {
        for expiry in [0u64, 1, 1_700_000_000_000, (1u64 << 32) + 7, i64::MAX as u64] {
            let token = LockToken::generate(expiry);
            let decoded = LockToken::from_bytes(token.as_bytes()).expect("24 bytes");
            assert_eq!(decoded.expiry_millis(), expiry);
            assert_eq!(decoded, token);
        }
    }

    #[test]
    fn generated_tokens_have_distinct_owners() {
        let a = LockToken::generate(1);
        let b = LockToken::generate(1);
        assert_ne!(a.owner(), b.owner());
    }

    #[test]
    fn staleness_follows_embedded_expiry() {
        let token = LockToken::generate(1_000);
        assert!(!is_stale(token.as_bytes(), 999));
        assert!(!is_stale(token.as_bytes(), 1_000));
        assert!(is_stale(token.as_bytes(), 1_001));
        assert!(is_stale(b"garbage", 0));
    }

    #[test]
    fn it_should_reject_empty_lock_names() {
        let result = DistributedLock::new(router(), "", LockOptions::default());
        assert!(matches!(result, Err(LockError::InvalidLockName)));
    }

    #[test]
    fn construction_clamps_timings_and_prefixes_key() {
        let lock = DistributedLock::new(router(), "L", LockOptions::new(999_999, 1)).expect("lock");
        assert_eq!(lock.hold_timeout(), Duration::from_secs(86_400));
        assert_eq!(lock.retry_sleep(), Duration::from_millis(9));
        assert_eq!(lock.key(), b"shard-lock:L");
    }

    #[tokio::test]
    async fn unlock_with_a_foreign_handle_is_a_noop() {
        let router = router();
        let a = DistributedLock::new(Arc::clone(&router), "a", LockOptions::new(10, 10)).expect("lock");
        let b = DistributedLock::new(router, "b", LockOptions::new(10, 10)).expect("lock");
        let handle_a = a.try_lock().await.expect("try").expect("acquired");
        let handle_b = b.try_lock().await.expect("try").expect("acquired");

        assert!(!b.is_held_by(&handle_a).await.expect("check"));
        assert!(!b.unlock(handle_a).await.expect("unlock"));
        assert!(b.is_held_by(&handle_b).await.expect("check"));
        assert!(a.is_locked().await.expect("check"));
    }
}
