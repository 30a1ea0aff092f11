use {
    super::{Connector, DiscoveryClient, ShardConnection, StoreError, TxnOp, TxnReply},
    crate::topology::HostAndPort,
    futures::stream::BoxStream,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::sync::broadcast,
    tracing::trace,
};

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct NodeState {
    entries: HashMap<Vec<u8>, Entry>,
    last_version: u64,
}

impl NodeState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    // Expired entries are dropped lazily, on first access.
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn version_of(&mut self, key: &[u8]) -> Option<u64> {
        self.live(key).map(|entry| entry.version)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        let version = self.next_version();
        let prev = self.live(key).map(|entry| std::mem::take(&mut entry.value));
        self.entries.insert(
            key.to_vec(),
            Entry {
                value,
                version,
                expires_at: None,
            },
        );
        prev
    }

    fn expire(&mut self, key: &[u8], seconds: u64) -> bool {
        let version = self.next_version();
        match self.live(key) {
            Some(entry) => {
                entry.version = version;
                entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let existed = self.live(key).is_some();
        self.entries.remove(key);
        existed
    }
}

struct MemoryNode {
    state: Mutex<NodeState>,
    reachable: AtomicBool,
    // Bumped on every outage so connections opened before it stay broken afterwards.
    epoch: AtomicU64,
    read_delay: Mutex<Option<Duration>>,
}

///
/// A single in-process store node.
///
/// Cloning is cheap and every clone refers to the same data.
///
#[derive(Clone)]
pub struct MemoryStore {
    endpoint: HostAndPort,
    node: Arc<MemoryNode>,
}

impl MemoryStore {
    pub fn new(endpoint: HostAndPort) -> Self {
        Self {
            endpoint,
            node: Arc::new(MemoryNode {
                state: Mutex::new(NodeState::default()),
                reachable: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                read_delay: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> &HostAndPort {
        &self.endpoint
    }

    ///
    /// Reads a key directly, bypassing connections.
    ///
    pub fn raw_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.node.state.lock().live(key).map(|entry| entry.value.clone())
    }

    ///
    /// Writes a key directly, bypassing connections. Counts as a write for watchers.
    ///
    pub fn raw_set(&self, key: &[u8], value: &[u8]) {
        self.node.state.lock().put(key, value.to_vec());
    }

    ///
    /// Remaining time-to-live of `key`, if it has one.
    ///
    pub fn ttl(&self, key: &[u8]) -> Option<Duration> {
        let mut state = self.node.state.lock();
        let entry = state.live(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn key_count(&self) -> usize {
        let mut state = self.node.state.lock();
        let keys: Vec<Vec<u8>> = state.entries.keys().cloned().collect();
        keys.iter().filter(|key| state.live(key).is_some()).count()
    }

    ///
    /// Simulates an outage (`false`) or a recovery (`true`).
    ///
    /// Connections opened before an outage keep failing after recovery, like real sockets would.
    ///
    pub fn set_reachable(&self, reachable: bool) {
        if !reachable {
            self.node.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.node.reachable.store(reachable, Ordering::Release);
    }

    ///
    /// Makes every `get` through a connection take `delay` (`None` to answer immediately).
    ///
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.node.read_delay.lock() = delay;
    }

    pub fn is_reachable(&self) -> bool {
        self.node.reachable.load(Ordering::Acquire)
    }

    pub fn connect(&self) -> Result<MemoryConnection, StoreError> {
        if !self.is_reachable() {
            return Err(StoreError::Unreachable(self.endpoint.clone()));
        }
        Ok(MemoryConnection {
            store: self.clone(),
            epoch: self.node.epoch.load(Ordering::Acquire),
            watched: Vec::new(),
        })
    }
}

///
/// Connection to a [`MemoryStore`] node.
///
pub struct MemoryConnection {
    store: MemoryStore,
    epoch: u64,
    // Watched keys and their version at watch time (`None` when the key was absent).
    // Re-watching a key keeps its first version, like Redis does.
    watched: Vec<(Vec<u8>, Option<u64>)>,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), StoreError> {
        let node = &self.store.node;
        if !node.reachable.load(Ordering::Acquire) || node.epoch.load(Ordering::Acquire) != self.epoch {
            return Err(StoreError::Unreachable(self.store.endpoint.clone()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ShardConnection for MemoryConnection {
    async fn set_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.store.node.state.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.put(key, value.to_vec());
        Ok(true)
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        let delay = *self.store.node.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.store.raw_get(key))
    }

    async fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.store.node.state.lock().expire(key, seconds))
    }

    async fn watch(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        if self.watched.iter().any(|(watched, _)| watched.as_slice() == key) {
            return Ok(());
        }
        let version = self.store.node.state.lock().version_of(key);
        self.watched.push((key.to_vec(), version));
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        self.check()?;
        self.watched.clear();
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<TxnOp>) -> Result<Option<Vec<TxnReply>>, StoreError> {
        self.check()?;
        let watched = std::mem::take(&mut self.watched);
        let mut state = self.store.node.state.lock();
        for (key, version) in watched {
            if state.version_of(&key) != version {
                trace!("transaction aborted, watched key changed");
                return Ok(None);
            }
        }
        let replies = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::GetSet { key, value } => TxnReply::Value(state.put(&key, value)),
                TxnOp::Del { key } => TxnReply::Integer(state.delete(&key) as i64),
                TxnOp::Expire { key, seconds } => {
                    TxnReply::Integer(state.expire(&key, seconds) as i64)
                }
            })
            .collect();
        Ok(Some(replies))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.check()
    }
}

///
/// A set of [`MemoryStore`] nodes addressed by endpoint; acts as the [`Connector`] for them.
///
#[derive(Clone, Default)]
pub struct MemoryCluster {
    nodes: Arc<Mutex<HashMap<HostAndPort, MemoryStore>>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Registers a node at `endpoint`, returning the existing one if already present.
    ///
    pub fn add_node(&self, endpoint: HostAndPort) -> MemoryStore {
        self.nodes
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(|| MemoryStore::new(endpoint))
            .clone()
    }

    pub fn node(&self, endpoint: &HostAndPort) -> Option<MemoryStore> {
        self.nodes.lock().get(endpoint).cloned()
    }

    ///
    /// Number of connections successfully opened so far, across all nodes.
    ///
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, endpoint: &HostAndPort) -> Result<Box<dyn ShardConnection>, StoreError> {
        let node = self
            .node(endpoint)
            .ok_or_else(|| StoreError::Unreachable(endpoint.clone()))?;
        let conn = node.connect()?;
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(conn))
    }
}

#[derive(Debug, Clone)]
enum PeerEvent {
    Message { channel: String, payload: String },
    Disconnect,
}

struct PeerState {
    reachable: bool,
    events: broadcast::Sender<PeerEvent>,
}

#[derive(Default)]
struct SentinelState {
    masters: HashMap<String, HostAndPort>,
    peers: HashMap<HostAndPort, PeerState>,
}

///
/// In-process discovery service: a set of peers that agree on the masters and broadcast switches.
///
#[derive(Clone, Default)]
pub struct MemorySentinel {
    state: Arc<Mutex<SentinelState>>,
}

impl MemorySentinel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: HostAndPort) {
        let (events, _) = broadcast::channel(64);
        self.state.lock().peers.insert(
            peer,
            PeerState {
                reachable: true,
                events,
            },
        );
    }

    pub fn set_master(&self, name: impl Into<String>, master: HostAndPort) {
        self.state.lock().masters.insert(name.into(), master);
    }

    pub fn master(&self, name: &str) -> Option<HostAndPort> {
        self.state.lock().masters.get(name).cloned()
    }

    ///
    /// Makes `peer` unreachable (dropping its subscribers) or reachable again.
    ///
    pub fn set_peer_reachable(&self, peer: &HostAndPort, reachable: bool) {
        let mut state = self.state.lock();
        if let Some(peer_state) = state.peers.get_mut(peer) {
            peer_state.reachable = reachable;
            if !reachable {
                let _ = peer_state.events.send(PeerEvent::Disconnect);
            }
        }
    }

    ///
    /// Number of live subscriptions on `peer`.
    ///
    pub fn subscriber_count(&self, peer: &HostAndPort) -> usize {
        self.state
            .lock()
            .peers
            .get(peer)
            .map(|p| p.events.receiver_count())
            .unwrap_or(0)
    }

    ///
    /// Publishes a raw payload on `channel` through every reachable peer.
    ///
    pub fn publish(&self, channel: &str, payload: &str) {
        let state = self.state.lock();
        for peer_state in state.peers.values().filter(|p| p.reachable) {
            let _ = peer_state.events.send(PeerEvent::Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    ///
    /// Promotes `new_master` for shard `name` and announces the switch on every reachable peer.
    ///
    pub fn failover(&self, name: &str, new_master: HostAndPort) {
        let old = {
            let mut state = self.state.lock();
            state.masters.insert(name.to_string(), new_master.clone())
        };
        let (old_host, old_port) = old
            .map(|hp| (hp.host, hp.port.to_string()))
            .unwrap_or_else(|| ("-".to_string(), "0".to_string()));
        let payload = format!(
            "{name} {old_host} {old_port} {} {}",
            new_master.host, new_master.port
        );
        self.publish(super::SWITCH_MASTER_CHANNEL, &payload);
    }

    fn reachable_peer(&self, peer: &HostAndPort) -> Result<broadcast::Sender<PeerEvent>, StoreError> {
        let state = self.state.lock();
        match state.peers.get(peer) {
            Some(p) if p.reachable => Ok(p.events.clone()),
            _ => Err(StoreError::Unreachable(peer.clone())),
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for MemorySentinel {
    async fn master_addr(
        &self,
        peer: &HostAndPort,
        name: &str,
    ) -> Result<Option<HostAndPort>, StoreError> {
        self.reachable_peer(peer)?;
        Ok(self.master(name))
    }

    async fn subscribe(
        &self,
        peer: &HostAndPort,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError> {
        let rx = self.reachable_peer(peer)?.subscribe();
        let channel = channel.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(PeerEvent::Message {
                            channel: published_on,
                            payload,
                        }) => {
                            if published_on == channel {
                                return Some((Ok::<_, StoreError>(payload), rx));
                            }
                        }
                        Ok(PeerEvent::Disconnect) => return None,
                        Err(broadcast::error::RecvError::Closed) => return None,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp(port: u16) -> HostAndPort {
        HostAndPort::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn set_if_absent_only_creates_once() {
        let store = MemoryStore::new(hp(1));
        let mut conn = store.connect().expect("connect");
        assert!(conn.set_if_absent(b"k", b"v1").await.expect("setnx"));
        assert!(!conn.set_if_absent(b"k", b"v2").await.expect("setnx"));
        assert_eq!(conn.get(b"k").await.expect("get"), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn rewatching_a_key_keeps_the_first_watch_point() {
        let store = MemoryStore::new(hp(1));
        let mut conn = store.connect().expect("connect");
        store.raw_set(b"k", b"v1");

        conn.watch(b"k").await.expect("watch");
        store.raw_set(b"k", b"v1");
        conn.watch(b"k").await.expect("watch");
        let replies = conn
            .exec(vec![TxnOp::Del { key: b"k".to_vec() }])
            .await
            .expect("exec");
        assert_eq!(replies, None);

        conn.watch(b"k").await.expect("watch");
        let replies = conn
            .exec(vec![TxnOp::Del { key: b"k".to_vec() }])
            .await
            .expect("exec");
        assert_eq!(replies, Some(vec![TxnReply::Integer(1)]));
    }

    #[tokio::test]
    async fn exec_should_abort_when_watched_key_changed() {
        let store = MemoryStore::new(hp(1));
        let mut c1 = store.connect().expect("connect");
        let mut c2 = store.connect().expect("connect");
        store.raw_set(b"k", b"v1");

        c1.watch(b"k").await.expect("watch");
        c2.exec(vec![TxnOp::GetSet {
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
        }])
        .await
        .expect("exec");

        let result = c1
            .exec(vec![TxnOp::Del { key: b"k".to_vec() }])
            .await
            .expect("exec");
        assert_eq!(result, None);
        assert_eq!(store.raw_get(b"k"), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn exec_should_commit_and_report_overwritten_value() {
        let store = MemoryStore::new(hp(1));
        let mut conn = store.connect().expect("connect");
        store.raw_set(b"k", b"old");

        conn.watch(b"k").await.expect("watch");
        let replies = conn
            .exec(vec![
                TxnOp::GetSet {
                    key: b"k".to_vec(),
                    value: b"new".to_vec(),
                },
                TxnOp::Expire {
                    key: b"k".to_vec(),
                    seconds: 10,
                },
            ])
            .await
            .expect("exec")
            .expect("committed");
        assert_eq!(
            replies,
            vec![TxnReply::Value(Some(b"old".to_vec())), TxnReply::Integer(1)]
        );
        assert!(store.ttl(b"k").is_some());
    }

    #[tokio::test]
    async fn watching_an_absent_key_aborts_if_it_gets_created() {
        let store = MemoryStore::new(hp(1));
        let mut c1 = store.connect().expect("connect");
        c1.watch(b"k").await.expect("watch");
        store.raw_set(b"k", b"x");
        let result = c1
            .exec(vec![TxnOp::Del { key: b"k".to_vec() }])
            .await
            .expect("exec");
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn connections_opened_before_an_outage_stay_broken() {
        let store = MemoryStore::new(hp(1));
        let mut conn = store.connect().expect("connect");
        store.set_reachable(false);
        assert!(conn.ping().await.is_err());
        assert!(store.connect().is_err());
        store.set_reachable(true);
        assert!(conn.ping().await.is_err());
        let mut fresh = store.connect().expect("connect");
        assert!(fresh.ping().await.is_ok());
    }

    #[tokio::test]
    async fn cluster_refuses_unknown_endpoints() {
        let cluster = MemoryCluster::new();
        cluster.add_node(hp(1));
        assert!(cluster.connect(&hp(1)).await.is_ok());
        assert!(matches!(
            cluster.connect(&hp(2)).await,
            Err(StoreError::Unreachable(_))
        ));
        assert_eq!(cluster.connect_count(), 1);
    }

    #[tokio::test]
    async fn sentinel_streams_switch_messages_until_disconnect() {
        use tokio_stream::StreamExt;

        let sentinel = MemorySentinel::new();
        sentinel.add_peer(hp(26379));
        sentinel.set_master("shard-a", hp(6379));

        let mut stream = sentinel
            .subscribe(&hp(26379), super::super::SWITCH_MASTER_CHANNEL)
            .await
            .expect("subscribe");
        sentinel.failover("shard-a", hp(6380));
        let msg = stream.next().await.expect("message").expect("ok");
        assert_eq!(msg, "shard-a 127.0.0.1 6379 127.0.0.1 6380");

        sentinel.set_peer_reachable(&hp(26379), false);
        assert!(stream.next().await.is_none());
        assert!(sentinel.master_addr(&hp(26379), "shard-a").await.is_err());
    }
}
