use {
    crate::{
        config::FailoverConfig,
        router::ShardRouter,
        store::{DiscoveryClient, SWITCH_MASTER_CHANNEL},
        topology::{HostAndPort, ShardTopology, TopologyError},
    },
    retry::delay::Fixed,
    std::{str::FromStr, sync::Arc, time::Duration},
    thiserror::Error,
    tokio::{sync::watch, task::JoinSet},
    tokio_stream::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, trace, warn},
};

#[derive(Debug, Error)]
pub enum SwitchMasterParseError {
    #[error("expected 5 space separated fields, got {0}")]
    FieldCount(usize),
    #[error(transparent)]
    Endpoint(#[from] TopologyError),
}

///
/// A `+switch-master` announcement: `<name> <old-host> <old-port> <new-host> <new-port>`.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMaster {
    pub name: String,
    pub old_master: HostAndPort,
    pub new_master: HostAndPort,
}

impl FromStr for SwitchMaster {
    type Err = SwitchMasterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        match fields.as_slice() {
            [name, old_host, old_port, new_host, new_port] => Ok(Self {
                name: name.to_string(),
                old_master: HostAndPort::from_parts(old_host, old_port)?,
                new_master: HostAndPort::from_parts(new_host, new_port)?,
            }),
            _ => Err(SwitchMasterParseError::FieldCount(fields.len())),
        }
    }
}

async fn ask_peers(
    discovery: &dyn DiscoveryClient,
    peers: &[HostAndPort],
    name: &str,
) -> Option<HostAndPort> {
    for peer in peers {
        match discovery.master_addr(peer, name).await {
            Ok(Some(master)) => {
                info!("discovery peer {peer} reports master of `{name}` at {master}");
                return Some(master);
            }
            Ok(None) => {
                warn!("discovery peer {peer} does not know master `{name}`, trying next one");
            }
            Err(e) => {
                warn!("cannot connect to discovery peer {peer}: {e}, trying next one");
            }
        }
    }
    None
}

///
/// Resolve the current master of every shard name, in order.
///
/// Every name gets one pass over `peers`; failed passes draw from a single budget of
/// `config.startup_retries` retries shared by all names, spaced by `config.startup_backoff_ms`.
///
pub async fn discover_masters(
    discovery: &dyn DiscoveryClient,
    peers: &[HostAndPort],
    names: &[String],
    config: &FailoverConfig,
) -> Result<ShardTopology, TopologyError> {
    info!("trying to find all masters from available discovery peers...");
    let mut retries = Fixed::from_millis(config.startup_backoff_ms).take(config.startup_retries);
    let mut attempts = 0;
    let mut masters = Vec::with_capacity(names.len());
    for name in names {
        let master = loop {
            attempts += 1;
            if let Some(master) = ask_peers(discovery, peers, name).await {
                break master;
            }
            match retries.next() {
                Some(delay) => {
                    warn!("all discovery peers failed to resolve `{name}`, sleeping {delay:?} and retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!("all discovery peers are down or do not know master `{name}`");
                    return Err(TopologyError::DiscoveryExhausted {
                        name: name.clone(),
                        peers: peers.to_vec(),
                        attempts,
                    });
                }
            }
        };
        masters.push(master);
    }
    let topology = ShardTopology::new(masters);
    info!("redis master running at {topology}, starting discovery listeners...");
    Ok(topology)
}

///
/// Lifecycle of a single discovery listener.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting to (re)subscribe after the peer went away.
    Disconnected,
    Subscribing,
    /// Subscribed, switch announcements are being applied.
    Listening,
    Terminated,
}

struct MasterListener {
    peer: HostAndPort,
    router: Arc<ShardRouter>,
    discovery: Arc<dyn DiscoveryClient>,
    resubscribe_backoff: Duration,
    cancel: CancellationToken,
    state_tx: watch::Sender<ListenerState>,
}

impl MasterListener {
    fn set_state(&self, state: ListenerState) {
        trace!("listener on {} is now {:?}", self.peer, state);
        self.state_tx.send_replace(state);
    }

    async fn run(self) {
        'outer: loop {
            self.set_state(ListenerState::Subscribing);
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                result = self.discovery.subscribe(&self.peer, SWITCH_MASTER_CHANNEL) => result,
            };
            match subscribed {
                Ok(mut stream) => {
                    self.set_state(ListenerState::Listening);
                    info!("listening for master switches on discovery peer {}", self.peer);
                    'inner: loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                info!("unsubscribing from discovery peer {}", self.peer);
                                break 'outer;
                            }
                            msg = stream.next() => match msg {
                                Some(Ok(payload)) => self.apply(&payload),
                                Some(Err(e)) => {
                                    error!("subscription to {} failed: {e}", self.peer);
                                    break 'inner;
                                }
                                None => break 'inner,
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("failed to subscribe to discovery peer {}: {e}", self.peer);
                }
            }

            self.set_state(ListenerState::Disconnected);
            warn!(
                "lost connection to discovery peer {}, sleeping {:?} and retrying",
                self.peer, self.resubscribe_backoff
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                _ = tokio::time::sleep(self.resubscribe_backoff) => {}
            }
        }
        self.set_state(ListenerState::Terminated);
    }

    fn apply(&self, payload: &str) {
        trace!("discovery peer {} published: {payload}", self.peer);
        let switch = match payload.parse::<SwitchMaster>() {
            Ok(switch) => switch,
            Err(e) => {
                error!("invalid message on {SWITCH_MASTER_CHANNEL} from {}: `{payload}` ({e})", self.peer);
                return;
            }
        };
        let Some(index) = self.router.shard_index(&switch.name) else {
            info!(
                "ignoring master switch of `{}`, monitored shards are {:?}",
                switch.name,
                self.router.shard_names()
            );
            return;
        };
        match self.router.update_master(index, switch.new_master.clone()) {
            Ok(true) => info!(
                "shard `{}` failed over from {} to {}",
                switch.name, switch.old_master, switch.new_master
            ),
            Ok(false) => trace!("shard `{}` already at {}", switch.name, switch.new_master),
            Err(e) => error!("failed to apply master switch of `{}`: {e}", switch.name),
        }
    }
}

///
/// Follows master switches announced by every discovery peer and applies them to a [`ShardRouter`].
///
/// One listener task runs per peer. Several peers announcing the same switch is harmless: the router
/// ignores topologies equal to the current one.
///
pub struct FailoverMonitor {
    cancel: CancellationToken,
    js: JoinSet<()>,
    states: Vec<(HostAndPort, watch::Receiver<ListenerState>)>,
}

impl FailoverMonitor {
    ///
    /// Spawn one listener per peer on the current runtime.
    ///
    pub fn spawn(
        router: Arc<ShardRouter>,
        discovery: Arc<dyn DiscoveryClient>,
        peers: Vec<HostAndPort>,
        config: FailoverConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut js = JoinSet::new();
        let mut states = Vec::with_capacity(peers.len());
        for peer in peers {
            let (state_tx, state_rx) = watch::channel(ListenerState::Disconnected);
            let listener = MasterListener {
                peer: peer.clone(),
                router: Arc::clone(&router),
                discovery: Arc::clone(&discovery),
                resubscribe_backoff: config.resubscribe_backoff(),
                cancel: cancel.child_token(),
                state_tx,
            };
            js.spawn(listener.run());
            states.push((peer, state_rx));
        }
        Self { cancel, js, states }
    }

    pub fn listener_states(&self) -> Vec<(HostAndPort, ListenerState)> {
        self.states
            .iter()
            .map(|(peer, rx)| (peer.clone(), *rx.borrow()))
            .collect()
    }

    ///
    /// Wait until every listener has an active subscription.
    ///
    pub async fn wait_until_listening(&self) {
        for (_, rx) in &self.states {
            let mut rx = rx.clone();
            // An error means the listener is gone, nothing left to wait for.
            let _ = rx.wait_for(|state| *state == ListenerState::Listening).await;
        }
    }

    ///
    /// Stop every listener and wait for them to unsubscribe.
    ///
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.js.join_next().await {
            if let Err(e) = result {
                error!("discovery listener failed: {e}");
            }
        }
        info!("stopped {} discovery listeners", self.states.len());
    }
}
