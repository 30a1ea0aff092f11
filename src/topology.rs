use {
    core::fmt,
    serde::{Deserialize, Serialize},
    std::str::FromStr,
    thiserror::Error,
};

const CONTINUUM_SEED: u64 = 0x1234ABCD;
const VIRTUAL_NODES_PER_SHARD: usize = 160;

///
/// A `host:port` endpoint of a store master or a discovery peer.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    ///
    /// Builds an endpoint from a separate host and port string, as announced by discovery peers.
    ///
    pub fn from_parts(host: &str, port: &str) -> Result<Self, TopologyError> {
        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::InvalidEndpoint(format!("{host}:{port}")))?;
        if host.is_empty() {
            return Err(TopologyError::InvalidEndpoint(format!(":{port}")));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().rsplit_once(':') {
            Some((host, port)) => Self::from_parts(host, port),
            None => Err(TopologyError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl TryFrom<String> for HostAndPort {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAndPort> for String {
    fn from(value: HostAndPort) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("invalid endpoint `{0}`, expected host:port")]
    InvalidEndpoint(String),
    #[error("topology has {actual} masters but {expected} shards are configured")]
    CardinalityMismatch { expected: usize, actual: usize },
    #[error("shard index {index} out of range for {len} shards")]
    ShardIndexOutOfRange { index: usize, len: usize },
    #[error("no discovery peer in {peers:?} knows the master of `{name}` after {attempts} attempts")]
    DiscoveryExhausted {
        name: String,
        peers: Vec<HostAndPort>,
        attempts: usize,
    },
}

///
/// Ordered list of master endpoints, one per logical shard name.
///
/// A topology is never mutated in place: failover builds a new one with [`ShardTopology::with_master`]
/// and the router swaps it in whole.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTopology {
    masters: Vec<HostAndPort>,
}

impl ShardTopology {
    pub fn new(masters: Vec<HostAndPort>) -> Self {
        Self { masters }
    }

    pub fn masters(&self) -> &[HostAndPort] {
        &self.masters
    }

    pub fn master(&self, index: usize) -> Option<&HostAndPort> {
        self.masters.get(index)
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    ///
    /// Returns a copy of this topology where shard `index` points to `master`.
    ///
    pub fn with_master(&self, index: usize, master: HostAndPort) -> Result<Self, TopologyError> {
        if index >= self.masters.len() {
            return Err(TopologyError::ShardIndexOutOfRange {
                index,
                len: self.masters.len(),
            });
        }
        let mut masters = self.masters.clone();
        masters[index] = master;
        Ok(Self { masters })
    }
}

impl fmt::Display for ShardTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, master) in self.masters.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{master}")?;
        }
        f.write_str("]")
    }
}

///
/// MurmurHash64A over `data`, reading 8-byte blocks little-endian.
///
pub fn murmur_hash64a(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut blocks = data.chunks_exact(8);
    for block in &mut blocks {
        let mut k = u64::from_le_bytes(block.try_into().expect("chunk of 8 bytes"));
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut buf = [0u8; 8];
        buf[..tail.len()].copy_from_slice(tail);
        h ^= u64::from_le_bytes(buf);
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

///
/// Consistent-hash ring mapping keys onto shard indexes.
///
/// The ring only depends on the number of shards, never on their endpoints, so swapping a master
/// during failover does not move any key to another shard.
///
#[derive(Debug, Clone)]
pub struct Continuum {
    // Sorted by signed hash, matching the ordering of Java-based sharded clients.
    points: Vec<(i64, usize)>,
}

impl Continuum {
    pub fn new(shard_count: usize) -> Self {
        let mut points = Vec::with_capacity(shard_count * VIRTUAL_NODES_PER_SHARD);
        for shard in 0..shard_count {
            for node in 0..VIRTUAL_NODES_PER_SHARD {
                let label = format!("SHARD-{shard}-NODE-{node}");
                points.push((Self::point(label.as_bytes()), shard));
            }
        }
        points.sort_unstable_by_key(|(hash, _)| *hash);
        Self { points }
    }

    fn point(data: &[u8]) -> i64 {
        murmur_hash64a(data, CONTINUUM_SEED) as i64
    }

    ///
    /// Index of the shard owning `key`: first ring point at or after the key's hash, wrapping around.
    ///
    pub fn locate(&self, key: &[u8]) -> usize {
        let hash = Self::point(key);
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        match self.points.get(idx) {
            Some((_, shard)) => *shard,
            None => self.points.first().map(|(_, shard)| *shard).unwrap_or(0),
        }
    }
}
