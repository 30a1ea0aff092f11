///
/// Client configuration, loaded from JSON
///
pub mod config;

///
/// Master endpoints and the consistent-hash continuum
pub mod topology;

///
/// Store and discovery contracts, with Redis, etcd and in-memory backends
pub mod store;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Bounded per-shard connection pools
pub mod pool;

///
/// Routes lock keys to shards and swaps topologies on failover
///
pub mod router;

///
/// Provides an API over a distributed lock
///
/// A lock is a single key on the shard its name hashes to. Stale holders (past their embedded expiry)
/// are taken over with an optimistic transaction.
///
pub mod lock;

///
/// Follows master switches announced by discovery peers
///
pub mod failover;

///
/// Entry point wiring config, routing, failover and named locks together
///
pub mod client;
