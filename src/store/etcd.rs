use {
    super::{Connector, ShardConnection, StoreError, TxnOp, TxnReply},
    crate::{config::ClientConfig, retry::retry_etcd, topology::HostAndPort},
    etcd_client::{
        Client, Compare, CompareOp, ConnectOptions, DeleteOptions, PutOptions, Txn,
        TxnOp as EtcdTxnOp, TxnOpResponse,
    },
    std::{collections::HashMap, time::Duration},
    tracing::{debug, trace},
};

///
/// Opens etcd clients, one per pooled connection.
///
#[derive(Clone, Debug)]
pub struct EtcdConnector {
    credentials: Option<(String, String)>,
    connect_timeout: Duration,
}

impl EtcdConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            credentials: None,
            connect_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Self {
            credentials,
            connect_timeout: config.connect_timeout(),
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        let options = ConnectOptions::new()
            .with_connect_timeout(self.connect_timeout)
            .with_timeout(self.connect_timeout);
        match &self.credentials {
            Some((user, password)) => options.with_user(user.clone(), password.clone()),
            None => options,
        }
    }
}

#[async_trait::async_trait]
impl Connector for EtcdConnector {
    async fn connect(&self, endpoint: &HostAndPort) -> Result<Box<dyn ShardConnection>, StoreError> {
        let url = format!("http://{endpoint}");
        let connecting = Client::connect([url], Some(self.connect_options()));
        let client = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(client) => client?,
            Err(_) => {
                return Err(StoreError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout: self.connect_timeout,
                })
            }
        };
        debug!("connected to etcd at {endpoint}");
        Ok(Box::new(EtcdConnection {
            client,
            watched: None,
        }))
    }
}

///
/// etcd flavour of the optimistic protocol.
///
/// A watch records the key's `mod_revision`; `exec` turns into a txn guarded by that revision.
/// Expiry is expressed with a fresh lease attached to the key; the lease it replaces is revoked.
///
pub struct EtcdConnection {
    client: Client,
    watched: Option<(Vec<u8>, i64)>,
}

fn absent(key: &[u8]) -> Compare {
    Compare::version(key.to_vec(), CompareOp::Equal, 0)
}

impl EtcdConnection {
    async fn run_txn(&self, txn: Txn) -> Result<etcd_client::TxnResponse, StoreError> {
        retry_etcd(self.client.clone(), (txn,), |mut etcd, (txn,)| async move {
            etcd.txn(txn).await
        })
        .await
    }

    async fn grant(&self, seconds: u64) -> Result<i64, StoreError> {
        let ttl = seconds.min(i64::MAX as u64) as i64;
        let resp = retry_etcd(self.client.clone(), (ttl,), |mut etcd, (ttl,)| async move {
            etcd.lease_grant(ttl, None).await
        })
        .await?;
        Ok(resp.id())
    }

    // Best effort, a lease that already expired fails with not found.
    async fn revoke(&self, leases: impl IntoIterator<Item = i64>) {
        for lease_id in leases.into_iter().filter(|id| *id != 0) {
            let revoked = retry_etcd(self.client.clone(), (lease_id,), |mut etcd, (id,)| async move {
                etcd.lease_revoke(id).await
            })
            .await;
            match revoked {
                Ok(_) => trace!("revoked lease {lease_id}"),
                Err(e) => debug!("failed to revoke lease {lease_id}: {e}"),
            }
        }
    }
}

// Leases held by the values a committed txn replaced, minus the ones it just attached.
fn superseded_leases(responses: &[TxnOpResponse], granted: &[i64]) -> Vec<i64> {
    responses
        .iter()
        .flat_map(|resp| match resp {
            TxnOpResponse::Put(put) => put.prev_key().map(|kv| kv.lease()).into_iter().collect(),
            TxnOpResponse::Delete(del) => del.prev_kvs().iter().map(|kv| kv.lease()).collect(),
            _ => Vec::new(),
        })
        .filter(|lease_id| *lease_id != 0 && !granted.contains(lease_id))
        .collect()
}

#[async_trait::async_trait]
impl ShardConnection for EtcdConnection {
    async fn set_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when(vec![absent(key)])
            .and_then(vec![EtcdTxnOp::put(key.to_vec(), value.to_vec(), None)]);
        Ok(self.run_txn(txn).await?.succeeded())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = retry_etcd(self.client.clone(), (key.to_vec(),), |mut etcd, (key,)| async move {
            etcd.get(key, None).await
        })
        .await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool, StoreError> {
        let lease_id = self.grant(seconds).await?;
        let txn = Txn::new()
            .when(vec![Compare::version(key.to_vec(), CompareOp::Greater, 0)])
            .and_then(vec![EtcdTxnOp::put(
                key.to_vec(),
                vec![],
                Some(
                    PutOptions::new()
                        .with_lease(lease_id)
                        .with_ignore_value()
                        .with_prev_key(),
                ),
            )]);
        let resp = match self.run_txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                self.revoke([lease_id]).await;
                return Err(e);
            }
        };
        if !resp.succeeded() {
            self.revoke([lease_id]).await;
            return Ok(false);
        }
        self.revoke(superseded_leases(&resp.op_responses(), &[lease_id]))
            .await;
        Ok(true)
    }

    async fn watch(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let resp = retry_etcd(self.client.clone(), (key.to_vec(),), |mut etcd, (key,)| async move {
            etcd.get(key, None).await
        })
        .await?;
        let revision = resp.kvs().first().map(|kv| kv.mod_revision()).unwrap_or(0);
        trace!("watching key at mod_revision {revision}");
        self.watched = Some((key.to_vec(), revision));
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        self.watched = None;
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<TxnOp>) -> Result<Option<Vec<TxnReply>>, StoreError> {
        let compares = match self.watched.take() {
            Some((key, 0)) => vec![absent(&key)],
            Some((key, revision)) => vec![Compare::mod_revision(key, CompareOp::Equal, revision)],
            None => vec![],
        };

        // Expiry rides on the preceding write of the same key as a lease.
        let mut leases = HashMap::new();
        for (i, op) in ops.iter().enumerate() {
            if let TxnOp::Expire { key, seconds } = op {
                let written_before = ops[..i]
                    .iter()
                    .any(|prev| matches!(prev, TxnOp::GetSet { key: k, .. } if k == key));
                if !written_before {
                    return Err(StoreError::Protocol(
                        "an expire inside an etcd transaction must follow a write of the same key".into(),
                    ));
                }
                leases.insert(key.clone(), self.grant(*seconds).await?);
            }
        }

        let etcd_ops = ops
            .iter()
            .filter_map(|op| match op {
                TxnOp::GetSet { key, value } => {
                    let mut options = PutOptions::new().with_prev_key();
                    if let Some(lease_id) = leases.get(key) {
                        options = options.with_lease(*lease_id);
                    }
                    Some(EtcdTxnOp::put(key.clone(), value.clone(), Some(options)))
                }
                TxnOp::Del { key } => Some(EtcdTxnOp::delete(
                    key.clone(),
                    Some(DeleteOptions::new().with_prev_key()),
                )),
                TxnOp::Expire { .. } => None,
            })
            .collect::<Vec<_>>();

        let granted: Vec<i64> = leases.values().copied().collect();
        let resp = match self.run_txn(Txn::new().when(compares).and_then(etcd_ops)).await {
            Ok(resp) => resp,
            Err(e) => {
                self.revoke(granted).await;
                return Err(e);
            }
        };
        if !resp.succeeded() {
            self.revoke(granted).await;
            return Ok(None);
        }

        let op_responses = resp.op_responses();
        self.revoke(superseded_leases(&op_responses, &granted)).await;
        let mut responses = op_responses.into_iter();
        let mut replies = Vec::with_capacity(ops.len());
        for op in &ops {
            let reply = match op {
                TxnOp::Expire { .. } => TxnReply::Integer(1),
                _ => match responses.next() {
                    Some(TxnOpResponse::Put(put)) => {
                        TxnReply::Value(put.prev_key().map(|kv| kv.value().to_vec()))
                    }
                    Some(TxnOpResponse::Delete(del)) => TxnReply::Integer(del.deleted()),
                    other => {
                        return Err(StoreError::Protocol(format!(
                            "unexpected etcd txn response {other:?}"
                        )))
                    }
                },
            };
            replies.push(reply);
        }
        Ok(Some(replies))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.client.status().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::lock::LockToken};

    fn local_etcd() -> HostAndPort {
        HostAndPort::new("127.0.0.1", 2379)
    }

    async fn lease_of(client: &mut Client, key: &[u8]) -> i64 {
        let resp = client.get(key.to_vec(), None).await.expect("get");
        resp.kvs().first().map(|kv| kv.lease()).unwrap_or(0)
    }

    #[tokio::test]
    #[ignore = "requires an etcd server on 127.0.0.1:2379"]
    async fn takeover_revokes_the_replaced_lease() {
        let mut etcd = Client::connect(["http://127.0.0.1:2379"], None)
            .await
            .expect("etcd");
        let connector = EtcdConnector::new(Duration::from_secs(2));
        let mut conn = connector.connect(&local_etcd()).await.expect("connect");
        let key = format!("shard-lock-test:{}", rand::random::<u64>()).into_bytes();

        assert!(conn.set_if_absent(&key, LockToken::generate(1).as_bytes()).await.expect("create"));
        assert!(conn.expire(&key, 60).await.expect("expire"));
        let first_lease = lease_of(&mut etcd, &key).await;
        assert_ne!(first_lease, 0);

        conn.watch(&key).await.expect("watch");
        conn.exec(vec![
            TxnOp::GetSet {
                key: key.clone(),
                value: LockToken::generate(2).as_bytes().to_vec(),
            },
            TxnOp::Expire {
                key: key.clone(),
                seconds: 60,
            },
        ])
        .await
        .expect("exec")
        .expect("committed");
        let second_lease = lease_of(&mut etcd, &key).await;
        assert_ne!(second_lease, first_lease);

        let ttl = etcd
            .lease_time_to_live(first_lease, None)
            .await
            .expect("ttl");
        assert_eq!(ttl.ttl(), -1);

        conn.exec(vec![TxnOp::Del { key }]).await.expect("exec");
        let ttl = etcd
            .lease_time_to_live(second_lease, None)
            .await
            .expect("ttl");
        assert_eq!(ttl.ttl(), -1);
    }

    #[tokio::test]
    #[ignore = "requires an etcd server on 127.0.0.1:2379"]
    async fn concurrent_write_aborts_watched_exec() {
        let connector = EtcdConnector::new(Duration::from_secs(2));
        let mut a = connector.connect(&local_etcd()).await.expect("connect");
        let mut b = connector.connect(&local_etcd()).await.expect("connect");
        let key = format!("shard-lock-test:{}", rand::random::<u64>()).into_bytes();
        let first = LockToken::generate(1);

        assert!(a.set_if_absent(&key, first.as_bytes()).await.expect("create"));
        assert!(!b.set_if_absent(&key, b"other").await.expect("create"));

        a.watch(&key).await.expect("watch");
        b.exec(vec![TxnOp::GetSet {
            key: key.clone(),
            value: b"intruder".to_vec(),
        }])
        .await
        .expect("exec")
        .expect("unwatched exec commits");

        let aborted = a
            .exec(vec![TxnOp::GetSet {
                key: key.clone(),
                value: LockToken::generate(2).as_bytes().to_vec(),
            }])
            .await
            .expect("exec");
        assert_eq!(aborted, None);

        let deleted = a.exec(vec![TxnOp::Del { key }]).await.expect("exec");
        assert_eq!(deleted, Some(vec![TxnReply::Integer(1)]));
    }
}
