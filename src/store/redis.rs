use {
    super::{Connector, DiscoveryClient, ShardConnection, StoreError, TxnOp, TxnReply},
    crate::{config::ClientConfig, topology::HostAndPort},
    ::redis::{
        aio::MultiplexedConnection, cmd, from_redis_value, pipe, Client, ConnectionAddr,
        ConnectionInfo, RedisConnectionInfo, Value,
    },
    futures::{stream::BoxStream, StreamExt},
    std::{future::Future, time::Duration},
    tracing::{debug, info},
};

fn open_client(
    endpoint: &HostAndPort,
    database: i64,
    username: Option<String>,
    password: Option<String>,
) -> Result<Client, StoreError> {
    let info = ConnectionInfo {
        addr: ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port),
        redis: RedisConnectionInfo {
            db: database,
            username,
            password,
            ..Default::default()
        },
    };
    Ok(Client::open(info)?)
}

async fn with_connect_timeout<T, Fut>(
    endpoint: &HostAndPort,
    timeout: Duration,
    fut: Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, ::redis::RedisError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::ConnectTimeout {
            endpoint: endpoint.clone(),
            timeout,
        }),
    }
}

///
/// Opens authenticated connections to Redis masters.
///
#[derive(Clone, Debug)]
pub struct RedisConnector {
    database: i64,
    username: Option<String>,
    password: Option<String>,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            database: 0,
            username: None,
            password: None,
            connect_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.connect_timeout())
            .with_database(config.database)
            .with_credentials(config.username.clone(), config.password.clone())
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

#[async_trait::async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, endpoint: &HostAndPort) -> Result<Box<dyn ShardConnection>, StoreError> {
        let client = open_client(
            endpoint,
            self.database,
            self.username.clone(),
            self.password.clone(),
        )?;
        let conn = with_connect_timeout(
            endpoint,
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await?;
        debug!("connected to redis master at {endpoint}");
        Ok(Box::new(RedisConnection { conn }))
    }
}

///
/// A dedicated connection to one Redis master.
///
/// Each pooled connection owns its socket, so `WATCH` state never leaks between callers.
///
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait::async_trait]
impl ShardConnection for RedisConnection {
    async fn set_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let created: bool = cmd("SETNX")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn)
            .await?;
        Ok(created)
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value: Option<Vec<u8>> = cmd("GET").arg(key).query_async(&mut self.conn).await?;
        Ok(value)
    }

    async fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool, StoreError> {
        let applied: bool = cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(applied)
    }

    async fn watch(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let _: () = cmd("WATCH").arg(key).query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        let _: () = cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<TxnOp>) -> Result<Option<Vec<TxnReply>>, StoreError> {
        let mut txn = pipe();
        txn.atomic();
        for op in &ops {
            match op {
                TxnOp::GetSet { key, value } => {
                    txn.cmd("GETSET").arg(key.as_slice()).arg(value.as_slice());
                }
                TxnOp::Del { key } => {
                    txn.cmd("DEL").arg(key.as_slice());
                }
                TxnOp::Expire { key, seconds } => {
                    txn.cmd("EXPIRE").arg(key.as_slice()).arg(*seconds);
                }
            }
        }
        // A nil EXEC reply means the watched key was touched and nothing ran.
        let replies: Option<Vec<Value>> = txn.query_async(&mut self.conn).await?;
        let Some(replies) = replies else {
            return Ok(None);
        };
        if replies.len() != ops.len() {
            return Err(StoreError::Protocol(format!(
                "expected {} transaction replies, got {}",
                ops.len(),
                replies.len()
            )));
        }
        let decoded = ops
            .iter()
            .zip(replies.iter())
            .map(|(op, reply)| match op {
                TxnOp::GetSet { .. } => Ok(TxnReply::Value(from_redis_value(reply)?)),
                TxnOp::Del { .. } | TxnOp::Expire { .. } => {
                    Ok(TxnReply::Integer(from_redis_value(reply)?))
                }
            })
            .collect::<Result<Vec<_>, ::redis::RedisError>>()?;
        Ok(Some(decoded))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        let pong: String = cmd("PING").query_async(&mut self.conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply `{pong}`")));
        }
        Ok(())
    }
}

///
/// Redis Sentinel peers used as discovery service.
///
#[derive(Clone, Debug)]
pub struct SentinelDiscovery {
    connect_timeout: Duration,
}

impl SentinelDiscovery {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for SentinelDiscovery {
    async fn master_addr(
        &self,
        peer: &HostAndPort,
        name: &str,
    ) -> Result<Option<HostAndPort>, StoreError> {
        let client = open_client(peer, 0, None, None)?;
        let mut conn = with_connect_timeout(
            peer,
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await?;
        let addr: Option<Vec<String>> = cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(name)
            .query_async(&mut conn)
            .await?;
        match addr.as_deref() {
            Some([host, port, ..]) => HostAndPort::from_parts(host, port)
                .map(Some)
                .map_err(|e| StoreError::Protocol(e.to_string())),
            _ => Ok(None),
        }
    }

    async fn subscribe(
        &self,
        peer: &HostAndPort,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError> {
        let client = open_client(peer, 0, None, None)?;
        let mut pubsub =
            with_connect_timeout(peer, self.connect_timeout, client.get_async_pubsub()).await?;
        pubsub.subscribe(channel).await?;
        info!("subscribed to {channel} on sentinel {peer}");
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(StoreError::from));
        Ok(stream.boxed())
    }
}
