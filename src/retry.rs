use {
    crate::store::StoreError,
    retry::delay::Exponential,
    std::{error::Error, future::Future, time::Duration},
    tracing::{error, warn},
};

pub fn is_transient_etcd(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => {
            // Go through the numeric code so the table does not depend on etcd-client's tonic version.
            match tonic::Code::from(i32::from(status.code())) {
                tonic::Code::Ok => false,
                tonic::Code::Cancelled => false,
                tonic::Code::Unknown => status.source().is_none(),
                tonic::Code::InvalidArgument => false,
                tonic::Code::DeadlineExceeded => true,
                tonic::Code::NotFound => false,
                tonic::Code::AlreadyExists => false,
                tonic::Code::PermissionDenied => false,
                tonic::Code::ResourceExhausted => true,
                tonic::Code::FailedPrecondition => false,
                tonic::Code::Aborted => false,
                tonic::Code::OutOfRange => false,
                tonic::Code::Unimplemented => false,
                tonic::Code::Internal => true,
                tonic::Code::Unavailable => true,
                tonic::Code::DataLoss => true,
                tonic::Code::Unauthenticated => false,
            }
        }
        etcd_client::Error::TransportError(_) => true,
        etcd_client::Error::IoError(_) => true,
        _ => false,
    }
}

pub fn is_transient_redis(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}

///
/// Whether `err` was caused by "outside" forces (network partition, failover in progress, ...)
/// and the same operation may succeed if tried again later.
///
pub fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Etcd(e) => is_transient_etcd(e),
        StoreError::Redis(e) => is_transient_redis(e),
        StoreError::Unreachable(_) => true,
        StoreError::ConnectTimeout { .. } => true,
        StoreError::PoolExhausted(_) => true,
        StoreError::PoolClosed(_) => false,
        StoreError::Protocol(_) => false,
    }
}

///
/// Retry a store operation on transient errors only, with the default exponential strategy.
///
/// Examples
///
/// ```no_run
/// use rust_shard_lock::{retry::retry_store, store::{memory::MemoryStore, ShardConnection}, topology::HostAndPort};
///
/// # async fn run() {
/// let store = MemoryStore::new(HostAndPort::new("127.0.0.1", 6379));
/// let value = retry_store(|| {
///     let store = store.clone();
///     async move {
///         let mut conn = store.connect()?;
///         conn.get(b"my_key").await
///     }
/// })
/// .await;
/// # }
/// ```
///
pub async fn retry_store<T, F, Fut>(f: F) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
    F: FnMut() -> Fut,
{
    let retry_strategy = Exponential::from_millis_with_factor(10, 10.0).take(3);
    retry_store_with_strategy(retry_strategy, f).await
}

pub async fn retry_store_with_strategy<T, F, Fut>(
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
    F: FnMut() -> Fut,
{
    let mut retry_strategy = retry_strategy.into_iter();
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if is_transient(&e) {
                    warn!("failed due to transient state {:?}", e);
                    match retry_strategy.next() {
                        Some(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                } else {
                    error!("failed due to non-transient state: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}

///
/// Retry an etcd operation by capturing reusable args and a closure that computes the future to try.
///
/// Only transient etcd errors are retried; e.g. gRPC status "Not found" is returned immediately.
///
pub(crate) async fn retry_etcd<A, T, F, Fut>(
    etcd: etcd_client::Client,
    reusable_args: A,
    mut f: F,
) -> Result<T, StoreError>
where
    A: Clone,
    Fut: Future<Output = Result<T, etcd_client::Error>>,
    F: FnMut(etcd_client::Client, A) -> Fut,
{
    retry_store(|| {
        let fut = f(etcd.clone(), reusable_args.clone());
        async move { fut.await.map_err(StoreError::from) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::topology::HostAndPort,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test]
    async fn it_should_retry_transient_errors_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = retry_store_with_strategy(vec![Duration::from_millis(1); 5], || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unreachable(HostAndPort::new("a", 1)))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.expect("eventually ok"), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn it_should_not_retry_non_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = retry_store_with_strategy(vec![Duration::from_millis(1); 5], || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Protocol("bad".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Protocol(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn it_should_give_up_when_strategy_is_exhausted() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = retry_store_with_strategy(vec![Duration::from_millis(1); 2], || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unreachable(HostAndPort::new("a", 1))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
