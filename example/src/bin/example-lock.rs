use core::time::Duration;

use rust_shard_lock::{
    client::LockClient,
    config::{ClientConfig, LockOptions, TopologyConfig},
    topology::HostAndPort,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Pass a JSON config path to use sentinel discovery, otherwise a single local redis is used.
    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_json_file(path).expect("failed to load config"),
        None => ClientConfig::new(
            vec!["locks".to_string()],
            TopologyConfig::Static {
                masters: vec![HostAndPort::new("127.0.0.1", 6379)],
            },
        ),
    };
    let client = LockClient::connect_redis(config)
        .await
        .expect("failed to connect to redis");

    let lock_name = "example-lock";
    let lock = client
        .get_lock_with(lock_name, LockOptions::new(10, 100))
        .expect("invalid lock name");

    let handle = lock.lock().await;
    println!("Lock acquired in main task!");

    let cancel = CancellationToken::new();
    let lock2 = client.get_lock(lock_name).expect("invalid lock name");
    let cancel2 = cancel.clone();
    let h = tokio::spawn(async move {
        let handle = lock2
            .lock_cancellable(&cancel2)
            .await
            .expect("task 2 was cancelled");
        println!("Lock acquired in task 2!");
        lock2.unlock(handle).await.expect("failed to unlock");
    });

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Releasing lock!");
    lock.unlock(handle).await.expect("failed to unlock");

    println!("Waiting for task 2 to acquire lock...");
    h.await.expect("task 2 failed to acquire lock");

    client.shutdown().await;
    println!("Finished!");
}
