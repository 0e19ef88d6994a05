//! Basic usage: connect, run a few commands, watch the queues drain.
//!
//! Run with a local Redis: `cargo run --example basic_usage`

use redis_keel::{ConnectionConfig, RedisClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redis_keel=debug".into()),
        )
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let config = ConnectionConfig::new(url)?;
    let connection = RedisClient::new(config).connect().await?;

    connection.set("example:key", "hello").await?;
    let value = connection.get("example:key").await?;
    println!("GET example:key -> {value:?}");

    let count = connection.incr("example:counter").await?;
    println!("INCR example:counter -> {count}");

    let snapshot = connection.queue_snapshot();
    println!(
        "queues after completion: buffered={} in_flight={}",
        snapshot.buffered, snapshot.in_flight
    );

    connection.del(vec!["example:key".into(), "example:counter".into()]).await?;
    connection.close();
    Ok(())
}
