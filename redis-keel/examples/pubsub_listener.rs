//! Pub/sub with automatic resubscription.
//!
//! Subscribes to a channel and prints everything published to it. Kill the
//! Redis connection (e.g. `CLIENT KILL`) and watch the subscription come
//! back on its own.

use redis_keel::{ConnectionConfig, ConnectionEvent, RedisClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redis_keel=info".into()),
        )
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let config = ConnectionConfig::new(url)?;
    let client = RedisClient::new(config);

    let mut pubsub = client.connect_pubsub().await?;
    let mut events = pubsub.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ConnectionEvent::SubscriptionsRestored { channels, patterns } = event {
                println!("restored {channels} channel(s), {patterns} pattern(s)");
            }
        }
    });

    pubsub.subscribe(vec!["example:events".to_string()]).await?;
    println!("listening on example:events");

    while let Some(message) = pubsub.next_message().await {
        println!(
            "[{}] {}",
            message.channel,
            String::from_utf8_lossy(&message.payload)
        );
    }
    Ok(())
}
