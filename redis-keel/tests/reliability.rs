//! End-to-end delivery-guarantee scenarios against an in-process server.

mod support;

use bytes::Bytes;
use redis_keel::command::{CommandArgs, CommandKind, IntegerOutput};
use redis_keel::{
    CancelReason, ClientOptions, ConnectionConfig, Connection, KeyValueCodec, ReconnectPolicy,
    RedisClient, RedisError, RedisResult,
};
use std::time::Duration;
use support::TestServer;

fn fast_options() -> ClientOptions {
    ClientOptions::default()
        .reconnect_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        })
        .default_timeout(Duration::from_secs(2))
}

async fn client_for(server: &TestServer) -> RedisClient {
    let config = ConnectionConfig::new(server.url()).unwrap();
    RedisClient::new(config).with_options(fast_options())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}

async fn wait_for_empty_queues(connection: &Connection) {
    wait_until(|| {
        let snapshot = connection.queue_snapshot();
        snapshot.buffered == 0 && snapshot.in_flight == 0
    })
    .await;
}

#[tokio::test]
async fn basic_round_trip() {
    let server = TestServer::start().await;
    let connection = client_for(&server).await.connect().await.unwrap();

    connection.set("key", "1").await.unwrap();
    assert_eq!(connection.get("key").await.unwrap().as_deref(), Some("1"));
    assert_eq!(connection.get("missing").await.unwrap(), None);

    wait_for_empty_queues(&connection).await;
    connection.close();
}

struct RefusingCodec;

impl KeyValueCodec for RefusingCodec {
    type Key = String;
    type Value = String;

    fn encode_key(&self, _key: &String) -> RedisResult<Bytes> {
        Err(RedisError::Encode("I want to break free".to_string()))
    }

    fn encode_value(&self, _value: &String) -> RedisResult<Bytes> {
        Err(RedisError::Encode("I want to break free".to_string()))
    }

    fn decode_key(&self, _data: Bytes) -> RedisResult<String> {
        unreachable!("never decodes")
    }

    fn decode_value(&self, _data: Bytes) -> RedisResult<String> {
        unreachable!("never decodes")
    }
}

#[tokio::test]
async fn encode_failure_does_not_desync() {
    let server = TestServer::start().await;
    let client = client_for(&server).await;
    let connection = client.connect().await.unwrap();
    let verification = client.connect().await.unwrap();

    connection.set("key", "1").await.unwrap();

    let args = CommandArgs::new().key(&RefusingCodec, &"key".to_string());
    let failed = connection.write_command(
        CommandKind::Incr,
        args,
        Box::new(IntegerOutput::default()),
    );

    assert!(failed.is_done());
    assert!(matches!(failed.error(), Some(RedisError::Encode(_))));

    // the stream is undisturbed and the key unchanged
    assert_eq!(
        verification.get("key").await.unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(connection.get("key").await.unwrap().as_deref(), Some("1"));
    wait_for_empty_queues(&connection).await;
}

#[tokio::test]
async fn at_least_once_across_disconnect() {
    let server = TestServer::start().await;
    let client = client_for(&server).await;
    let connection = client.connect().await.unwrap();
    let verification = client.connect().await.unwrap();

    connection.set("key", "1").await.unwrap();

    connection.watchdog().set_listen_on_channel_inactive(false);
    connection.quit().await.unwrap();
    wait_until(|| !connection.is_open()).await;

    // submitted while disconnected: buffered, future unresolved
    let args = CommandArgs::new().arg("key");
    let incr =
        connection.write_command(CommandKind::Incr, Ok(args), Box::new(IntegerOutput::default()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!incr.is_done());
    assert_eq!(connection.queue_snapshot().buffered, 1);
    assert_eq!(
        verification.get("key").await.unwrap().as_deref(),
        Some("1")
    );

    connection.watchdog().set_listen_on_channel_inactive(true);
    connection.watchdog().schedule_reconnect();

    let reply = incr.await_reply_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.as_integer().unwrap(), 2);
    assert_eq!(
        verification.get("key").await.unwrap().as_deref(),
        Some("2")
    );
    wait_for_empty_queues(&connection).await;
}

#[tokio::test]
async fn at_most_once_cancels_across_disconnect() {
    let server = TestServer::start().await;
    let config = ConnectionConfig::new(server.url()).unwrap();
    let client =
        RedisClient::new(config).with_options(fast_options().auto_reconnect(false));
    let connection = client.connect().await.unwrap();

    connection.set("key", "1").await.unwrap();

    // the server swallows the INCR and hangs up: the command reached the
    // wire, so at-most-once must cancel it rather than retry
    server.hang_up_on("INCR");
    let err = connection.incr("key").await.unwrap_err();
    assert!(matches!(
        err,
        RedisError::Cancelled(CancelReason::Disconnected)
    ));

    let verification = client_for(&server).await.connect().await.unwrap();
    assert_eq!(
        verification.get("key").await.unwrap().as_deref(),
        Some("1")
    );

    let snapshot = connection.queue_snapshot();
    assert_eq!(snapshot.buffered, 0);
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test]
async fn pubsub_resubscribe_after_disconnect() {
    let server = TestServer::start().await;
    let client = client_for(&server).await;
    let mut pubsub = client.connect_pubsub().await.unwrap();
    let mut events = pubsub.events();

    pubsub.subscribe(vec!["channel0".to_string()]).await.unwrap();
    assert_eq!(pubsub.subscribed_channels(), vec!["channel0".to_string()]);

    // only the events caused by the disconnect matter below
    while events.try_recv().is_ok() {}
    server.drop_connections();

    // the restoration re-emits the subscription with its count
    let mut resubscribe_count = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no restoration observed")
            .unwrap();
        match event {
            redis_keel::ConnectionEvent::SubscriptionsRestored { channels, patterns } => {
                assert_eq!(channels, 1);
                assert_eq!(patterns, 0);
                break;
            }
            redis_keel::ConnectionEvent::Subscribed { ref channel, count }
                if channel == "channel0" =>
            {
                resubscribe_count = Some(count);
            }
            _ => {}
        }
    }
    assert_eq!(resubscribe_count, Some(1));
    wait_until(|| pubsub.is_open()).await;
    assert_eq!(pubsub.subscribed_channels(), vec!["channel0".to_string()]);

    let publisher = client.connect().await.unwrap();
    let receivers = publisher.publish("channel0", "msg").await.unwrap();
    assert_eq!(receivers, 1);

    let message = tokio::time::timeout(Duration::from_secs(2), pubsub.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.channel, "channel0");
    assert_eq!(message.payload, Bytes::from_static(b"msg"));
}

#[tokio::test]
async fn queue_overflow_fails_fast() {
    let server = TestServer::start().await;
    let config = ConnectionConfig::new(server.url()).unwrap();
    let client =
        RedisClient::new(config).with_options(fast_options().request_queue_size(3));
    let connection = client.connect().await.unwrap();

    connection.watchdog().set_listen_on_channel_inactive(false);
    connection.quit().await.unwrap();
    wait_until(|| !connection.is_open()).await;

    let seen_before = server.commands_seen();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            connection.write_command(
                CommandKind::Incr,
                Ok(CommandArgs::new().arg("key")),
                Box::new(IntegerOutput::default()),
            )
        })
        .collect();

    for handle in &handles[..3] {
        assert!(!handle.is_done());
    }
    assert!(matches!(
        handles[3].error(),
        Some(RedisError::QueueOverflow(3))
    ));
    assert_eq!(connection.queue_snapshot().buffered, 3);

    // nothing went out on the wire
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.commands_seen(), seen_before);
}

#[tokio::test]
async fn restoration_runs_auth_select_and_ping() {
    let server = TestServer::start_with_password(Some("sekrit")).await;
    let config =
        ConnectionConfig::new(format!("{}/2", server.url_with_password("sekrit"))).unwrap();
    let client = RedisClient::new(config)
        .with_options(fast_options().ping_before_activate_connection(true));

    let connection = client.connect().await.unwrap();
    connection.set("key", "1").await.unwrap();
    assert_eq!(connection.get("key").await.unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn rejected_auth_is_fatal() {
    let server = TestServer::start_with_password(Some("sekrit")).await;
    let config = ConnectionConfig::new(server.url_with_password("wrong")).unwrap();
    let client = RedisClient::new(config).with_options(fast_options());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, RedisError::Auth(_)));
}

#[tokio::test]
async fn timed_out_await_leaves_command_running() {
    let server = TestServer::start().await;
    let connection = client_for(&server).await.connect().await.unwrap();

    connection.set("key", "1").await.unwrap();
    connection.watchdog().set_listen_on_channel_inactive(false);
    server.hang_up_on("GET"); // swallowed, never answered

    let handle = connection.write_command(
        CommandKind::Get,
        Ok(CommandArgs::new().arg("key")),
        Box::new(redis_keel::command::ValueOutput::default()),
    );
    let err = handle
        .await_reply_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RedisError::Timeout));
    assert!(!handle.is_done());

    // the retry engine picks the command back up once the channel returns
    connection.watchdog().set_listen_on_channel_inactive(true);
    connection.watchdog().schedule_reconnect();
    let reply = handle.await_reply_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.into_string().unwrap(), "1");
}
