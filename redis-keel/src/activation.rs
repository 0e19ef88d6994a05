//! Session restoration between `Connected` and `Active`
//!
//! Every new channel walks the same ordered handshake before the endpoint
//! releases it for user traffic: PING (when configured), AUTH, SELECT, then
//! the pub/sub subscription replay. Each step must succeed before the next
//! one runs; user commands wait in the endpoint buffer throughout, so
//! nothing can interleave with the handshake.

use crate::endpoint::{Endpoint, EndpointMode};
use crate::events::ConnectionEvent;
use crate::protocol::{self, ReplyReader};
use crate::pubsub::{AckKind, PushFrame};
use bytes::{Bytes, BytesMut};
use redis_keel_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Run the restoration sequence on a fresh channel.
///
/// An `Err(RedisError::Auth(_))` is fatal for the endpoint; any other error
/// fails only this activation attempt and leaves the reconnect machinery in
/// charge.
pub(crate) async fn activate<R, W>(
    endpoint: &Arc<Endpoint>,
    read: &mut R,
    write: &mut W,
    reader: &mut ReplyReader,
) -> RedisResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if endpoint.options().ping_before_activate_connection {
        let reply = roundtrip(endpoint, read, write, reader, &[Bytes::from_static(b"PING")]).await?;
        match reply {
            RespValue::Simple(ref pong) if pong == "PONG" => {}
            other => {
                return Err(RedisError::Protocol(format!(
                    "unexpected PING reply during activation: {other:?}"
                )))
            }
        }
        debug!("activation ping succeeded");
    }

    if let Some(password) = endpoint.url().password.clone() {
        let request = [
            Bytes::from_static(b"AUTH"),
            Bytes::from(password.into_bytes()),
        ];
        let reply = roundtrip(endpoint, read, write, reader, &request).await?;
        match reply {
            RespValue::Simple(ref ok) if ok == "OK" => debug!("authenticated"),
            RespValue::Error(message) => return Err(RedisError::Auth(message)),
            other => {
                return Err(RedisError::Auth(format!(
                    "unexpected AUTH reply: {other:?}"
                )))
            }
        }
    }

    let database = endpoint.url().database;
    if database != 0 {
        let request = [
            Bytes::from_static(b"SELECT"),
            Bytes::from(database.to_string().into_bytes()),
        ];
        let reply = roundtrip(endpoint, read, write, reader, &request).await?;
        match reply {
            RespValue::Simple(ref ok) if ok == "OK" => debug!("selected database {database}"),
            RespValue::Error(message) => return Err(RedisError::Server(message)),
            other => {
                return Err(RedisError::Protocol(format!(
                    "unexpected SELECT reply: {other:?}"
                )))
            }
        }
    }

    if endpoint.mode() == EndpointMode::PubSub {
        restore_subscriptions(endpoint, read, write, reader).await?;
    }

    Ok(())
}

/// Replay the subscription set and re-emit the confirmation events so
/// listeners observe the restoration.
async fn restore_subscriptions<R, W>(
    endpoint: &Arc<Endpoint>,
    read: &mut R,
    write: &mut W,
    reader: &mut ReplyReader,
) -> RedisResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (channels, patterns) = {
        let subscriptions = endpoint.subscriptions();
        (subscriptions.channels(), subscriptions.patterns())
    };
    if channels.is_empty() && patterns.is_empty() {
        return Ok(());
    }

    replay(endpoint, read, write, reader, b"SUBSCRIBE", &channels).await?;
    replay(endpoint, read, write, reader, b"PSUBSCRIBE", &patterns).await?;

    info!(
        "restored {} channel(s) and {} pattern(s)",
        channels.len(),
        patterns.len()
    );
    endpoint.emit(ConnectionEvent::SubscriptionsRestored {
        channels: channels.len(),
        patterns: patterns.len(),
    });
    Ok(())
}

async fn replay<R, W>(
    endpoint: &Arc<Endpoint>,
    read: &mut R,
    write: &mut W,
    reader: &mut ReplyReader,
    verb: &'static [u8],
    names: &[Bytes],
) -> RedisResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if names.is_empty() {
        return Ok(());
    }

    let mut request = Vec::with_capacity(1 + names.len());
    request.push(Bytes::from_static(verb));
    request.extend_from_slice(names);
    send(write, &request).await?;

    // one acknowledgement per name; published messages may interleave
    for _ in 0..names.len() {
        let frame = next_reply(endpoint, read, reader).await?;
        let push = PushFrame::parse(&frame);
        match &push {
            Some(ack @ PushFrame::Ack { kind, name, count }) => {
                endpoint.emit(subscription_event(*kind, name, *count));
                if let Some(dispatcher) = endpoint.dispatcher() {
                    dispatcher.dispatch(ack);
                }
            }
            _ => {
                return Err(RedisError::Protocol(format!(
                    "unexpected reply during subscription replay: {frame:?}"
                )))
            }
        }
    }
    Ok(())
}

pub(crate) fn subscription_event(kind: AckKind, name: &Bytes, count: i64) -> ConnectionEvent {
    let name = String::from_utf8_lossy(name).into_owned();
    match kind {
        AckKind::Subscribe => ConnectionEvent::Subscribed {
            channel: name,
            count,
        },
        AckKind::Unsubscribe => ConnectionEvent::Unsubscribed {
            channel: name,
            count,
        },
        AckKind::PSubscribe => ConnectionEvent::PatternSubscribed {
            pattern: name,
            count,
        },
        AckKind::PUnsubscribe => ConnectionEvent::PatternUnsubscribed {
            pattern: name,
            count,
        },
    }
}

async fn roundtrip<R, W>(
    endpoint: &Arc<Endpoint>,
    read: &mut R,
    write: &mut W,
    reader: &mut ReplyReader,
    request: &[Bytes],
) -> RedisResult<RespValue>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(write, request).await?;
    next_reply(endpoint, read, reader).await
}

async fn send<W: AsyncWrite + Unpin>(write: &mut W, request: &[Bytes]) -> RedisResult<()> {
    let mut out = BytesMut::new();
    protocol::encode_request(request, &mut out);
    write.write_all(&out).await?;
    write.flush().await?;
    Ok(())
}

/// Read the next frame that is not an out-of-band published message.
async fn next_reply<R: AsyncRead + Unpin>(
    endpoint: &Arc<Endpoint>,
    read: &mut R,
    reader: &mut ReplyReader,
) -> RedisResult<RespValue> {
    loop {
        while let Some(frame) = reader.next_frame()? {
            if endpoint.mode() == EndpointMode::PubSub {
                if let Some(push @ (PushFrame::Message { .. } | PushFrame::PMessage { .. })) =
                    PushFrame::parse(&frame)
                {
                    if let Some(dispatcher) = endpoint.dispatcher() {
                        dispatcher.dispatch(&push);
                    }
                    continue;
                }
            }
            return Ok(frame);
        }

        let n = read.read_buf(reader.buffer_mut()).await?;
        if n == 0 {
            return Err(RedisError::Connection(
                "connection closed during activation".to_string(),
            ));
        }
    }
}
