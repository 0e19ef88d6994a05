//! Pub/sub support: push-frame parsing, the subscription set and the
//! listener-facing message stream
//!
//! Pub/sub endpoints receive two flavors of array frames: out-of-band
//! `message`/`pmessage` pushes, and `subscribe`-family confirmations that
//! double as command replies. The handler parses both here and routes them;
//! the subscription set survives disconnects and is replayed during
//! activation.

use crate::command::CommandOutput;
use bytes::Bytes;
use futures_util::Stream;
use redis_keel_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A message published to a channel this endpoint listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The channel the message arrived on
    pub channel: String,
    /// The message payload
    pub payload: Bytes,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
}

/// Everything a pub/sub listener can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    /// A channel subscription was confirmed
    Subscribed {
        /// Channel name
        channel: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A channel subscription was removed
    Unsubscribed {
        /// Channel name
        channel: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A pattern subscription was confirmed
    PatternSubscribed {
        /// Pattern
        pattern: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A pattern subscription was removed
    PatternUnsubscribed {
        /// Pattern
        pattern: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A published message
    Message(PubSubMessage),
}

/// Kinds of subscription acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

/// A parsed pub/sub push frame.
#[derive(Debug)]
pub(crate) enum PushFrame {
    Message {
        channel: Bytes,
        payload: Bytes,
    },
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    Ack {
        kind: AckKind,
        name: Bytes,
        count: i64,
    },
}

impl PushFrame {
    /// Try to interpret an array frame as a pub/sub push. Returns `None`
    /// for anything that is a plain command reply.
    pub(crate) fn parse(frame: &RespValue) -> Option<PushFrame> {
        let items = match frame {
            RespValue::Array(items) if items.len() >= 3 => items,
            _ => return None,
        };

        let label = match &items[0] {
            RespValue::Bulk(b) => b.as_ref(),
            _ => return None,
        };

        match label {
            b"message" => Some(PushFrame::Message {
                channel: bulk_bytes(&items[1])?,
                payload: bulk_bytes(&items[2])?,
            }),
            b"pmessage" if items.len() >= 4 => Some(PushFrame::PMessage {
                pattern: bulk_bytes(&items[1])?,
                channel: bulk_bytes(&items[2])?,
                payload: bulk_bytes(&items[3])?,
            }),
            b"subscribe" => Some(ack(AckKind::Subscribe, items)?),
            b"unsubscribe" => Some(ack(AckKind::Unsubscribe, items)?),
            b"psubscribe" => Some(ack(AckKind::PSubscribe, items)?),
            b"punsubscribe" => Some(ack(AckKind::PUnsubscribe, items)?),
            _ => None,
        }
    }
}

fn bulk_bytes(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::Bulk(b) => Some(b.clone()),
        _ => None,
    }
}

fn ack(kind: AckKind, items: &[RespValue]) -> Option<PushFrame> {
    let count = match &items[2] {
        RespValue::Integer(n) => *n,
        _ => return None,
    };
    Some(PushFrame::Ack {
        kind,
        name: bulk_bytes(&items[1])?,
        count,
    })
}

fn text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// The channels and patterns this endpoint has asked to listen on.
///
/// Mutated only on the connection's I/O task, replayed by the session
/// restorer after every reconnect.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

impl SubscriptionSet {
    /// Record a confirmed subscription change.
    pub(crate) fn apply(&mut self, kind: AckKind, name: &Bytes) {
        match kind {
            AckKind::Subscribe => {
                self.channels.insert(name.clone());
            }
            AckKind::Unsubscribe => {
                self.channels.remove(name);
            }
            AckKind::PSubscribe => {
                self.patterns.insert(name.clone());
            }
            AckKind::PUnsubscribe => {
                self.patterns.remove(name);
            }
        }
    }

    /// Channels currently subscribed, in replay order.
    pub fn channels(&self) -> Vec<Bytes> {
        let mut channels: Vec<_> = self.channels.iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Patterns currently subscribed, in replay order.
    pub fn patterns(&self) -> Vec<Bytes> {
        let mut patterns: Vec<_> = self.patterns.iter().cloned().collect();
        patterns.sort();
        patterns
    }

    /// `true` when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

/// Hands push frames to whoever holds the [`MessageStream`].
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionDispatcher {
    tx: mpsc::UnboundedSender<PubSubEvent>,
}

impl SubscriptionDispatcher {
    pub(crate) fn pair() -> (Self, MessageStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MessageStream { rx })
    }

    /// Deliver a parsed push frame to the listener.
    pub(crate) fn dispatch(&self, push: &PushFrame) {
        let event = match push {
            PushFrame::Message { channel, payload } => PubSubEvent::Message(PubSubMessage {
                channel: text(channel),
                payload: payload.clone(),
                pattern: None,
            }),
            PushFrame::PMessage {
                pattern,
                channel,
                payload,
            } => PubSubEvent::Message(PubSubMessage {
                channel: text(channel),
                payload: payload.clone(),
                pattern: Some(text(pattern)),
            }),
            PushFrame::Ack { kind, name, count } => match kind {
                AckKind::Subscribe => PubSubEvent::Subscribed {
                    channel: text(name),
                    count: *count,
                },
                AckKind::Unsubscribe => PubSubEvent::Unsubscribed {
                    channel: text(name),
                    count: *count,
                },
                AckKind::PSubscribe => PubSubEvent::PatternSubscribed {
                    pattern: text(name),
                    count: *count,
                },
                AckKind::PUnsubscribe => PubSubEvent::PatternUnsubscribed {
                    pattern: text(name),
                    count: *count,
                },
            },
        };
        // the listener side may be gone; pushes are then dropped
        let _ = self.tx.send(event);
    }
}

/// Stream of pub/sub events in server publication order.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<PubSubEvent>,
}

impl MessageStream {
    /// Receive the next event, waiting for it.
    pub async fn recv(&mut self) -> Option<PubSubEvent> {
        self.rx.recv().await
    }

    /// Receive the next published message, skipping subscription events.
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        while let Some(event) = self.rx.recv().await {
            if let PubSubEvent::Message(message) = event {
                return Some(message);
            }
        }
        None
    }
}

impl Stream for MessageStream {
    type Item = PubSubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Output decoder for `SUBSCRIBE`-family commands: the server sends one
/// acknowledgement frame per requested channel or pattern.
#[derive(Debug)]
pub struct SubscriptionOutput {
    expected: usize,
    acks: Vec<RespValue>,
}

impl SubscriptionOutput {
    /// Expect `expected` acknowledgement frames.
    pub fn new(expected: usize) -> Self {
        Self {
            expected: expected.max(1),
            acks: Vec::new(),
        }
    }
}

impl CommandOutput for SubscriptionOutput {
    fn set(&mut self, frame: RespValue) -> RedisResult<()> {
        let is_ack = matches!(&frame, RespValue::Array(items) if items.len() >= 3);
        if !is_ack {
            return Err(RedisError::Decode(format!(
                "expected a subscription acknowledgement, got {frame:?}"
            )));
        }
        self.acks.push(frame);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.acks.len() >= self.expected
    }

    fn reset(&mut self) {
        self.acks.clear();
    }

    fn take(&mut self) -> RespValue {
        RespValue::Array(std::mem::take(&mut self.acks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_frame() -> RespValue {
        RespValue::Array(vec![
            RespValue::bulk("message"),
            RespValue::bulk("news"),
            RespValue::bulk("hello"),
        ])
    }

    #[test]
    fn test_parse_message_push() {
        match PushFrame::parse(&message_frame()) {
            Some(PushFrame::Message { channel, payload }) => {
                assert_eq!(&channel[..], b"news");
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_pmessage_push() {
        let frame = RespValue::Array(vec![
            RespValue::bulk("pmessage"),
            RespValue::bulk("news.*"),
            RespValue::bulk("news.tech"),
            RespValue::bulk("hello"),
        ]);
        match PushFrame::parse(&frame) {
            Some(PushFrame::PMessage { pattern, .. }) => assert_eq!(&pattern[..], b"news.*"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let frame = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("news"),
            RespValue::Integer(1),
        ]);
        match PushFrame::parse(&frame) {
            Some(PushFrame::Ack { kind, count, .. }) => {
                assert_eq!(kind, AckKind::Subscribe);
                assert_eq!(count, 1);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_plain_replies_are_not_pushes() {
        assert!(PushFrame::parse(&RespValue::Simple("OK".to_string())).is_none());
        assert!(PushFrame::parse(&RespValue::Array(vec![
            RespValue::bulk("get"),
            RespValue::bulk("a"),
            RespValue::bulk("b"),
        ]))
        .is_none());
    }

    #[test]
    fn test_subscription_set_apply() {
        let mut set = SubscriptionSet::default();
        set.apply(AckKind::Subscribe, &Bytes::from_static(b"a"));
        set.apply(AckKind::Subscribe, &Bytes::from_static(b"b"));
        set.apply(AckKind::PSubscribe, &Bytes::from_static(b"n.*"));
        set.apply(AckKind::Unsubscribe, &Bytes::from_static(b"a"));

        assert_eq!(set.channels(), vec![Bytes::from_static(b"b")]);
        assert_eq!(set.patterns(), vec![Bytes::from_static(b"n.*")]);
        assert!(!set.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order() {
        let (dispatcher, mut stream) = SubscriptionDispatcher::pair();
        dispatcher.dispatch(&PushFrame::Message {
            channel: Bytes::from_static(b"c"),
            payload: Bytes::from_static(b"first"),
        });
        dispatcher.dispatch(&PushFrame::Message {
            channel: Bytes::from_static(b"c"),
            payload: Bytes::from_static(b"second"),
        });

        assert_eq!(
            stream.next_message().await.unwrap().payload,
            Bytes::from_static(b"first")
        );
        assert_eq!(
            stream.next_message().await.unwrap().payload,
            Bytes::from_static(b"second")
        );
    }

    #[test]
    fn test_subscription_output_counts_acks() {
        let ack = |name: &'static str| {
            RespValue::Array(vec![
                RespValue::bulk("subscribe"),
                RespValue::bulk(name),
                RespValue::Integer(1),
            ])
        };
        let mut output = SubscriptionOutput::new(2);
        output.set(ack("a")).unwrap();
        assert!(!output.is_complete());
        output.set(ack("b")).unwrap();
        assert!(output.is_complete());
    }
}
