//! Durable publish/subscribe channel.
//!
//! `ChannelClient` is the only seam to the broker. Implementations own their
//! connection lifecycle (lazy, idempotent connect and a clean disconnect) and
//! any transport-level reconnect backoff. They never retry at the
//! application level: a failed publish is returned to the caller.

mod amqp;
mod memory;

pub use amqp::AmqpChannel;
pub use memory::MemoryBroker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerConfig, BrokerKind};
use crate::error::{ChannelError, DecodeMessageSnafu, EncodeMessageSnafu};
use crate::event::Event;
use crate::retry::DeadLetterEntry;

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key: String,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Encode `value` as a JSON message body.
    pub fn json<T: Serialize>(
        key: String,
        headers: BTreeMap<String, String>,
        value: &T,
    ) -> Result<Self, ChannelError> {
        let value = serde_json::to_vec(value).context(EncodeMessageSnafu)?;
        Ok(Self {
            key,
            value,
            headers,
        })
    }

    pub fn for_event(event: &Event) -> Result<Self, ChannelError> {
        Self::json(event.message_key(), event.headers(), event)
    }

    /// Dead-letter entries keep the key and headers of the event they carry.
    pub fn for_dead_letter(entry: &DeadLetterEntry) -> Result<Self, ChannelError> {
        let mut headers = entry.event.headers();
        headers.insert("original-topic".to_string(), entry.original_topic.clone());
        Self::json(entry.event.message_key(), headers, entry)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Position in the topic (memory) or delivery tag (AMQP).
    pub offset: u64,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_slice(&self.payload).context(DecodeMessageSnafu {
            topic: self.topic.clone(),
        })
    }
}

/// How a handled message should be settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Settled; the broker must not redeliver it.
    Ack,
    /// Dropped without requeue.
    Reject,
}

/// Consumes messages for a subscription, one at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Disposition;
}

/// Options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub consumer_tag: String,
    /// Replay the topic from its first retained message.
    pub from_beginning: bool,
}

impl SubscribeOptions {
    pub fn new(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            from_beginning: false,
        }
    }

    pub fn from_beginning(mut self) -> Self {
        self.from_beginning = true;
        self
    }
}

/// Publish/subscribe access to a durable broker.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Open the connection if it is not open. Idempotent.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Publish one message and wait for the broker to confirm it.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), ChannelError>;

    /// Deliver messages from `topic` to `handler` until `shutdown` is
    /// cancelled. Each message is settled according to the handler's
    /// disposition before the next is delivered.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ChannelError>;

    /// Close the connection. Later calls reconnect lazily.
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Whether published messages outlive this process.
    fn is_durable(&self) -> bool {
        true
    }

    /// Take the messages on `topic` that `consumer_tag` has not consumed yet
    /// and that only this process holds. They count as consumed afterwards.
    /// Durable brokers keep their own backlog and return nothing.
    async fn take_unconsumed(&self, _topic: &str, _consumer_tag: &str) -> Vec<Message> {
        Vec::new()
    }
}

/// Build the client selected by `config.kind`.
pub fn from_config(config: &BrokerConfig) -> Arc<dyn ChannelClient> {
    match config.kind {
        BrokerKind::Amqp => Arc::new(AmqpChannel::new(config)),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    }
}
