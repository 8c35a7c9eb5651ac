//! In-process broker with a retained log per topic.
//!
//! Each topic keeps every message ever published plus one committed offset
//! per consumer tag. A subscriber resumes at its committed offset, or at 0
//! when asked to replay from the beginning. Taking the broker offline makes
//! connect, publish and subscribe fail, which is how tests simulate an
//! outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BrokerUnavailableSnafu, ChannelError};

use super::{ChannelClient, Disposition, Envelope, Message, MessageHandler, SubscribeOptions};

#[derive(Default)]
struct TopicLog {
    messages: Vec<Message>,
    committed: HashMap<String, u64>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    offline: AtomicBool,
    connected: AtomicBool,
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going down or coming back.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
        if !online {
            self.inner.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Every message retained on `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.topics()
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Offset the next subscription with `consumer_tag` would resume from.
    pub fn committed(&self, topic: &str, consumer_tag: &str) -> u64 {
        self.topics()
            .get(topic)
            .and_then(|log| log.committed.get(consumer_tag).copied())
            .unwrap_or(0)
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self, operation: impl Into<String>) -> Result<(), ChannelError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return BrokerUnavailableSnafu {
                operation: operation.into(),
            }
            .fail();
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn message_at(&self, topic: &str, offset: u64) -> Option<Message> {
        let index = usize::try_from(offset).ok()?;
        self.topics()
            .get(topic)
            .and_then(|log| log.messages.get(index).cloned())
    }

    fn commit(&self, topic: &str, consumer_tag: &str, offset: u64) {
        self.topics()
            .entry(topic.to_string())
            .or_default()
            .committed
            .insert(consumer_tag.to_string(), offset);
    }
}

#[async_trait]
impl ChannelClient for MemoryBroker {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.ensure_online("connect")
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), ChannelError> {
        self.ensure_online(format!("publish to '{topic}'"))?;

        let offset = {
            let mut topics = self.topics();
            let log = topics.entry(topic.to_string()).or_default();
            let offset = log.messages.len() as u64;
            log.messages.push(Message {
                topic: topic.to_string(),
                key: envelope.key,
                payload: envelope.value,
                headers: envelope.headers,
                offset,
            });
            offset
        };
        self.inner.appended.notify_waiters();

        debug!(topic, offset, "Message appended");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ChannelError> {
        self.ensure_online(format!("subscribe to '{topic}'"))?;

        let mut offset = if options.from_beginning {
            0
        } else {
            self.committed(topic, &options.consumer_tag)
        };
        info!(
            topic,
            consumer_tag = %options.consumer_tag,
            offset,
            "Subscribed"
        );

        while !shutdown.is_cancelled() {
            // Register for wakeups before looking, so an append between the
            // lookup and the wait is not missed.
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            match self.message_at(topic, offset) {
                Some(message) => {
                    if handler.handle(message).await == Disposition::Reject {
                        debug!(topic, offset, "Message rejected");
                    }
                    offset += 1;
                    self.commit(topic, &options.consumer_tag, offset);
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = appended => {}
                    }
                }
            }
        }

        info!(topic, consumer_tag = %options.consumer_tag, "Subscription closed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn take_unconsumed(&self, topic: &str, consumer_tag: &str) -> Vec<Message> {
        let mut topics = self.topics();
        let Some(log) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let end = log.messages.len() as u64;
        let start = log.committed.get(consumer_tag).copied().unwrap_or(0).min(end);
        log.committed.insert(consumer_tag.to_string(), end);
        log.messages[start as usize..].to_vec()
    }
}
