//! RabbitMQ channel client.
//!
//! Topics map to durable queues of the same name, published through the
//! default exchange with publisher confirms enabled. A single queue keeps
//! total order, so per-key order holds as well.
//!
//! AMQP queues hand out every unconsumed message, so `from_beginning` has no
//! effect here.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use snafu::prelude::*;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{
    BrokerAckSnafu, BrokerCloseSnafu, BrokerConnectSnafu, BrokerPublishSnafu,
    BrokerSubscribeSnafu, ChannelError, ChannelSetupSnafu, PublishRejectedSnafu,
};

use super::{ChannelClient, Disposition, Envelope, Message, MessageHandler, SubscribeOptions};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    publisher: Channel,
    declared: HashSet<String>,
}

/// Lazily connected RabbitMQ client shared by producers and consumers.
pub struct AmqpChannel {
    url: String,
    client_id: String,
    initial_retry: Duration,
    connect_retries: u32,
    session: Mutex<Option<Session>>,
}

impl AmqpChannel {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            client_id: config.client_id.clone(),
            initial_retry: Duration::from_millis(config.initial_retry_ms),
            connect_retries: config.connect_retries.max(1),
            session: Mutex::new(None),
        }
    }

    /// Return the open session, connecting with exponential backoff first if
    /// there is none or the connection dropped.
    async fn session<'a>(
        &self,
        slot: &'a mut Option<Session>,
    ) -> Result<&'a mut Session, ChannelError> {
        if slot
            .as_ref()
            .is_some_and(|s| !s.connection.status().connected())
        {
            warn!("Broker connection lost, reconnecting");
            *slot = None;
        }

        if slot.is_none() {
            let connection = self.open_connection().await?;
            let publisher = connection
                .create_channel()
                .await
                .context(ChannelSetupSnafu { topic: "*" })?;
            publisher
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .context(ChannelSetupSnafu { topic: "*" })?;

            *slot = Some(Session {
                connection,
                publisher,
                declared: HashSet::new(),
            });
        }

        // Populated just above when it was empty.
        slot.as_mut().ok_or_else(|| ChannelError::BrokerUnavailable {
            operation: "connect".to_string(),
        })
    }

    async fn open_connection(&self) -> Result<Connection, ChannelError> {
        let mut delay = self.initial_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let properties = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.client_id.clone()));

            match Connection::connect(&self.url, properties).await {
                Ok(connection) => {
                    info!(client_id = %self.client_id, attempt, "Connected to broker");
                    return Ok(connection);
                }
                Err(e) if attempt < self.connect_retries => {
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker connection failed: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(source) => {
                    return Err(source).context(BrokerConnectSnafu { attempts: attempt });
                }
            }
        }
    }
}

async fn declare_queue(channel: &Channel, topic: &str) -> Result<(), ChannelError> {
    channel
        .queue_declare(
            topic,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .context(ChannelSetupSnafu { topic })?;
    Ok(())
}

fn to_field_table(envelope: &Envelope) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from("key"),
        AMQPValue::LongString(LongString::from(envelope.key.clone())),
    );
    for (name, value) in &envelope.headers {
        table.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((name.as_str().to_string(), text))
        })
        .collect()
}

#[async_trait]
impl ChannelClient for AmqpChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut slot = self.session.lock().await;
        self.session(&mut slot).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), ChannelError> {
        let mut slot = self.session.lock().await;
        let session = self.session(&mut slot).await?;

        if !session.declared.contains(topic) {
            declare_queue(&session.publisher, topic).await?;
            session.declared.insert(topic.to_string());
        }

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_headers(to_field_table(&envelope));

        let confirmation = session
            .publisher
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                &envelope.value,
                properties,
            )
            .await
            .context(BrokerPublishSnafu { topic })?
            .await
            .context(BrokerPublishSnafu { topic })?;

        ensure!(!confirmation.is_nack(), PublishRejectedSnafu { topic });
        debug!(topic, key = %envelope.key, "Message published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ChannelError> {
        let channel = {
            let mut slot = self.session.lock().await;
            let session = self.session(&mut slot).await?;
            session
                .connection
                .create_channel()
                .await
                .context(ChannelSetupSnafu { topic })?
        };
        declare_queue(&channel, topic).await?;
        // One unsettled message at a time keeps processing ordered.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context(ChannelSetupSnafu { topic })?;

        let mut consumer = channel
            .basic_consume(
                topic,
                &options.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context(BrokerSubscribeSnafu { topic })?;
        info!(topic, consumer_tag = %options.consumer_tag, "Subscribed");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = consumer.next() => next,
            };
            let Some(delivery) = next else {
                warn!(topic, "Consumer stream ended");
                break;
            };
            let mut delivery = delivery.context(BrokerSubscribeSnafu { topic })?;

            let headers = from_field_table(delivery.properties.headers().as_ref());
            let message = Message {
                topic: topic.to_string(),
                key: headers.get("key").cloned().unwrap_or_default(),
                payload: std::mem::take(&mut delivery.data),
                headers,
                offset: delivery.delivery_tag,
            };

            match handler.handle(message).await {
                Disposition::Ack => delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .context(BrokerAckSnafu { topic })?,
                Disposition::Reject => delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
                    .context(BrokerAckSnafu { topic })?,
            }
        }

        if let Err(e) = channel
            .basic_cancel(&options.consumer_tag, BasicCancelOptions::default())
            .await
        {
            debug!(topic, "Failed to cancel consumer: {}", e);
        }
        if let Err(e) = channel.close(200, "subscription closed").await {
            debug!(topic, "Failed to close consumer channel: {}", e);
        }
        info!(topic, consumer_tag = %options.consumer_tag, "Subscription closed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session
            .connection
            .close(200, "client disconnect")
            .await
            .context(BrokerCloseSnafu)?;
        info!(client_id = %self.client_id, "Disconnected from broker");
        Ok(())
    }
}
