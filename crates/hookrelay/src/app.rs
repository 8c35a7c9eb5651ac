//! Command wiring: builds the shared clients from config and runs the
//! ingress, the consumer or a reconcile pass until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::prelude::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cascade::DeliveryCascade;
use crate::channel::{self, ChannelClient, MessageHandler, SubscribeOptions};
use crate::config::RelayConfig;
use crate::error::{
    BindSnafu, ChannelError, ConfigSnafu, ConsumerSnafu, MetricsSnafu, ReconcileSnafu, RelayError,
    ServeSnafu, StoreInitSnafu, TaskJoinSnafu, UnsupportedBrokerSnafu,
};
use crate::event::Event;
use crate::fallback::FallbackStore;
use crate::ingress::{self, IngressState};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::retry::{DeadLetterEntry, EventProcessor, Topics};
use crate::store::{EventStore, MySqlStore};

/// Pause before re-subscribing after the consumer loses its subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Process-wide clients shared by every command.
pub struct Relay {
    config: RelayConfig,
    channel: Arc<dyn ChannelClient>,
    store: Arc<dyn EventStore>,
    fallback: Arc<FallbackStore>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Load and merge the config files, then build the clients.
    pub fn load(paths: &[PathBuf], shutdown: CancellationToken) -> Result<Self, RelayError> {
        let config = RelayConfig::from_files(paths).context(ConfigSnafu)?;
        Self::from_config(config, shutdown)
    }

    pub fn from_config(
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, RelayError> {
        let channel = channel::from_config(&config.broker);
        let store: Arc<dyn EventStore> =
            Arc::new(MySqlStore::new(&config.store).context(StoreInitSnafu)?);
        let fallback = Arc::new(FallbackStore::new(&config.fallback.root));
        Ok(Self::with_parts(config, channel, store, fallback, shutdown))
    }

    /// Build from already constructed clients.
    pub fn with_parts(
        config: RelayConfig,
        channel: Arc<dyn ChannelClient>,
        store: Arc<dyn EventStore>,
        fallback: Arc<FallbackStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            channel,
            store,
            fallback,
            shutdown,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn init_metrics(&self) -> Result<(), RelayError> {
        if self.config.metrics.enabled {
            hookrelay_core::init_metrics(&self.config.metrics.address).context(MetricsSnafu)?;
        }
        Ok(())
    }

    pub fn cascade(&self) -> DeliveryCascade {
        DeliveryCascade::standard(
            Arc::clone(&self.channel),
            self.config.broker.topic.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.fallback),
            self.config.ingress.tier_timeout(),
        )
    }

    pub fn processor(&self) -> EventProcessor {
        EventProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.channel),
            Arc::clone(&self.fallback),
            self.config.retry.policy(),
            Topics::from_config(&self.config.broker),
            self.shutdown.clone(),
        )
    }

    /// The reconciler writes straight to the store when the broker would not
    /// keep a re-published event past this process.
    pub fn reconciler(&self) -> Reconciler {
        let reconciler = Reconciler::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.store),
            Arc::clone(&self.fallback),
            Topics::from_config(&self.config.broker),
            self.reconciler_tag(),
            self.config.reconciler.dead_letter_window(),
        );
        if self.channel.is_durable() {
            reconciler
        } else {
            reconciler.store_only()
        }
    }

    fn reconciler_tag(&self) -> String {
        format!("{}-reconciler", self.config.broker.consumer_tag)
    }

    /// Create store tables. A store that is down at startup is not fatal:
    /// the cascade and the consumer cope with it per event.
    async fn prepare_store(&self) {
        match self.store.prepare().await {
            Ok(()) => info!("Store schema ready"),
            Err(e) => warn!("Store schema initialization failed: {}", e),
        }
    }

    /// Run the ingress, and the consumer too when `with_consumer` is set,
    /// until shutdown.
    pub async fn serve(&self, with_consumer: bool) -> Result<(), RelayError> {
        ensure!(
            with_consumer || self.channel.is_durable(),
            UnsupportedBrokerSnafu {
                command: "serve",
                hint: "run it with --with-consumer",
            }
        );
        self.prepare_store().await;

        let address = &self.config.ingress.address;
        let listener = TcpListener::bind(address)
            .await
            .context(BindSnafu { address })?;

        let consumer = with_consumer.then(|| {
            let processor = Arc::new(self.processor());
            let channel = Arc::clone(&self.channel);
            let topic = self.config.broker.topic.clone();
            let tag = self.config.broker.consumer_tag.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let result = run_consumer(
                    channel.as_ref(),
                    &topic,
                    &tag,
                    Arc::clone(&processor),
                    &shutdown,
                )
                .await;
                processor.drain().await;
                result
            })
        });

        let state = IngressState {
            cascade: Arc::new(self.cascade()),
            tenants: Arc::new(self.config.tenants.directory()),
            shutdown: self.shutdown.clone(),
        };
        let served = ingress::serve(listener, state, self.shutdown.clone())
            .await
            .context(ServeSnafu);
        info!("Ingress stopped");

        // Stop the consumer too if the server exited on its own.
        self.shutdown.cancel();
        let consumed = match consumer {
            Some(handle) => match handle.await {
                Ok(result) => result.context(ConsumerSnafu),
                Err(e) => Err(e).context(TaskJoinSnafu),
            },
            None => Ok(()),
        };

        if with_consumer {
            self.flush_unconsumed().await;
        }
        self.close().await;
        served?;
        consumed
    }

    /// Consume the ingest topic until shutdown.
    pub async fn consume(&self) -> Result<(), RelayError> {
        ensure!(
            self.channel.is_durable(),
            UnsupportedBrokerSnafu {
                command: "consume",
                hint: "use 'serve --with-consumer' instead",
            }
        );
        self.prepare_store().await;

        let processor = Arc::new(self.processor());
        let result = run_consumer(
            self.channel.as_ref(),
            &self.config.broker.topic,
            &self.config.broker.consumer_tag,
            Arc::clone(&processor),
            &self.shutdown,
        )
        .await;
        processor.drain().await;

        self.close().await;
        result.context(ConsumerSnafu)
    }

    /// One reconcile pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RelayError> {
        let report = self.reconciler().run(&self.shutdown).await;
        self.store.close().await;
        report.context(ReconcileSnafu)
    }

    /// Move events the broker holds only in memory to pending fallback
    /// files, so the next reconcile picks them up. Call once the consumer has
    /// stopped.
    pub async fn flush_unconsumed(&self) {
        let broker = &self.config.broker;
        let ingest = self
            .channel
            .take_unconsumed(&broker.topic, &broker.consumer_tag)
            .await;
        for message in ingest {
            match message.decode::<Event>() {
                Ok(event) => self.save_unconsumed(&event, "unconsumed at shutdown").await,
                Err(e) => warn!(offset = message.offset, "Dropping undecodable message: {}", e),
            }
        }

        let parked = self
            .channel
            .take_unconsumed(&broker.dead_letter_topic, &self.reconciler_tag())
            .await;
        for message in parked {
            match message.decode::<DeadLetterEntry>() {
                Ok(entry) => {
                    let reason = format!("parked at shutdown: {}", entry.error);
                    self.save_unconsumed(&entry.event, &reason).await;
                }
                Err(e) => warn!(offset = message.offset, "Dropping undecodable dead letter: {}", e),
            }
        }
    }

    async fn save_unconsumed(&self, event: &Event, reason: &str) {
        match self.fallback.save(event, reason).await {
            Ok(_) => info!(event_id = %event.id, "{}, saved to fallback file", reason),
            Err(e) => error!(event_id = %event.id, "Event lost at shutdown: {}", e),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.channel.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }
        self.store.close().await;
    }
}

/// Keep a subscription to `topic` alive until `shutdown` is cancelled.
///
/// A subscription that ends or fails recoverably is re-established after
/// [`RESUBSCRIBE_DELAY`].
pub async fn run_consumer(
    channel: &dyn ChannelClient,
    topic: &str,
    consumer_tag: &str,
    processor: Arc<EventProcessor>,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    let handler: Arc<dyn MessageHandler> = processor;

    while !shutdown.is_cancelled() {
        let result = channel
            .subscribe(
                topic,
                SubscribeOptions::new(consumer_tag),
                Arc::clone(&handler),
                shutdown.clone(),
            )
            .await;

        match result {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => warn!(topic, "Subscription ended, resubscribing"),
            Err(e) if !e.is_recoverable() => {
                error!(topic, "Consumer failed: {}", e);
                return Err(e);
            }
            Err(e) => warn!(topic, "Subscription failed, retrying: {}", e),
        }

        if shutdown
            .run_until_cancelled(tokio::time::sleep(RESUBSCRIBE_DELAY))
            .await
            .is_none()
        {
            break;
        }
    }

    info!(topic, "Consumer stopped");
    Ok(())
}
