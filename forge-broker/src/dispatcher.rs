//! Queue dispatcher
//!
//! Binds message handlers to durable queues. Every delivery is handed to a
//! [`MessageHandler`] together with a [`Replier`] that routes any number of
//! replies (status updates, then a terminal result) to the reply queue under
//! the delivery's correlation id. Once the handler returns, the delivery is
//! settled exactly once: `Ok` acks, [`Requeue`] nacks with requeue.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::CloseSignal;
use crate::error::{BrokerError, Result};

/// Sends replies on behalf of one delivery
#[async_trait]
pub trait Replier: Send + Sync {
    /// Publishes `payload` to `queue`, or to the default reply queue when `None`
    async fn send(&self, payload: String, queue: Option<&str>) -> Result<()>;
}

/// Handler outcome asking for the delivery to be put back on the queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("requeue requested: {reason}")]
pub struct Requeue {
    pub reason: String,
}

impl Requeue {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<BrokerError> for Requeue {
    fn from(err: BrokerError) -> Self {
        Self::new(err.to_string())
    }
}

/// Processes one delivery
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles a message body
    ///
    /// # Arguments
    /// * `body` - Message body decoded as UTF-8 (lossy)
    /// * `correlation_id` - Correlation id of the delivery (generated when absent)
    /// * `replier` - Reply channel bound to this delivery
    async fn on_message(
        &self,
        body: String,
        correlation_id: String,
        replier: Arc<dyn Replier>,
    ) -> std::result::Result<(), Requeue>;
}

/// How a delivery is settled once its handler has returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
}

impl Settlement {
    pub fn from_outcome(outcome: &std::result::Result<(), Requeue>) -> Self {
        match outcome {
            Ok(()) => Self::Ack,
            Err(_) => Self::Requeue,
        }
    }
}

/// Parameters of the bounded "run N tasks then exit" mode
#[derive(Debug, Clone, Copy)]
pub struct BoundedRun {
    /// Deliveries to hand over before stopping
    pub tasks: u32,

    /// Idle time with an empty queue after which the run stops early
    pub max_wait: Duration,

    /// Pause between polls of an empty queue
    pub polling_interval: Duration,

    /// Pause before closing the channel so pending acks reach the broker
    pub drain_pause: Duration,
}

/// A message taken off a queue and not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Broker tag used to settle the message
    pub delivery_tag: u64,
    /// Body decoded as UTF-8 (lossy)
    pub body: String,
    pub correlation_id: String,
    /// App id set by the publisher
    pub app_id: Option<String>,
}

impl Inbound {
    fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            body: String::from_utf8_lossy(&delivery.data).into_owned(),
            correlation_id: correlation_id_of(&delivery.properties),
            app_id: delivery
                .properties
                .app_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
        }
    }
}

/// Channel operations behind message dispatch
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Takes one message off `queue`, `None` when the queue is empty
    async fn fetch(&self, queue: &str) -> Result<Option<Inbound>>;

    /// Acks or requeues a message
    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()>;

    /// Reply channel bound to `message`
    fn replier(&self, message: &Inbound) -> Arc<dyn Replier>;

    async fn close(&self) -> Result<()>;
}

/// Where a reply goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target<'a> {
    /// The default reply queue, declared when the dispatcher opened
    Reply(&'a str),
    /// Another worker's queue, which may not exist yet
    Handoff(&'a str),
}

impl<'a> Target<'a> {
    fn resolve(queue: Option<&'a str>, reply_queue: &'a str) -> Self {
        match queue {
            Some(queue) if queue != reply_queue => Self::Handoff(queue),
            _ => Self::Reply(reply_queue),
        }
    }
}

/// Replier publishing to the broker on the dispatcher's channel
struct AmqpReplier {
    channel: Channel,
    correlation_id: String,
    app_id: String,
    reply_queue: String,
}

#[async_trait]
impl Replier for AmqpReplier {
    async fn send(&self, payload: String, queue: Option<&str>) -> Result<()> {
        let queue = match Target::resolve(queue, &self.reply_queue) {
            Target::Reply(queue) => queue,
            Target::Handoff(queue) => {
                // Unroutable messages on the default exchange are dropped
                declare_durable(&self.channel, queue).await?;
                queue
            }
        };
        debug!(
            "Sending reply for {} to {}: {}",
            self.correlation_id, queue, payload
        );

        let properties = BasicProperties::default()
            .with_correlation_id(self.correlation_id.clone().into())
            .with_app_id(self.app_id.clone().into());

        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}

/// Consumes durable queues on a single channel
#[derive(Clone)]
pub struct QueueDispatcher {
    channel: Channel,
    reply_queue: String,
    app_id: String,
}

impl QueueDispatcher {
    /// Opens a channel and declares the reply queue
    ///
    /// # Arguments
    /// * `connection` - Established broker connection
    /// * `reply_queue` - Default destination of replies
    /// * `app_id` - Application id for replies to deliveries that carry none
    pub async fn open(
        connection: &Connection,
        reply_queue: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        let channel = connection.create_channel().await?;
        let reply_queue = reply_queue.into();

        declare_durable(&channel, &reply_queue).await?;

        Ok(Self {
            channel,
            reply_queue,
            app_id: app_id.into(),
        })
    }

    /// Starts consuming `queue`
    ///
    /// Returns once the consumer is registered. Deliveries are processed in
    /// the background, at most `prefetch` at a time; when the consumer ends
    /// (channel or connection lost) `close` is signalled.
    pub async fn listen<H: MessageHandler>(
        &self,
        queue: &str,
        prefetch: u16,
        handler: Arc<H>,
        close: CloseSignal,
    ) -> Result<()> {
        declare_durable(&self.channel, queue).await?;
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Listening on {} (prefetch: {})", queue, prefetch);

        let semaphore = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let dispatcher = self.clone();
        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Consumer for {} failed: {}", queue, e);
                        break;
                    }
                };

                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };

                let message = Inbound::from_delivery(&delivery);
                let dispatcher = dispatcher.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    dispatch(&dispatcher, message, handler.as_ref()).await;
                    // Permit is released when dropped
                    drop(permit);
                });
            }

            close.close(&format!("consumer for {} ended", queue));
        });

        Ok(())
    }

    /// Handles at most `run.tasks` messages from `queue`, then closes the channel
    ///
    /// Messages are fetched one at a time with `basic.get`. The run stops
    /// early once the queue has stayed empty for `run.max_wait`.
    ///
    /// Returns the number of messages handed to the handler.
    pub async fn execute_tasks<H: MessageHandler>(
        self,
        queue: &str,
        run: BoundedRun,
        handler: Arc<H>,
    ) -> Result<u32> {
        declare_durable(&self.channel, queue).await?;
        self.channel.basic_qos(1, BasicQosOptions::default()).await?;

        run_bounded(&self, queue, run, handler.as_ref()).await
    }
}

#[async_trait]
impl QueueChannel for QueueDispatcher {
    async fn fetch(&self, queue: &str) -> Result<Option<Inbound>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|message| Inbound::from_delivery(&message.delivery)))
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Ack => {
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await?
            }
            Settlement::Requeue => {
                self.channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await?
            }
        }
        Ok(())
    }

    fn replier(&self, message: &Inbound) -> Arc<dyn Replier> {
        // Replies carry the requester's app id so it can route them back
        let app_id = message
            .app_id
            .clone()
            .unwrap_or_else(|| self.app_id.clone());

        Arc::new(AmqpReplier {
            channel: self.channel.clone(),
            correlation_id: message.correlation_id.clone(),
            app_id,
            reply_queue: self.reply_queue.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "OK").await?;
        Ok(())
    }
}

/// Hands `message` to `handler`, then settles it exactly once
async fn dispatch<C, H>(channel: &C, message: Inbound, handler: &H)
where
    C: QueueChannel + ?Sized,
    H: MessageHandler + ?Sized,
{
    let replier = channel.replier(&message);
    let Inbound {
        delivery_tag,
        body,
        correlation_id,
        ..
    } = message;

    let outcome = handler
        .on_message(body, correlation_id.clone(), replier)
        .await;

    if let Err(requeue) = &outcome {
        warn!("Requeueing {}: {}", correlation_id, requeue.reason);
    }

    if let Err(e) = channel
        .settle(delivery_tag, Settlement::from_outcome(&outcome))
        .await
    {
        error!("Failed to settle {}: {}", correlation_id, e);
    }
}

/// Fetches and dispatches up to `run.tasks` messages, then closes the channel
async fn run_bounded<C, H>(channel: &C, queue: &str, run: BoundedRun, handler: &H) -> Result<u32>
where
    C: QueueChannel + ?Sized,
    H: MessageHandler + ?Sized,
{
    info!("Executing up to {} task(s) from {}", run.tasks, queue);

    let mut handled = 0;
    let mut idle = Duration::ZERO;

    while handled < run.tasks {
        match channel.fetch(queue).await? {
            Some(message) => {
                idle = Duration::ZERO;
                handled += 1;
                info!("Handling task {}/{}", handled, run.tasks);
                dispatch(channel, message, handler).await;
            }
            None if idle >= run.max_wait => {
                info!("No task available after {:?}, stopping", idle);
                break;
            }
            None => {
                tokio::time::sleep(run.polling_interval).await;
                idle += run.polling_interval;
            }
        }
    }

    info!(
        "Handled {} task(s), waiting {:?} before closing",
        handled, run.drain_pause
    );
    tokio::time::sleep(run.drain_pause).await;
    channel.close().await?;

    Ok(handled)
}

/// Correlation id of a delivery, or a fresh one when the publisher set none
fn correlation_id_of(properties: &BasicProperties) -> String {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}
