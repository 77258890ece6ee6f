//! Delivery loop for the inbound customer event queue.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dedup_common::broker::{ConnectionError, ConnectionManager};
use dedup_common::event::CustomerEvent;
use dedup_common::health::HealthHandle;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable},
    Channel, Consumer,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::pipeline::EventHandler;

/// Header set by the broker on quorum queues with the number of earlier deliveries.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Pause before subscribing again after the delivery stream broke.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Failure counts kept for at most this many events before the table is reset.
const MAX_TRACKED_FAILURES: usize = 10_000;

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    Requeue,
    DeadLetter,
}

/// A message that failed `failures` times is requeued until it reaches `max_attempts`.
pub fn delivery_decision(failures: u32, max_attempts: u32) -> DeliveryDecision {
    if failures >= max_attempts {
        DeliveryDecision::DeadLetter
    } else {
        DeliveryDecision::Requeue
    }
}

/// Earlier deliveries of a message, as reported by the broker.
pub fn broker_delivery_count(headers: Option<&FieldTable>) -> Option<u32> {
    let (_, value) = headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

/// Counts handler failures per event across redeliveries.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: HashMap<Uuid, u32>,
}

impl FailureTracker {
    /// Record one more failure and return how many times the message has failed so far.
    /// The broker's own count wins when it is higher, so a restarted worker does not start over.
    pub fn record(&mut self, event_id: Uuid, broker_deliveries: Option<u32>) -> u32 {
        if self.failures.len() >= MAX_TRACKED_FAILURES && !self.failures.contains_key(&event_id) {
            self.failures.clear();
        }

        let tracked = self.failures.entry(event_id).or_default();
        *tracked += 1;
        if let Some(earlier) = broker_deliveries {
            *tracked = (*tracked).max(earlier.saturating_add(1));
        }

        *tracked
    }

    pub fn clear(&mut self, event_id: &Uuid) {
        self.failures.remove(event_id);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Gives the broker its final word on a delivery.
#[async_trait]
pub trait Settle {
    async fn acknowledge(&self) -> Result<(), lapin::Error>;
    async fn requeue(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Settle for Acker {
    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        self.ack(BasicAckOptions::default()).await
    }

    async fn requeue(&self) -> Result<(), lapin::Error> {
        self.nack(BasicNackOptions {
            requeue: true,
            ..Default::default()
        })
        .await
    }
}

/// Where messages that cannot be processed end up.
#[async_trait]
pub trait DeadLetterSink {
    async fn dead_letter(&self, payload: &[u8]) -> Result<(), ConnectionError>;
}

#[async_trait]
impl DeadLetterSink for ConnectionManager {
    async fn dead_letter(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.publish(&self.topology().dead_letter, payload).await
    }
}

/// Decodes a delivery, hands it to the handler and settles it according to the result.
pub struct DeliverySettler<H, D> {
    handler: H,
    dead_letters: Arc<D>,
    max_delivery_attempts: u32,
    failures: FailureTracker,
}

impl<H, D> DeliverySettler<H, D>
where
    H: EventHandler + Send + Sync,
    D: DeadLetterSink + Send + Sync,
{
    pub fn new(handler: H, dead_letters: Arc<D>, max_delivery_attempts: u32) -> Self {
        Self {
            handler,
            dead_letters,
            max_delivery_attempts,
            failures: FailureTracker::default(),
        }
    }

    /// Settle a single delivery.
    ///
    /// Errors are a failure to ack or nack, or a broker that is gone for good. In the latter
    /// case the delivery is left unsettled and comes back once the connection is dropped.
    pub async fn settle<A>(
        &mut self,
        payload: &[u8],
        headers: Option<&FieldTable>,
        acker: &A,
    ) -> Result<(), WorkerError>
    where
        A: Settle + Sync,
    {
        let event = match CustomerEvent::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dead-lettering undecodable message: {}", e);
                return self.dead_letter(payload, acker, "malformed").await;
            }
        };

        let e = match self.handler.handle(&event).await {
            Ok(outcome) => {
                debug!(event_id = %event.event_id, outcome = outcome.label(), "event processed");
                self.failures.clear(&event.event_id);
                acker.acknowledge().await?;
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => e,
        };

        let failures = self.failures.record(event.event_id, broker_delivery_count(headers));

        match delivery_decision(failures, self.max_delivery_attempts) {
            DeliveryDecision::Requeue => {
                warn!(
                    event_id = %event.event_id,
                    failures,
                    "event processing failed, requeueing: {}",
                    e
                );
                acker.requeue().await?;
            }
            DeliveryDecision::DeadLetter => {
                error!(
                    event_id = %event.event_id,
                    failures,
                    "event processing failed too many times, dead-lettering: {}",
                    e
                );
                self.failures.clear(&event.event_id);
                self.dead_letter(payload, acker, "max_attempts").await?;
            }
        }

        Ok(())
    }

    /// Requeues instead when the dead-letter publish fails, so the message is never lost.
    async fn dead_letter<A>(
        &self,
        payload: &[u8],
        acker: &A,
        reason: &'static str,
    ) -> Result<(), WorkerError>
    where
        A: Settle + Sync,
    {
        match self.dead_letters.dead_letter(payload).await {
            Ok(()) => {
                metrics::counter!("dedup_dead_lettered_total", &[("reason", reason)]).increment(1);
                acker.acknowledge().await?;
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(reason, "could not dead-letter message, requeueing: {}", e);
                acker.requeue().await?;
            }
        }

        Ok(())
    }
}

/// Consumes the inbound queue one message at a time and settles each delivery according to
/// what the handler reports.
pub struct EventConsumer<H> {
    manager: Arc<ConnectionManager>,
    settler: DeliverySettler<H, ConnectionManager>,
    consumer_tag: String,
    idle_tick: Duration,
    liveness: HealthHandle,
}

impl<H> EventConsumer<H>
where
    H: EventHandler + Send + Sync,
{
    pub fn new(
        manager: Arc<ConnectionManager>,
        handler: H,
        consumer_tag: &str,
        max_delivery_attempts: u32,
        idle_tick: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            settler: DeliverySettler::new(handler, manager.clone(), max_delivery_attempts),
            manager,
            consumer_tag: consumer_tag.to_owned(),
            idle_tick,
            liveness,
        }
    }

    /// Consume until `shutdown` fires or the broker becomes unreachable for good.
    ///
    /// The shutdown signal is only checked between messages: an event being processed is
    /// always settled first.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), WorkerError> {
        info!(queue = %self.manager.topology().inbound, "starting customer event consumption");

        loop {
            let (channel, mut consumer) = match self.subscribe().await {
                Ok(subscription) => subscription,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("could not subscribe to the inbound queue: {}", e);
                    self.manager.reset_consume_channel();
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;

                    _ = &mut shutdown => {
                        info!("shutdown signal received, no longer consuming");
                        return Ok(());
                    }

                    next = tokio::time::timeout(self.idle_tick, consumer.next()) => next,
                };

                self.liveness.report_healthy();

                let delivery = match next {
                    Err(_) => {
                        debug!("no delivery within idle tick");
                        continue;
                    }
                    Ok(None) => {
                        warn!("delivery stream ended");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("delivery stream failed: {}", e);
                        break;
                    }
                    Ok(Some(Ok(delivery))) => delivery,
                };

                let settled = self
                    .settler
                    .settle(
                        &delivery.data,
                        delivery.properties.headers().as_ref(),
                        &delivery.acker,
                    )
                    .await;

                match settled {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            delivery_tag = delivery.delivery_tag,
                            "lost the consume channel: {}", e
                        );
                        break;
                    }
                }
            }

            // Unacked deliveries on the old channel go back to the queue once it is closed.
            if let Err(e) = channel.close(200, "resubscribing").await {
                debug!("old consume channel already closed: {}", e);
            }
            self.manager.reset_consume_channel();
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    async fn subscribe(&self) -> Result<(Channel, Consumer), WorkerError> {
        let channel = self.manager.consume_channel().await?;

        let consumer = channel
            .basic_consume(
                &self.manager.topology().inbound,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(consumer_tag = %self.consumer_tag, "subscribed to inbound queue");

        Ok((channel, consumer))
    }
}
