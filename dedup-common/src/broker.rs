//! Broker connection lifecycle.
//!
//! `ConnectionManager` is the only owner of the AMQP connection and of the channels derived from
//! it. Everything else asks it for a handle right before using one, so a connection or channel
//! that died since the last call is replaced instead of reused.
use std::future::Future;
use std::sync::{Arc, RwLock};

use lapin::{
    options::{BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

/// Unacknowledged deliveries a consumer channel may hold at once.
pub const PREFETCH_COUNT: u16 = 1;

/// AMQP delivery mode for messages that must survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("could not connect to the broker after {attempts} attempts: {last_error}")]
    Fatal { attempts: u32, last_error: String },
    #[error("broker operation failed: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("the broker rejected a published message")]
    PublishRejected,
}

impl ConnectionError {
    /// A fatal error means the retry budget is spent and the process should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Fatal { .. })
    }
}

/// The queues this process reads from and writes to. All of them are declared durable,
/// non-exclusive and non-auto-delete whenever a channel is derived.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub inbound: String,
    pub outbound: String,
    pub dead_letter: String,
}

impl QueueTopology {
    pub fn names(&self) -> [&str; 3] {
        [&self.inbound, &self.outbound, &self.dead_letter]
    }
}

/// Run `connect` until it succeeds or `policy` runs out of attempts.
pub async fn retry_connect<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut connect: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match connect().await {
            Ok(connected) => return Ok(connected),
            Err(e) if policy.should_retry(attempt) => {
                let wait = policy.time_until_next_retry(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    "broker connection attempt failed, retrying in {:?}: {}",
                    wait,
                    e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                error!(attempt, "giving up on broker connection: {}", e);
                return Err(ConnectionError::Fatal {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
        }
    }
}

/// Lazily (re)connects to the broker and hands out channels.
///
/// The fast path reads the cached handles without waiting. Creation happens behind a single
/// async lock and re-checks the cache once the lock is held, so concurrent callers never open
/// two connections.
pub struct ConnectionManager {
    uri: String,
    retry_policy: RetryPolicy,
    topology: QueueTopology,
    connection: RwLock<Option<Arc<Connection>>>,
    consume_channel: RwLock<Option<Channel>>,
    publish_channel: RwLock<Option<Channel>>,
    lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(uri: &str, topology: QueueTopology, retry_policy: RetryPolicy) -> Self {
        Self {
            uri: uri.to_owned(),
            retry_policy,
            topology,
            connection: RwLock::new(None),
            consume_channel: RwLock::new(None),
            publish_channel: RwLock::new(None),
            lock: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Return a live connection, establishing one if there is none or the cached one closed.
    pub async fn connection(&self) -> Result<Arc<Connection>, ConnectionError> {
        if let Some(connection) = cached_connection(&self.connection) {
            return Ok(connection);
        }

        let _guard = self.lock.lock().await;
        self.connection_locked().await
    }

    /// Return the channel used for consuming, with QoS set and all queues declared.
    pub async fn consume_channel(&self) -> Result<Channel, ConnectionError> {
        if let Some(channel) = cached_channel(&self.consume_channel) {
            return Ok(channel);
        }

        let _guard = self.lock.lock().await;
        if let Some(channel) = cached_channel(&self.consume_channel) {
            return Ok(channel);
        }

        let connection = self.connection_locked().await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;
        self.declare_queues(&channel).await?;

        debug!(channel_id = channel.id(), "derived consume channel");
        store(&self.consume_channel, Some(channel.clone()));

        Ok(channel)
    }

    /// Return the channel used for publishing, in publisher-confirm mode with all queues declared.
    pub async fn publish_channel(&self) -> Result<Channel, ConnectionError> {
        if let Some(channel) = cached_channel(&self.publish_channel) {
            return Ok(channel);
        }

        let _guard = self.lock.lock().await;
        if let Some(channel) = cached_channel(&self.publish_channel) {
            return Ok(channel);
        }

        let connection = self.connection_locked().await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.declare_queues(&channel).await?;

        debug!(channel_id = channel.id(), "derived publish channel");
        store(&self.publish_channel, Some(channel.clone()));

        Ok(channel)
    }

    /// Publish a JSON payload to `queue` through the default exchange as a persistent message,
    /// waiting for the broker to confirm it.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), ConnectionError> {
        let channel = self.publish_channel().await?;

        let result = async {
            let confirm = channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default()
                        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                        .with_content_type("application/json".into()),
                )
                .await?;

            match confirm.await? {
                Confirmation::Nack(_) => Err(ConnectionError::PublishRejected),
                _ => Ok(()),
            }
        }
        .await;

        if let Err(ConnectionError::Amqp(ref e)) = result {
            warn!("dropping publish channel after error: {}", e);
            store(&self.publish_channel, None);
        }

        result
    }

    /// Forget the consume channel so the next `consume_channel` call derives a fresh one.
    pub fn reset_consume_channel(&self) {
        store(&self.consume_channel, None);
    }

    /// Close the connection, if one is open.
    pub async fn close(&self) {
        let _guard = self.lock.lock().await;
        store(&self.consume_channel, None);
        store(&self.publish_channel, None);

        let connection = match self.connection.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "shutting down").await {
                warn!("failed to close broker connection cleanly: {}", e);
            }
        }
    }

    /// Must only be called while holding `self.lock`.
    async fn connection_locked(&self) -> Result<Arc<Connection>, ConnectionError> {
        if let Some(connection) = cached_connection(&self.connection) {
            return Ok(connection);
        }

        // Channels from a dead connection are useless.
        store(&self.consume_channel, None);
        store(&self.publish_channel, None);

        let connection = retry_connect(&self.retry_policy, || {
            Connection::connect(&self.uri, ConnectionProperties::default())
        })
        .await?;
        info!("connected to broker");

        let connection = Arc::new(connection);
        store(&self.connection, Some(connection.clone()));

        Ok(connection)
    }

    async fn declare_queues(&self, channel: &Channel) -> Result<(), ConnectionError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };

        for queue in self.topology.names() {
            channel
                .queue_declare(queue, options, FieldTable::default())
                .await?;
        }

        Ok(())
    }
}

fn cached_connection(slot: &RwLock<Option<Arc<Connection>>>) -> Option<Arc<Connection>> {
    let guard = slot.read().ok()?;
    guard
        .as_ref()
        .filter(|connection| connection.status().connected())
        .cloned()
}

fn cached_channel(slot: &RwLock<Option<Channel>>) -> Option<Channel> {
    let guard = slot.read().ok()?;
    guard
        .as_ref()
        .filter(|channel| channel.status().connected())
        .cloned()
}

fn store<T>(slot: &RwLock<Option<T>>, value: Option<T>) {
    match slot.write() {
        Ok(mut guard) => *guard = value,
        // Poisoned lock: the next caller will find nothing cached and reconnect.
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_connect_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));

        let result: Result<(), ConnectionError> = retry_connect(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        match result {
            Err(ConnectionError::Fatal {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 10);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("expected a fatal error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_connect_waits_between_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let result: Result<(), ConnectionError> =
            retry_connect(&policy, || async { Err::<(), _>("nope") }).await;

        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_connect_returns_first_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));

        let result = retry_connect(&policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("third attempt should connect");

        assert_eq!(result, 3);
        assert!(!ConnectionError::PublishRejected.is_fatal());
    }

    #[test]
    fn test_topology_names_every_queue() {
        let topology = QueueTopology {
            inbound: "EventosCliente".to_owned(),
            outbound: "SuspeitosDuplicidadeCliente".to_owned(),
            dead_letter: "EventosCliente.dead-letter".to_owned(),
        };

        assert_eq!(
            topology.names(),
            [
                "EventosCliente",
                "SuspeitosDuplicidadeCliente",
                "EventosCliente.dead-letter"
            ]
        );
    }
}
