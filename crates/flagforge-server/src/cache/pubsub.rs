//! Invalidation broadcast: buses, the subscriber loop and its reactions.
//!
//! ## How It Works
//!
//! ```text
//! Instance 1: invalidate("proj1")
//!   ↓
//! Bus: PUBLISH flagforge.invalidate "proj1"
//!   ↓
//! Instance 2: subscriber receives "proj1" → evicts L1 snapshots of proj1
//! Worker:     subscriber receives "proj1" → records the invalidation
//! ```

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::backend::LocalCache;
use super::keys::project_prefix;

/// Default broadcast channel name.
pub const DEFAULT_CHANNEL: &str = "flagforge.invalidate";

/// Capacity of the in-process broadcast buffer.
const LOCAL_BUS_CAPACITY: usize = 1024;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Errors raised by an invalidation bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus subscribe error: {0}")]
    Subscribe(String),

    #[error("bus publish error: {0}")]
    Publish(String),

    #[error("bus message error: {0}")]
    Payload(String),

    #[error("subscriber lagged, {0} notifications dropped")]
    Lagged(u64),

    #[error("bus operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Stream of project ids taken off the bus; `Err` items are receive errors.
pub type InvalidationStream = BoxStream<'static, Result<String, BusError>>;

/// A shared broadcast channel carrying project ids whose snapshots went stale.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Broadcasts `project_id` to every live subscriber.
    async fn publish(&self, project_id: &str) -> Result<(), BusError>;

    /// Opens a new subscription on the channel.
    async fn subscribe(&self) -> Result<InvalidationStream, BusError>;

    fn channel(&self) -> &str;
}

/// Shared bus handle.
pub type DynBus = Arc<dyn InvalidationBus>;

/// In-process bus on a `tokio::sync::broadcast` channel.
///
/// Single-instance deployments and tests. Clones share the channel.
#[derive(Clone)]
pub struct LocalBus {
    channel: String,
    sender: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new(channel: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self {
            channel: channel.into(),
            sender,
        }
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL)
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, project_id: &str) -> Result<(), BusError> {
        // No receivers is not a failure, same as PUBLISH reaching zero clients
        let receivers = self.sender.send(project_id.to_string()).unwrap_or(0);
        tracing::debug!(project_id = %project_id, receivers, "published invalidation (local)");
        Ok(())
    }

    async fn subscribe(&self) -> Result<InvalidationStream, BusError> {
        let stream = BroadcastStream::new(self.sender.subscribe()).map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| BusError::Lagged(skipped))
        });
        Ok(stream.boxed())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

/// Bus on Redis pub/sub.
///
/// Publishes over the shared pool; each subscription opens its own
/// connection, since pooled connections cannot SUBSCRIBE.
#[derive(Clone)]
pub struct RedisBus {
    pool: Pool,
    redis_url: String,
    channel: String,
}

impl RedisBus {
    pub fn new(pool: Pool, redis_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, project_id: &str) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        conn.publish::<_, _, ()>(&self.channel, project_id)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        tracing::debug!(project_id = %project_id, channel = %self.channel, "published invalidation");
        Ok(())
    }

    async fn subscribe(&self) -> Result<InvalidationStream, BusError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        tracing::info!(channel = %self.channel, "Subscribed to invalidation channel");

        let stream = pubsub.into_on_message().map(|msg| {
            msg.get_payload::<String>()
                .map_err(|e| BusError::Payload(e.to_string()))
        });
        Ok(stream.boxed())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

/// A process's local reaction to an invalidation notification.
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    async fn on_invalidate(&self, project_id: &str);
}

/// Drops a project's snapshots from the process-local L1 tier.
pub struct EvictLocalSnapshots {
    local: LocalCache,
}

impl EvictLocalSnapshots {
    pub fn new(local: LocalCache) -> Self {
        Self { local }
    }
}

#[async_trait]
impl InvalidationHandler for EvictLocalSnapshots {
    async fn on_invalidate(&self, project_id: &str) {
        let evicted = self.local.evict_prefix(&project_prefix(project_id));
        tracing::debug!(project_id = %project_id, evicted, "evicted local snapshots");
    }
}

/// Logs and counts notifications. The worker's reaction.
#[derive(Debug, Default)]
pub struct RecordInvalidation {
    received: AtomicU64,
}

impl RecordInvalidation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications handled so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InvalidationHandler for RecordInvalidation {
    async fn on_invalidate(&self, project_id: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        tracing::info!(project_id = %project_id, "received invalidation");
    }
}

/// Why a subscriber loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberExit {
    /// Shutdown was signalled.
    Cancelled,
    /// The subscription ended underneath the loop.
    StreamClosed,
}

/// Long-lived listener applying an [`InvalidationHandler`] to every notification.
///
/// The loop is either listening or terminated. Receive errors are logged and
/// listening resumes; only shutdown terminates it. A closed stream is handed
/// back to the caller, see [`spawn_supervised`].
pub struct InvalidationSubscriber {
    bus: DynBus,
    handler: Arc<dyn InvalidationHandler>,
}

impl InvalidationSubscriber {
    pub fn new(bus: DynBus, handler: Arc<dyn InvalidationHandler>) -> Self {
        Self { bus, handler }
    }

    /// Subscribes, then listens until shutdown or until the stream closes.
    ///
    /// # Errors
    ///
    /// Returns the bus error when the subscription cannot be opened.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<SubscriberExit, BusError> {
        let stream = self.bus.subscribe().await?;
        Ok(self.listen(stream, &mut shutdown).await)
    }

    /// Listens on an already opened subscription.
    pub async fn listen(
        &self,
        mut stream: InvalidationStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SubscriberExit {
        loop {
            if *shutdown.borrow() {
                return SubscriberExit::Cancelled;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            tracing::info!(channel = %self.bus.channel(), "Invalidation subscriber shutting down");
                            return SubscriberExit::Cancelled;
                        }
                        Ok(()) => {}
                        Err(_) => {
                            tracing::info!("Invalidation subscriber shutdown channel closed");
                            return SubscriberExit::Cancelled;
                        }
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(project_id)) => {
                            crate::metrics::record_invalidation_received();
                            self.handler.on_invalidate(&project_id).await;
                        }
                        Some(Err(e)) => {
                            if *shutdown.borrow() {
                                return SubscriberExit::Cancelled;
                            }
                            tracing::warn!(error = %e, "invalidation receive error, still listening");
                        }
                        None => {
                            tracing::warn!(channel = %self.bus.channel(), "invalidation stream ended");
                            return SubscriberExit::StreamClosed;
                        }
                    }
                }
            }
        }
    }
}

/// Runs a subscriber in a background task, re-subscribing whenever the
/// subscription fails or closes, until `shutdown` turns true.
///
/// Failed subscribe attempts back off exponentially from 1 s up to 5 minutes.
pub fn spawn_supervised(
    subscriber: Arc<InvalidationSubscriber>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let delay = match subscriber.run(shutdown.clone()).await {
                Ok(SubscriberExit::Cancelled) => break,
                Ok(SubscriberExit::StreamClosed) => {
                    backoff = INITIAL_BACKOFF;
                    INITIAL_BACKOFF
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Invalidation subscription failed, retrying"
                    );
                    let delay = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        tracing::info!("Invalidation supervisor stopped");
    })
}

/// Resolves once shutdown is signalled or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
