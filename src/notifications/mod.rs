use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

mod webhook;

pub use webhook::{WebhookSink, WebhookSinkConfig};

use crate::metrics;
use crate::models::{EventNotification, Level};

/// Delivery attempts per sink before a notification is dropped
const DELIVERY_ATTEMPTS: u32 = 10;

/// Initial backoff between delivery attempts
const BACKOFF_BASE_MS: u64 = 500;

/// Backoff ceiling
const BACKOFF_MAX_MS: u64 = 60_000;

/// A notification destination. Adapters implement delivery only; retry
/// and level filtering belong to the bus.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &EventNotification) -> Result<()>;
}

/// Builds the immutable sink registry at startup
pub struct SenderBuilder {
    min_level: Level,
    sinks: Vec<Box<dyn Sink>>,
}

impl SenderBuilder {
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            sinks: Vec::new(),
        }
    }

    pub fn register(mut self, sink: Box<dyn Sink>) -> Self {
        info!("notification sink registered: {}", sink.name());
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Sender {
        info!(
            "notification sender initialized with {} sinks, minimum level {}",
            self.sinks.len(),
            self.min_level
        );
        Sender {
            inner: Arc::new(SenderInner {
                min_level: self.min_level,
                sinks: self.sinks,
            }),
        }
    }
}

struct SenderInner {
    min_level: Level,
    sinks: Vec<Box<dyn Sink>>,
}

/// Level-filtered fan-out to the registered sinks. Cloning is cheap; the
/// registry itself is immutable after startup.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    /// A sender with no sinks, for tests and wiring defaults
    pub fn disabled() -> Self {
        SenderBuilder::new(Level::Info).build()
    }

    /// Fan a notification out to every sink. Fire and forget: delivery
    /// (with retries) happens in background tasks and failures never
    /// reach the caller.
    pub fn send(&self, notification: EventNotification) {
        if notification.level < self.inner.min_level {
            debug!(
                "skipping notification {:?} below minimum level {}",
                notification.name, self.inner.min_level
            );
            return;
        }

        if self.inner.sinks.is_empty() {
            return;
        }

        for idx in 0..self.inner.sinks.len() {
            let inner = self.inner.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                deliver(&*inner.sinks[idx], &notification).await;
            });
        }
    }
}

/// Deliver to one sink with exponential backoff. Gives up after
/// DELIVERY_ATTEMPTS.
async fn deliver(sink: &dyn Sink, notification: &EventNotification) {
    let mut backoff_ms = BACKOFF_BASE_MS;

    for attempt in 1..=DELIVERY_ATTEMPTS {
        match sink.send(notification).await {
            Ok(()) => {
                debug!(
                    "notification {:?} delivered via {} (attempt {})",
                    notification.name,
                    sink.name(),
                    attempt
                );
                metrics::NOTIFICATIONS_SENT_TOTAL.inc();
                return;
            },
            Err(e) => {
                debug!(
                    "failed to deliver notification via {} (attempt {}/{}): {}",
                    sink.name(),
                    attempt,
                    DELIVERY_ATTEMPTS,
                    e
                );
            },
        }

        if attempt < DELIVERY_ATTEMPTS {
            let jitter = rand::random_range(0..backoff_ms / 2 + 1);
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
            backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
        }
    }

    error!(
        "giving up on notification {:?} via {} after {} attempts",
        notification.name,
        sink.name(),
        DELIVERY_ATTEMPTS
    );
    metrics::NOTIFICATIONS_FAILED_TOTAL.inc();
}
