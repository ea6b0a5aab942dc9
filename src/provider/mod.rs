use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error};

pub mod helm;
pub mod kubernetes;

use crate::models::{Event, TrackedImage};

/// Capacity of each provider's inbox. Producers block when a dispatcher
/// falls this far behind.
pub const EVENT_INBOX_SIZE: usize = 100;

/// A per-surface dispatcher that turns events into applied plans
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queue an event for processing. Blocks when the inbox is full.
    async fn submit(&self, event: Event) -> Result<()>;

    /// Images currently referenced by resources this provider manages
    async fn tracked_images(&self) -> Result<Vec<TrackedImage>>;
}

/// Registered providers. Trigger sources fan each event out to all of
/// them; providers decide for themselves whether an event is relevant.
#[derive(Clone)]
pub struct Providers {
    inner: Arc<Vec<Arc<dyn Provider>>>,
}

impl Providers {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            inner: Arc::new(providers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub async fn submit_all(&self, event: Event) {
        debug!(
            "submitting event for {} to {} providers",
            event.repository,
            self.inner.len()
        );
        for provider in self.inner.iter() {
            if let Err(e) = provider.submit(event.clone()).await {
                error!(
                    "provider {} failed to accept event for {}: {}",
                    provider.name(),
                    event.repository,
                    e
                );
            }
        }
    }

    /// Union of tracked images across providers. A failing provider is
    /// logged and skipped so one surface cannot stall the poller.
    pub async fn tracked_images(&self) -> Vec<TrackedImage> {
        let mut images = Vec::new();
        for provider in self.inner.iter() {
            match provider.tracked_images().await {
                Ok(mut tracked) => images.append(&mut tracked),
                Err(e) => {
                    error!(
                        "provider {} failed to list tracked images: {}",
                        provider.name(),
                        e
                    );
                },
            }
        }
        images
    }
}
