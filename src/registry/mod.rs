use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client as OciClient, Reference as OciReference};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod credentials;

pub use credentials::{Credentials, CredentialsChain, CredentialsError, CredentialsHelper};

use crate::image::Reference;
use crate::metrics;

/// Per-call timeout for registry operations
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Attempts before a registry operation is given up for this cycle
const RETRY_ATTEMPTS: u32 = 3;

/// Initial retry backoff
const RETRY_BASE_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),
    #[error("registry request timed out after {0}s")]
    Timeout(u64),
    #[error("registry request failed: {0}")]
    Api(#[from] oci_distribution::errors::OciDistributionError),
}

/// Distribution-spec registry access. The underlying client follows the
/// `WWW-Authenticate` challenge to the token endpoint and retries with a
/// bearer token; this wrapper adds timeouts and retry with backoff.
/// Results are never cached across polls.
pub struct RegistryClient {
    timeout: Duration,
    attempts: u32,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            attempts: RETRY_ATTEMPTS,
        }
    }

    /// Enumerate the repository's tags.
    pub async fn tags(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<Vec<String>, RegistryError> {
        let reference = to_oci_reference(image)?;
        let mut last_error = None;
        let mut backoff_ms = RETRY_BASE_MS;

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let jitter = rand::random_range(0..backoff_ms / 2 + 1);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms *= 2;
            }

            let client = OciClient::new(Default::default());
            let result = tokio::time::timeout(
                self.timeout,
                client.list_tags(&reference, auth, None, None),
            )
            .await;

            match result {
                Ok(Ok(response)) => {
                    debug!(
                        "listed {} tags for {}",
                        response.tags.len(),
                        image.remote()
                    );
                    return Ok(response.tags);
                },
                Ok(Err(e)) => {
                    warn!(
                        "failed to list tags for {} (attempt {}/{}): {}",
                        image.remote(),
                        attempt,
                        self.attempts,
                        e
                    );
                    metrics::REGISTRY_ERRORS_TOTAL.inc();
                    last_error = Some(RegistryError::Api(e));
                },
                Err(_) => {
                    warn!(
                        "listing tags for {} timed out (attempt {}/{})",
                        image.remote(),
                        attempt,
                        self.attempts
                    );
                    metrics::REGISTRY_ERRORS_TOTAL.inc();
                    last_error = Some(RegistryError::Timeout(self.timeout.as_secs()));
                },
            }
        }

        Err(last_error.expect("at least one attempt"))
    }

    /// Fetch the manifest digest for the image's tag. The digest is the
    /// authoritative identity for a floating tag.
    pub async fn digest(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<String, RegistryError> {
        let reference = to_oci_reference(image)?;
        let mut last_error = None;
        let mut backoff_ms = RETRY_BASE_MS;

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let jitter = rand::random_range(0..backoff_ms / 2 + 1);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms *= 2;
            }

            let client = OciClient::new(Default::default());
            let result = tokio::time::timeout(
                self.timeout,
                client.fetch_manifest_digest(&reference, auth),
            )
            .await;

            match result {
                Ok(Ok(digest)) => {
                    debug!("digest for {}: {}", image, digest);
                    return Ok(digest);
                },
                Ok(Err(e)) => {
                    warn!(
                        "failed to fetch digest for {} (attempt {}/{}): {}",
                        image, attempt, self.attempts, e
                    );
                    metrics::REGISTRY_ERRORS_TOTAL.inc();
                    last_error = Some(RegistryError::Api(e));
                },
                Err(_) => {
                    warn!(
                        "digest fetch for {} timed out (attempt {}/{})",
                        image, attempt, self.attempts
                    );
                    metrics::REGISTRY_ERRORS_TOTAL.inc();
                    last_error = Some(RegistryError::Timeout(self.timeout.as_secs()));
                },
            }
        }

        Err(last_error.expect("at least one attempt"))
    }
}

fn to_oci_reference(image: &Reference) -> Result<OciReference, RegistryError> {
    let raw = format!("{}/{}:{}", image.registry(), image.repository(), image.tag());
    OciReference::try_from(raw.as_str()).map_err(|_| RegistryError::InvalidReference(raw))
}
