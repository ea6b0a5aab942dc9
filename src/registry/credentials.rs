use anyhow::Context;
use base64::prelude::*;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::TrackedImage;

#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The helper does not handle this registry; the chain moves on
    #[error("registry is not supported by this helper")]
    UnsupportedRegistry,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A source of registry credentials. Helpers advertise whether they are
/// active and either produce credentials or signal that the registry is
/// not theirs so the chain continues.
#[async_trait::async_trait]
pub trait CredentialsHelper: Send + Sync {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    async fn credentials(&self, image: &TrackedImage) -> Result<Credentials, CredentialsError>;
}

/// Ordered, immutable chain of credential helpers built at startup
pub struct CredentialsChain {
    helpers: Vec<Box<dyn CredentialsHelper>>,
}

impl Default for CredentialsChain {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialsChain {
    pub fn new() -> Self {
        Self {
            helpers: Vec::new(),
        }
    }

    pub fn register(mut self, helper: Box<dyn CredentialsHelper>) -> Self {
        debug!("credentials helper registered: {}", helper.name());
        self.helpers.push(helper);
        self
    }

    /// Walk the chain and return auth for the image. Helpers that do not
    /// support the registry are skipped; helper errors are logged and the
    /// chain continues. Falls back to anonymous access.
    pub async fn resolve(&self, image: &TrackedImage) -> RegistryAuth {
        for helper in &self.helpers {
            if !helper.is_enabled() {
                continue;
            }

            match helper.credentials(image).await {
                Ok(credentials) => {
                    debug!(
                        "credentials for {} resolved by helper {}",
                        image.image.remote(),
                        helper.name()
                    );
                    return RegistryAuth::Basic(credentials.username, credentials.password);
                },
                Err(CredentialsError::UnsupportedRegistry) => continue,
                Err(CredentialsError::Other(e)) => {
                    warn!(
                        "credentials helper {} failed for {}: {}",
                        helper.name(),
                        image.image.remote(),
                        e
                    );
                },
            }
        }

        RegistryAuth::Anonymous
    }
}

/// Docker config.json structure found in pull secrets
#[derive(Debug, Deserialize)]
struct DockerConfig {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Resolves credentials from Kubernetes image pull secrets: the secrets
/// named on the tracked image first, then the namespace default service
/// account's imagePullSecrets.
pub struct KubernetesSecretsHelper {
    client: Client,
}

impl KubernetesSecretsHelper {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn from_named_secrets(
        &self,
        namespace: &str,
        names: &[String],
        registry: &str,
    ) -> anyhow::Result<Option<Credentials>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        for name in names {
            let secret = match secrets.get(name).await {
                Ok(secret) => secret,
                Err(e) => {
                    warn!("failed to get secret {}/{}: {}", namespace, name, e);
                    continue;
                },
            };

            if let Some(credentials) = parse_pull_secret(&secret, registry)? {
                return Ok(Some(credentials));
            }
        }

        Ok(None)
    }

    async fn from_service_account(
        &self,
        namespace: &str,
        registry: &str,
    ) -> anyhow::Result<Option<Credentials>> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = match accounts.get("default").await {
            Ok(account) => account,
            Err(e) => {
                debug!("failed to get default service account: {}", e);
                return Ok(None);
            },
        };

        let names: Vec<String> = account
            .image_pull_secrets
            .unwrap_or_default()
            .into_iter()
            .map(|reference| reference.name)
            .collect();

        self.from_named_secrets(namespace, &names, registry).await
    }
}

#[async_trait::async_trait]
impl CredentialsHelper for KubernetesSecretsHelper {
    fn name(&self) -> &str {
        "kubernetes-secrets"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn credentials(&self, image: &TrackedImage) -> Result<Credentials, CredentialsError> {
        let registry = image.image.registry();

        if let Some(credentials) = self
            .from_named_secrets(&image.namespace, &image.secrets, registry)
            .await?
        {
            return Ok(credentials);
        }

        if let Some(credentials) = self.from_service_account(&image.namespace, registry).await? {
            return Ok(credentials);
        }

        Err(CredentialsError::UnsupportedRegistry)
    }
}

/// Extract credentials for a registry from a pull secret, handling both
/// the dockerconfigjson and legacy dockercfg formats.
fn parse_pull_secret(secret: &Secret, registry: &str) -> anyhow::Result<Option<Credentials>> {
    let data = match &secret.data {
        Some(data) => data,
        None => return Ok(None),
    };

    if let Some(config) = data.get(".dockerconfigjson") {
        let config: DockerConfig =
            serde_json::from_slice(&config.0).context("failed to parse .dockerconfigjson")?;
        return find_auth_entry(&config.auths, registry);
    }

    if let Some(config) = data.get(".dockercfg") {
        // Legacy format, same entries without the auths wrapper
        let auths: HashMap<String, DockerAuthEntry> =
            serde_json::from_slice(&config.0).context("failed to parse .dockercfg")?;
        return find_auth_entry(&auths, registry);
    }

    Ok(None)
}

fn find_auth_entry(
    auths: &HashMap<String, DockerAuthEntry>,
    registry: &str,
) -> anyhow::Result<Option<Credentials>> {
    if let Some(entry) = auths.get(registry) {
        return decode_auth_entry(entry);
    }

    for (key, entry) in auths {
        if registry_matches(key, registry) {
            return decode_auth_entry(entry);
        }
    }

    Ok(None)
}

fn decode_auth_entry(entry: &DockerAuthEntry) -> anyhow::Result<Option<Credentials>> {
    if !entry.username.is_empty() && !entry.password.is_empty() {
        return Ok(Some(Credentials {
            username: entry.username.clone(),
            password: entry.password.clone(),
        }));
    }

    if !entry.auth.is_empty() {
        let decoded = BASE64_STANDARD
            .decode(entry.auth.as_bytes())
            .context("failed to decode auth token")?;
        let auth = String::from_utf8(decoded).context("auth token is not valid UTF-8")?;

        if let Some((username, password)) = auth.split_once(':') {
            return Ok(Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }
    }

    Ok(None)
}

/// Check whether a docker config key refers to the target registry,
/// accounting for scheme prefixes and Docker Hub aliases.
fn registry_matches(key: &str, target: &str) -> bool {
    let key = key
        .trim_start_matches("https://")
        .trim_start_matches("http://");

    if key == target {
        return true;
    }

    if target == "index.docker.io" || target == "docker.io" {
        return matches!(
            key,
            "docker.io"
                | "index.docker.io"
                | "registry-1.docker.io"
                | "index.docker.io/v1/"
                | "registry-1.docker.io/v1/"
        );
    }

    false
}
