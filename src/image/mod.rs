use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// `algorithm:hex` digest form
static DIGEST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]+$").unwrap());

/// Canonical public registry assumed when an image has no explicit host
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Namespace inserted for single-segment repositories on the default registry
pub const DEFAULT_NAMESPACE: &str = "library";

/// Tag assumed when none is given
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty image reference")]
    Empty,
    #[error("empty repository in image reference {0:?}")]
    EmptyRepository(String),
    #[error("invalid digest in image reference {0:?}")]
    InvalidDigest(String),
}

/// A parsed container image reference.
///
/// Equality and hashing consider only the registry and repository, so two
/// references to the same repository compare equal regardless of tag or
/// digest. `Display` emits the normalised long form and round-trips
/// through `parse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: String,
    digest: Option<String>,
}

impl Reference {
    /// Parse `[scheme://][host[:port]/]repo[:tag][@digest]`.
    ///
    /// A leading segment counts as a host only when it contains a `.` or
    /// `:` or is `localhost`; otherwise it belongs to the repository and
    /// the default registry is assumed. Single-segment repositories on the
    /// default registry gain the library namespace.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        // Scheme prefixes show up in chart repository URLs
        let without_scheme = match trimmed.find("://") {
            Some(idx) => &trimmed[idx + 3..],
            None => trimmed,
        };

        let (remainder, digest) = match without_scheme.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_PATTERN.is_match(digest) {
                    return Err(ParseError::InvalidDigest(raw.to_string()));
                }
                (rest, Some(digest.to_string()))
            },
            None => (without_scheme, None),
        };

        let (registry, rest) = match remainder.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), rest)
            },
            _ => (DEFAULT_REGISTRY.to_string(), remainder),
        };

        // Tag separator is the last colon after the last slash
        let (mut repository, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                (rest[..idx].to_string(), rest[idx + 1..].to_string())
            },
            _ => (rest.to_string(), DEFAULT_TAG.to_string()),
        };

        if repository.is_empty() {
            return Err(ParseError::EmptyRepository(raw.to_string()));
        }

        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{}/{}", DEFAULT_NAMESPACE, repository);
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository` identity, without tag or digest
    pub fn remote(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Repository name without the inserted library namespace, as it would
    /// appear in a Docker Hub style short reference
    pub fn short_name(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
        } else {
            &self.repository
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl Eq for Reference {}

impl std::hash::Hash for Reference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.registry.hash(state);
        self.repository.hash(state);
    }
}

impl std::str::FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

/// Rewrite the tag of a raw image string while preserving its original
/// registry and namespace form, so short references stay short.
pub fn with_tag(raw: &str, tag: &str) -> String {
    let (without_digest, _) = match raw.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (raw, None),
    };

    let base = match without_digest.rfind(':') {
        Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
        _ => without_digest,
    };

    format!("{}:{}", base, tag)
}
