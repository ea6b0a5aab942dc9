use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{annotations, metadata_value};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy selector: {0:?}")]
    InvalidSelector(String),
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("failed to parse version {0:?}")]
    InvalidVersion(String),
}

/// How far a semver policy is allowed to move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemverLevel {
    Major,
    Minor,
    Patch,
    /// Any increase
    All,
}

impl fmt::Display for SemverLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemverLevel::Major => write!(f, "major"),
            SemverLevel::Minor => write!(f, "minor"),
            SemverLevel::Patch => write!(f, "patch"),
            SemverLevel::All => write!(f, "all"),
        }
    }
}

/// Update policy attached to a managed resource. Decisions are pure
/// functions over the current and candidate tags; no I/O.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Never update
    None,
    /// Always update when the repository matches; with `match_tag` the
    /// candidate tag must equal the current one (same-tag re-roll)
    Force { match_tag: bool },
    Semver {
        level: SemverLevel,
        match_pre_release: bool,
    },
    Glob { pattern: String, matcher: Regex },
    Regexp { pattern: String, matcher: Regex },
}

impl Policy {
    /// Parse a policy selector: `all|major|minor|patch|force|none`,
    /// `glob:<pattern>` or `regexp:<pattern>`.
    pub fn parse(selector: &str, match_tag: bool, match_pre_release: bool) -> Result<Self, PolicyError> {
        let trimmed = selector.trim();

        if let Some(pattern) = trimmed.strip_prefix("glob:") {
            let matcher = glob_to_regex(pattern)?;
            return Ok(Policy::Glob {
                pattern: pattern.to_string(),
                matcher,
            });
        }

        if let Some(pattern) = trimmed.strip_prefix("regexp:") {
            let matcher = Regex::new(pattern).map_err(|source| PolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(Policy::Regexp {
                pattern: pattern.to_string(),
                matcher,
            });
        }

        let level = match trimmed.to_lowercase().as_str() {
            "none" | "" => return Ok(Policy::None),
            "force" => return Ok(Policy::Force { match_tag }),
            "all" => SemverLevel::All,
            "major" => SemverLevel::Major,
            "minor" => SemverLevel::Minor,
            "patch" => SemverLevel::Patch,
            _ => return Err(PolicyError::InvalidSelector(selector.to_string())),
        };

        Ok(Policy::Semver {
            level,
            match_pre_release,
        })
    }

    /// Resolve the effective policy from resource metadata. Annotations
    /// take precedence over labels; missing or unparseable selectors
    /// resolve to `None`.
    pub fn from_metadata(
        labels: &BTreeMap<String, String>,
        annotations_map: &BTreeMap<String, String>,
    ) -> Policy {
        let selector = match metadata_value(labels, annotations_map, annotations::POLICY) {
            Some(s) => s,
            None => return Policy::None,
        };

        let match_tag = metadata_value(labels, annotations_map, annotations::MATCH_TAG)
            .or_else(|| metadata_value(labels, annotations_map, annotations::MATCH_TAG_LEGACY))
            .map(|v| v == "true")
            .unwrap_or(false);

        let match_pre_release =
            metadata_value(labels, annotations_map, annotations::MATCH_PRE_RELEASE)
                .map(|v| v != "false")
                .unwrap_or(true);

        match Policy::parse(selector, match_tag, match_pre_release) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!("invalid policy selector {:?}: {}", selector, e);
                Policy::None
            },
        }
    }

    /// Human-readable policy name for logs and notifications
    pub fn name(&self) -> String {
        match self {
            Policy::None => "none".to_string(),
            Policy::Force { match_tag: false } => "force".to_string(),
            Policy::Force { match_tag: true } => "force (match tag)".to_string(),
            Policy::Semver { level, .. } => format!("semver ({})", level),
            Policy::Glob { pattern, .. } => format!("glob:{}", pattern),
            Policy::Regexp { pattern, .. } => format!("regexp:{}", pattern),
        }
    }

    /// Decide whether the candidate tag warrants an update from the
    /// current tag. Semver policies fail closed on unparseable versions.
    pub fn should_update(&self, current: &str, candidate: &str) -> Result<bool, PolicyError> {
        match self {
            Policy::None => Ok(false),
            Policy::Force { match_tag } => {
                if *match_tag {
                    Ok(current == candidate)
                } else {
                    Ok(true)
                }
            },
            Policy::Semver {
                level,
                match_pre_release,
            } => semver_should_update(*level, *match_pre_release, current, candidate),
            Policy::Glob { matcher, .. } | Policy::Regexp { matcher, .. } => {
                Ok(candidate != current && matcher.is_match(candidate))
            },
        }
    }
}

fn parse_semver(tag: &str) -> Result<semver::Version, PolicyError> {
    let candidate = tag.trim().strip_prefix('v').unwrap_or(tag.trim());
    semver::Version::parse(candidate).map_err(|_| PolicyError::InvalidVersion(tag.to_string()))
}

fn semver_should_update(
    level: SemverLevel,
    match_pre_release: bool,
    current: &str,
    candidate: &str,
) -> Result<bool, PolicyError> {
    let current = parse_semver(current)?;
    let candidate = parse_semver(candidate)?;

    if candidate.cmp_precedence(&current) != std::cmp::Ordering::Greater {
        return Ok(false);
    }

    if !match_pre_release && (!current.pre.is_empty() || !candidate.pre.is_empty()) {
        return Ok(false);
    }

    // Pre-release identifiers must agree; an empty identifier on one side
    // only never matches a set one on the other
    if match_pre_release && current.pre != candidate.pre {
        return Ok(false);
    }

    let allowed = match level {
        SemverLevel::Patch => {
            candidate.major == current.major && candidate.minor == current.minor
        },
        SemverLevel::Minor => candidate.major == current.major,
        SemverLevel::Major | SemverLevel::All => true,
    };

    Ok(allowed)
}

/// Compile a glob pattern (`*` wildcards) into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex, PolicyError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|source| PolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl FromStr for Policy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Policy::parse(s, false, true)
    }
}
