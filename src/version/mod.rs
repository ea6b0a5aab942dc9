use std::cmp::Ordering;
use std::fmt;

/// A container image tag interpreted as a version.
///
/// Tags that parse as SemVer are compared by SemVer 2.0 precedence with
/// build metadata ignored. Everything else (`latest`, `master`, date
/// stamps) is opaque and only supports equality.
#[derive(Debug, Clone)]
pub enum Version {
    Semver {
        version: semver::Version,
        original: String,
    },
    Opaque(String),
}

impl Version {
    /// Parse a tag, tolerating a leading `v` prefix.
    pub fn parse(tag: &str) -> Self {
        let trimmed = tag.trim();
        let candidate = trimmed.strip_prefix('v').unwrap_or(trimmed);

        match semver::Version::parse(candidate) {
            Ok(version) => Version::Semver {
                version,
                original: trimmed.to_string(),
            },
            Err(_) => Version::Opaque(trimmed.to_string()),
        }
    }

    pub fn is_semver(&self) -> bool {
        matches!(self, Version::Semver { .. })
    }

    pub fn as_semver(&self) -> Option<&semver::Version> {
        match self {
            Version::Semver { version, .. } => Some(version),
            Version::Opaque(_) => None,
        }
    }

    pub fn original(&self) -> &str {
        match self {
            Version::Semver { original, .. } => original,
            Version::Opaque(original) => original,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        matches!(compare(self, other), Some(Ordering::Equal))
    }
}

/// Compare two versions. SemVer pairs compare by precedence (metadata
/// ignored); opaque tags are equal when their strings match and
/// incomparable otherwise.
pub fn compare(a: &Version, b: &Version) -> Option<Ordering> {
    match (a, b) {
        (Version::Semver { version: a, .. }, Version::Semver { version: b, .. }) => {
            Some(a.cmp_precedence(b))
        },
        _ => {
            if a.original() == b.original() {
                Some(Ordering::Equal)
            } else {
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &str, b: &str) -> Option<Ordering> {
        compare(&Version::parse(a), &Version::parse(b))
    }

    #[test]
    fn test_parse_semver() {
        let version = Version::parse("1.2.3");
        assert!(version.is_semver());
        assert_eq!(version.as_semver().unwrap().major, 1);
        assert_eq!(version.original(), "1.2.3");
    }

    #[test]
    fn test_parse_v_prefix() {
        let version = Version::parse("v1.2.3");
        assert!(version.is_semver());
        assert_eq!(version.original(), "v1.2.3");
    }

    #[test]
    fn test_parse_opaque() {
        assert!(!Version::parse("latest").is_semver());
        assert!(!Version::parse("master").is_semver());
        assert!(!Version::parse("2024-01-15").is_semver());
    }

    #[test]
    fn test_semver_precedence() {
        assert_eq!(cmp("1.2.3", "1.2.4"), Some(Ordering::Less));
        assert_eq!(cmp("1.2.3", "1.2.3"), Some(Ordering::Equal));
        assert_eq!(cmp("2.0.0", "1.9.9"), Some(Ordering::Greater));

        // Pre-release sorts before the release
        assert_eq!(cmp("1.0.0-rc.1", "1.0.0"), Some(Ordering::Less));
        // Numeric identifiers compare numerically
        assert_eq!(cmp("1.0.0-rc.2", "1.0.0-rc.10"), Some(Ordering::Less));
        // Alphabetic beats numeric
        assert_eq!(cmp("1.0.0-1", "1.0.0-alpha"), Some(Ordering::Less));
    }

    #[test]
    fn test_metadata_ignored() {
        assert_eq!(cmp("1.0.0+build1", "1.0.0+build2"), Some(Ordering::Equal));
    }

    #[test]
    fn test_opaque_comparison() {
        assert_eq!(cmp("latest", "latest"), Some(Ordering::Equal));
        assert_eq!(cmp("latest", "master"), None);
        assert_eq!(cmp("latest", "1.0.0"), None);
    }
}
