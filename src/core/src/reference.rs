//! Image reference parsing.
//!
//! A served reference is `<repository>:<tag>` or `<repository>@sha256:<hex>`.
//! The repository may contain `/`. A missing tag defaults to `latest`.
//! These are the references the server itself answers for; upstream pulls
//! go through the registry client's own reference type.

use crate::error::{Error, Result};

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed served reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Repository path, possibly with slashes (e.g. `example.com/demo`).
    pub repository: String,
    /// Tag, when addressed by tag.
    pub tag: Option<String>,
    /// Digest, when addressed by digest.
    pub digest: Option<String>,
}

impl Reference {
    /// Build a tag reference directly from its parts.
    pub fn with_tag(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::ConfigInvalid("empty image reference".to_string()));
        }

        if let Some((name, digest)) = reference.split_once('@') {
            if !digest.starts_with("sha256:") {
                return Err(Error::ConfigInvalid(format!(
                    "invalid digest in reference {:?}",
                    reference
                )));
            }
            return Ok(Self {
                repository: name.to_string(),
                tag: None,
                digest: Some(digest.to_string()),
            });
        }

        // The tag separator is the last colon after the last slash.
        let after_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[after_slash..].rfind(':') {
            Some(idx) => {
                let colon = after_slash + idx;
                Ok(Self {
                    repository: reference[..colon].to_string(),
                    tag: Some(reference[colon + 1..].to_string()),
                    digest: None,
                })
            }
            None => Ok(Self {
                repository: reference.to_string(),
                tag: Some(DEFAULT_TAG.to_string()),
                digest: None,
            }),
        }
    }

    /// Tag or digest identifier.
    pub fn identifier(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.digest.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => write!(f, "{}:{}", self.repository, tag),
            (None, Some(digest)) => write!(f, "{}@{}", self.repository, digest),
            (None, None) => write!(f, "{}:{}", self.repository, DEFAULT_TAG),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let r = Reference::parse("example.com/demo:3.20").unwrap();
        assert_eq!(r.repository, "example.com/demo");
        assert_eq!(r.tag.as_deref(), Some("3.20"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_defaults_latest() {
        let r = Reference::parse("example.com/demo").unwrap();
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_registry_port_is_not_a_tag() {
        let r = Reference::parse("registry.local:5000/demo").unwrap();
        assert_eq!(r.repository, "registry.local:5000/demo");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest() {
        let digest = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        let r = Reference::parse(&format!("example.com/demo@{digest}")).unwrap();
        assert_eq!(r.repository, "example.com/demo");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(digest));
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(Reference::parse("demo@md5:abc").is_err());
        assert!(Reference::parse("").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let r = Reference::parse("example.com/demo:3.20").unwrap();
        assert_eq!(r.to_string(), "example.com/demo:3.20");
    }

    #[test]
    fn test_identifier() {
        assert_eq!(Reference::with_tag("a", "b").identifier(), "b");
    }
}
