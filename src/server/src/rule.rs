//! Build rules and matched actions.
//!
//! A [`Rule`] is an immutable compiled form of an `Image` configuration
//! document. Matching a requested reference against a rule yields an
//! [`Action`]: the captured parameters plus a counted handle to the rule,
//! from which the concrete base image, mutations, and storage target are
//! derived.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use stratum_core::config::{ImageSpec, Mutate, PlatformSelector};
use stratum_core::Result;

use crate::pattern::{substitute, Pattern};

/// Default OS injected when the base image carries no platform.
pub const DEFAULT_OS: &str = "linux";
/// Default architecture injected when the base image carries no platform.
pub const DEFAULT_ARCH: &str = "amd64";

/// A compiled build rule.
#[derive(Debug)]
pub struct Rule {
    pattern: Pattern,
    raw_pattern: String,
    base_image: String,
    mutates: Vec<Mutate>,
    storage_image: Option<String>,
    platforms: Option<Vec<PlatformSelector>>,
}

impl Rule {
    /// Compile a rule; an ill-formed pattern is rejected here.
    pub fn new(spec: &ImageSpec) -> Result<Self> {
        Ok(Self {
            pattern: Pattern::parse(&spec.pattern)?,
            raw_pattern: spec.pattern.clone(),
            base_image: spec.base_image.clone(),
            mutates: spec.mutates.clone(),
            storage_image: spec.storage_image.clone(),
            platforms: spec.platforms.clone(),
        })
    }

    /// The pattern string the rule was built from.
    pub fn pattern_str(&self) -> &str {
        &self.raw_pattern
    }

    /// Match a requested reference, producing an action on success.
    pub fn matches(self: &Arc<Self>, image: &str) -> Option<Action> {
        let params = self.pattern.matches(image)?;
        Some(Action {
            params,
            matched: image.to_string(),
            rule: Arc::clone(self),
        })
    }

    /// Specificity comparison for rule ordering.
    pub fn specificity(&self, other: &Rule) -> Ordering {
        self.pattern.specificity(&other.pattern)
    }

    /// Whether the rule's platform filter admits `(os, arch)`.
    ///
    /// A rule without a filter admits everything.
    pub fn allows_platform(&self, os: &str, arch: &str) -> bool {
        match &self.platforms {
            None => true,
            Some(list) => list.iter().any(|p| p.os == os && p.architecture == arch),
        }
    }
}

/// A rule bound to a concrete request and its parameter substitutions.
#[derive(Debug, Clone)]
pub struct Action {
    params: HashMap<String, String>,
    matched: String,
    rule: Arc<Rule>,
}

impl Action {
    /// The reference that matched the rule.
    pub fn matched(&self) -> &str {
        &self.matched
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// The concrete base image reference.
    pub fn base_image(&self) -> String {
        substitute(&self.rule.base_image, &self.params)
    }

    /// The concrete storage image reference, when the rule declares one.
    pub fn storage_image(&self) -> Option<String> {
        self.rule
            .storage_image
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| substitute(s, &self.params))
    }

    /// The rule's mutations with parameters substituted, including the
    /// per-platform `GOOS`/`GOARCH` injection.
    pub fn mutates(&self, platform: Option<(&str, &str)>) -> Vec<Mutate> {
        let (os, arch) = platform.unwrap_or((DEFAULT_OS, DEFAULT_ARCH));

        let mut params = self.params.clone();
        params.insert("GOOS".to_string(), os.to_string());
        params.insert("GOARCH".to_string(), arch.to_string());

        self.rule
            .mutates
            .iter()
            .map(|m| match m {
                Mutate::File(f) => {
                    let mut f = f.clone();
                    f.source = substitute(&f.source, &params);
                    f.destination = substitute(&f.destination, &params);
                    Mutate::File(f)
                }
                Mutate::Model(m) => {
                    let mut m = m.clone();
                    m.model = substitute(&m.model, &params);
                    m.work_dir = substitute(&m.work_dir, &params);
                    m.model_name = m.model_name.map(|n| substitute(&n, &params));
                    Mutate::Model(m)
                }
            })
            .collect()
    }
}
