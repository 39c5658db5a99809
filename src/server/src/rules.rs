//! The rule registry.
//!
//! Merges rules from two sources: static configuration documents and
//! dynamically watched resources from the orchestration API. A sorted
//! projection of the union is memoized; any dynamic add/update/delete
//! invalidates it and the next read recomputes it. A separate registry
//! map provides per-host upstream credentials.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use stratum_core::config::{Document, ImageSpec, RegistrySpec};
use stratum_core::Result;

use crate::rule::{Action, Rule};

/// Credentials and transport options for one registry host.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryCredentials {
    fn from_spec(spec: &RegistrySpec) -> Self {
        let (username, password) = match spec.basic_auth() {
            Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
            None => (None, None),
        };
        Self {
            insecure: spec.insecure,
            username,
            password,
        }
    }
}

#[derive(Default)]
struct DynamicState {
    /// Watched Image resources by name.
    images: BTreeMap<String, ImageSpec>,
    /// Watched Registry resources by name.
    registries: BTreeMap<String, RegistrySpec>,
    /// Memoized sorted rule projection; `None` after invalidation.
    sorted: Option<Arc<Vec<Arc<Rule>>>>,
    /// Memoized credential map; `None` after invalidation.
    credentials: Option<Arc<HashMap<String, RegistryCredentials>>>,
}

/// Static + dynamic rule union with a memoized sorted view.
pub struct RuleRegistry {
    static_rules: Vec<Arc<Rule>>,
    static_registries: Vec<RegistrySpec>,
    dynamic: Mutex<DynamicState>,
}

impl RuleRegistry {
    /// Build the registry from static configuration documents.
    ///
    /// A static rule with an ill-formed pattern is rejected here, which
    /// makes it fatal at startup.
    pub fn new(documents: Vec<Document>) -> Result<Self> {
        let mut static_rules = Vec::new();
        let mut static_registries = Vec::new();

        for document in documents {
            match document {
                Document::Image { spec, .. } => {
                    static_rules.push(Arc::new(Rule::new(&spec)?));
                }
                Document::Registry { spec, .. } => static_registries.push(spec),
            }
        }

        Ok(Self {
            static_rules,
            static_registries,
            dynamic: Mutex::new(DynamicState::default()),
        })
    }

    /// Resolve a requested reference to the first matching rule's action.
    pub fn resolve(&self, image: &str) -> Option<Action> {
        let rules = self.snapshot();
        rules.iter().find_map(|rule| rule.matches(image))
    }

    /// The current sorted rule projection, recomputing it if invalidated.
    ///
    /// The projection is rebuilt under the lock, so readers always see a
    /// fully recomputed snapshot.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Rule>>> {
        let mut state = self.dynamic.lock().unwrap();
        if let Some(sorted) = &state.sorted {
            return Arc::clone(sorted);
        }

        let mut rules: Vec<Arc<Rule>> =
            Vec::with_capacity(self.static_rules.len() + state.images.len());
        rules.extend(self.static_rules.iter().cloned());

        for (name, spec) in &state.images {
            match Rule::new(spec) {
                Ok(rule) => rules.push(Arc::new(rule)),
                Err(e) => {
                    tracing::error!(resource = %name, error = %e, "skipping watched rule");
                }
            }
        }

        // Stable sort: ties keep configuration order.
        rules.sort_by(|a, b| a.specificity(b));

        let sorted = Arc::new(rules);
        state.sorted = Some(Arc::clone(&sorted));
        sorted
    }

    /// Credentials for a registry host, or `None` for anonymous.
    pub fn credentials_for(&self, host: &str) -> Option<RegistryCredentials> {
        let mut state = self.dynamic.lock().unwrap();
        if state.credentials.is_none() {
            let mut map = HashMap::new();
            for spec in &self.static_registries {
                map.insert(spec.host(), RegistryCredentials::from_spec(spec));
            }
            for spec in state.registries.values() {
                map.insert(spec.host(), RegistryCredentials::from_spec(spec));
            }
            state.credentials = Some(Arc::new(map));
        }

        state
            .credentials
            .as_ref()
            .and_then(|map| map.get(host))
            .cloned()
    }

    /// Replace the watched Image set (initial list or relist).
    pub fn set_images(&self, images: BTreeMap<String, ImageSpec>) {
        let mut state = self.dynamic.lock().unwrap();
        state.images = images;
        state.sorted = None;
    }

    pub fn upsert_image(&self, name: String, spec: ImageSpec) {
        let mut state = self.dynamic.lock().unwrap();
        state.images.insert(name, spec);
        state.sorted = None;
    }

    pub fn delete_image(&self, name: &str) {
        let mut state = self.dynamic.lock().unwrap();
        state.images.remove(name);
        state.sorted = None;
    }

    /// Replace the watched Registry set (initial list or relist).
    ///
    /// Registry events invalidate the cached credential map only; the
    /// rule projection and watch state are untouched.
    pub fn set_registries(&self, registries: BTreeMap<String, RegistrySpec>) {
        let mut state = self.dynamic.lock().unwrap();
        state.registries = registries;
        state.credentials = None;
    }

    pub fn upsert_registry(&self, name: String, spec: RegistrySpec) {
        let mut state = self.dynamic.lock().unwrap();
        state.registries.insert(name, spec);
        state.credentials = None;
    }

    pub fn delete_registry(&self, name: &str) {
        let mut state = self.dynamic.lock().unwrap();
        state.registries.remove(name);
        state.credentials = None;
    }
}
