//! Attribute-indexed capability store
//!
//! A [`CapabilitySet`] holds the capabilities of one namespace and answers
//! filter queries. Equality tests on indexed attributes are served from a
//! per-attribute value index; every other filter leaf is evaluated against
//! the candidates that survive the indexed part of the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use graft_core::types::{Capability, CapabilityKey, Filter, Version};

type ValueIndex = HashMap<String, HashSet<CapabilityKey>>;

/// Indexed set of capabilities for one namespace
#[derive(Debug, Default)]
pub struct CapabilitySet {
    /// attribute name -> attribute value -> capabilities carrying it
    indices: HashMap<String, ValueIndex>,
    /// All capabilities in the set
    capabilities: HashMap<CapabilityKey, Arc<Capability>>,
}

impl CapabilitySet {
    /// Create a set indexing the given attribute names
    pub fn new(index_attrs: &[&str]) -> Self {
        Self {
            indices: index_attrs
                .iter()
                .map(|attr| (attr.to_string(), ValueIndex::new()))
                .collect(),
            capabilities: HashMap::new(),
        }
    }

    /// Add a capability; adding an already present capability is a no-op
    pub fn add_capability(&mut self, capability: Arc<Capability>) {
        let key = capability.key();
        if self.capabilities.contains_key(&key) {
            return;
        }

        for (attr, index) in self.indices.iter_mut() {
            if let Some(value) = capability.attributes.get(attr) {
                for value_key in value.index_keys() {
                    index.entry(value_key).or_default().insert(key);
                }
            }
        }
        self.capabilities.insert(key, capability);
    }

    /// Remove a capability, returning whether it was present
    pub fn remove_capability(&mut self, capability: &Capability) -> bool {
        let key = capability.key();
        let Some(stored) = self.capabilities.remove(&key) else {
            return false;
        };

        for (attr, index) in self.indices.iter_mut() {
            if let Some(value) = stored.attributes.get(attr) {
                for value_key in value.index_keys() {
                    if let Some(keys) = index.get_mut(&value_key) {
                        keys.remove(&key);
                        if keys.is_empty() {
                            index.remove(&value_key);
                        }
                    }
                }
            }
        }
        true
    }

    /// Check if a capability is present
    pub fn contains(&self, capability: &Capability) -> bool {
        self.capabilities.contains_key(&capability.key())
    }

    /// Number of capabilities in the set
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// All capabilities, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Capability>> {
        self.capabilities.values()
    }

    /// Find capabilities matching `filter`.
    ///
    /// With `obey_mandatory`, a capability only matches when the filter names
    /// every attribute the capability declares mandatory.
    pub fn matches(&self, filter: &Filter, obey_mandatory: bool) -> Vec<Arc<Capability>> {
        let keys = self.match_keys(None, filter);
        let mentioned = filter.attribute_names();

        let mut result: Vec<Arc<Capability>> = keys
            .into_iter()
            .filter_map(|key| self.capabilities.get(&key))
            .filter(|cap| {
                !obey_mandatory
                    || cap
                        .mandatory_attributes()
                        .iter()
                        .all(|attr| mentioned.contains(attr))
            })
            .cloned()
            .collect();
        result.sort_by_key(|cap| cap.key());
        result
    }

    /// Keys matching `filter` within `scope` (`None` means the whole set)
    fn match_keys(
        &self,
        scope: Option<&HashSet<CapabilityKey>>,
        filter: &Filter,
    ) -> HashSet<CapabilityKey> {
        match filter {
            Filter::MatchAll => self.scope_keys(scope),
            Filter::And(filters) => {
                let mut ordered: Vec<&Filter> = filters.iter().collect();
                ordered.sort_by_key(|f| !self.is_indexed_equality(f));

                let mut current: Option<HashSet<CapabilityKey>> = scope.cloned();
                for sub in ordered {
                    let narrowed = self.match_keys(current.as_ref(), sub);
                    if narrowed.is_empty() {
                        return narrowed;
                    }
                    current = Some(narrowed);
                }
                current.unwrap_or_else(|| self.scope_keys(None))
            }
            Filter::Or(filters) => filters
                .iter()
                .flat_map(|sub| self.match_keys(scope, sub))
                .collect(),
            Filter::Not(sub) => {
                let excluded = self.match_keys(scope, sub);
                self.scope_keys(scope)
                    .into_iter()
                    .filter(|key| !excluded.contains(key))
                    .collect()
            }
            Filter::Equal { attr, value } if self.indices.contains_key(attr) => {
                let index = &self.indices[attr];
                lookup_variants(value)
                    .iter()
                    .filter_map(|variant| index.get(variant))
                    .flatten()
                    .filter(|key| scope.map(|s| s.contains(*key)).unwrap_or(true))
                    .filter(|key| self.leaf_matches(key, filter))
                    .copied()
                    .collect()
            }
            leaf => self
                .scope_keys(scope)
                .into_iter()
                .filter(|key| self.leaf_matches(key, leaf))
                .collect(),
        }
    }

    fn scope_keys(&self, scope: Option<&HashSet<CapabilityKey>>) -> HashSet<CapabilityKey> {
        match scope {
            Some(keys) => keys.clone(),
            None => self.capabilities.keys().copied().collect(),
        }
    }

    fn leaf_matches(&self, key: &CapabilityKey, filter: &Filter) -> bool {
        self.capabilities
            .get(key)
            .map(|cap| filter.matches(&cap.attributes))
            .unwrap_or(false)
    }

    fn is_indexed_equality(&self, filter: &Filter) -> bool {
        matches!(filter, Filter::Equal { attr, .. } if self.indices.contains_key(attr))
    }
}

/// Index keys under which a filter operand may be stored.
///
/// Indexed values are stored in canonical form, so an operand that parses
/// as a version or integer is also looked up by its canonical rendering.
fn lookup_variants(value: &str) -> Vec<String> {
    let mut variants = vec![value.to_string()];
    if let Ok(version) = value.parse::<Version>() {
        variants.push(version.to_string());
    }
    if let Ok(number) = value.trim().parse::<i64>() {
        variants.push(number.to_string());
    }
    variants.sort();
    variants.dedup();
    variants
}
