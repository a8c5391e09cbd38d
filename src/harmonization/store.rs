//! Fitted parameter store.

use crate::combat::ComBatEstimates;
use crate::harmonization::error::HarmonizationError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a stored estimate. Groups and covariates live in separate
/// namespaces, so a group may share its name with a covariate column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKey {
    /// A feature group, by name.
    Group(String),
    /// A covariate of no interest, by column name.
    Covariate(String),
}

impl StoreKey {
    pub fn group(name: &str) -> Self {
        StoreKey::Group(name.to_string())
    }

    pub fn covariate(column: &str) -> Self {
        StoreKey::Covariate(column.to_string())
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Group(name) => write!(f, "group '{}'", name),
            StoreKey::Covariate(name) => write!(f, "covariate '{}'", name),
        }
    }
}

/// Estimates produced by one `fit`, in estimation order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    entries: IndexMap<StoreKey, ComBatEstimates>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an estimate, replacing any previous one under the same key.
    pub fn insert(&mut self, key: StoreKey, estimates: ComBatEstimates) {
        self.entries.insert(key, estimates);
    }

    /// Look up an estimate.
    pub fn get(&self, key: &StoreKey) -> Result<&ComBatEstimates, HarmonizationError> {
        self.entries
            .get(key)
            .ok_or_else(|| HarmonizationError::MissingEstimate(key.to_string()))
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StoreKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
