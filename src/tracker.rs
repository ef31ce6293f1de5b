use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// What recording a freshly resolved digest revealed about the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No digest had been recorded for the image yet.
    First,
    Changed { previous: String },
    Unchanged,
}

impl Observation {
    /// Classifies a freshly resolved digest against the previously recorded one.
    /// Comparison is exact string equality.
    pub fn between(previous: Option<String>, digest: &str) -> Self {
        match previous {
            None => Observation::First,
            Some(previous) if previous == digest => Observation::Unchanged,
            Some(previous) => Observation::Changed { previous },
        }
    }
}

/// Last observed registry digest per image key. Entries live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct DigestTracker {
    digests: RwLock<HashMap<String, String>>,
}

impl DigestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.digests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, digest: &str) {
        self.digests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), digest.to_string());
    }

    /// Sorted copy of all entries, for status reporting.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.digests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, digest)| (key.clone(), digest.clone()))
            .collect()
    }
}
