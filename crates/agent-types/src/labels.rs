//! Agent labels (§3 Status snapshot, §6 `labels{}`).
//!
//! Labels are free-form key/value strings configured by the operator, with
//! `id` and `version` auto-injected at load time so every status snapshot
//! and decision-log event can be attributed to a specific agent instance.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Auto-injected label carrying the agent's generated instance id.
pub const LABEL_ID: &str = "id";
/// Auto-injected label carrying the agent's own build version.
pub const LABEL_VERSION: &str = "version";

/// Key/value label set, immutable through discovery (§4.G Immutability).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `id`/`version` if not already present, per §6.
    pub fn with_auto_injected(mut self, id: &str, version: &str) -> Self {
        self.0.entry(LABEL_ID.to_string()).or_insert_with(|| id.to_string());
        self.0
            .entry(LABEL_VERSION.to_string())
            .or_insert_with(|| version.to_string());
        self
    }
}

impl Deref for Labels {
    type Target = BTreeMap<String, String>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Labels {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_injection_does_not_override_explicit_labels() {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), "explicit-id".to_string());
        let labels = Labels::from(map).with_auto_injected("generated-id", "1.2.3");
        assert_eq!(labels.get("id"), Some(&"explicit-id".to_string()));
        assert_eq!(labels.get("version"), Some(&"1.2.3".to_string()));
    }

    #[test]
    fn auto_injection_fills_missing_labels() {
        let labels = Labels::new().with_auto_injected("gen-id", "0.3.0");
        assert_eq!(labels.get("id"), Some(&"gen-id".to_string()));
        assert_eq!(labels.get("version"), Some(&"0.3.0".to_string()));
    }
}
