//! In-memory decision dataset.
//!
//! Exact-match lookups keyed by scope and value. The parent keeps one copy
//! fed by the decision stream; each worker keeps its own copy fed by
//! control-plane pushes.

use std::collections::HashMap;

use crate::decision::Decision;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    scope: String,
    value: String,
}

impl Key {
    fn new(scope: &str, value: &str) -> Self {
        Self {
            scope: scope.to_ascii_lowercase(),
            value: value.to_string(),
        }
    }
}

/// Set of active decisions.
#[derive(Debug, Default, Clone)]
pub struct Dataset {
    entries: HashMap<Key, Decision>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace decisions. A later decision for the same scope and
    /// value wins.
    pub fn add(&mut self, decisions: impl IntoIterator<Item = Decision>) {
        for decision in decisions {
            let key = Key::new(&decision.scope, &decision.value);
            self.entries.insert(key, decision);
        }
    }

    /// Remove decisions by scope and value; unknown entries are ignored.
    pub fn remove<'a>(&mut self, decisions: impl IntoIterator<Item = &'a Decision>) {
        for decision in decisions {
            self.entries
                .remove(&Key::new(&decision.scope, &decision.value));
        }
    }

    /// Remediation for `value` in `scope`, if any.
    pub fn lookup(&self, scope: &str, value: &str) -> Option<&str> {
        self.entries
            .get(&Key::new(scope, value))
            .map(|d| d.kind.as_str())
    }

    /// Replace the whole content.
    pub fn reset(&mut self, decisions: impl IntoIterator<Item = Decision>) {
        self.entries.clear();
        self.add(decisions);
    }

    /// Copy of every active decision.
    pub fn snapshot(&self) -> Vec<Decision> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_is_case_insensitive() {
        let mut dataset = Dataset::new();
        dataset.add([Decision::new("Ip", "192.0.2.1", "ban")]);
        assert_eq!(dataset.lookup("ip", "192.0.2.1"), Some("ban"));
        assert_eq!(dataset.lookup("IP", "192.0.2.1"), Some("ban"));
        assert_eq!(dataset.lookup("ip", "192.0.2.2"), None);
    }

    #[test]
    fn later_decision_replaces_earlier() {
        let mut dataset = Dataset::new();
        dataset.add([Decision::new("Ip", "192.0.2.1", "captcha")]);
        dataset.add([Decision::new("Ip", "192.0.2.1", "ban")]);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.lookup("ip", "192.0.2.1"), Some("ban"));
    }

    #[test]
    fn remove_ignores_unknown() {
        let mut dataset = Dataset::new();
        let known = Decision::new("Ip", "192.0.2.1", "ban");
        dataset.add([known.clone()]);
        dataset.remove(&[Decision::new("Ip", "198.51.100.7", "ban"), known]);
        assert!(dataset.is_empty());
    }

    #[test]
    fn reset_replaces_content() {
        let mut dataset = Dataset::new();
        dataset.add([Decision::new("Ip", "192.0.2.1", "ban")]);
        dataset.reset([Decision::new("Country", "FR", "captcha")]);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.lookup("country", "FR"), Some("captcha"));
    }
}
