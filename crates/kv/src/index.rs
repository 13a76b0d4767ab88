//! Local secondary indexes.
//!
//! When a node is configured with `index_fields`, every applied write whose
//! value parses as a JSON object is indexed as `field → value → keys`.
//! Lookups are local; cross-node queries merge the per-node answers at the
//! caller.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct IndexManager {
    fields: Vec<String>,
    /// field → rendered value → keys.
    entries: HashMap<String, HashMap<String, BTreeSet<String>>>,
    /// key → (field, rendered value) pairs currently indexed, for removal.
    by_key: HashMap<String, Vec<(String, String)>>,
}

impl IndexManager {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            entries: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Index a newly applied value, replacing whatever this key had before.
    pub fn add_record(&mut self, key: &str, value: &[u8]) {
        if self.fields.is_empty() {
            return;
        }
        self.remove_key(key);

        let parsed: serde_json::Value = match serde_json::from_slice(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        let object = match parsed.as_object() {
            Some(o) => o,
            None => return,
        };

        let mut indexed = Vec::new();
        for field in &self.fields {
            if let Some(v) = object.get(field) {
                let rendered = render(v);
                self.entries
                    .entry(field.clone())
                    .or_default()
                    .entry(rendered.clone())
                    .or_default()
                    .insert(key.to_string());
                indexed.push((field.clone(), rendered));
            }
        }
        if !indexed.is_empty() {
            self.by_key.insert(key.to_string(), indexed);
        }
    }

    /// Drop a key from every posting list (deletes and overwrites).
    pub fn remove_key(&mut self, key: &str) {
        let Some(postings) = self.by_key.remove(key) else {
            return;
        };
        for (field, rendered) in postings {
            if let Some(values) = self.entries.get_mut(&field) {
                if let Some(keys) = values.get_mut(&rendered) {
                    keys.remove(key);
                    if keys.is_empty() {
                        values.remove(&rendered);
                    }
                }
            }
        }
    }

    /// Keys whose `field` equals `value` (rendered comparison, so `"42"`
    /// matches the number 42).
    pub fn query(&self, field: &str, value: &str) -> Vec<String> {
        self.entries
            .get(field)
            .and_then(|values| values.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Canonical string form of an indexed JSON value.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IndexManager {
        IndexManager::new(vec!["city".to_string(), "age".to_string()])
    }

    #[test]
    fn test_add_and_query() {
        let mut idx = manager();
        idx.add_record("user:1", br#"{"city": "lisbon", "age": 30}"#);
        idx.add_record("user:2", br#"{"city": "lisbon"}"#);
        idx.add_record("user:3", br#"{"city": "porto"}"#);

        assert_eq!(idx.query("city", "lisbon"), vec!["user:1", "user:2"]);
        assert_eq!(idx.query("city", "porto"), vec!["user:3"]);
        assert_eq!(idx.query("age", "30"), vec!["user:1"]);
        assert!(idx.query("city", "faro").is_empty());
    }

    #[test]
    fn test_overwrite_moves_key() {
        let mut idx = manager();
        idx.add_record("user:1", br#"{"city": "lisbon"}"#);
        idx.add_record("user:1", br#"{"city": "porto"}"#);

        assert!(idx.query("city", "lisbon").is_empty());
        assert_eq!(idx.query("city", "porto"), vec!["user:1"]);
    }

    #[test]
    fn test_remove_key() {
        let mut idx = manager();
        idx.add_record("user:1", br#"{"city": "lisbon"}"#);
        idx.remove_key("user:1");
        assert!(idx.query("city", "lisbon").is_empty());
    }

    #[test]
    fn test_non_json_values_ignored() {
        let mut idx = manager();
        idx.add_record("k", b"not json");
        idx.add_record("k2", br#""a plain string""#);
        assert!(idx.query("city", "not json").is_empty());
    }

    #[test]
    fn test_unindexed_fields_ignored() {
        let mut idx = manager();
        idx.add_record("user:1", br#"{"country": "pt"}"#);
        assert!(idx.query("country", "pt").is_empty());
    }

    #[test]
    fn test_disabled_when_no_fields() {
        let mut idx = IndexManager::new(vec![]);
        assert!(!idx.is_enabled());
        idx.add_record("user:1", br#"{"city": "lisbon"}"#);
        assert!(idx.query("city", "lisbon").is_empty());
    }
}
