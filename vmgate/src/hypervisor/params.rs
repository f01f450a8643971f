use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Map, Value};

/// Thread-safe string key/value map shared between the daemon and driver
/// code. Drivers mutate it from their own tasks while controllers read it,
/// so all access goes through short lock sections and values are returned
/// by clone.
#[derive(Debug, Default)]
pub struct ParameterMap {
    entries: RwLock<HashMap<String, String>>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a JSON object. Non-string scalars are stringified;
    /// nested objects and arrays are kept as compact JSON text.
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let entries = object
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Numeric read with fallback, tolerating unparsable values.
    pub fn get_num(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Snapshot of the entries under `prefix/`, with the prefix stripped.
    #[allow(dead_code)] // part of the driver-facing map contract
    pub fn subgroup(&self, prefix: &str) -> ParameterMap {
        let needle = format!("{}/", prefix);
        let entries = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&needle)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        ParameterMap {
            entries: RwLock::new(entries),
        }
    }

    /// Full snapshot as a JSON object (used for `stateVariables` blobs).
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_roundtrip() {
        let params = ParameterMap::new();
        assert!(!params.contains("cpus"));
        params.set("cpus", "4");
        assert!(params.contains("cpus"));
        assert_eq!(params.get("cpus").as_deref(), Some("4"));
        assert_eq!(params.get_or("memory", "512"), "512");
    }

    #[test]
    fn get_num_parses_and_falls_back() {
        let params = ParameterMap::new();
        params.set("state", "5");
        params.set("junk", "abc");
        assert_eq!(params.get_num("state", 0), 5);
        assert_eq!(params.get_num("junk", 7), 7);
        assert_eq!(params.get_num("missing", -1), -1);
    }

    #[test]
    fn from_json_stringifies_scalars() {
        let obj = json!({
            "name": "vm1",
            "memory": 512,
            "secret": "s3cret",
            "flags": {"a": 1}
        });
        let params = ParameterMap::from_json(obj.as_object().unwrap());
        assert_eq!(params.get("name").as_deref(), Some("vm1"));
        assert_eq!(params.get("memory").as_deref(), Some("512"));
        assert_eq!(params.get("flags").as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn subgroup_strips_prefix() {
        let params = ParameterMap::new();
        params.set("properties/owner", "alice");
        params.set("properties/tag", "ci");
        params.set("name", "vm1");
        let props = params.subgroup("properties");
        assert_eq!(props.get("owner").as_deref(), Some("alice"));
        assert_eq!(props.get("tag").as_deref(), Some("ci"));
        assert!(!props.contains("name"));
    }

    #[test]
    fn to_json_snapshot() {
        let params = ParameterMap::new();
        params.set("name", "vm1");
        let json = params.to_json();
        assert_eq!(json["name"], "vm1");
    }
}
