use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};

/// Per-probe event accumulator.
///
/// Keys are addressed with dotted paths (`tls.rtt.handshake`); every segment
/// but the last becomes a nested object. Insertion order is preserved so the
/// emitted JSON reads in the order the probe produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Fields(Map<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Fields(Map::new())
    }

    /// Set `value` at the dotted `path`, replacing any non-object value that
    /// sits where an intermediate object is needed.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) {
        let mut segments = path.split('.').peekable();
        let mut current = &mut self.0;

        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current.insert(segment.to_string(), value.into());
                return;
            }

            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just replaced by an object"),
            };
        }
    }

    /// Write a round-trip time as `{ "us": <microseconds> }`.
    pub fn put_rtt(&mut self, path: &str, rtt: Duration) {
        self.put(path, rtt_value(rtt));
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Deep merge `other` into `self`; values from `other` win on conflict,
    /// objects present on both sides are merged key by key.
    pub fn merge(&mut self, other: Fields) {
        merge_maps(&mut self.0, other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Fields {
    fn from(map: Map<String, Value>) -> Self {
        Fields(map)
    }
}

pub fn rtt_value(rtt: Duration) -> Value {
    json!({ "us": u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX) })
}

fn merge_maps(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming);
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_creates_nested_objects() {
        let mut fields = Fields::new();
        fields.put("tls.rtt.handshake", rtt_value(Duration::from_micros(1500)));
        fields.put("tls.established", true);

        assert_eq!(
            fields.clone().into_value(),
            json!({ "tls": { "rtt": { "handshake": { "us": 1500 } }, "established": true } })
        );
        assert_eq!(fields.get("tls.rtt.handshake.us"), Some(&json!(1500)));
        assert!(fields.get("tls.missing").is_none());
    }

    #[test]
    fn put_replaces_scalar_with_object() {
        let mut fields = Fields::new();
        fields.put("http.url", "http://example.com");
        fields.put("http.url.full", "http://example.com/x");
        assert_eq!(fields.get("http.url.full"), Some(&json!("http://example.com/x")));
    }

    #[test]
    fn merge_is_deep() {
        let mut base = Fields::new();
        base.put("monitor.host", "example.com");
        base.put("tcp.port", 443);

        let mut dynamic = Fields::new();
        dynamic.put("monitor.status", "up");
        dynamic.put("tcp.rtt.connect.us", 10);

        base.merge(dynamic);
        assert_eq!(base.get("monitor.host"), Some(&json!("example.com")));
        assert_eq!(base.get("monitor.status"), Some(&json!("up")));
        assert_eq!(base.get("tcp.port"), Some(&json!(443)));
        assert_eq!(base.get("tcp.rtt.connect.us"), Some(&json!(10)));
    }

    #[test]
    fn keys_keep_insertion_order() {
        let mut fields = Fields::new();
        fields.put("zeta", 1);
        fields.put("alpha", 2);
        let keys: Vec<_> = fields.0.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }
}
