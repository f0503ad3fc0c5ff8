//! Request fingerprinting
//!
//! `request_hash = hex(sha256(canonical_json({"body", "method", "path"})))`
//! where canonical JSON has object keys sorted at every level and no
//! insignificant whitespace. An empty body omits `body`; a body that is not
//! JSON is hashed as hex bytes under `body_raw`, so it never matches a JSON body.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Deterministic JSON text: sorted keys, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn request_hash(method: &str, path: &str, body: &[u8]) -> String {
    let mut request = json!({
        "method": method.to_ascii_uppercase(),
        "path": path,
    });
    if !body.is_empty() {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => request["body"] = value,
            Err(_) => request["body_raw"] = Value::String(hex::encode(body)),
        }
    }
    sha256_hex(canonical_json(&request).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value: Value =
            serde_json::from_str(r#"{ "b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": null} }"#)
                .unwrap();
        assert_eq!(canonical_json(&value), r#"{"a":{"c":null,"z":[3,{"x":2,"y":1}]},"b":1}"#);
    }

    #[test]
    fn test_hash_ignores_key_order_and_whitespace() {
        let a = request_hash("POST", "/things", br#"{"name":"x","qty":1}"#);
        let b = request_hash("post", "/things", b"{ \"qty\": 1,\n \"name\": \"x\" }");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_distinguishes_requests() {
        let base = request_hash("POST", "/things", br#"{"name":"x"}"#);
        assert_ne!(base, request_hash("POST", "/things", br#"{"name":"y"}"#));
        assert_ne!(base, request_hash("PUT", "/things", br#"{"name":"x"}"#));
        assert_ne!(base, request_hash("POST", "/other", br#"{"name":"x"}"#));
    }

    #[test]
    fn test_raw_bodies_keep_their_bytes() {
        let hash = |body: &[u8]| request_hash("POST", "/things", body);
        assert_ne!(hash(&[0xff]), hash(&[0xfe]));
        assert_ne!(hash(br#""abc""#), hash(b"abc"));
        assert_ne!(hash(b""), hash(b"null"));
        assert_eq!(hash(b"abc"), hash(b"abc"));
    }
}
