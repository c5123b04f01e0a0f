//! Contains utilities and helper functions that aid in packet processing.
//!
//! Packets are tshark `-T json` records: `{"_source": {"layers": {"frame": {..}, "tcp": {..}, ..}}}`.
//! Field values are strings; repeated fields (`ip.addr`, several HTTP/2 streams in one
//! frame) come as arrays.
use super::metrics::InternalAddress;
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde_json::Value;
use std::fs;
use std::path::Path;
use url::Url;

/// Loads a dissected capture: a JSON array with one record per frame, in frame order.
pub fn load_capture(path: &Path) -> Result<Vec<Value>> {
    log::debug!("Loading capture {}", path.display());
    let bytes = fs::read(path)?;

    // tshark can emit invalid UTF-8 in field values; replace rather than fail.
    let text = String::from_utf8_lossy(&bytes);
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(packets) => Ok(packets),
        other => Err(Error::Capture {
            path: path.to_path_buf(),
            reason: format!("expected a packet array, found {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn get_layer<'a>(packet: &'a Value, key: &str) -> Option<&'a Value> {
    packet.get("_source")?.get("layers")?.get(key)
}

/// Looks up a dissection field such as `frame.len` or `ip.src`.
///
/// The layer is named by the first path segment; the field keeps the full dotted name.
pub fn get_attr<'a>(packet: &'a Value, path: &str) -> Option<&'a Value> {
    let key = path.split('.').next()?;
    get_layer(packet, key)?.get(path)
}

/// Normalizes a field that tshark emits either as a single value or as an array.
pub fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Reads an integer field, whether tshark wrote it as a string or a number.
pub fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Reads a flag such as `http2.flags.end_stream`; tshark writes them as `"1"`/`"0"`
/// (or `"True"`/`"False"` in some versions).
pub fn flag_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}

/// Finds `key` in a protocol layer, either directly or one level down.
///
/// HTTP/1.1 puts the request/status line fields (`http.request.method`, `http.response.code`)
/// in an object keyed by the raw first line.
pub fn find_field<'a>(layer: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(value) = layer.get(key) {
        return Some(value);
    }

    layer
        .as_object()?
        .values()
        .filter(|v| v.is_object())
        .find_map(|v| v.get(key))
}

pub fn frame_number(packet: &Value) -> Option<u64> {
    get_attr(packet, "frame.number").and_then(value_u64)
}

/// The record for frame `frame_nr`. Frame numbers start at 1.
pub fn packet_at(capture: &[Value], frame_nr: u64) -> Option<&Value> {
    let idx = usize::try_from(frame_nr).ok()?.checked_sub(1)?;
    capture.get(idx)
}

/// MD5 Hash used for resource and connection identifiers.
pub fn get_md5_hash(string_in: String) -> String {
    let mut hasher = Md5::new();
    hasher.update(string_in);
    let result = hasher.finalize();

    hex::encode(result)
}

/// Identifier of one TCP connection within a study.
pub fn connection_id(website: &str, study: &str, tcp_stream: &str) -> String {
    get_md5_hash(format!("({:?}, {:?}, {:?})", website, study, tcp_stream))
}

/// Identifier of one resource: its connection plus the HTTP/2 stream id, or the
/// response frame for HTTP/1.1.
pub fn resource_id(website: &str, study: &str, tcp_stream: &str, sub_id: &str) -> String {
    get_md5_hash(format!("({:?}, {:?}, {:?}, {:?})", website, study, tcp_stream, sub_id))
}

/// Picks the remote peer of a packet: the first `ip.addr` outside the crawler network.
pub fn remote_address(packet: &Value, scope: &dyn InternalAddress) -> Option<String> {
    let addrs = get_attr(packet, "ip.addr").or_else(|| get_attr(packet, "ipv6.addr"))?;

    as_list(addrs)
        .into_iter()
        .filter_map(|a| a.as_str())
        .find(|a| !scope.is_internal(a))
        .map(|a| a.to_string())
}

/// Host (and explicit port) of a URL. Protocol-relative locations (`//host/path`) are
/// accepted; relative paths have no host and yield `None`.
pub fn netloc(url: &str) -> Option<String> {
    let parsed = if url.starts_with("//") {
        Url::parse(&format!("https:{url}"))
    } else {
        Url::parse(url)
    };

    let parsed = parsed.ok()?;
    let host = parsed.host_str().filter(|h| !h.is_empty())?;

    match parsed.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::metrics::AddressScope;
    use serde_json::json;

    fn packet() -> Value {
        json!({
            "_source": {
                "layers": {
                    "frame": {"frame.number": "7", "frame.len": "1514"},
                    "ip": {"ip.src": "172.17.0.2", "ip.addr": ["172.17.0.2", "93.184.216.34"]},
                    "http": {
                        "GET / HTTP/1.1\r\n": {"http.request.method": "GET"},
                        "http.host": "example.com"
                    }
                }
            }
        })
    }

    #[test]
    fn test_get_attr() {
        let p = packet();
        assert_eq!(get_attr(&p, "frame.len"), Some(&json!("1514")));
        assert_eq!(get_attr(&p, "tcp.stream"), None);
        assert_eq!(frame_number(&p), Some(7));
    }

    #[test]
    fn test_find_field_nested() {
        let p = packet();
        let http = get_layer(&p, "http").unwrap();
        assert_eq!(find_field(http, "http.request.method"), Some(&json!("GET")));
        assert_eq!(find_field(http, "http.host"), Some(&json!("example.com")));
        assert_eq!(find_field(http, "http.response.code"), None);
    }

    #[test]
    fn test_remote_address() {
        let scope = AddressScope::new(vec![String::from("172.17.")]);
        assert_eq!(remote_address(&packet(), &scope), Some(String::from("93.184.216.34")));

        let internal = json!({"_source": {"layers": {"ip": {"ip.addr": ["172.17.0.2", "172.17.0.3"]}}}});
        assert_eq!(remote_address(&internal, &scope), None);
    }

    #[test]
    fn test_ids() {
        let a = resource_id("example.com", "study", "3", "1");
        let b = resource_id("example.com", "study", "3", "3");
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(a, resource_id("example.com", "study", "3", "1"));
        assert_ne!(connection_id("example.com", "s1", "3"), connection_id("example.com", "s2", "3"));
    }

    #[test]
    fn test_netloc() {
        assert_eq!(netloc("https://b.example/x"), Some(String::from("b.example")));
        assert_eq!(netloc("http://a.com:8080/"), Some(String::from("a.com:8080")));
        assert_eq!(netloc("//cdn.a.com/lib.js"), Some(String::from("cdn.a.com")));
        assert_eq!(netloc("/relative/path"), None);
    }

    #[test]
    fn test_flags_and_lists() {
        assert!(flag_set(Some(&json!("1"))));
        assert!(!flag_set(Some(&json!("0"))));
        assert!(!flag_set(None));
        assert_eq!(as_list(&json!("x")).len(), 1);
        assert_eq!(as_list(&json!(["x", "y"])).len(), 2);
        assert_eq!(packet_at(&[json!(1), json!(2)], 2), Some(&json!(2)));
        assert_eq!(packet_at(&[json!(1)], 0), None);
    }
}
