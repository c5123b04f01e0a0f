use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Http2 => write!(f, "http2"),
        }
    }
}

/// Coarse request type handed to the filter engine, derived from the content-type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Script,
    Image,
    Stylesheet,
    Document,
    Font,
    Media,
    Other,
}

// Ordered; first category with a matching needle wins.
const CONTENT_NEEDLES: [(ResourceType, &[&str]); 6] = [
    (ResourceType::Script, &["javascript", "ecmascript"]),
    (ResourceType::Image, &["image"]),
    (ResourceType::Stylesheet, &["css"]),
    (ResourceType::Document, &["html"]),
    (ResourceType::Font, &["font"]),
    (ResourceType::Media, &["video", "audio"]),
];

impl ResourceType {
    /// Classifies a content-type header value by substring. `None` for an unset content-type.
    pub fn from_content(content: Option<&str>) -> Option<Self> {
        let content = content.filter(|c| !c.is_empty())?;

        let found = CONTENT_NEEDLES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| content.contains(n)))
            .map(|(t, _)| *t);

        Some(found.unwrap_or(ResourceType::Other))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Script => "script",
            ResourceType::Image => "image",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Document => "document",
            ResourceType::Font => "font",
            ResourceType::Media => "media",
            ResourceType::Other => "other",
        }
    }

    /// The tag string passed to the filter engine; untyped content gives an empty tag.
    pub fn tag(content: Option<&str>) -> &'static str {
        Self::from_content(content).map(|t| t.as_str()).unwrap_or("")
    }
}

/// One reconstructed request/response exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub url: String,
    pub connection_id: String,
    pub ip: Option<String>,
    pub protocol: Protocol,
    pub method: String,
    pub website_call: String,
    pub study_name: String,
    #[serde(default)]
    pub hostname: String,
    pub start: u64,
    pub end_header: Option<u64>,
    pub end_stream: Option<u64>,
    /// Frame numbers, kept sorted and unique.
    pub packets: Vec<u64>,
    pub content: Option<String>,
    pub first_party: Option<String>,
    pub context: Option<String>,
    pub ip_context: Option<String>,
    #[serde(default)]
    pub is_tp: bool,
    #[serde(default)]
    pub is_tracker: bool,
    pub filter: Option<String>,
    /// Projected per-frame fields, index-aligned with `packets`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Vec<Value>>,
}

impl Resource {
    /// Creates a resource whose packet set is seeded with its starting frame.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        url: String,
        connection_id: String,
        ip: Option<String>,
        protocol: Protocol,
        method: String,
        website_call: &str,
        study_name: &str,
        start: u64,
    ) -> Self {
        Self {
            id,
            url,
            connection_id,
            ip,
            protocol,
            method,
            website_call: website_call.to_string(),
            study_name: study_name.to_string(),
            hostname: String::new(),
            start,
            end_header: None,
            end_stream: None,
            packets: vec![start],
            content: None,
            first_party: None,
            context: None,
            ip_context: None,
            is_tp: false,
            is_tracker: false,
            filter: None,
            extra: BTreeMap::new(),
        }
    }

    /// Inserts a frame number, keeping `packets` sorted and free of duplicates.
    pub fn add_packet(&mut self, frame_nr: u64) {
        if let Err(pos) = self.packets.binary_search(&frame_nr) {
            self.packets.insert(pos, frame_nr);
        }
    }

    pub fn add_packets<I: IntoIterator<Item = u64>>(&mut self, frames: I) {
        for frame_nr in frames {
            self.add_packet(frame_nr);
        }
    }

    /// A resource is closed once its protocol's terminal markers have been seen.
    pub fn is_closed(&self) -> bool {
        match self.protocol {
            Protocol::Http => self.end_header.is_some(),
            Protocol::Http2 => self.end_header.is_some() && self.end_stream.is_some(),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        ResourceType::tag(self.content.as_deref())
    }

    /// A projected field, if the projector produced it.
    pub fn collected(&self, field: &str) -> Option<&[Value]> {
        self.extra.get(field).map(|v| v.as_slice())
    }
}

/// Resources of one study, keyed by id, in creation order.
///
/// Owned by the scanning pass. Callers check `contains` before every insert or update;
/// `insert` refuses an id that already exists instead of overwriting it.
#[derive(Debug, Default)]
pub struct ResourceMap {
    index: HashMap<String, usize>,
    resources: Vec<Resource>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Resource> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.resources[i]),
            None => None,
        }
    }

    /// Adds a new resource. Hands the resource back if its id is already taken.
    pub fn insert(&mut self, resource: Resource) -> Result<(), Resource> {
        if self.contains(&resource.id) {
            return Err(resource);
        }
        self.index.insert(resource.id.clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn into_vec(self) -> Vec<Resource> {
        self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(protocol: Protocol, id: &str) -> Resource {
        Resource::new(
            id.to_string(),
            String::from("https://example.com/"),
            String::from("conn"),
            None,
            protocol,
            String::from("GET"),
            "example.com",
            "study",
            10,
        )
    }

    #[test]
    fn test_packets_sorted_and_unique() {
        let mut r = resource(Protocol::Http2, "a");
        r.add_packets([14, 3, 10, 14, 7, 3]);
        assert_eq!(r.packets, vec![3, 7, 10, 14]);
    }

    #[test]
    fn test_is_closed_http() {
        let mut r = resource(Protocol::Http, "a");
        assert!(!r.is_closed());
        r.end_header = Some(12);
        assert!(r.is_closed());
    }

    #[test]
    fn test_is_closed_http2_needs_both_markers() {
        let mut r = resource(Protocol::Http2, "a");
        r.end_header = Some(12);
        assert!(!r.is_closed());
        r.end_stream = Some(20);
        assert!(r.is_closed());

        r.end_header = None;
        assert!(!r.is_closed());
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(ResourceType::tag(Some("text/html; charset=utf-8")), "document");
        assert_eq!(ResourceType::tag(Some("application/javascript")), "script");
        assert_eq!(ResourceType::tag(Some("text/ecmascript")), "script");
        assert_eq!(ResourceType::tag(Some("image/svg+xml")), "image");
        assert_eq!(ResourceType::tag(Some("text/css")), "stylesheet");
        assert_eq!(ResourceType::tag(Some("font/woff2")), "font");
        assert_eq!(ResourceType::tag(Some("audio/ogg")), "media");
        assert_eq!(ResourceType::tag(Some("application/json")), "other");
        assert_eq!(ResourceType::tag(None), "");
        assert_eq!(ResourceType::tag(Some("")), "");
    }

    #[test]
    fn test_type_priority() {
        // Script beats document when both needles appear.
        assert_eq!(ResourceType::tag(Some("text/html+javascript")), "script");
    }

    #[test]
    fn test_map_refuses_duplicate_ids() {
        let mut map = ResourceMap::new();
        assert!(map.insert(resource(Protocol::Http2, "a")).is_ok());
        assert!(map.insert(resource(Protocol::Http2, "b")).is_ok());

        let mut dup = resource(Protocol::Http2, "a");
        dup.url = String::from("https://other.com/");
        let rejected = map.insert(dup).unwrap_err();
        assert_eq!(rejected.url, "https://other.com/");

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a").unwrap().url, "https://example.com/");

        let ids: Vec<String> = map.into_vec().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_serializes_flat() {
        let mut r = resource(Protocol::Http2, "a");
        r.extra.insert(String::from("sizes"), vec![Value::from(60)]);
        let json = serde_json::to_value(&r).unwrap();

        assert_eq!(json["protocol"], "http2");
        assert_eq!(json["packets"], serde_json::json!([10]));
        assert_eq!(json["sizes"], serde_json::json!([60]));
        assert!(json.get("extra").is_none());
    }
}
