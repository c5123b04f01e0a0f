//! Reconstructs HTTP/1.1 and HTTP/2 exchanges from a dissected capture.
//!
//! The capture is walked once, in frame order: a response can only be attached to a request
//! we have already seen. Frames referencing something we never saw the start of are dropped
//! with a warning; captures routinely begin mid-connection.
use super::containers::{Protocol, Resource, ResourceMap};
use super::metrics::InternalAddress;
use super::party::FirstPartyResolver;
use super::utils::{
    as_list, connection_id, find_field, flag_set, frame_number, get_attr, get_layer, packet_at, remote_address,
    resource_id, value_u64,
};
use serde_json::Value;
use std::collections::HashMap;

const HTTP2_DATA: u64 = 0;
const HTTP2_HEADERS: u64 = 1;
const HTTP2_PUSH_PROMISE: u64 = 5;

/// Result of scanning one study's capture.
#[derive(Debug)]
pub struct Scan {
    pub resources: Vec<Resource>,
    /// The first party after following redirects.
    pub first_party: String,
}

/// Per-frame facts shared by every HTTP message in the frame.
struct FrameContext<'a> {
    website: &'a str,
    study: &'a str,
    frame_nr: u64,
    tcp_id: String,
    connection_id: String,
    ip: Option<String>,
}

impl FrameContext<'_> {
    fn resource_id(&self, sub_id: &str) -> String {
        resource_id(self.website, self.study, &self.tcp_id, sub_id)
    }
}

/// Walks the capture and collects every resource of the study.
///
/// TCP segments that tshark reassembled into a resource's frames are folded in afterwards,
/// so each resource's packet set covers everything it was carried in.
pub fn scan_for_resources(capture: &[Value], website: &str, study: &str, scope: &dyn InternalAddress) -> Scan {
    log::info!("Scanning {} frames of {website}/{study}", capture.len());
    let mut resources = ResourceMap::new();
    let mut party = FirstPartyResolver::new(website);

    for packet in capture {
        let Some(frame_nr) = frame_number(packet) else {
            continue;
        };
        let protocols = get_attr(packet, "frame.protocols").and_then(|p| p.as_str()).unwrap_or("");
        if !protocols.contains("http") {
            continue;
        }

        // Without TCP there is no connection to attribute the frame to.
        let Some(tcp_id) = get_layer(packet, "tcp").and_then(|tcp| tcp.get("tcp.stream")).and_then(field_string)
        else {
            continue;
        };

        let ctx = FrameContext {
            website,
            study,
            frame_nr,
            connection_id: connection_id(website, study, &tcp_id),
            tcp_id,
            ip: remote_address(packet, scope),
        };

        if let Some(http2) = get_layer(packet, "http2") {
            scan_http2(http2, &ctx, &mut resources, &mut party);
        } else if let Some(http) = get_layer(packet, "http") {
            scan_http(http, capture, &ctx, &mut resources, &mut party);
        }
    }

    let mut resources = resources.into_vec();
    add_tcp(capture, &mut resources);

    let open = resources.iter().filter(|r| !r.is_closed()).count();
    log::info!(
        "Found {} resources ({open} not closed) for {website}/{study}, first party {}",
        resources.len(),
        party.first_party()
    );

    Scan {
        resources,
        first_party: party.into_first_party(),
    }
}

fn scan_http2(layer: &Value, ctx: &FrameContext, resources: &mut ResourceMap, party: &mut FirstPartyResolver) {
    for http2 in as_list(layer) {
        let Some(streams) = http2.get("http2.stream") else {
            continue;
        };

        for stream in as_list(streams) {
            // Connection preface and other signalling carry no stream id.
            let Some(stream_id) = stream.get("http2.streamid").and_then(field_string) else {
                continue;
            };

            match stream.get("http2.type").and_then(value_u64) {
                Some(HTTP2_DATA) => on_http2_data(stream, &stream_id, ctx, resources),
                Some(HTTP2_HEADERS) | Some(HTTP2_PUSH_PROMISE) => {
                    on_http2_headers(stream, &stream_id, ctx, resources, party)
                }
                _ => {}
            }
        }
    }
}

fn on_http2_data(stream: &Value, stream_id: &str, ctx: &FrameContext, resources: &mut ResourceMap) {
    let id = ctx.resource_id(stream_id);
    let Some(resource) = resources.get_mut(&id) else {
        log::warn!(
            "Skip because missing starting point context={}, framenr={}, httpstream={stream_id}",
            ctx.website,
            ctx.frame_nr
        );
        return;
    };

    resource.add_packet(ctx.frame_nr);
    if stream_flag(stream, "http2.flags.end_stream") {
        resource.end_stream = Some(ctx.frame_nr);
    }
}

fn on_http2_headers(
    stream: &Value,
    stream_id: &str,
    ctx: &FrameContext,
    resources: &mut ResourceMap,
    party: &mut FirstPartyResolver,
) {
    let Some(header_list) = stream.get("http2.header") else {
        log::debug!("No header block in frame {} stream {stream_id}", ctx.frame_nr);
        return;
    };
    let headers = flatten_headers(header_list);

    if let Some(method) = headers.get(":method") {
        // A request, or a server push announcing the stream it will answer on.
        let target = stream
            .get("http2.push_promise.promised_stream_id")
            .and_then(field_string)
            .unwrap_or_else(|| stream_id.to_string());
        let id = ctx.resource_id(&target);

        if resources.contains(&id) {
            log::error!(
                "Skip because resource already exists context={}, framenr={}, httpstream={target}",
                ctx.website,
                ctx.frame_nr
            );
            return;
        }

        let Some(url) = http2_url(&headers) else {
            log::warn!(
                "Skip request without :scheme/:authority/:path context={}, framenr={}, httpstream={target}",
                ctx.website,
                ctx.frame_nr
            );
            return;
        };

        let resource = Resource::new(
            id,
            url,
            ctx.connection_id.clone(),
            ctx.ip.clone(),
            Protocol::Http2,
            method.clone(),
            ctx.website,
            ctx.study,
            ctx.frame_nr,
        );
        if let Err(dup) = resources.insert(resource) {
            log::error!("Resource {} inserted twice", dup.id);
        }
        return;
    }

    // Response headers
    let id = ctx.resource_id(stream_id);
    let Some(resource) = resources.get_mut(&id) else {
        log::warn!(
            "Skip because missing starting point context={}, framenr={}, httpstream={stream_id}",
            ctx.website,
            ctx.frame_nr
        );
        return;
    };

    resource.add_packet(ctx.frame_nr);
    if stream_flag(stream, "http2.flags.eh") {
        resource.end_header = Some(ctx.frame_nr);
    }
    if let Some(content) = headers.get("content-type") {
        resource.content = Some(content.clone());
    }

    party.observe(
        &resource.url,
        headers.get("location").map(String::as_str),
        headers.get(":status").map(String::as_str),
    );
}

/// HTTP/1.1 responses carry `http.request_in`, the frame of their request.
fn scan_http(
    layer: &Value,
    capture: &[Value],
    ctx: &FrameContext,
    resources: &mut ResourceMap,
    party: &mut FirstPartyResolver,
) {
    for http in as_list(layer) {
        let Some(request_in) = http.get("http.request_in").and_then(value_u64) else {
            continue;
        };

        let method = packet_at(capture, request_in)
            .and_then(|request| get_layer(request, "http"))
            .and_then(|request| {
                as_list(request)
                    .into_iter()
                    .find_map(|h| find_field(h, "http.request.method"))
            })
            .and_then(|m| m.as_str());
        let Some(method) = method else {
            log::warn!(
                "Skip because missing starting point context={}, framenr={}, request_in={request_in}",
                ctx.website,
                ctx.frame_nr
            );
            continue;
        };

        let Some(url) = http.get("http.response_for.uri").and_then(|u| u.as_str()) else {
            log::warn!("Skip response without request uri context={}, framenr={}", ctx.website, ctx.frame_nr);
            continue;
        };

        let id = ctx.resource_id(&ctx.frame_nr.to_string());
        if resources.contains(&id) {
            log::error!(
                "Skip because resource already exists context={}, framenr={}",
                ctx.website,
                ctx.frame_nr
            );
            continue;
        }

        let mut resource = Resource::new(
            id,
            url.to_string(),
            ctx.connection_id.clone(),
            ctx.ip.clone(),
            Protocol::Http,
            method.to_string(),
            ctx.website,
            ctx.study,
            request_in,
        );
        resource.add_packet(ctx.frame_nr);
        resource.end_header = Some(ctx.frame_nr);
        resource.content = http.get("http.content_type").and_then(|c| c.as_str()).map(String::from);

        if let Err(dup) = resources.insert(resource) {
            log::error!("Resource {} inserted twice", dup.id);
            continue;
        }

        party.observe(
            url,
            http.get("http.location").and_then(|l| l.as_str()),
            find_field(http, "http.response.code").and_then(|c| c.as_str()),
        );
    }
}

/// Folds the frames of tshark's reassembled TCP segments into each resource.
pub fn add_tcp(capture: &[Value], resources: &mut [Resource]) {
    for resource in resources.iter_mut() {
        let mut segments = Vec::new();
        for &frame_nr in &resource.packets {
            let Some(tcp) = packet_at(capture, frame_nr).and_then(|p| get_layer(p, "tcp.segments")) else {
                continue;
            };
            let Some(listed) = tcp.get("tcp.segment") else {
                continue;
            };
            segments.extend(as_list(listed).into_iter().filter_map(value_u64));
        }

        resource.add_packets(segments);
    }
}

/// Header block as name -> value. Later duplicates win.
fn flatten_headers(header_list: &Value) -> HashMap<String, String> {
    as_list(header_list)
        .into_iter()
        .filter_map(|h| {
            let name = h.get("http2.header.name")?.as_str()?;
            let value = h.get("http2.header.value").and_then(|v| v.as_str()).unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn http2_url(headers: &HashMap<String, String>) -> Option<String> {
    Some(format!(
        "{}://{}{}",
        headers.get(":scheme")?,
        headers.get(":authority")?,
        headers.get(":path")?
    ))
}

/// HTTP/2 frame flags live in `http2.flags_tree`.
fn stream_flag(stream: &Value, flag: &str) -> bool {
    let nested = stream.get("http2.flags_tree").and_then(|t| t.get(flag));
    flag_set(nested.or_else(|| stream.get(flag)))
}

fn field_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
