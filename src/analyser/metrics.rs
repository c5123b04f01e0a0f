//! Per-resource metric projection and the cross-resource aggregation run over a whole corpus.
use super::containers::Resource;
use super::utils::{get_attr, packet_at};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Projected field holding each frame's relative timestamp.
pub const REL_TIME: &str = "rel_time";
/// Projected field holding each frame's size.
pub const SIZES: &str = "sizes";
/// Projected field holding each frame's source address.
pub const IP_SRC: &str = "ip_src";

/// Decides whether an address belongs to the crawler's own network.
pub trait InternalAddress {
    fn is_internal(&self, ip: &str) -> bool;
}

impl<F: Fn(&str) -> bool> InternalAddress for F {
    fn is_internal(&self, ip: &str) -> bool {
        self(ip)
    }
}

/// Prefix match against the configured bridge subnets, e.g. `172.17.`.
#[derive(Clone, Debug)]
pub struct AddressScope {
    prefixes: Vec<String>,
}

impl AddressScope {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl InternalAddress for AddressScope {
    fn is_internal(&self, ip: &str) -> bool {
        self.prefixes.iter().any(|p| ip.starts_with(p.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cast {
    Int,
    Float,
    Str,
}

impl Cast {
    /// Converts one collected value. Values that do not convert become `null`.
    pub fn apply(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (Cast::Int, Value::String(s)) => s.trim().parse::<i64>().map(Value::from).unwrap_or_else(|_| {
                log::warn!("Cannot cast {s:?} to int");
                Value::Null
            }),
            (Cast::Int, Value::Number(n)) => match n.as_i64() {
                Some(i) => Value::from(i),
                None => n.as_f64().map(|f| Value::from(f as i64)).unwrap_or(Value::Null),
            },
            (Cast::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| {
                    log::warn!("Cannot cast {s:?} to float");
                    Value::Null
                }),
            (Cast::Float, Value::Number(n)) => n.as_f64().and_then(Number::from_f64).map(Value::Number).unwrap_or(Value::Null),
            (Cast::Str, Value::String(s)) => Value::String(s),
            (Cast::Str, other) => Value::String(other.to_string()),
            (_, other) => {
                log::warn!("Cannot cast {other} with {self:?}");
                Value::Null
            }
        }
    }
}

/// Projects dissection fields onto resources.
///
/// For every `name -> path` entry, each resource gets a list with one value per frame in
/// its packet set (`null` where the frame lacks the field), optionally cast.
pub fn collect_data(
    resources: &mut [Resource],
    capture: &[Value],
    to_collect: &BTreeMap<String, String>,
    cast: &BTreeMap<String, Cast>,
) {
    for (name, path) in to_collect {
        let caster = cast.get(name);
        for resource in resources.iter_mut() {
            let collected: Vec<Value> = resource
                .packets
                .iter()
                .map(|&frame_nr| {
                    let value = packet_at(capture, frame_nr)
                        .and_then(|p| get_attr(p, path))
                        .cloned()
                        .unwrap_or(Value::Null);
                    match caster {
                        Some(c) => c.apply(value),
                        None => value,
                    }
                })
                .collect();

            resource.extra.insert(name.clone(), collected);
        }
    }
}

/// A resource with the timing and direction columns of the corpus table.
#[derive(Clone, Debug)]
pub struct ResourceRow<'a> {
    pub resource: &'a Resource,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Gap to the previous resource of the same study, website and hostname.
    pub delta_time: f64,
    pub incoming: Vec<u64>,
    pub incoming_sizes: Vec<Value>,
    pub outgoing: Vec<u64>,
    pub outgoing_sizes: Vec<Value>,
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Builds the corpus table rows for a batch of resources.
pub fn aggregate<'a>(resources: &'a [Resource], scope: &dyn InternalAddress) -> Vec<ResourceRow<'a>> {
    let mut rows: Vec<ResourceRow<'a>> = resources.iter().map(|r| row(r, scope)).collect();

    let mut groups: HashMap<(&str, &str, &str), Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if row.start_time.is_none() {
            continue;
        }
        let r = row.resource;
        groups
            .entry((r.study_name.as_str(), r.website_call.as_str(), r.hostname.as_str()))
            .or_default()
            .push(i);
    }

    for members in groups.values_mut() {
        members.sort_by(|&a, &b| {
            let (ta, tb) = (rows[a].start_time.unwrap_or(0.0), rows[b].start_time.unwrap_or(0.0));
            ta.total_cmp(&tb)
        });

        // The first of each group keeps a delta of zero.
        for pair in members.windows(2) {
            let prev = rows[pair[0]].start_time.unwrap_or(0.0);
            let cur = rows[pair[1]].start_time.unwrap_or(0.0);
            rows[pair[1]].delta_time = cur - prev;
        }
    }

    rows
}

fn row<'a>(resource: &'a Resource, scope: &dyn InternalAddress) -> ResourceRow<'a> {
    let times = resource.collected(REL_TIME).unwrap_or(&[]);
    let start_time = times.first().and_then(as_f64);
    let end_time = times.last().and_then(as_f64);

    let mut row = ResourceRow {
        resource,
        start_time,
        end_time,
        delta_time: 0.0,
        incoming: Vec::new(),
        incoming_sizes: Vec::new(),
        outgoing: Vec::new(),
        outgoing_sizes: Vec::new(),
    };

    let Some(sources) = resource.collected(IP_SRC) else {
        log::warn!("Resource {} has no {IP_SRC} projection, direction left empty", resource.id);
        return row;
    };
    let sizes = resource.collected(SIZES).unwrap_or(&[]);

    for (i, (&frame_nr, source)) in resource.packets.iter().zip(sources).enumerate() {
        // Frames without an IPv4 source (e.g. IPv6) are not attributed to either side.
        let Some(ip) = source.as_str() else {
            continue;
        };
        let size = sizes.get(i).cloned().unwrap_or(Value::Null);

        if scope.is_internal(ip) {
            row.outgoing.push(frame_nr);
            row.outgoing_sizes.push(size);
        } else {
            row.incoming.push(frame_nr);
            row.incoming_sizes.push(size);
        }
    }

    row
}
