use crate::analyser::core::StudyOutcome;
use crate::analyser::metrics::ResourceRow;
use crate::error::Result;
use ansi_term::Colour;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Resource columns of the corpus table, in order. Projected fields follow them.
const RESOURCE_COLUMNS: [&str; 20] = [
    "id",
    "url",
    "connection_id",
    "ip",
    "protocol",
    "method",
    "website_call",
    "study_name",
    "hostname",
    "start",
    "end_header",
    "end_stream",
    "packets",
    "content",
    "first_party",
    "context",
    "ip_context",
    "is_tp",
    "is_tracker",
    "filter",
];

const AGGREGATE_COLUMNS: [&str; 7] = [
    "start_time",
    "end_time",
    "delta_time",
    "incoming",
    "incoming_sizes",
    "outgoing",
    "outgoing_sizes",
];

/// Per-website counts for the end-of-run report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WebsiteSummary {
    pub website: String,
    pub studies: usize,
    pub empty_studies: usize,
    pub resources: usize,
    pub open: usize,
    pub third_party: usize,
    pub trackers: usize,
}

pub fn summarize(outcomes: &[StudyOutcome]) -> Vec<WebsiteSummary> {
    let mut sites: BTreeMap<&str, WebsiteSummary> = BTreeMap::new();

    for outcome in outcomes {
        let site = sites.entry(outcome.website.as_str()).or_insert_with(|| WebsiteSummary {
            website: outcome.website.clone(),
            ..Default::default()
        });
        site.studies += 1;
        if outcome.resources.is_empty() {
            site.empty_studies += 1;
        }
        site.resources += outcome.resources.len();
        site.open += outcome.resources.iter().filter(|r| !r.is_closed()).count();
        site.third_party += outcome.resources.iter().filter(|r| r.is_tp).count();
        site.trackers += outcome.resources.iter().filter(|r| r.is_tracker).count();
    }

    sites.into_values().collect()
}

pub fn print_results(summaries: &[WebsiteSummary]) {
    let now = chrono::Local::now().format("%d.%m.%Y %H:%M:%S");
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results ({now})");
    for summary in summaries {
        print_website(summary);
    }
}

pub fn print_website(summary: &WebsiteSummary) {
    println!("\u{2503}");
    println!("\u{2503} Website {}", Colour::Red.paint(&summary.website));
    println!("\u{2503} Studies          : {}", Colour::Fixed(226).paint(summary.studies.to_string()));
    if summary.empty_studies > 0 {
        println!("\u{2503} Empty studies    : {}", Colour::Yellow.paint(summary.empty_studies.to_string()));
    }
    println!("\u{2503} Resources        : {}", Colour::Fixed(226).paint(summary.resources.to_string()));
    println!("\u{2503} Not closed       : {}", Colour::Fixed(226).paint(summary.open.to_string()));
    println!("\u{2503} Third party      : {}", Colour::Fixed(226).paint(summary.third_party.to_string()));
    println!("\u{2503} Trackers         : {}", Colour::Fixed(226).paint(summary.trackers.to_string()));
    println!("\u{2503} ");
}

pub fn data_as_json<T: Serialize + ?Sized>(data: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(data)
}

pub fn data_to_file(json: String, path: &Path) -> std::io::Result<()> {
    fs::write(path, json)
}

/// Renders one JSON value as a CSV cell. Lists and objects stay JSON.
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Writes the corpus table: one row per resource with its timing and direction columns.
pub fn write_table(rows: &[ResourceRow], path: &Path) -> Result<usize> {
    let extra: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.resource.extra.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::WriterBuilder::new().from_path(path)?;
    let header: Vec<&str> = RESOURCE_COLUMNS
        .iter()
        .copied()
        .chain(extra.iter().copied())
        .chain(AGGREGATE_COLUMNS.iter().copied())
        .collect();
    wtr.write_record(&header)?;

    for row in rows {
        let resource = serde_json::to_value(row.resource)?;
        let aggregated = serde_json::json!({
            "start_time": row.start_time,
            "end_time": row.end_time,
            "delta_time": row.delta_time,
            "incoming": row.incoming,
            "incoming_sizes": row.incoming_sizes,
            "outgoing": row.outgoing,
            "outgoing_sizes": row.outgoing_sizes,
        });

        let record: Vec<String> = RESOURCE_COLUMNS
            .iter()
            .chain(extra.iter())
            .map(|c| cell(resource.get(*c)))
            .chain(AGGREGATE_COLUMNS.iter().map(|c| cell(aggregated.get(*c))))
            .collect();
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(rows.len())
}
