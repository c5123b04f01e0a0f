//! Tracker and third-party labelling of reconstructed resources.
//!
//! The rule engine sits behind [FilterEngine]; the shipped implementation compiles
//! Adblock Plus / uBlock style lists with the `adblock` crate.
use super::containers::Resource;
use super::domain::DomainResolver;
use crate::error::{Error, Result};
use adblock::lists::{FilterSet, ParseOptions};
use adblock::request::Request;
use adblock::Engine;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of one filter engine lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterMatch {
    pub matched: bool,
    /// The rule that matched, as written in the list.
    pub filter: Option<String>,
}

/// Decides whether a request is a tracker.
///
/// `hostname` is the resource's registrable domain and `first_party` the host the visit
/// settled on. Engines that parse `url` themselves are free to ignore `hostname`.
pub trait FilterEngine {
    fn classify(&self, url: &str, hostname: &str, first_party: &str, request_type: &str) -> FilterMatch;
}

pub struct AdblockEngine {
    engine: Engine,
}

impl AdblockEngine {
    /// Compiles raw list lines into an engine.
    ///
    /// Blank lines, `!` comments and `[Adblock ...]` headers are skipped. Lists that hold
    /// rules of which none parse are refused.
    pub fn new(rules: &[String]) -> Result<Self> {
        if rules.is_empty() {
            log::warn!("Building filter engine without any rules, nothing will be labelled a tracker.");
        }

        // Debug mode keeps each rule as written, so a match can report its filter.
        let mut filter_set = FilterSet::new(true);
        let mut candidates = 0;
        let mut parsed = 0;
        for rule in rules.iter().map(|r| r.trim()) {
            if rule.is_empty() || rule.starts_with('!') || rule.starts_with('[') {
                continue;
            }
            candidates += 1;
            match filter_set.add_filter(rule, ParseOptions::default()) {
                Ok(()) => parsed += 1,
                Err(err) => log::debug!("Unusable filter {rule:?}: {err:?}"),
            }
        }

        if candidates > 0 && parsed == 0 {
            return Err(Error::FilterList(format!("none of {candidates} filter rules could be parsed")));
        }
        log::debug!("Compiled {parsed} of {candidates} filter rules");

        Ok(Self {
            engine: Engine::from_filter_set(filter_set, true),
        })
    }
}

impl FilterEngine for AdblockEngine {
    fn classify(&self, url: &str, _hostname: &str, first_party: &str, request_type: &str) -> FilterMatch {
        // Host-anchored rules need the full request host, which Request::new takes from the url.
        let source_url = format!("https://{first_party}/");
        let request = match Request::new(url, &source_url, request_type) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Filter engine cannot parse {url}: {err:?}");
                return FilterMatch::default();
            }
        };

        let result = self.engine.check_network_request(&request);
        FilterMatch {
            matched: result.matched,
            filter: result.filter,
        }
    }
}

/// Reads every non-hidden file in `dir` as a filter list and concatenates their lines.
pub fn load_rules(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(Error::FilterList(format!("no filter list directory at {}", dir.display())));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            !p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true)
        })
        .collect();
    files.sort();

    let mut rules = Vec::new();
    for file in files {
        log::debug!("Reading filterset {}", file.display());
        let text = fs::read_to_string(&file)?;
        rules.extend(text.lines().map(String::from));
    }

    log::info!("Loaded {} filter rules from {}", rules.len(), dir.display());
    Ok(rules)
}

/// Sets hostname, third-party and tracker fields on each resource.
///
/// Expects attribution (`first_party`, `context`, `ip_context`) to be filled in already.
/// Pure in its inputs, so relabelling an unchanged resource gives the same result.
pub fn label_resources(resources: &mut [Resource], engine: &dyn FilterEngine, domains: &DomainResolver) {
    for resource in resources.iter_mut() {
        resource.hostname = domains.hostname(&resource.url);
        resource.is_tp = is_thirdparty(resource, domains);

        let first_party = resource.first_party.as_deref().unwrap_or(&resource.website_call);
        let result = engine.classify(&resource.url, &resource.hostname, first_party, resource.type_tag());
        resource.is_tracker = result.matched;
        resource.filter = result.filter;
    }
}

/// Third party if the registrable domain differs from the first party's. Hosts without one
/// (bare IPs) are compared by resolved address instead.
pub fn is_thirdparty(resource: &Resource, domains: &DomainResolver) -> bool {
    match domains.registrable_domain(&resource.url) {
        Some(domain) => resource.context.as_deref() != Some(domain.as_str()),
        None => resource.ip != resource.ip_context,
    }
}
