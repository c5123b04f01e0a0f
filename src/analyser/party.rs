//! First-party resolution.
//!
//! The site a crawl ends up on is not necessarily the one it asked for. We follow redirects
//! issued by the current first party until it answers with a 2xx; that host is the baseline
//! for third-party checks.
use super::containers::Resource;
use super::domain::DomainResolver;
use super::utils::netloc;

#[derive(Clone, Debug)]
pub struct FirstPartyResolver {
    first_party: String,
    is_final: bool,
}

impl FirstPartyResolver {
    pub fn new(website: &str) -> Self {
        Self {
            first_party: website.to_string(),
            is_final: false,
        }
    }

    /// Feeds one response into the chain.
    ///
    /// Only responses for the current first party count, and only until the chain is final.
    /// A redirect with a host advances the chain; otherwise a 2xx status ends it.
    pub fn observe(&mut self, response_url: &str, location: Option<&str>, status: Option<&str>) {
        if self.is_final {
            return;
        }
        if netloc(response_url).as_deref() != Some(self.first_party.as_str()) {
            return;
        }

        if let Some(location) = location {
            match netloc(location) {
                Some(next) => {
                    log::debug!("First party redirects {} -> {}", self.first_party, next);
                    self.first_party = next;
                }
                None => log::debug!("Ignoring relative redirect {location} on {}", self.first_party),
            }
        } else if status.map(|s| s.trim_start().starts_with('2')).unwrap_or(false) {
            log::debug!("First party settled on {}", self.first_party);
            self.is_final = true;
        }
    }

    pub fn first_party(&self) -> &str {
        &self.first_party
    }

    pub fn into_first_party(self) -> String {
        self.first_party
    }
}

/// Stamps the resolved first party onto every resource of a study.
///
/// `context` is the registrable domain of the first party; `ip_context` the address the
/// first party was served from, used for third-party checks on bare-IP resources.
pub fn attribute_resources(resources: &mut [Resource], first_party: &str, website: &str, domains: &DomainResolver) {
    let ip_first = resources
        .iter()
        .find(|r| netloc(&r.url).as_deref() == Some(first_party))
        .and_then(|r| r.ip.clone());

    let context = domains.registrable_domain(first_party).unwrap_or_else(|| {
        log::error!("No registrable domain for first party {first_party}, using the host as context");
        first_party.to_string()
    });

    if !is_expected_context(website, &context, domains) {
        log::error!("Different context called website={website} context={context}");
    }

    for resource in resources.iter_mut() {
        resource.first_party = Some(first_party.to_string());
        resource.context = Some(context.clone());
        resource.ip_context = ip_first.clone();
    }
}

/// Whether the crawl stayed with the site it was sent to: the leading label of the
/// requested site's registrable domain must appear in the resolved context.
/// `example.com` landing on `example.de` is fine, landing on a parking page is not.
pub fn is_expected_context(website: &str, context: &str, domains: &DomainResolver) -> bool {
    let requested = domains
        .registrable_domain(website)
        .unwrap_or_else(|| website.to_string());
    let label = requested.split('.').next().unwrap_or(&requested);

    context.contains(label)
}
