//! Registrable domain (eTLD+1) lookups against the Public Suffix List.
use crate::error::{Error, Result};
use publicsuffix::{List, Psl};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use url::{Host, Url};

/// Reads a Public Suffix List in the standard `public_suffix_list.dat` format.
pub fn load_suffix_list(path: &Path) -> Result<List> {
    let text = fs::read_to_string(path).map_err(|e| Error::SuffixList {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    text.parse::<List>().map_err(|e| Error::SuffixList {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Memoizing registrable-domain lookup, keyed by the raw input string.
///
/// One resolver lives for one study; the same URL is resolved for the hostname, the
/// third-party check and the filter engine, so results are cached.
pub struct DomainResolver<'a> {
    list: &'a List,
    cache: RefCell<HashMap<String, Option<String>>>,
}

impl<'a> DomainResolver<'a> {
    pub fn new(list: &'a List) -> Self {
        Self {
            list,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Registrable domain of a URL or a bare host name (`www.a.co.uk` -> `a.co.uk`).
    ///
    /// `None` for IP literals, public suffixes themselves and anything unparsable.
    pub fn registrable_domain(&self, input: &str) -> Option<String> {
        if let Some(hit) = self.cache.borrow().get(input) {
            return hit.clone();
        }

        let resolved = self.resolve(input);
        self.cache.borrow_mut().insert(input.to_string(), resolved.clone());
        resolved
    }

    /// Hostname used for grouping and filtering: the registrable domain, or the raw host
    /// when there is none (bare IPs).
    pub fn hostname(&self, url: &str) -> String {
        self.registrable_domain(url)
            .or_else(|| super::utils::netloc(url))
            .unwrap_or_default()
    }

    fn resolve(&self, input: &str) -> Option<String> {
        // Bare hosts are given a scheme so they parse like URLs.
        let parsed = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("http://{input}"))
        }
        .ok()?;

        let host = match parsed.host()? {
            Host::Domain(d) => d.trim_end_matches('.').to_ascii_lowercase(),
            Host::Ipv4(_) | Host::Ipv6(_) => return None,
        };

        let domain = self.list.domain(host.as_bytes())?;
        std::str::from_utf8(domain.as_bytes()).ok().map(String::from)
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}
