//! Cookie federation - harvest cookies from live pages, replay into a fresh context
//!
//! A freshly created context cannot borrow another context's cookie jar
//! across CDP isolation boundaries; the sanctioned path is to read cookies
//! from a context with live navigation history and write them into the
//! target, per domain, after anchoring the target on that domain. All of this
//! is best-effort: every sub-operation degrades to a recorded skip, never an
//! aborted acquire.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cdp::protocol::TargetSummary;
use crate::context::BrowsingContext;
use crate::probe::{Endpoint, ReadinessProbe, PROBE_TIMEOUT};

/// Bound for each probe-page navigation (document-loaded, not full load).
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Cookie as CDP reports it. De-duplication identity is `(name, domain)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

impl Cookie {
    fn identity(&self) -> (String, String) {
        (self.name.clone(), self.domain.clone())
    }

    /// Cookie domain with the host-only leading dot stripped.
    fn bare_domain(&self) -> &str {
        self.domain.trim_start_matches('.')
    }
}

/// Does a cookie scoped to `cookie_domain` belong to `probed`? Exact match,
/// or the (dot-stripped) cookie domain is a suffix of the probed host.
pub fn domain_matches(cookie_domain: &str, probed: &str) -> bool {
    let cookie_domain = cookie_domain.trim_start_matches('.');
    // Cookie domains never carry ports; compare against the bare host.
    let probed_host = probed.split(':').next().unwrap_or(probed);
    probed_host == cookie_domain || probed_host.ends_with(&format!(".{}", cookie_domain))
}

/// De-duplicate by `(name, domain)`, first-seen wins.
pub fn dedupe_cookies(cookies: Vec<Cookie>) -> Vec<Cookie> {
    let mut seen = HashSet::new();
    cookies
        .into_iter()
        .filter(|cookie| seen.insert(cookie.identity()))
        .collect()
}

/// Group cookies by bare domain, preserving first-seen domain order.
pub fn group_by_domain(cookies: &[Cookie]) -> Vec<(String, Vec<Cookie>)> {
    let mut groups: Vec<(String, Vec<Cookie>)> = Vec::new();
    for cookie in cookies {
        let key = cookie.bare_domain().to_string();
        match groups.iter_mut().find(|(domain, _)| *domain == key) {
            Some((_, group)) => group.push(cookie.clone()),
            None => groups.push((key, vec![cookie.clone()])),
        }
    }
    groups
}

/// Authority (host, plus `:port` when explicit) of a page URL.
fn authority_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_string();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// HTTP page targets reduced to unique authorities, first-seen order - at
/// most one probe per domain no matter how many tabs it has open.
pub fn unique_page_domains(targets: &[TargetSummary]) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for target in targets.iter().filter(|t| t.is_http_page()) {
        let Some(authority) = authority_of(&target.url) else {
            continue;
        };
        if seen.insert(authority.clone()) {
            domains.push((authority, target.url.clone()));
        }
    }
    domains
}

/// Outcome of one per-domain sub-operation. Skips carry the reason so the
/// aggregated warning list is assertable instead of silently swallowed.
#[derive(Debug)]
enum DomainProbe {
    Harvested(Vec<Cookie>),
    Skipped { domain: String, reason: String },
}

/// What federation accomplished: cookies installed plus every per-domain
/// degradation that happened along the way.
#[derive(Debug, Default)]
pub struct FederationReport {
    pub installed: usize,
    pub warnings: Vec<String>,
}

/// Harvests cookies per domain from the browser's live pages and replays
/// them into a freshly created context.
pub struct CookieFederator {
    navigation_timeout: Duration,
}

impl CookieFederator {
    pub fn new() -> Self {
        Self {
            navigation_timeout: NAVIGATION_TIMEOUT,
        }
    }

    /// Best-effort federation; never fails the acquire flow. Strictly
    /// sequential per domain - probes share one context, and concurrent
    /// navigations on shared context state are not safe under CDP.
    pub async fn federate(
        &self,
        probe: &ReadinessProbe,
        endpoint: &Endpoint,
        context: &BrowsingContext,
    ) -> FederationReport {
        let mut report = FederationReport::default();

        let targets = match probe.list_targets(endpoint, PROBE_TIMEOUT).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("cookie federation skipped: target listing failed: {}", e);
                report.warnings.push(format!("target listing failed: {}", e));
                return report;
            }
        };

        let domains = unique_page_domains(&targets);
        tracing::info!(
            "federating cookies from {} unique domain(s) across {} target(s)",
            domains.len(),
            targets.len()
        );

        let mut harvested = Vec::new();
        for (domain, origin_url) in &domains {
            match self.harvest_domain(context, domain, origin_url).await {
                DomainProbe::Harvested(cookies) => {
                    tracing::debug!("harvested {} cookie(s) from {}", cookies.len(), domain);
                    harvested.extend(cookies);
                }
                DomainProbe::Skipped { domain, reason } => {
                    tracing::debug!("skipped {}: {}", domain, reason);
                    report.warnings.push(format!("{}: {}", domain, reason));
                }
            }
        }

        let merged = dedupe_cookies(harvested);

        for (domain, cookies) in group_by_domain(&merged) {
            match self.install_domain(context, &domain, &cookies).await {
                Ok(count) => report.installed += count,
                Err(reason) => {
                    tracing::warn!("installing cookies for {} failed: {}", domain, reason);
                    report.warnings.push(format!("{}: {}", domain, reason));
                }
            }
        }

        if report.installed == 0 {
            tracing::warn!(
                "no cookies federated; make sure the running browser has an authenticated \
                 tab open, or provide cookies explicitly via configuration"
            );
        } else {
            tracing::info!("federated {} cookie(s) into the new context", report.installed);
        }

        report
    }

    /// Navigate a temporary page to the domain's original URL and read back
    /// the cookies that belong to it. The page closes on every exit path.
    async fn harvest_domain(
        &self,
        context: &BrowsingContext,
        domain: &str,
        origin_url: &str,
    ) -> DomainProbe {
        let page = match context.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                return DomainProbe::Skipped {
                    domain: domain.to_string(),
                    reason: format!("opening probe page failed: {}", e),
                }
            }
        };

        let outcome = async {
            page.navigate_and_wait(origin_url, self.navigation_timeout)
                .await
                .map_err(|e| format!("navigation failed: {}", e))?;
            let jar = context
                .cookies()
                .await
                .map_err(|e| format!("cookie read failed: {}", e))?;
            Ok::<_, String>(
                jar.into_iter()
                    .filter(|cookie| domain_matches(&cookie.domain, domain))
                    .collect::<Vec<_>>(),
            )
        }
        .await;

        context.close_page(&page.target_id).await;

        match outcome {
            Ok(cookies) => DomainProbe::Harvested(cookies),
            Err(reason) => DomainProbe::Skipped {
                domain: domain.to_string(),
                reason,
            },
        }
    }

    /// Anchor a temporary page on the domain (https first, http fallback),
    /// then install its cookies. The cookie write API only accepts writes
    /// for domains the context has at least notionally visited.
    async fn install_domain(
        &self,
        context: &BrowsingContext,
        domain: &str,
        cookies: &[Cookie],
    ) -> Result<usize, String> {
        let page = context
            .new_page("about:blank")
            .await
            .map_err(|e| format!("opening anchor page failed: {}", e))?;

        let mut anchored = page
            .navigate_and_wait(format!("https://{}", domain), self.navigation_timeout)
            .await
            .is_ok();
        if !anchored {
            anchored = page
                .navigate_and_wait(format!("http://{}", domain), self.navigation_timeout)
                .await
                .is_ok();
        }

        let result = if anchored {
            context
                .add_cookies(cookies)
                .await
                .map(|_| cookies.len())
                .map_err(|e| format!("cookie install failed: {}", e))
        } else {
            Err("anchor navigation failed over https and http".to_string())
        };

        context.close_page(&page.target_id).await;
        result
    }
}

impl Default for CookieFederator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, domain: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: "v".to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            expires: None,
            http_only: None,
            secure: None,
            same_site: None,
        }
    }

    fn page_target(id: &str, url: &str) -> TargetSummary {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "page",
            "url": url,
        }))
        .unwrap()
    }

    #[test]
    fn dedupe_is_idempotent_on_identity() {
        let cookies = vec![
            cookie("sid", "example.com"),
            cookie("sid", "example.com"),
            cookie("sid", ".example.com"),
            cookie("theme", "example.com"),
        ];
        let deduped = dedupe_cookies(cookies);
        // Distinct (name, domain) pairs survive; repeats collapse.
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].domain, "example.com");
    }

    #[test]
    fn first_seen_wins_on_duplicate_identity() {
        let mut first = cookie("sid", "example.com");
        first.value = "first".to_string();
        let mut second = cookie("sid", "example.com");
        second.value = "second".to_string();

        let deduped = dedupe_cookies(vec![first, second]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].value, "first");
    }

    #[test]
    fn domain_matching_accepts_exact_and_suffix() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches(".example.com", "example.com"));
        assert!(domain_matches(".example.com", "www.example.com"));
        assert!(domain_matches("example.com", "example.com:8443"));
        assert!(!domain_matches("example.com", "other.com"));
        assert!(!domain_matches("wexample.com", "example.com"));
        assert!(!domain_matches(".example.com", "badexample.com"));
    }

    #[test]
    fn three_targets_two_domains() {
        let targets = vec![
            page_target("A", "http://a.com/x"),
            page_target("B", "http://a.com/y"),
            page_target("C", "http://b.com/z"),
        ];
        let domains = unique_page_domains(&targets);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].0, "a.com");
        assert_eq!(domains[0].1, "http://a.com/x"); // first tab's URL wins
        assert_eq!(domains[1].0, "b.com");
    }

    #[test]
    fn non_page_and_non_http_targets_are_ignored() {
        let targets: Vec<TargetSummary> = serde_json::from_value(serde_json::json!([
            {"id": "A", "type": "page", "url": "chrome://newtab/"},
            {"id": "B", "type": "iframe", "url": "https://ads.example.com/"},
            {"id": "C", "type": "page", "url": "https://example.com:8443/app"},
        ]))
        .unwrap();
        let domains = unique_page_domains(&targets);
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].0, "example.com:8443");
    }

    #[test]
    fn grouping_preserves_domain_order() {
        let cookies = vec![
            cookie("a", ".b.com"),
            cookie("b", "a.com"),
            cookie("c", "b.com"),
        ];
        let groups = group_by_domain(&cookies);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b.com");
        assert_eq!(groups[0].1.len(), 2); // dotted and bare b.com coalesce
        assert_eq!(groups[1].0, "a.com");
    }

    #[test]
    fn skipped_domains_do_not_disturb_others() {
        // Fault isolation at the aggregation level: a skip for one domain
        // leaves the other domains' membership in the merged set intact.
        let probes = vec![
            DomainProbe::Harvested(vec![cookie("sid", "a.com")]),
            DomainProbe::Skipped {
                domain: "b.com".to_string(),
                reason: "navigation failed: Request timeout".to_string(),
            },
            DomainProbe::Harvested(vec![cookie("tok", "c.com")]),
        ];

        let mut harvested = Vec::new();
        let mut warnings = Vec::new();
        for probe in probes {
            match probe {
                DomainProbe::Harvested(cookies) => harvested.extend(cookies),
                DomainProbe::Skipped { domain, reason } => {
                    warnings.push(format!("{}: {}", domain, reason))
                }
            }
        }

        let merged = dedupe_cookies(harvested);
        let domains: Vec<_> = merged.iter().map(|c| c.bare_domain()).collect();
        assert_eq!(domains, vec!["a.com", "c.com"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("b.com:"));
    }

    #[test]
    fn cookie_wire_shape_is_camel_case() {
        let mut c = cookie("sid", "example.com");
        c.http_only = Some(true);
        c.same_site = Some("Lax".to_string());

        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["httpOnly"], serde_json::json!(true));
        assert_eq!(value["sameSite"], serde_json::json!("Lax"));
        assert!(value.get("expires").is_none());
    }
}
