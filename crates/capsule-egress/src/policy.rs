//! Target parsing and the effective allowlist.

use tracing::debug;
use url::Url;

use capsule_core::{Allowlist, AllowlistRule};

use crate::address::check_host;
use crate::error::{EgressError, EgressResult};

/// A validated outbound target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressTarget {
    pub url: Url,
    /// Lowercased hostname as it appears in the URL.
    pub host: String,
    pub port: u16,
}

/// Parse a target URL: http/https only, and no literal internal address.
/// Runs before any DNS lookup or allowlist match.
pub fn parse_target(raw: &str) -> EgressResult<EgressTarget> {
    let mut url = Url::parse(raw.trim()).map_err(|e| EgressError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(EgressError::UnsupportedScheme(other.to_string())),
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| EgressError::InvalidUrl("missing host".into()))?
        .to_ascii_lowercase();
    if !url.username().is_empty() || url.password().is_some() {
        return Err(EgressError::InvalidUrl("credentials in url".into()));
    }
    check_host(&host).map_err(|reason| EgressError::Blocked {
        host: host.clone(),
        reason,
    })?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| EgressError::InvalidUrl("missing port".into()))?;
    url.set_fragment(None);
    Ok(EgressTarget { url, host, port })
}

/// Manifest capability intersected with the deployment-wide ceiling. A
/// target passes only when both lists admit it; an empty global list
/// admits nothing.
#[derive(Debug, Clone)]
pub struct EffectiveAllowlist<'a> {
    pub manifest: &'a Allowlist,
    pub global: &'a Allowlist,
}

impl<'a> EffectiveAllowlist<'a> {
    pub fn new(manifest: &'a Allowlist, global: &'a Allowlist) -> Self {
        Self { manifest, global }
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty() || self.global.is_empty()
    }

    /// Manifest rule that admits the target, if the global list agrees.
    pub fn authorize(&self, target: &EgressTarget) -> EgressResult<&'a AllowlistRule> {
        let manifest_rule = self.manifest.matching_rule(&target.host, target.port);
        let global_ok = self.global.permits(&target.host, target.port);
        match manifest_rule {
            Some(rule) if global_ok => {
                debug!(host = %target.host, port = target.port, rule = %rule, "egress target allowed");
                Ok(rule)
            }
            _ => Err(EgressError::NotAllowlisted {
                host: target.host.clone(),
                port: target.port,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::BlockReason;

    fn list(entries: &[&str]) -> Allowlist {
        Allowlist::parse_all(entries).unwrap()
    }

    #[test]
    fn parses_http_and_https_targets() {
        let t = parse_target("https://API.example.com/v1?q=1#frag").unwrap();
        assert_eq!(t.host, "api.example.com");
        assert_eq!(t.port, 443);
        assert_eq!(t.url.fragment(), None);
        assert_eq!(parse_target("http://example.com:8080/").unwrap().port, 8080);
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(matches!(parse_target("ftp://example.com/"), Err(EgressError::UnsupportedScheme(_))));
        assert!(matches!(parse_target("file:///etc/passwd"), Err(EgressError::UnsupportedScheme(_))));
        assert!(matches!(parse_target("not a url"), Err(EgressError::InvalidUrl(_))));
        assert!(matches!(parse_target("https://user:pw@example.com/"), Err(EgressError::InvalidUrl(_))));
    }

    #[test]
    fn metadata_endpoint_is_link_local() {
        match parse_target("http://169.254.169.254/latest/meta-data") {
            Err(EgressError::Blocked { reason, .. }) => assert_eq!(reason, BlockReason::LinkLocalAddress),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn numeric_ipv4_forms_are_normalized_then_blocked() {
        for raw in ["http://2130706433/", "http://127.1/", "http://0x7f000001/"] {
            match parse_target(raw) {
                Err(EgressError::Blocked { reason, .. }) => assert_eq!(reason, BlockReason::LoopbackAddress, "{raw}"),
                other => panic!("{raw}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn ipv6_and_localhost_are_blocked() {
        assert!(matches!(
            parse_target("http://[::1]:8080/"),
            Err(EgressError::Blocked { reason: BlockReason::Ipv6Literal, .. })
        ));
        assert!(matches!(
            parse_target("http://localhost/"),
            Err(EgressError::Blocked { reason: BlockReason::Localhost, .. })
        ));
    }

    #[test]
    fn intersection_requires_both_lists() {
        let manifest = list(&["api.example.com", "*.cdn.test"]);
        let global = list(&["*.example.com"]);
        let effective = EffectiveAllowlist::new(&manifest, &global);

        let ok = parse_target("https://api.example.com/x").unwrap();
        assert_eq!(effective.authorize(&ok).unwrap().host, "api.example.com");

        let manifest_only = parse_target("https://img.cdn.test/x").unwrap();
        assert!(matches!(effective.authorize(&manifest_only), Err(EgressError::NotAllowlisted { .. })));

        let global_only = parse_target("https://other.example.com/x").unwrap();
        assert!(effective.authorize(&global_only).is_err());
    }

    #[test]
    fn empty_global_admits_nothing() {
        let manifest = list(&["api.example.com"]);
        let global = Allowlist::default();
        let effective = EffectiveAllowlist::new(&manifest, &global);
        assert!(effective.is_empty());
        let target = parse_target("https://api.example.com/").unwrap();
        assert!(effective.authorize(&target).is_err());
    }

    #[test]
    fn port_must_be_admitted_by_both() {
        let manifest = list(&["api.example.com:8443"]);
        let global = list(&["api.example.com"]);
        let effective = EffectiveAllowlist::new(&manifest, &global);
        let target = parse_target("https://api.example.com:8443/").unwrap();
        assert!(effective.authorize(&target).is_err());
    }
}
