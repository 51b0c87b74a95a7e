//! NAT-aware resolution of presentation URLs pushed by a master.
//!
//! A master builds its command URLs from its own idea of its address.  When
//! the follower reached the master through NAT, a different interface of a
//! multi-homed box, or a hostname the follower cannot resolve, that URL is
//! unreachable from here even though the command channel itself works.  The
//! resolver compares the URL against the endpoint the follower *actually*
//! used to reach the master and rewrites host and port toward it when they
//! disagree.
//!
//! Presentations can embed a second presentation via a `src` query
//! parameter that is itself a URL (picture-in-picture).  The nested URL is
//! checked and rewritten with the same rule.

use std::borrow::Cow;

use thiserror::Error;
use url::Url;

use stagelink_core::{PairedMaster, ResolvedEndpoint};

/// Error type for URL resolution.
#[derive(Debug, Error, PartialEq)]
pub enum ResolveUrlError {
    /// The command carried something `Url::parse` rejects.
    #[error("invalid presentation url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The resolved endpoint cannot be written into this URL (e.g. the
    /// scheme forbids a host).
    #[error("cannot point {url:?} at {host}:{port}")]
    HostNotApplicable {
        url: String,
        host: String,
        port: u16,
    },
}

/// Why the resolver did or did not rewrite a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteReason {
    /// The master record declares its own URLs unreachable across the link.
    NatCompat,
    /// No resolved endpoint for this master, so there is nothing to rewrite
    /// toward.
    NoEndpoint,
    /// The URL's own host/port differ from the endpoint in use.
    TopUrlMismatch,
    /// The top-level URL matches but the nested `src` URL does not.
    NestedSrcMismatch,
    /// Host and port already match everywhere.
    AlreadyMatching,
}

impl RewriteReason {
    /// Stable label used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteReason::NatCompat => "nat-compat",
            RewriteReason::NoEndpoint => "no-endpoint",
            RewriteReason::TopUrlMismatch => "top-url-mismatch",
            RewriteReason::NestedSrcMismatch => "nested-src-mismatch",
            RewriteReason::AlreadyMatching => "already-matching",
        }
    }
}

/// Outcome of the rewrite decision for one command URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteDecision {
    pub enabled: bool,
    pub reason: RewriteReason,
}

/// A command URL after resolution, with the decision that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUrl {
    pub url: String,
    pub decision: RewriteDecision,
}

/// Decides whether `url` must be rewritten toward `endpoint`.
///
/// Decision table, first match wins:
/// 1. `master.nat_compatibility` → rewrite (`nat-compat`).
/// 2. no endpoint → keep (`no-endpoint`).
/// 3. URL host/port differ from the endpoint → rewrite (`top-url-mismatch`).
/// 4. nested `src` URL host/port differ → rewrite (`nested-src-mismatch`).
/// 5. otherwise keep (`already-matching`).
pub fn should_rewrite_for_master(
    master: &PairedMaster,
    endpoint: Option<&ResolvedEndpoint>,
    url: &Url,
) -> RewriteDecision {
    if master.nat_compatibility {
        return RewriteDecision {
            enabled: true,
            reason: RewriteReason::NatCompat,
        };
    }
    let Some(endpoint) = endpoint else {
        return RewriteDecision {
            enabled: false,
            reason: RewriteReason::NoEndpoint,
        };
    };
    if !matches_endpoint(url, endpoint) {
        return RewriteDecision {
            enabled: true,
            reason: RewriteReason::TopUrlMismatch,
        };
    }
    if let Some(src) = nested_src_url(url) {
        if !matches_endpoint(&src, endpoint) {
            return RewriteDecision {
                enabled: true,
                reason: RewriteReason::NestedSrcMismatch,
            };
        }
    }
    RewriteDecision {
        enabled: false,
        reason: RewriteReason::AlreadyMatching,
    }
}

/// Resolves a raw command URL for `master`: parses it, applies the decision
/// table, and rewrites host and port (top-level and nested `src`) when the
/// decision says so.  Path, query parameters, and scheme are preserved.
///
/// # Errors
///
/// Returns [`ResolveUrlError::InvalidUrl`] when `raw` does not parse, and
/// [`ResolveUrlError::HostNotApplicable`] when the endpoint cannot be
/// written into the URL.
pub fn resolve_command_url(
    master: &PairedMaster,
    endpoint: Option<&ResolvedEndpoint>,
    raw: &str,
) -> Result<ResolvedUrl, ResolveUrlError> {
    let parsed = Url::parse(raw).map_err(|source| ResolveUrlError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    let decision = should_rewrite_for_master(master, endpoint, &parsed);
    if !decision.enabled {
        return Ok(ResolvedUrl {
            url: raw.to_string(),
            decision,
        });
    }

    // The decision table only enables a rewrite when an endpoint exists.
    let Some(endpoint) = endpoint else {
        return Ok(ResolvedUrl {
            url: raw.to_string(),
            decision: RewriteDecision {
                enabled: false,
                reason: RewriteReason::NoEndpoint,
            },
        });
    };

    let rewritten = rewrite_toward_endpoint(&parsed, endpoint)?;
    Ok(ResolvedUrl {
        url: rewritten.to_string(),
        decision,
    })
}

/// Returns a copy of `url` whose host and port (and those of a nested `src`
/// URL, when present) point at `endpoint`.  Everything else is untouched.
pub fn rewrite_toward_endpoint(
    url: &Url,
    endpoint: &ResolvedEndpoint,
) -> Result<Url, ResolveUrlError> {
    let mut rewritten = url.clone();
    point_at(&mut rewritten, endpoint)?;

    if let Some(src) = nested_src_url(url) {
        let mut src_rewritten = src;
        point_at(&mut src_rewritten, endpoint)?;
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                if key == "src" {
                    (key.into_owned(), src_rewritten.to_string())
                } else {
                    (key.into_owned(), value.into_owned())
                }
            })
            .collect();
        rewritten
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    Ok(rewritten)
}

fn point_at(url: &mut Url, endpoint: &ResolvedEndpoint) -> Result<(), ResolveUrlError> {
    let fail = |url: &Url| ResolveUrlError::HostNotApplicable {
        url: url.to_string(),
        host: endpoint.host.clone(),
        port: endpoint.port,
    };
    url.set_host(Some(&endpoint.host)).map_err(|_| fail(url))?;
    url.set_port(Some(endpoint.port)).map_err(|_| fail(url))?;
    Ok(())
}

fn matches_endpoint(url: &Url, endpoint: &ResolvedEndpoint) -> bool {
    url.host_str() == Some(endpoint.host.as_str())
        && url.port_or_known_default() == Some(endpoint.port)
}

/// Extracts the `src` query parameter when it is itself an absolute URL.
/// A `src` that is a bare path or slug is not subject to rewriting.
fn nested_src_url(url: &Url) -> Option<Url> {
    let value: Cow<'_, str> = url
        .query_pairs()
        .find(|(key, _)| key == "src")
        .map(|(_, value)| value)?;
    let nested = Url::parse(&value).ok()?;
    nested.host_str()?;
    Some(nested)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_master(nat_compatibility: bool) -> PairedMaster {
        PairedMaster {
            instance_id: Uuid::new_v4(),
            name: "main-hall".to_string(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\nAA\n-----END PUBLIC KEY-----\n"
                .to_string(),
            paired_at: 1_700_000_000_000,
            host_hint: Some("192.168.1.10".to_string()),
            pairing_port_hint: Some(1947),
            nat_compatibility,
        }
    }

    fn lan_endpoint() -> ResolvedEndpoint {
        ResolvedEndpoint {
            host: "192.168.1.10".to_string(),
            port: 1947,
        }
    }

    #[test]
    fn test_top_level_host_mismatch_rewrites_host_and_keeps_path() {
        // Arrange: master advertises a host the follower cannot reach.
        let master = make_master(false);
        let endpoint = lan_endpoint();

        // Act
        let resolved = resolve_command_url(
            &master,
            Some(&endpoint),
            "http://10.0.0.5:1947/presentations_x/slug/index.html",
        )
        .expect("resolve");

        // Assert
        assert!(resolved.decision.enabled);
        assert_eq!(resolved.decision.reason, RewriteReason::TopUrlMismatch);
        assert_eq!(
            resolved.url,
            "http://192.168.1.10:1947/presentations_x/slug/index.html"
        );
    }

    #[test]
    fn test_nested_src_mismatch_rewrites_only_the_src_host() {
        // Arrange: top-level URL already matches, the embedded one does not.
        let master = make_master(false);
        let endpoint = lan_endpoint();
        let raw = "http://192.168.1.10:1947/presentations_x/slug/index.html?src=http%3A%2F%2F10.0.0.5%3A1947%2Fpip";

        // Act
        let resolved = resolve_command_url(&master, Some(&endpoint), raw).expect("resolve");

        // Assert
        assert!(resolved.decision.enabled);
        assert_eq!(resolved.decision.reason, RewriteReason::NestedSrcMismatch);
        let rewritten = Url::parse(&resolved.url).expect("parse rewritten");
        assert_eq!(rewritten.host_str(), Some("192.168.1.10"));
        assert_eq!(rewritten.path(), "/presentations_x/slug/index.html");
        let src = rewritten
            .query_pairs()
            .find(|(k, _)| k == "src")
            .map(|(_, v)| v.into_owned())
            .expect("src param survives");
        assert_eq!(src, "http://192.168.1.10:1947/pip");
    }

    #[test]
    fn test_everything_matching_returns_url_unchanged() {
        let master = make_master(false);
        let endpoint = lan_endpoint();
        let raw = "http://192.168.1.10:1947/presentations_x/slug/index.html?src=http%3A%2F%2F192.168.1.10%3A1947%2Fpip&autoplay=1";

        let resolved = resolve_command_url(&master, Some(&endpoint), raw).expect("resolve");

        assert!(!resolved.decision.enabled);
        assert_eq!(resolved.decision.reason, RewriteReason::AlreadyMatching);
        assert_eq!(resolved.url, raw, "matching URL must pass through untouched");
    }

    #[test]
    fn test_nat_incompatible_master_always_rewrites() {
        // Even a URL that already matches gets rewritten under nat-compat.
        let master = make_master(true);
        let endpoint = lan_endpoint();

        let resolved = resolve_command_url(
            &master,
            Some(&endpoint),
            "http://192.168.1.10:1947/deck/index.html",
        )
        .expect("resolve");

        assert!(resolved.decision.enabled);
        assert_eq!(resolved.decision.reason, RewriteReason::NatCompat);
        assert_eq!(resolved.url, "http://192.168.1.10:1947/deck/index.html");
    }

    #[test]
    fn test_missing_endpoint_never_rewrites() {
        let master = make_master(false);

        let resolved =
            resolve_command_url(&master, None, "http://10.0.0.5:1947/deck/index.html")
                .expect("resolve");

        assert!(!resolved.decision.enabled);
        assert_eq!(resolved.decision.reason, RewriteReason::NoEndpoint);
        assert_eq!(resolved.url, "http://10.0.0.5:1947/deck/index.html");
    }

    #[test]
    fn test_port_mismatch_alone_triggers_rewrite() {
        let master = make_master(false);
        let endpoint = lan_endpoint();

        let resolved = resolve_command_url(
            &master,
            Some(&endpoint),
            "http://192.168.1.10:2020/deck/index.html",
        )
        .expect("resolve");

        assert_eq!(resolved.decision.reason, RewriteReason::TopUrlMismatch);
        assert_eq!(resolved.url, "http://192.168.1.10:1947/deck/index.html");
    }

    #[test]
    fn test_default_port_compares_against_explicit_endpoint_port() {
        // "http://host/x" carries an implicit port 80.
        let master = make_master(false);
        let endpoint = ResolvedEndpoint {
            host: "192.168.1.10".to_string(),
            port: 80,
        };

        let resolved =
            resolve_command_url(&master, Some(&endpoint), "http://192.168.1.10/deck/")
                .expect("resolve");

        assert_eq!(resolved.decision.reason, RewriteReason::AlreadyMatching);
    }

    #[test]
    fn test_non_url_src_parameter_is_ignored() {
        // A slug-valued src must not be mistaken for an embedded URL.
        let master = make_master(false);
        let endpoint = lan_endpoint();

        let resolved = resolve_command_url(
            &master,
            Some(&endpoint),
            "http://192.168.1.10:1947/deck/index.html?src=intro-slide",
        )
        .expect("resolve");

        assert_eq!(resolved.decision.reason, RewriteReason::AlreadyMatching);
    }

    #[test]
    fn test_other_query_parameters_survive_a_nested_rewrite() {
        let master = make_master(false);
        let endpoint = lan_endpoint();
        let raw = "http://192.168.1.10:1947/deck/index.html?autoplay=1&src=http%3A%2F%2F10.0.0.5%3A1947%2Fpip&loop=0";

        let resolved = resolve_command_url(&master, Some(&endpoint), raw).expect("resolve");

        let rewritten = Url::parse(&resolved.url).expect("parse");
        let pairs: Vec<(String, String)> = rewritten
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("autoplay".to_string(), "1".to_string()));
        assert_eq!(pairs[1].0, "src");
        assert_eq!(pairs[1].1, "http://192.168.1.10:1947/pip");
        assert_eq!(pairs[2], ("loop".to_string(), "0".to_string()));
    }

    #[test]
    fn test_invalid_url_is_reported_not_swallowed() {
        let master = make_master(false);
        let endpoint = lan_endpoint();

        let err = resolve_command_url(&master, Some(&endpoint), "not a url")
            .expect_err("must fail");

        assert!(matches!(err, ResolveUrlError::InvalidUrl { .. }));
    }

    #[test]
    fn test_nat_compat_rewrite_touches_nested_src_too() {
        let master = make_master(true);
        let endpoint = lan_endpoint();
        let raw = "http://10.0.0.5:2020/deck/index.html?src=http%3A%2F%2F10.0.0.5%3A2020%2Fpip";

        let resolved = resolve_command_url(&master, Some(&endpoint), raw).expect("resolve");

        let rewritten = Url::parse(&resolved.url).expect("parse");
        assert_eq!(rewritten.host_str(), Some("192.168.1.10"));
        assert_eq!(rewritten.port_or_known_default(), Some(1947));
        let src = rewritten
            .query_pairs()
            .find(|(k, _)| k == "src")
            .map(|(_, v)| v.into_owned())
            .expect("src param");
        assert_eq!(src, "http://192.168.1.10:1947/pip");
    }

    #[test]
    fn test_reason_labels_are_stable() {
        assert_eq!(RewriteReason::NatCompat.as_str(), "nat-compat");
        assert_eq!(RewriteReason::NoEndpoint.as_str(), "no-endpoint");
        assert_eq!(RewriteReason::TopUrlMismatch.as_str(), "top-url-mismatch");
        assert_eq!(
            RewriteReason::NestedSrcMismatch.as_str(),
            "nested-src-mismatch"
        );
        assert_eq!(RewriteReason::AlreadyMatching.as_str(), "already-matching");
    }
}
