//! Agent dial-target rewriting (§4.4). Grounded on
//! `original_source/agent.go`'s `dial` closure: match the composed
//! `network://address` string against an ordered pattern list, rewrite
//! the first match, and fall through to a real dial when nothing
//! matches.

use regex::Regex;
use url::Url;

/// One rewrite rule. `replace` may reference capture groups with `$1`,
/// `$2`, ... exactly like the regex crate's replacement syntax (the
/// same syntax the original pattern strings already use).
#[derive(Clone)]
pub struct Pattern {
    pub pattern: Regex,
    pub replace: String,
}

impl Pattern {
    pub fn new(pattern: Regex, replace: impl Into<String>) -> Self {
        Self {
            pattern,
            replace: replace.into(),
        }
    }

    /// True when two pattern lists are the element-wise same pattern
    /// string and replacement (§4.6 salient fields for Agent).
    pub fn slice_eq(a: &[Pattern], b: &[Pattern]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.pattern.as_str() == y.pattern.as_str() && x.replace == y.replace)
    }
}

/// `\w+://(?:\S+\.)?(\w+\.(agent))` → `$2://$1`: any host ending in
/// `.agent` dials the literal string `agent://<original-host>` on the
/// Intranet, closing the loop so nested tunnels can address each other
/// by synthetic name.
pub fn default_patterns() -> Vec<Pattern> {
    vec![Pattern::new(
        Regex::new(r"\w+://(?:\S+\.)?(\w+\.(agent))").expect("default pattern is valid"),
        "$2://$1",
    )]
}

/// Where a dial for `network://address` should actually go.
#[derive(Debug, PartialEq, Eq)]
pub enum DialRoute {
    /// Dial through the Intranet at this synthetic address.
    Intranet { network: String, address: String },
    /// No pattern matched; dial the real network directly.
    Direct,
}

fn host_with_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Apply `patterns` to a `network://address` dial target in order,
/// returning the first match's rewritten route. A pattern whose
/// replacement fails to parse as a URL is skipped, not fatal — the loop
/// moves on to the next candidate pattern.
pub fn resolve_dial_target(patterns: &[Pattern], network: &str, address: &str) -> DialRoute {
    let target = format!("{network}://{address}");

    for pattern in patterns {
        if !pattern.pattern.is_match(&target) {
            continue;
        }

        if pattern.replace.is_empty() {
            return DialRoute::Intranet {
                network: network.to_string(),
                address: address.to_string(),
            };
        }

        let replaced = pattern.pattern.replace(&target, pattern.replace.as_str());
        match Url::parse(&replaced) {
            Ok(url) => {
                return DialRoute::Intranet {
                    network: url.scheme().to_string(),
                    address: host_with_port(&url),
                }
            }
            Err(_) => continue,
        }
    }

    DialRoute::Direct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_rewrites_dot_agent_hosts() {
        let patterns = default_patterns();
        let route = resolve_dial_target(&patterns, "tcp", "server.agent");
        assert_eq!(
            route,
            DialRoute::Intranet {
                network: "agent".to_string(),
                address: "server.agent".to_string(),
            }
        );
    }

    #[test]
    fn default_pattern_rewrites_deep_subdomain() {
        let patterns = default_patterns();
        let route = resolve_dial_target(&patterns, "tcp", "leaf.branch.server.agent");
        assert_eq!(
            route,
            DialRoute::Intranet {
                network: "agent".to_string(),
                address: "server.agent".to_string(),
            }
        );
    }

    #[test]
    fn non_matching_target_dials_direct() {
        let patterns = default_patterns();
        let route = resolve_dial_target(&patterns, "tcp", "example.com:443");
        assert_eq!(route, DialRoute::Direct);
    }

    #[test]
    fn empty_replacement_dials_through_intranet_unmodified() {
        let patterns = vec![Pattern::new(Regex::new(r"^tcp://special$").unwrap(), "")];
        let route = resolve_dial_target(&patterns, "tcp", "special");
        assert_eq!(
            route,
            DialRoute::Intranet {
                network: "tcp".to_string(),
                address: "special".to_string(),
            }
        );
    }

    #[test]
    fn slice_eq_detects_pattern_or_replace_changes() {
        let a = default_patterns();
        let b = default_patterns();
        assert!(Pattern::slice_eq(&a, &b));

        let c = vec![Pattern::new(Regex::new(r"^x$").unwrap(), "y")];
        assert!(!Pattern::slice_eq(&a, &c));
    }
}
