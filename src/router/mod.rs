//! Request-path to upstream-id resolution.
//!
//! Matching order (spec.md §4.5): exact match first, then the first
//! prefix/wildcard pattern that matches in listed order (not the longest
//! one), then the catch-all `""` pattern last. Nothing matching is a
//! `NoRoute` close, never a default upstream.

use crate::config::LocationConf;
use crate::error::{ProxyError, Result};

enum Rule {
    Exact(String, String),
    Prefix(String, String),
    CatchAll(String),
}

/// Ordered, pre-classified set of locations for one listener.
pub struct Router {
    exact: Vec<Rule>,
    prefix: Vec<Rule>,
    catch_all: Option<Rule>,
}

impl Router {
    pub fn new(locations: &[LocationConf]) -> Self {
        let mut exact = Vec::new();
        let mut prefix = Vec::new();
        let mut catch_all = None;

        for loc in locations {
            if loc.pattern.is_empty() {
                // First catch-all wins; later ones are unreachable dead config.
                if catch_all.is_none() {
                    catch_all = Some(Rule::CatchAll(loc.upstream_id.clone()));
                }
            } else if let Some(stripped) = loc.pattern.strip_suffix('*') {
                prefix.push(Rule::Prefix(stripped.to_string(), loc.upstream_id.clone()));
            } else {
                exact.push(Rule::Exact(loc.pattern.clone(), loc.upstream_id.clone()));
            }
        }

        // Prefix rules stay in config order: the first one that matches
        // wins, regardless of which is more specific.
        Self { exact, prefix, catch_all }
    }

    /// Resolve `path` to an upstream id, or `NoRoute` if nothing matches.
    /// Among prefix rules, the first one in listed order that matches wins
    /// (spec.md §4.5), so a shorter prefix listed earlier beats a longer,
    /// more specific one listed later.
    pub fn resolve(&self, path: &str) -> Result<&str> {
        for rule in &self.exact {
            if let Rule::Exact(pattern, upstream_id) = rule {
                if pattern == path {
                    return Ok(upstream_id);
                }
            }
        }
        for rule in &self.prefix {
            if let Rule::Prefix(pattern, upstream_id) = rule {
                if path.starts_with(pattern.as_str()) {
                    return Ok(upstream_id);
                }
            }
        }
        if let Some(Rule::CatchAll(upstream_id)) = &self.catch_all {
            return Ok(upstream_id);
        }
        Err(ProxyError::NoRoute(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(pattern: &str, upstream: &str) -> LocationConf {
        LocationConf {
            pattern: pattern.to_string(),
            upstream_id: upstream.to_string(),
        }
    }

    // P7: no-route closes when nothing matches.
    #[test]
    fn no_catch_all_means_no_route_error() {
        let router = Router::new(&[loc("/api/", "u1")]);
        assert!(matches!(router.resolve("/other"), Err(ProxyError::NoRoute(_))));
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let router = Router::new(&[loc("/api/*", "u-prefix"), loc("/api/health", "u-exact")]);
        assert_eq!(router.resolve("/api/health").unwrap(), "u-exact");
        assert_eq!(router.resolve("/api/other").unwrap(), "u-prefix");
    }

    #[test]
    fn first_listed_prefix_match_wins_over_more_specific() {
        let router = Router::new(&[loc("/a*", "short"), loc("/a/b*", "long")]);
        // "/a*" is listed first and matches "/a/b/c" too, so it wins even
        // though "/a/b*" is the more specific rule.
        assert_eq!(router.resolve("/a/b/c").unwrap(), "short");

        let router = Router::new(&[loc("/a/b*", "long"), loc("/a*", "short")]);
        assert_eq!(router.resolve("/a/b/c").unwrap(), "long");
    }

    #[test]
    fn catch_all_is_ordered_last() {
        let router = Router::new(&[loc("", "catch"), loc("/api/*", "u1")]);
        assert_eq!(router.resolve("/api/x").unwrap(), "u1");
        assert_eq!(router.resolve("/anything").unwrap(), "catch");
    }
}
