//! URL rewrite rules
//! Redirect vendor urls found in responses to the proxy

use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Rule loading errors
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid rewrite pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read rewrite rules: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse rewrite rules: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    pattern: String,
    replacement: String,
}

/// A single pattern -> replacement rule
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, RewriteError> {
        let regex = Regex::new(pattern).map_err(|source| RewriteError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: regex,
            replacement: replacement.to_string(),
        })
    }
}

/// Ordered list of rewrite rules
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    rules: Vec<RewriteRule>,
}

impl RewriteRules {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// Default rules: send the vendor's sync service hosts to `server_url`
    pub fn for_server(server_url: &str) -> Self {
        let pattern = r"https?://(todo|cde|firs|det)-[a-z0-9-]+\.amazon\.com/";
        // the replacement is literal text apart from `$`, which must be escaped
        let replacement = server_url.replace('$', "$$");
        match RewriteRule::new(pattern, &replacement) {
            Ok(rule) => Self::new(vec![rule]),
            Err(_) => Self::default(),
        }
    }

    /// Load rules from a JSON array of `{"pattern": ..., "replacement": ...}` objects
    pub fn from_json(json: &str) -> Result<Self, RewriteError> {
        let specs: Vec<RuleSpec> = serde_json::from_str(json)?;
        let rules = specs
            .iter()
            .map(|s| RewriteRule::new(&s.pattern, &s.replacement))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RewriteError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a url with the first matching rule.
    ///
    /// Only the matched span is replaced; the replacement may refer to capture groups.
    /// Without a match the url comes back unchanged.
    pub fn rewrite(&self, url: &str) -> String {
        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(url) {
                let span = caps.get(0).map_or(0..0, |m| m.range());
                let mut out = String::with_capacity(url.len());
                out.push_str(&url[..span.start]);
                caps.expand(&rule.replacement, &mut out);
                out.push_str(&url[span.end..]);
                return out;
            }
        }
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_keeps_surrounding_text() {
        let rules = RewriteRules::new(vec![
            RewriteRule::new(r"amazon\.example\.com/(.*)", "proxy.local/$1").unwrap(),
        ]);

        assert_eq!(
            rules.rewrite("https://amazon.example.com/path?x=1"),
            "https://proxy.local/path?x=1"
        );
    }

    #[test]
    fn test_no_match_is_identity() {
        let rules = RewriteRules::new(vec![RewriteRule::new(r"nomatch\.com", "x").unwrap()]);
        let url = "https://cdn.example.org/a b?c=ü";
        assert_eq!(rules.rewrite(url), url);
        assert_eq!(RewriteRules::default().rewrite(url), url);
    }

    #[test]
    fn test_only_first_matching_rule_applies() {
        let rules = RewriteRules::new(vec![
            RewriteRule::new("a", "b").unwrap(),
            RewriteRule::new("b", "c").unwrap(),
        ]);
        assert_eq!(rules.rewrite("xa"), "xb");
        assert_eq!(rules.rewrite("xb"), "xc");
    }

    #[test]
    fn test_named_groups() {
        let rules = RewriteRules::new(vec![
            RewriteRule::new(r"//(?P<svc>\w+)\.vendor\.com", "//proxy/${svc}").unwrap(),
        ]);
        assert_eq!(rules.rewrite("https://todo.vendor.com/x"), "https://proxy/todo/x");
    }

    #[test]
    fn test_default_rules_for_server() {
        let rules = RewriteRules::for_server("https://ksp.local/");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules.rewrite("https://cde-ta-g7g.amazon.com/FionaCDEServiceEngine/UploadSnapshot"),
            "https://ksp.local/FionaCDEServiceEngine/UploadSnapshot"
        );
        let cdn = "https://d1.cloudfront.net/book.azw";
        assert_eq!(rules.rewrite(cdn), cdn);
    }

    #[test]
    fn test_from_json() {
        let rules = RewriteRules::from_json(
            r#"[{"pattern": "old\\.host", "replacement": "new.host"}]"#,
        )
        .unwrap();
        assert_eq!(rules.rewrite("http://old.host/p"), "http://new.host/p");

        assert!(matches!(
            RewriteRules::from_json(r#"[{"pattern": "(", "replacement": ""}]"#),
            Err(RewriteError::Pattern { .. })
        ));
        assert!(matches!(RewriteRules::from_json("{"), Err(RewriteError::Json(_))));
    }
}
