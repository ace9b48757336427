use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use mockpod_http::HttpHeader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

/// Pure request predicate: `(method, url) → bool`.
///
/// A missing `method` matches any method; method comparison is
/// case-insensitive. A `Regex` pattern that fails to compile never matches
/// and never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMatcher {
    #[serde(rename = "urlPattern")]
    pub url_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "matchType")]
    pub match_type: MatchType,
}

impl RequestMatcher {
    pub fn matches(&self, method: &str, url: &str) -> bool {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        match self.match_type {
            MatchType::Exact => url == self.url_pattern,
            MatchType::Contains => url.contains(&self.url_pattern),
            MatchType::Regex => match Regex::new(&self.url_pattern) {
                Ok(pattern) => pattern.is_match(url),
                Err(_) => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
    #[serde(default)]
    pub body: String,
    /// Seconds to wait before flushing the response; fractional values allowed.
    #[serde(
        rename = "delaySeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub matcher: RequestMatcher,
    #[serde(rename = "mockResponse")]
    pub response: MockResponse,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "updatedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MockRule {
    pub fn new(name: impl Into<String>, matcher: RequestMatcher, response: MockResponse) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            matcher,
            response,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// Named, ordered collection of rules as exported to and imported from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: Uuid,
    pub name: String,
    pub rules: Vec<MockRule>,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, rules: Vec<MockRule>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            rules,
            is_active: false,
            created_at: Utc::now(),
            description: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parses an exported rule set. The id is regenerated and the set comes
    /// back inactive, so an import never collides with or silently activates
    /// over existing sets.
    pub fn import_json(json: &str) -> serde_json::Result<Self> {
        let mut set: Self = serde_json::from_str(json)?;
        set.id = Uuid::new_v4();
        set.is_active = false;
        Ok(set)
    }
}

enum CompiledUrlMatcher {
    Exact(String),
    Contains(String),
    Regex(Regex),
    NeverMatches,
}

impl CompiledUrlMatcher {
    fn matches(&self, url: &str) -> bool {
        match self {
            Self::Exact(pattern) => url == pattern,
            Self::Contains(pattern) => url.contains(pattern.as_str()),
            Self::Regex(pattern) => pattern.is_match(url),
            Self::NeverMatches => false,
        }
    }
}

struct CompiledRule {
    method: Option<String>,
    url: CompiledUrlMatcher,
    rule: MockRule,
}

fn compile_rules(rules: Vec<MockRule>) -> Vec<CompiledRule> {
    rules
        .into_iter()
        .filter(|rule| rule.enabled)
        .map(|rule| {
            let url = match rule.matcher.match_type {
                MatchType::Exact => CompiledUrlMatcher::Exact(rule.matcher.url_pattern.clone()),
                MatchType::Contains => {
                    CompiledUrlMatcher::Contains(rule.matcher.url_pattern.clone())
                }
                MatchType::Regex => match Regex::new(&rule.matcher.url_pattern) {
                    Ok(pattern) => CompiledUrlMatcher::Regex(pattern),
                    Err(_) => CompiledUrlMatcher::NeverMatches,
                },
            };
            CompiledRule {
                method: rule.matcher.method.clone(),
                url,
                rule,
            }
        })
        .collect()
}

/// First-match rule lookup over an atomically swappable snapshot.
///
/// `replace` compiles the incoming list (disabled rules dropped, regexes
/// compiled once, compile failures degraded to never-match) and swaps it in
/// under a write lock. `find_match` clones the snapshot `Arc` under a read
/// lock and evaluates without holding it, so a swap mid-transaction never
/// interleaves with an evaluation.
#[derive(Default)]
pub struct RuleEngine {
    active: RwLock<Arc<Vec<CompiledRule>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, rules: Vec<MockRule>) {
        let compiled = Arc::new(compile_rules(rules));
        let mut slot = self.active.write().unwrap_or_else(|poison| poison.into_inner());
        *slot = compiled;
    }

    pub fn find_match(&self, method: &str, url: &str) -> Option<MockRule> {
        let snapshot = {
            let slot = self.active.read().unwrap_or_else(|poison| poison.into_inner());
            Arc::clone(&slot)
        };
        snapshot
            .iter()
            .find(|compiled| {
                let method_ok = compiled
                    .method
                    .as_ref()
                    .map(|expected| expected.eq_ignore_ascii_case(method))
                    .unwrap_or(true);
                method_ok && compiled.url.matches(url)
            })
            .map(|compiled| compiled.rule.clone())
    }

    /// Snapshot of the rules currently evaluated, in match order.
    pub fn active_rules(&self) -> Vec<MockRule> {
        let snapshot = {
            let slot = self.active.read().unwrap_or_else(|poison| poison.into_inner());
            Arc::clone(&slot)
        };
        snapshot.iter().map(|compiled| compiled.rule.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{MatchType, MockResponse, MockRule, RequestMatcher, RuleEngine, RuleSet};
    use mockpod_http::HttpHeader;

    fn matcher(pattern: &str, method: Option<&str>, match_type: MatchType) -> RequestMatcher {
        RequestMatcher {
            url_pattern: pattern.to_string(),
            method: method.map(str::to_string),
            match_type,
        }
    }

    fn rule(name: &str, pattern: &str, method: Option<&str>, match_type: MatchType) -> MockRule {
        MockRule::new(
            name,
            matcher(pattern, method, match_type),
            MockResponse {
                status_code: 418,
                headers: Vec::new(),
                body: "hello".to_string(),
                delay_seconds: None,
            },
        )
    }

    #[test]
    fn exact_match_requires_byte_equality() {
        let m = matcher("http://a.test/x", None, MatchType::Exact);
        assert!(m.matches("GET", "http://a.test/x"));
        assert!(!m.matches("GET", "http://a.test/x/y"));
    }

    #[test]
    fn contains_match_accepts_substrings() {
        let m = matcher("/v1/u", None, MatchType::Contains);
        assert!(m.matches("GET", "https://api.test/v1/users"));
        assert!(!m.matches("GET", "https://api.test/v2/users"));
    }

    #[test]
    fn regex_match_uses_the_pattern() {
        let m = matcher(r"/v\d+/users$", None, MatchType::Regex);
        assert!(m.matches("GET", "https://api.test/v1/users"));
        assert!(!m.matches("GET", "https://api.test/v1/users/42"));
    }

    #[test]
    fn invalid_regex_never_matches_and_never_panics() {
        let m = matcher(r"([unclosed", None, MatchType::Regex);
        assert!(!m.matches("GET", "https://api.test/([unclosed"));
    }

    #[test]
    fn method_comparison_is_case_insensitive_and_optional() {
        let m = matcher("/a", Some("GET"), MatchType::Contains);
        assert!(m.matches("get", "http://x.test/a"));
        assert!(!m.matches("POST", "http://x.test/a"));

        let any = matcher("/a", None, MatchType::Contains);
        assert!(any.matches("DELETE", "http://x.test/a"));
    }

    #[test]
    fn engine_returns_first_rule_in_list_order() {
        let engine = RuleEngine::new();
        let first = rule("first", "/a", None, MatchType::Contains);
        let second = rule("second", "/a", None, MatchType::Contains);
        engine.replace(vec![first.clone(), second]);

        let matched = engine.find_match("GET", "http://x.test/a").expect("match");
        assert_eq!(matched.id, first.id);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = RuleEngine::new();
        let mut first = rule("first", "/a", None, MatchType::Contains);
        first.enabled = false;
        let second = rule("second", "/a", None, MatchType::Contains);
        engine.replace(vec![first, second.clone()]);

        let matched = engine.find_match("GET", "http://x.test/a").expect("match");
        assert_eq!(matched.id, second.id);
    }

    #[test]
    fn replace_takes_effect_for_subsequent_lookups() {
        let engine = RuleEngine::new();
        let only = rule("only", "/a", None, MatchType::Contains);
        engine.replace(vec![only.clone()]);
        assert!(engine.find_match("GET", "http://x.test/a").is_some());

        let mut disabled = only;
        disabled.enabled = false;
        engine.replace(vec![disabled]);
        assert!(engine.find_match("GET", "http://x.test/a").is_none());
    }

    #[test]
    fn empty_engine_matches_nothing() {
        let engine = RuleEngine::new();
        assert!(engine.find_match("GET", "http://x.test/a").is_none());
    }

    #[test]
    fn rule_set_json_round_trips() {
        let mut set = RuleSet::new(
            "offline pack",
            vec![rule("r1", "/a", Some("GET"), MatchType::Exact)],
        );
        set.description = Some("fixtures for offline demos".to_string());
        set.rules[0].response.headers = vec![HttpHeader::new("Content-Type", "text/plain")];
        set.rules[0].response.delay_seconds = Some(0.25);

        let json = set.to_json().expect("serialize");
        assert!(json.contains("\"isActive\""), "{json}");
        assert!(json.contains("\"createdAt\""), "{json}");
        assert!(json.contains("\"urlPattern\""), "{json}");

        let parsed: RuleSet = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, set);
    }

    #[test]
    fn import_regenerates_id_and_deactivates() {
        let mut set = RuleSet::new("pack", vec![rule("r1", "/a", None, MatchType::Contains)]);
        set.is_active = true;
        let json = set.to_json().expect("serialize");

        let imported = RuleSet::import_json(&json).expect("import");
        assert_ne!(imported.id, set.id);
        assert!(!imported.is_active);
        assert_eq!(imported.rules, set.rules);
        assert_eq!(imported.name, set.name);
    }
}
