/// Response classification for untrusted upstream bodies
///
/// Upstream markup and error wording drift over time. Everything that depends
/// on them lives in a `PatternSet`, so adapting to a redesign means swapping
/// data rather than editing strategy control flow.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Character name cell on the current profile page
    static ref PRIMARY_NAME_PATTERN: Regex =
        Regex::new(r#"class="name"[^>]*>([^<]+)"#).unwrap();

    /// Character name span on the legacy profile page
    static ref LEGACY_NAME_PATTERN: Regex =
        Regex::new(r#"<span[^>]*class="character-name"[^>]*>([^<]+)"#).unwrap();
}

/// Substring and markup patterns for one upstream
#[derive(Debug, Clone)]
pub struct PatternSet {
    /// Name extraction patterns, tried in order; the first with matches wins
    pub name_patterns: Vec<Regex>,
    /// Case-insensitive markers of a private profile
    pub private_markers: Vec<String>,
    /// Case-insensitive markers of an unknown account or character
    pub not_found_markers: Vec<String>,
    /// Case-insensitive markers of upstream rate limiting
    pub rate_limit_markers: Vec<String>,
    /// Case-insensitive prefixes of an HTML document
    pub html_prefixes: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PatternSet {
    /// Patterns for the official site (listing endpoint and profile page)
    pub fn official() -> Self {
        Self {
            name_patterns: vec![PRIMARY_NAME_PATTERN.clone(), LEGACY_NAME_PATTERN.clone()],
            private_markers: owned(&["private"]),
            not_found_markers: owned(&["account not found"]),
            rate_limit_markers: owned(&["rate limit", "too many requests"]),
            html_prefixes: owned(&["<!doctype html", "<html"]),
        }
    }

    /// Patterns for the third-party import service
    pub fn import_service() -> Self {
        Self {
            name_patterns: Vec::new(),
            private_markers: owned(&["private profile or invalid character name"]),
            not_found_markers: owned(&["was not found"]),
            rate_limit_markers: owned(&["too many requests"]),
            html_prefixes: owned(&["<!doctype html>"]),
        }
    }
}

/// What an unparsable body most likely is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyClass {
    PrivateProfile,
    NotFound,
    RateLimited,
    Html,
    Unrecognized,
}

/// Classifies upstream bodies against a pattern set
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    patterns: PatternSet,
}

impl ResponseClassifier {
    pub fn new(patterns: PatternSet) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Classify a body that failed structured parsing.
    ///
    /// Explicit messages win over the HTML check: a private-profile page is
    /// still HTML, but the message is the actionable part.
    pub fn classify(&self, body: &str) -> BodyClass {
        let lower = body.to_lowercase();
        if contains_any(&lower, &self.patterns.private_markers) {
            BodyClass::PrivateProfile
        } else if contains_any(&lower, &self.patterns.not_found_markers) {
            BodyClass::NotFound
        } else if contains_any(&lower, &self.patterns.rate_limit_markers) {
            BodyClass::RateLimited
        } else if self.is_html(body) {
            BodyClass::Html
        } else {
            BodyClass::Unrecognized
        }
    }

    /// Whether the body starts like an HTML document
    pub fn is_html(&self, body: &str) -> bool {
        let head = body
            .trim_start()
            .chars()
            .take(32)
            .collect::<String>()
            .to_lowercase();
        self.patterns
            .html_prefixes
            .iter()
            .any(|prefix| head.starts_with(prefix.as_str()))
    }

    pub fn mentions_private(&self, text: &str) -> bool {
        contains_any(&text.to_lowercase(), &self.patterns.private_markers)
    }

    pub fn mentions_not_found(&self, text: &str) -> bool {
        contains_any(&text.to_lowercase(), &self.patterns.not_found_markers)
    }

    pub fn mentions_rate_limit(&self, text: &str) -> bool {
        contains_any(&text.to_lowercase(), &self.patterns.rate_limit_markers)
    }

    /// Extract character names from profile markup
    pub fn extract_names(&self, html: &str) -> Vec<String> {
        for pattern in &self.patterns.name_patterns {
            let mut names: Vec<String> = Vec::new();
            for capture in pattern.captures_iter(html) {
                let name = capture[1].trim();
                if !name.is_empty() && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            if !names.is_empty() {
                return names;
            }
        }
        Vec::new()
    }
}

fn contains_any(lower: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_names_primary_markup() {
        let classifier = ResponseClassifier::new(PatternSet::official());
        let html = r#"
            <div class="character"><span class="name" data-x="1">Witchy</span></div>
            <div class="character"><span class="name">  Slammer </span></div>
            <div class="character"><span class="name">Witchy</span></div>
        "#;
        assert_eq!(classifier.extract_names(html), vec!["Witchy", "Slammer"]);
    }

    #[test]
    fn test_extract_names_legacy_markup() {
        let classifier = ResponseClassifier::new(PatternSet::official());
        let html = r#"<li><span id="c1" class="character-name">OldTimer</span></li>"#;
        assert_eq!(classifier.extract_names(html), vec!["OldTimer"]);
    }

    #[test]
    fn test_extract_names_none() {
        let classifier = ResponseClassifier::new(PatternSet::official());
        assert!(classifier
            .extract_names("<html><body>Login</body></html>")
            .is_empty());
    }

    #[test]
    fn test_import_service_classification() {
        let classifier = ResponseClassifier::new(PatternSet::import_service());

        assert_eq!(
            classifier.classify("Error: Private profile or invalid character name"),
            BodyClass::PrivateProfile
        );
        assert_eq!(
            classifier.classify("Account 'nobody' was not found"),
            BodyClass::NotFound
        );
        assert_eq!(
            classifier.classify("<!DOCTYPE html><html><body>Cloudflare</body></html>"),
            BodyClass::Html
        );
        assert_eq!(classifier.classify("Internal Server Error"), BodyClass::Unrecognized);
    }

    #[test]
    fn test_swapped_patterns_change_behaviour() {
        let mut patterns = PatternSet::official();
        patterns.name_patterns = vec![Regex::new(r#"data-char="([^"]+)""#).unwrap()];
        let classifier = ResponseClassifier::new(patterns);

        let html = r#"<a data-char="Newstyle"></a><span class="name">Ignored</span>"#;
        assert_eq!(classifier.extract_names(html), vec!["Newstyle"]);
    }

    #[test]
    fn test_official_markers() {
        let classifier = ResponseClassifier::new(PatternSet::official());
        assert!(classifier.mentions_private("This profile is PRIVATE"));
        assert!(classifier.mentions_not_found("Account not found"));
        assert!(classifier.mentions_rate_limit("You have hit the Rate Limit"));
        assert!(classifier.is_html("  <html><head>"));
        assert!(!classifier.is_html("[{\"name\":\"x\"}]"));
    }
}
