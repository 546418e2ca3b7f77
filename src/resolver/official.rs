/// Official site strategies: JSON character listing and profile page scrape
use super::cascade::{StepOutcome, Strategy};
use super::classifier::{PatternSet, ResponseClassifier};
use super::{
    encode, BuildRequest, CharacterListing, CharacterRequest, CharacterSummary, ListingSource,
};
use crate::error::ResolveError;
use crate::upstream::{FetchClient, FetchError, UpstreamResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retry-After assumed when the listing reports rate limiting in its body
const BODY_RATE_LIMIT_RETRY: Duration = Duration::from_secs(60);

/// Client for the official site's character endpoints
pub struct OfficialSite {
    fetch: FetchClient,
    base_url: String,
    classifier: ResponseClassifier,
}

impl OfficialSite {
    pub fn new(fetch: FetchClient, base_url: &str) -> Self {
        Self::with_patterns(fetch, base_url, PatternSet::official())
    }

    pub fn with_patterns(fetch: FetchClient, base_url: &str, patterns: PatternSet) -> Self {
        Self {
            fetch,
            base_url: base_url.trim_end_matches('/').to_string(),
            classifier: ResponseClassifier::new(patterns),
        }
    }

    pub fn classifier(&self) -> &ResponseClassifier {
        &self.classifier
    }

    pub fn characters_url(&self, account: &str, realm: &str) -> String {
        format!(
            "{}/character-window/get-characters?accountName={}&realm={}",
            self.base_url,
            encode(account),
            encode(realm)
        )
    }

    pub fn profile_url(&self, account: &str, realm: &str) -> String {
        format!(
            "{}/account/view-profile/{}/characters?realm={}",
            self.base_url,
            encode(account),
            encode(realm)
        )
    }

    pub fn items_url(&self, account: &str, character: &str, realm: &str) -> String {
        format!(
            "{}/character-window/get-items?character={}&accountName={}&realm={}",
            self.base_url,
            encode(character),
            encode(account),
            encode(realm)
        )
    }

    pub fn passives_url(&self, account: &str, character: &str, realm: &str) -> String {
        format!(
            "{}/character-window/get-passive-skills?character={}&accountName={}&realm={}",
            self.base_url,
            encode(character),
            encode(account),
            encode(realm)
        )
    }

    /// GET with browser-like referer/origin and the caller's session, if any
    pub async fn get(
        &self,
        url: &str,
        session: Option<&str>,
    ) -> Result<UpstreamResponse, FetchError> {
        let referer = format!("{}/account/view-profile", self.base_url);
        let mut headers: Vec<(&str, &str)> =
            vec![("referer", referer.as_str()), ("origin", self.base_url.as_str())];
        if let Some(cookie) = session.filter(|c| !c.trim().is_empty()) {
            headers.push(("cookie", cookie));
        }
        self.fetch.fetch(url, &headers).await
    }

    /// Fetch the raw item and passive documents of a character concurrently
    pub async fn fetch_build_data(
        &self,
        request: &BuildRequest,
    ) -> Result<(Value, Value), ResolveError> {
        let account = request.account.as_str();
        let items_url = self.items_url(account, &request.character, &request.realm);
        let passives_url = self.passives_url(account, &request.character, &request.realm);
        let session = request.session.as_deref();

        let (items, passives) = futures::try_join!(
            self.get_json(&items_url, session, "items"),
            self.get_json(&passives_url, session, "passive skills"),
        )?;
        Ok((items, passives))
    }

    async fn get_json(
        &self,
        url: &str,
        session: Option<&str>,
        what: &str,
    ) -> Result<Value, ResolveError> {
        let response = self.get(url, session).await?;

        if response.status.as_u16() == 404 {
            return Err(ResolveError::NotFound(format!("character {} not found", what)));
        }
        if !response.is_success() {
            return Err(ResolveError::UpstreamProtocol(format!(
                "{} endpoint returned HTTP {}",
                what, response.status
            )));
        }

        match response.json::<Value>() {
            Ok(Value::Object(obj)) if obj.contains_key("error") => {
                let message = error_message(&obj["error"]);
                if self.classifier.mentions_private(&message) {
                    Err(ResolveError::Forbidden(format!("{} are private", what)))
                } else {
                    Err(ResolveError::UpstreamProtocol(format!(
                        "{} endpoint reported an error",
                        what
                    )))
                }
            }
            Ok(value) => Ok(value),
            Err(_) => {
                debug!("Non-JSON {} body: {}", what, response.excerpt());
                Err(ResolveError::UpstreamProtocol(format!(
                    "{} endpoint did not return JSON",
                    what
                )))
            }
        }
    }
}

/// Extract the message of an `error` field that may be a string or an object
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// Map a JSON listing entry to a summary
fn summary_from_value(value: &Value) -> Option<CharacterSummary> {
    let name = value.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(CharacterSummary {
        name: name.to_string(),
        class_name: value
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        level: value
            .get("level")
            .and_then(Value::as_u64)
            .map(|l| l.min(u32::MAX as u64) as u32)
            .unwrap_or(0),
    })
}

/// Strategy 1: official JSON character listing
pub struct OfficialListing {
    site: Arc<OfficialSite>,
}

impl OfficialListing {
    pub fn new(site: Arc<OfficialSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl Strategy<CharacterRequest, CharacterListing> for OfficialListing {
    fn name(&self) -> &'static str {
        "official_listing"
    }

    async fn attempt(&self, request: &CharacterRequest) -> StepOutcome<CharacterListing> {
        let url = self.site.characters_url(request.account.as_str(), &request.realm);
        let response = match self.site.get(&url, request.session.as_deref()).await {
            Ok(response) => response,
            Err(e @ FetchError::RateLimited { .. }) => return StepOutcome::Fatal(e.into()),
            Err(e) => return StepOutcome::Continue(e.into()),
        };

        let classifier = self.site.classifier();

        if response.is_success() && response.is_json() {
            match response.json::<Value>() {
                Ok(Value::Array(entries)) => {
                    let characters: Vec<CharacterSummary> =
                        entries.iter().filter_map(summary_from_value).collect();
                    if characters.len() != entries.len() {
                        debug!(
                            "Dropped {} malformed listing entries",
                            entries.len() - characters.len()
                        );
                    }
                    return StepOutcome::Success(CharacterListing {
                        source: ListingSource::Json,
                        characters,
                    });
                }
                Ok(Value::Object(obj)) if obj.contains_key("error") => {
                    let message = error_message(&obj["error"]);
                    if classifier.mentions_private(&message) {
                        return StepOutcome::Continue(ResolveError::Forbidden(
                            "character listing is private".to_string(),
                        ));
                    }
                    if classifier.mentions_not_found(&message) {
                        return StepOutcome::Continue(ResolveError::NotFound(format!(
                            "account {} not found",
                            request.account
                        )));
                    }
                    if classifier.mentions_rate_limit(&message) {
                        return StepOutcome::Fatal(ResolveError::RateLimited {
                            retry_after: BODY_RATE_LIMIT_RETRY,
                        });
                    }
                    return StepOutcome::Continue(ResolveError::UpstreamProtocol(
                        "character listing reported an error".to_string(),
                    ));
                }
                Ok(_) => {
                    return StepOutcome::Continue(ResolveError::UpstreamProtocol(
                        "character listing was not a JSON array".to_string(),
                    ));
                }
                Err(_) => {}
            }
        }

        debug!(
            "Listing answered HTTP {} ({}): {}",
            response.status,
            response.content_type,
            response.excerpt()
        );

        if classifier.mentions_rate_limit(&response.body) {
            return StepOutcome::Fatal(ResolveError::RateLimited {
                retry_after: BODY_RATE_LIMIT_RETRY,
            });
        }
        if classifier.mentions_not_found(&response.body) {
            return StepOutcome::Continue(ResolveError::NotFound(format!(
                "account {} not found",
                request.account
            )));
        }
        if classifier.is_html(&response.body) {
            return StepOutcome::Continue(ResolveError::UpstreamProtocol(
                "character listing returned HTML instead of JSON".to_string(),
            ));
        }

        StepOutcome::Continue(ResolveError::UpstreamProtocol(format!(
            "character listing returned HTTP {} with content type {:?}",
            response.status.as_u16(),
            response.content_type
        )))
    }
}

/// Strategy 2: public profile page scrape
pub struct ProfileScrape {
    site: Arc<OfficialSite>,
}

impl ProfileScrape {
    pub fn new(site: Arc<OfficialSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl Strategy<CharacterRequest, CharacterListing> for ProfileScrape {
    fn name(&self) -> &'static str {
        "profile_scrape"
    }

    async fn attempt(&self, request: &CharacterRequest) -> StepOutcome<CharacterListing> {
        let url = self.site.profile_url(request.account.as_str(), &request.realm);
        let response = match self.site.get(&url, request.session.as_deref()).await {
            Ok(response) => response,
            Err(e @ FetchError::RateLimited { .. }) => return StepOutcome::Fatal(e.into()),
            Err(FetchError::Forbidden) => {
                return StepOutcome::Continue(ResolveError::Forbidden(
                    "profile page is private".to_string(),
                ))
            }
            Err(e) => return StepOutcome::Continue(e.into()),
        };

        let names = self.site.classifier().extract_names(&response.body);
        if !names.is_empty() {
            return StepOutcome::Success(CharacterListing {
                source: ListingSource::Html,
                characters: names.into_iter().map(CharacterSummary::name_only).collect(),
            });
        }

        let classifier = self.site.classifier();
        if response.status.as_u16() == 404 || classifier.mentions_not_found(&response.body) {
            return StepOutcome::Continue(ResolveError::NotFound(format!(
                "account {} not found",
                request.account
            )));
        }

        StepOutcome::Continue(ResolveError::UpstreamProtocol(
            "no character names found in profile page".to_string(),
        ))
    }
}
