/// Third-party import service strategy
///
/// The service answers an import request with `{ "url": ... }` pointing at a
/// hosted share page; the share code itself is served by that page's `/raw`
/// sibling. Bodies are treated as untrusted text first and parsed second.

use super::cascade::{StepOutcome, Strategy};
use super::classifier::{BodyClass, PatternSet, ResponseClassifier};
use super::{encode, BuildRequest, BuildResolution, BuildSource};
use crate::codec;
use crate::error::ResolveError;
use crate::upstream::{FetchClient, FetchError};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BODY_RATE_LIMIT_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ImportResponse {
    url: Option<String>,
}

/// Client for the import service
pub struct ImportService {
    fetch: FetchClient,
    base_url: String,
    classifier: ResponseClassifier,
}

impl ImportService {
    pub fn new(fetch: FetchClient, base_url: &str) -> Self {
        Self {
            fetch,
            base_url: base_url.trim_end_matches('/').to_string(),
            classifier: ResponseClassifier::new(PatternSet::import_service()),
        }
    }

    pub fn import_url(&self, account: &str, character: &str) -> String {
        format!(
            "{}/api/import?poe_account_name={}&character_name={}",
            self.base_url,
            encode(account),
            encode(character)
        )
    }

    /// Only share pages on the import service's own origin are followed
    pub fn is_trusted_share_url(&self, share_url: &str) -> bool {
        match (Url::parse(&self.base_url), Url::parse(share_url)) {
            (Ok(base), Ok(share)) => base.origin() == share.origin(),
            _ => false,
        }
    }

    /// Request an import, returning the hosted share URL
    async fn request_import(&self, request: &BuildRequest) -> StepOutcome<String> {
        let url = self.import_url(request.account.as_str(), &request.character);
        let response = match self.fetch.fetch(&url, &[]).await {
            Ok(response) => response,
            Err(FetchError::Forbidden) => {
                return StepOutcome::Fatal(ResolveError::Forbidden(
                    "import service was refused access to the character".to_string(),
                ))
            }
            Err(e) => return StepOutcome::Fatal(e.into()),
        };

        if let Ok(parsed) = serde_json::from_str::<ImportResponse>(response.body.trim()) {
            return match parsed.url.map(|u| u.trim().to_string()) {
                Some(share_url) if !share_url.is_empty() => {
                    if self.is_trusted_share_url(&share_url) {
                        StepOutcome::Success(share_url)
                    } else {
                        warn!("Import service returned a foreign share URL");
                        StepOutcome::Fatal(ResolveError::UpstreamProtocol(
                            "import service returned a share URL on another origin".to_string(),
                        ))
                    }
                }
                _ => StepOutcome::Fatal(ResolveError::UpstreamProtocol(
                    "import service did not return a share URL".to_string(),
                )),
            };
        }

        debug!(
            "Import answered HTTP {} with unparsable body: {}",
            response.status,
            response.excerpt()
        );

        match self.classifier.classify(&response.body) {
            BodyClass::PrivateProfile => StepOutcome::Fatal(ResolveError::Forbidden(
                "character tab is private or the character name is wrong".to_string(),
            )),
            BodyClass::NotFound => StepOutcome::Fatal(ResolveError::NotFound(format!(
                "account {} not found",
                request.account
            ))),
            BodyClass::RateLimited => StepOutcome::Fatal(ResolveError::RateLimited {
                retry_after: BODY_RATE_LIMIT_RETRY,
            }),
            BodyClass::Html => {
                info!("Import service returned HTML, handing over to reconstruction");
                StepOutcome::Continue(ResolveError::UpstreamProtocol(
                    "import service returned an HTML page".to_string(),
                ))
            }
            BodyClass::Unrecognized => StepOutcome::Fatal(ResolveError::UpstreamProtocol(
                "import service returned a non-JSON response".to_string(),
            )),
        }
    }

    /// Fetch and decode the share code behind a share page
    async fn fetch_document(&self, share_url: &str) -> Result<String, ResolveError> {
        let raw_url = format!("{}/raw", share_url.trim_end_matches('/'));
        let response = self.fetch.fetch(&raw_url, &[]).await?;

        if !response.is_success() {
            return Err(ResolveError::UpstreamProtocol(format!(
                "share endpoint returned HTTP {}",
                response.status.as_u16()
            )));
        }

        let body = response.body.trim();
        if body.is_empty() {
            return Err(ResolveError::EmptyBuild);
        }

        if codec::is_share_code(body) {
            let document = codec::decode(body)?;
            if document.trim().is_empty() {
                return Err(ResolveError::EmptyBuild);
            }
            Ok(document)
        } else if codec::is_build_document(body) {
            Ok(body.to_string())
        } else {
            Err(ResolveError::UpstreamProtocol(
                "share endpoint returned neither a build code nor a document".to_string(),
            ))
        }
    }
}

/// Strategy 3: third-party import service
pub struct ImportStrategy {
    service: Arc<ImportService>,
}

impl ImportStrategy {
    pub fn new(service: Arc<ImportService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Strategy<BuildRequest, BuildResolution> for ImportStrategy {
    fn name(&self) -> &'static str {
        "import_service"
    }

    async fn attempt(&self, request: &BuildRequest) -> StepOutcome<BuildResolution> {
        let share_url = match self.service.request_import(request).await {
            StepOutcome::Success(url) => url,
            StepOutcome::Continue(e) => return StepOutcome::Continue(e),
            StepOutcome::Fatal(e) => return StepOutcome::Fatal(e),
        };

        match self.service.fetch_document(&share_url).await {
            Ok(document) => StepOutcome::Success(BuildResolution {
                source: BuildSource::Import,
                document,
                share_url: Some(share_url),
            }),
            Err(e) => StepOutcome::Fatal(e),
        }
    }
}
