/// Direct reconstruction fallback
///
/// Reached only when the import service answers with an HTML page. The raw
/// item and passive documents are fetched from the official site and handed
/// to an external reconstruction collaborator, whose only contract is: JSON
/// in, build document text out, starting with the document root marker.

use super::cascade::{StepOutcome, Strategy};
use super::official::OfficialSite;
use super::{BuildRequest, BuildResolution, BuildSource};
use crate::codec::ROOT_MARKER;
use crate::error::ResolveError;
use crate::upstream::excerpt;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// External step turning raw character data into a build document
#[async_trait]
pub trait BuildReconstructor: Send + Sync {
    /// Synthesize build document text from raw items and passive skills
    async fn reconstruct(&self, items: &Value, passives: &Value) -> Result<String, ResolveError>;
}

/// Used when no collaborator is configured
pub struct UnavailableReconstructor;

#[async_trait]
impl BuildReconstructor for UnavailableReconstructor {
    async fn reconstruct(
        &self,
        _items: &Value,
        _passives: &Value,
    ) -> Result<String, ResolveError> {
        Err(ResolveError::Unavailable("build reconstruction".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ReconstructResponse {
    document: Option<String>,
    xml: Option<String>,
    error: Option<String>,
}

/// Collaborator reached over HTTP: POST `{ items, passiveSkills }`
pub struct HttpReconstructor {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpReconstructor {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            ResolveError::Unavailable(format!("reconstruction client could not start: {}", e))
        })?;

        Ok(Self {
            http,
            url: url.to_string(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl BuildReconstructor for HttpReconstructor {
    async fn reconstruct(&self, items: &Value, passives: &Value) -> Result<String, ResolveError> {
        let payload = json!({ "items": items, "passiveSkills": passives });

        let mut request = self.http.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let is_json = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("application/json"))
                .unwrap_or(false);
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, is_json, body))
        };

        let (status, is_json, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                return Err(ResolveError::Timeout(format!(
                    "reconstruction did not answer within {:?}",
                    self.timeout
                )))
            }
            Ok(Err(e)) => return Err(ResolveError::Network(e.to_string())),
            Ok(Ok(parts)) => parts,
        };

        if !status.is_success() {
            debug!("Reconstruction answered HTTP {}: {}", status, excerpt(&body));
            return Err(ResolveError::UpstreamProtocol(format!(
                "reconstruction returned HTTP {}",
                status.as_u16()
            )));
        }

        if !is_json {
            return Ok(body);
        }

        let parsed: ReconstructResponse = serde_json::from_str(&body).map_err(|_| {
            ResolveError::UpstreamProtocol("reconstruction returned malformed JSON".to_string())
        })?;

        match (parsed.document.or(parsed.xml), parsed.error) {
            (Some(document), _) => Ok(document),
            (None, Some(error)) => {
                debug!("Reconstruction reported: {}", excerpt(&error));
                Err(ResolveError::UpstreamProtocol(
                    "reconstruction reported an error".to_string(),
                ))
            }
            (None, None) => Err(ResolveError::UpstreamProtocol(
                "reconstruction returned no document".to_string(),
            )),
        }
    }
}

/// Strategy 4: direct item/passive retrieval plus reconstruction
pub struct ReconstructStrategy {
    site: Arc<OfficialSite>,
    reconstructor: Arc<dyn BuildReconstructor>,
    min_budget: Duration,
}

impl ReconstructStrategy {
    pub fn new(
        site: Arc<OfficialSite>,
        reconstructor: Arc<dyn BuildReconstructor>,
        min_budget: Duration,
    ) -> Self {
        Self {
            site,
            reconstructor,
            min_budget,
        }
    }
}

#[async_trait]
impl Strategy<BuildRequest, BuildResolution> for ReconstructStrategy {
    fn name(&self) -> &'static str {
        "reconstruction"
    }

    fn min_budget(&self) -> Duration {
        self.min_budget
    }

    async fn attempt(&self, request: &BuildRequest) -> StepOutcome<BuildResolution> {
        let (items, passives) = match self.site.fetch_build_data(request).await {
            Ok(data) => data,
            Err(e) => return StepOutcome::Fatal(e),
        };

        info!("Fetched raw build data for {}, reconstructing", request.character);

        let text = match self.reconstructor.reconstruct(&items, &passives).await {
            Ok(text) => text,
            Err(e) => return StepOutcome::Fatal(e),
        };

        let document = text.trim();
        if !document.starts_with(ROOT_MARKER) {
            debug!("Reconstruction output: {}", excerpt(document));
            return StepOutcome::Fatal(ResolveError::UpstreamProtocol(format!(
                "reconstruction output does not start with {}",
                ROOT_MARKER
            )));
        }

        StepOutcome::Success(BuildResolution {
            source: BuildSource::Reconstruction,
            document: document.to_string(),
            share_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_reconstructor() {
        let err = UnavailableReconstructor
            .reconstruct(&json!([]), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unavailable(_)));
    }
}
