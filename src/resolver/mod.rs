/// Character and build resolution
///
/// Two cascades share one dispatcher:
/// - character listing: official JSON listing, then the public profile page
/// - build import: third-party import service, then direct reconstruction
///
/// Results are cached per account (and character) for the cache TTL. Requests
/// carrying an upstream session bypass the cache, since they may see data
/// that anonymous callers must not.

pub mod cascade;
pub mod classifier;
pub mod import;
pub mod official;
pub mod reconstruct;

use crate::cache::{build_key, CacheConfig, ResultCache};
use crate::error::ResolveError;
use crate::upstream::FetchClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub use cascade::{Cascade, CascadeSuccess, StepOutcome, Strategy};
pub use classifier::{BodyClass, PatternSet, ResponseClassifier};
pub use import::{ImportService, ImportStrategy};
pub use official::{OfficialListing, OfficialSite, ProfileScrape};
pub use reconstruct::{
    BuildReconstructor, HttpReconstructor, ReconstructStrategy, UnavailableReconstructor,
};

/// Normalized account handle
///
/// Leading `@` and any `#1234` discriminator are stripped before the handle is
/// used as a cache key or in upstream URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountHandle(String);

impl AccountHandle {
    /// Normalize a user-supplied handle; `None` when nothing usable remains
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let without_sigil = trimmed.strip_prefix('@').unwrap_or(trimmed);
        let without_discriminator = match without_sigil.split_once('#') {
            Some((name, _)) => name,
            None => without_sigil,
        };
        let name = without_discriminator.trim();

        if name.is_empty() {
            None
        } else {
            Some(Self(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One character on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub name: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub level: u32,
}

impl CharacterSummary {
    /// Summary recovered from profile markup, which carries names only
    pub fn name_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: "Unknown".to_string(),
            level: 0,
        }
    }
}

/// Which upstream produced a character listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingSource {
    Json,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterListing {
    pub source: ListingSource,
    pub characters: Vec<CharacterSummary>,
}

/// Which strategy produced a build document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSource {
    Import,
    Reconstruction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResolution {
    pub source: BuildSource,
    /// Decoded build document text
    pub document: String,
    /// Hosted share page, when the import service produced one
    pub share_url: Option<String>,
}

/// Input of the character listing cascade
#[derive(Debug, Clone)]
pub struct CharacterRequest {
    pub account: AccountHandle,
    pub realm: String,
    /// Raw `Cookie` header value forwarded to the official site
    pub session: Option<String>,
}

/// Input of the build cascade
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub account: AccountHandle,
    pub character: String,
    pub realm: String,
    pub session: Option<String>,
}

/// Entry point request: a character name selects the build cascade
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub account: AccountHandle,
    pub character: Option<String>,
    pub realm: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Resolution {
    Characters(CharacterListing),
    Build(BuildResolution),
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub poe_base_url: String,
    pub import_base_url: String,
    pub default_realm: String,
    /// End-to-end budget of one resolution
    pub request_deadline: Duration,
    /// Remaining budget required before starting reconstruction
    pub reconstruct_min_budget: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            poe_base_url: "https://www.pathofexile.com".to_string(),
            import_base_url: "https://pobbin.com".to_string(),
            default_realm: "pc".to_string(),
            request_deadline: Duration::from_millis(25_000),
            reconstruct_min_budget: Duration::from_millis(20_000),
        }
    }
}

/// Resolution service with result caching
#[derive(Clone)]
pub struct Resolver {
    config: Arc<ResolverConfig>,
    characters: Cascade<CharacterRequest, CharacterListing>,
    builds: Cascade<BuildRequest, BuildResolution>,
    character_cache: ResultCache<CharacterListing>,
    build_cache: ResultCache<BuildResolution>,
}

impl Resolver {
    /// Create a resolver wired to the official site and the import service
    pub fn new(
        config: ResolverConfig,
        fetch: FetchClient,
        reconstructor: Arc<dyn BuildReconstructor>,
        cache: CacheConfig,
    ) -> Self {
        let site = Arc::new(OfficialSite::new(fetch.clone(), &config.poe_base_url));
        let import = Arc::new(ImportService::new(fetch, &config.import_base_url));

        let characters = Cascade::new(vec![
            Arc::new(OfficialListing::new(site.clone()))
                as Arc<dyn Strategy<CharacterRequest, CharacterListing>>,
            Arc::new(ProfileScrape::new(site.clone())),
        ]);
        let builds = Cascade::new(vec![
            Arc::new(ImportStrategy::new(import))
                as Arc<dyn Strategy<BuildRequest, BuildResolution>>,
            Arc::new(ReconstructStrategy::new(
                site,
                reconstructor,
                config.reconstruct_min_budget,
            )),
        ]);

        info!(
            "Resolver ready (characters: {:?}, builds: {:?})",
            characters.names(),
            builds.names()
        );

        Self {
            config: Arc::new(config),
            characters,
            builds,
            character_cache: ResultCache::named("characters", cache.clone()),
            build_cache: ResultCache::named("builds", cache),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn realm_or_default(&self, realm: Option<&str>) -> String {
        realm
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.config.default_realm)
            .to_lowercase()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_deadline
    }

    /// List the characters of an account
    pub async fn list_characters(
        &self,
        account: &AccountHandle,
        realm: Option<&str>,
        session: Option<&str>,
    ) -> Result<CharacterListing, ResolveError> {
        let realm = self.realm_or_default(realm);
        let key = build_key("characters", &[account.as_str(), &realm]);

        if session.is_none() {
            if let Some(cached) = self.character_cache.get(&key) {
                debug!("Character listing cache hit: {}", key);
                return Ok(cached);
            }
        }

        let request = CharacterRequest {
            account: account.clone(),
            realm,
            session: session.map(str::to_string),
        };
        let outcome = self.characters.run(&request, self.deadline()).await?;

        if session.is_none() {
            self.character_cache.set(&key, outcome.value.clone());
        }
        Ok(outcome.value)
    }

    /// Import the build of one character
    pub async fn resolve_build(
        &self,
        account: &AccountHandle,
        character: &str,
        realm: Option<&str>,
        session: Option<&str>,
    ) -> Result<BuildResolution, ResolveError> {
        let character = character.trim();
        if character.is_empty() {
            return Err(ResolveError::NotFound("empty character name".to_string()));
        }

        let realm = self.realm_or_default(realm);
        let key = build_key("build", &[account.as_str(), character, &realm]);

        if session.is_none() {
            if let Some(cached) = self.build_cache.get(&key) {
                debug!("Build cache hit: {}", key);
                return Ok(cached);
            }
        }

        let request = BuildRequest {
            account: account.clone(),
            character: character.to_string(),
            realm,
            session: session.map(str::to_string),
        };
        let outcome = self.builds.run(&request, self.deadline()).await?;

        if session.is_none() {
            self.build_cache.set(&key, outcome.value.clone());
        }
        Ok(outcome.value)
    }

    /// Resolve a request: a character name selects the build, otherwise the
    /// account's character list
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<Resolution, ResolveError> {
        let realm = request.realm.as_deref();
        let session = request.session.as_deref();

        match request.character.as_deref().map(str::trim) {
            Some(character) if !character.is_empty() => self
                .resolve_build(&request.account, character, realm, session)
                .await
                .map(Resolution::Build),
            _ => self
                .list_characters(&request.account, realm, session)
                .await
                .map(Resolution::Characters),
        }
    }

    /// Drop expired cache entries
    pub fn purge_expired(&self) -> usize {
        self.character_cache.purge_expired() + self.build_cache.purge_expired()
    }

    /// Release cached results
    pub fn close(&self) {
        self.character_cache.close();
        self.build_cache.close();
    }
}

/// Percent-encode a query or path component
pub(crate) fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}
