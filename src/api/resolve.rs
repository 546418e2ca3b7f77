/// Character listing and build import endpoints
use super::forwarded_session;
use crate::{
    context::AppContext,
    error::{GatewayError, GatewayResult},
    resolver::{AccountHandle, BuildResolution, CharacterListing, Resolution, ResolveRequest},
};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use axum_extra::{headers::Cookie, TypedHeader};
use serde::Deserialize;
use tracing::info;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/characters", get(list_characters))
        .route("/api/build", get(resolve_build))
        .route("/api/resolve", get(resolve))
}

#[derive(Debug, Deserialize)]
pub struct CharactersParams {
    /// Account handle, with or without the `#1234` discriminator
    pub handle: Option<String>,
    pub realm: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BuildParams {
    pub handle: Option<String>,
    pub character: Option<String>,
    pub realm: Option<String>,
}

fn parse_handle(raw: Option<&str>) -> GatewayResult<AccountHandle> {
    raw.and_then(AccountHandle::parse).ok_or_else(|| {
        GatewayError::Validation("Missing handle param (e.g., Hettii#6037)".to_string())
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// GET /api/characters
pub async fn list_characters(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    cookies: Option<TypedHeader<Cookie>>,
    Query(params): Query<CharactersParams>,
) -> GatewayResult<Json<CharacterListing>> {
    let account = parse_handle(params.handle.as_deref())?;
    let session = forwarded_session(&headers, cookies.as_ref());

    info!("Listing characters for {}", account);

    let listing = ctx
        .resolver
        .list_characters(&account, non_empty(params.realm.as_deref()), session.as_deref())
        .await?;

    Ok(Json(listing))
}

/// GET /api/build
pub async fn resolve_build(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    cookies: Option<TypedHeader<Cookie>>,
    Query(params): Query<BuildParams>,
) -> GatewayResult<Json<BuildResolution>> {
    let account = parse_handle(params.handle.as_deref())?;
    let character = non_empty(params.character.as_deref())
        .ok_or_else(|| GatewayError::Validation("Missing character param".to_string()))?;
    let session = forwarded_session(&headers, cookies.as_ref());

    info!("Importing build of {} for {}", character, account);

    let build = ctx
        .resolver
        .resolve_build(
            &account,
            character,
            non_empty(params.realm.as_deref()),
            session.as_deref(),
        )
        .await?;

    Ok(Json(build))
}

/// GET /api/resolve: the build when a character is named, else the listing
pub async fn resolve(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    cookies: Option<TypedHeader<Cookie>>,
    Query(params): Query<BuildParams>,
) -> GatewayResult<Json<Resolution>> {
    let request = ResolveRequest {
        account: parse_handle(params.handle.as_deref())?,
        character: non_empty(params.character.as_deref()).map(str::to_string),
        realm: non_empty(params.realm.as_deref()).map(str::to_string),
        session: forwarded_session(&headers, cookies.as_ref()),
    };

    Ok(Json(ctx.resolver.resolve(&request).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handle() {
        assert_eq!(
            parse_handle(Some("  Hettii#6037 ")).unwrap().as_str(),
            AccountHandle::parse("Hettii").unwrap().as_str()
        );
        assert!(matches!(parse_handle(None), Err(GatewayError::Validation(_))));
        assert!(matches!(parse_handle(Some("  ")), Err(GatewayError::Validation(_))));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some(" xbox ")), Some("xbox"));
        assert_eq!(non_empty(Some("")), None);
        assert_eq!(non_empty(None), None);
    }
}
