/// Pasted share-code decoding
use crate::{
    codec::{self, CodecError},
    context::AppContext,
    error::{GatewayError, GatewayResult},
};
use axum::{extract::rejection::JsonRejection, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub fn routes() -> Router<AppContext> {
    Router::new().route("/api/decode", post(decode_share_code))
}

#[derive(Debug, Deserialize)]
pub struct DecodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecodeResponse {
    pub document: String,
}

/// POST /api/decode
pub async fn decode_share_code(
    payload: Result<Json<DecodeRequest>, JsonRejection>,
) -> GatewayResult<Json<DecodeResponse>> {
    let Json(request) = payload.map_err(|e| {
        GatewayError::Validation(format!("Expected a JSON body with a code field: {}", e))
    })?;

    let document = decode_text(&request.code)?;
    Ok(Json(DecodeResponse { document }))
}

/// Decode a share code; document text that is already decoded passes through
fn decode_text(input: &str) -> GatewayResult<String> {
    let text = input.trim();
    if text.is_empty() {
        return Err(GatewayError::Validation("Paste a build code to decode".to_string()));
    }

    if text.starts_with('<') {
        return Ok(text.to_string());
    }

    if !codec::is_share_code(text) {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        debug!("Rejected paste of length {} that is not a share code", compact.len());
        return Err(CodecError::undecodable(&compact).into());
    }

    Ok(codec::decode(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;

    const DOCUMENT: &str = "<PathOfBuilding><Build level=\"90\"/></PathOfBuilding>";

    #[test]
    fn test_decodes_share_code() {
        let code = codec::encode(DOCUMENT).unwrap();
        assert_eq!(decode_text(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_document_passes_through() {
        assert_eq!(decode_text(&format!("  {}\n", DOCUMENT)).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_rejects_other_text() {
        let err = decode_text("https://pobb.in/abc").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Resolve(ResolveError::Codec(CodecError::Undecodable { .. }))
        ));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(decode_text(" \n "), Err(GatewayError::Validation(_))));
    }
}
