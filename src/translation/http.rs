//! HTTP translator speaking the free GTX endpoint dialect
//!
//! The provider answers `GET ?client=gtx&sl=..&tl=..&dt=t&q=..` with a nested
//! JSON array whose first element lists translated segments. No API key, but
//! also no contract: anything malformed surfaces as
//! `TranslationError::InvalidResponse`.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::TranslationConfig;
use crate::error::TranslationError;
use crate::protocol::LanguageCode;
use crate::translation::backend::{Translation, Translator};

/// The endpoint rejects very long queries; truncate on a char boundary.
const MAX_QUERY_CHARS: usize = 1_000;

/// The endpoint reports no per-request quality signal. A response that
/// differs from the input scores this much; an unchanged echo scores zero.
const GTX_CONFIDENCE: f32 = 0.8;

pub struct GtxTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl GtxTranslator {
    pub fn new(config: &TranslationConfig) -> Result<Self, TranslationError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TranslationError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl Translator for GtxTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, TranslationError> {
        let query: String = text.chars().take(MAX_QUERY_CHARS).collect();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("client", "gtx"),
                ("sl", gtx_code(source)),
                ("tl", gtx_code(target)),
                ("dt", "t"),
                ("q", query.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslationError::Timeout
                } else {
                    TranslationError::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(TranslationError::UnsupportedPair {
                from: source.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        if !status.is_success() {
            return Err(TranslationError::Backend(format!("status {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
        let translated = parse_segments(&payload)?;
        let confidence = if translated == query { 0.0 } else { GTX_CONFIDENCE };
        debug!(source = source.as_str(), target = target.as_str(), "translated");
        Ok(Translation {
            text: translated,
            confidence,
        })
    }
}

/// The provider wants region-qualified codes for a few languages.
fn gtx_code(language: &LanguageCode) -> &str {
    match language.as_str() {
        "zh" => "zh-CN",
        other => other,
    }
}

/// Payload shape: `[[["<translated>", "<original>", ...], ...], ...]`.
/// Long inputs come back split over several segments; join them in order.
fn parse_segments(payload: &Value) -> Result<String, TranslationError> {
    let segments = payload
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| TranslationError::InvalidResponse("missing segment array".to_string()))?;
    let mut out = String::new();
    for segment in segments {
        if let Some(piece) = segment.get(0).and_then(Value::as_str) {
            out.push_str(piece);
        }
    }
    if out.is_empty() {
        return Err(TranslationError::InvalidResponse(
            "no translated text".to_string(),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    #[test]
    fn joins_response_segments_in_order() {
        let payload = json!([
            [
                ["Hola, ", "Hello, ", null],
                ["mundo.", "world.", null]
            ],
            null,
            "en"
        ]);
        assert_eq!(parse_segments(&payload).unwrap(), "Hola, mundo.");
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(parse_segments(&json!({"error": "nope"})).is_err());
        assert!(parse_segments(&json!([[]])).is_err());
        assert!(parse_segments(&json!([[["", "x"]]])).is_err());
    }

    #[test]
    fn maps_region_qualified_codes() {
        assert_eq!(gtx_code(&LanguageCode::new("zh")), "zh-CN");
        assert_eq!(gtx_code(&LanguageCode::new("ko")), "ko");
    }

    async fn fake_gtx(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        assert_eq!(params.get("client").map(String::as_str), Some("gtx"));
        assert_eq!(params.get("dt").map(String::as_str), Some("t"));
        let q = params.get("q").cloned().unwrap_or_default();
        Json(json!([[[format!("tr:{q}"), q, null]], null, "en"]))
    }

    #[tokio::test]
    async fn translates_against_a_gtx_shaped_server() {
        let app = Router::new().route("/translate_a/single", get(fake_gtx));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TranslationConfig {
            endpoint: format!("http://{addr}/translate_a/single"),
            ..TranslationConfig::default()
        };
        let translator = GtxTranslator::new(&config).unwrap();
        let result = translator
            .translate("good morning", &LanguageCode::new("en"), &LanguageCode::new("es"))
            .await
            .unwrap();
        assert_eq!(result.text, "tr:good morning");
        assert!((result.confidence - GTX_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn long_queries_are_truncated() {
        let app = Router::new().route(
            "/t",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let q = params.get("q").cloned().unwrap_or_default();
                assert_eq!(q.chars().count(), MAX_QUERY_CHARS);
                Json(json!([[["ok", q, null]]]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TranslationConfig {
            endpoint: format!("http://{addr}/t"),
            ..TranslationConfig::default()
        };
        let translator = GtxTranslator::new(&config).unwrap();
        let long_input = "a".repeat(MAX_QUERY_CHARS + 500);
        let result = translator
            .translate(&long_input, &LanguageCode::new("en"), &LanguageCode::new("fr"))
            .await
            .unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn unchanged_echo_scores_zero_confidence() {
        let app = Router::new().route(
            "/t",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let q = params.get("q").cloned().unwrap_or_default();
                Json(json!([[[q.clone(), q, null]]]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TranslationConfig {
            endpoint: format!("http://{addr}/t"),
            ..TranslationConfig::default()
        };
        let translator = GtxTranslator::new(&config).unwrap();
        let result = translator
            .translate("ok", &LanguageCode::new("en"), &LanguageCode::new("de"))
            .await
            .unwrap();
        assert_eq!(result.text, "ok");
        assert!(result.confidence.abs() < f32::EPSILON);
    }
}
