//! HTTP translator speaking the MyMemory dialect
//!
//! Secondary provider behind [`crate::translation::FallbackTranslator`].
//! The provider answers `GET ?q=..&langpair=src|tgt` with a JSON envelope
//! and reports failures inline with HTTP 200, so the `responseStatus`
//! field is the one that counts.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::TranslationConfig;
use crate::error::TranslationError;
use crate::protocol::LanguageCode;
use crate::translation::backend::{Translation, Translator};

/// This endpoint caps queries well below the primary's limit.
const MAX_QUERY_CHARS: usize = 500;

/// Fallback results never outrank the primary provider.
const MYMEMORY_MAX_CONFIDENCE: f32 = 0.7;

pub struct MyMemoryTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl MyMemoryTranslator {
    pub fn new(config: &TranslationConfig) -> Result<Self, TranslationError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TranslationError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.fallback_endpoint.clone(),
        })
    }
}

#[async_trait]
impl Translator for MyMemoryTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, TranslationError> {
        let query: String = text.chars().take(MAX_QUERY_CHARS).collect();
        let langpair = format!("{}|{}", mymemory_code(source), mymemory_code(target));
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query.as_str()), ("langpair", langpair.as_str())])
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
        if !status.is_success() {
            return Err(TranslationError::Backend(format!("status {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
        let translated = parse_envelope(&payload, source, target)?;
        let confidence = if translated == query {
            0.0
        } else {
            confidence_from_match(match_quality(&payload))
        };
        debug!(source = source.as_str(), target = target.as_str(), "translated via fallback");
        Ok(Translation {
            text: translated,
            confidence,
        })
    }
}

/// The provider wants RFC3066 codes for a few languages.
fn mymemory_code(language: &LanguageCode) -> &str {
    match language.as_str() {
        "zh" => "zh-CN",
        other => other,
    }
}

/// Envelope shape:
/// `{"responseData": {"translatedText": .., "match": ..}, "responseStatus": 200}`.
fn parse_envelope(
    payload: &Value,
    source: &LanguageCode,
    target: &LanguageCode,
) -> Result<String, TranslationError> {
    let status = inline_status(payload);
    if status != 200 {
        let details = payload
            .get("responseDetails")
            .and_then(Value::as_str)
            .unwrap_or("no details");
        if details.contains("INVALID") && details.contains("LANGUAGE") {
            return Err(TranslationError::UnsupportedPair {
                from: source.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        return Err(TranslationError::Backend(format!("status {status}: {details}")));
    }
    let translated = payload
        .get("responseData")
        .and_then(|data| data.get("translatedText"))
        .and_then(Value::as_str)
        .ok_or_else(|| TranslationError::InvalidResponse("missing translatedText".to_string()))?;
    if translated.is_empty() {
        return Err(TranslationError::InvalidResponse(
            "no translated text".to_string(),
        ));
    }
    Ok(translated.to_string())
}

/// The inline status arrives as a number on success and as a string on
/// some failure paths.
fn inline_status(payload: &Value) -> i64 {
    match payload.get("responseStatus") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Translation-memory match quality. Reported on a 0..1 scale, by older
/// deployments as a percentage.
fn match_quality(payload: &Value) -> f32 {
    payload
        .get("responseData")
        .and_then(|data| data.get("match"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32
}

fn confidence_from_match(quality: f32) -> f32 {
    let normalized = if quality > 1.0 { quality / 100.0 } else { quality };
    normalized.clamp(0.0, MYMEMORY_MAX_CONFIDENCE)
}
