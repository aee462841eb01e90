//! Translation backend abstraction and provider chaining

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TranslationError;
use crate::protocol::LanguageCode;

/// One translated string with the backend's own confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    /// In [0, 1]
    pub confidence: f32,
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, TranslationError>;
}

/// Two providers behind one [`Translator`]. The fallback is consulted
/// when the primary fails or echoes the input unchanged; only when both
/// providers fail does the error surface to the caller.
pub struct FallbackTranslator {
    primary: Arc<dyn Translator>,
    fallback: Arc<dyn Translator>,
}

impl FallbackTranslator {
    pub fn new(primary: Arc<dyn Translator>, fallback: Arc<dyn Translator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Translator for FallbackTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, TranslationError> {
        match self.primary.translate(text, source, target).await {
            Ok(translation) if translation.confidence > 0.0 => Ok(translation),
            Ok(echo) => {
                debug!(target = target.as_str(), "primary echoed the input, trying fallback");
                match self.fallback.translate(text, source, target).await {
                    Ok(translation) if translation.confidence > 0.0 => Ok(translation),
                    // Both providers answered with the input unchanged;
                    // an echo is still an answer.
                    Ok(_) => Ok(echo),
                    Err(err) => {
                        warn!(error = %err, "fallback translator failed, keeping the echo");
                        Ok(echo)
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "primary translator failed, trying fallback");
                self.fallback.translate(text, source, target).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    enum Script {
        Succeed(&'static str, f32),
        Echo,
        Fail,
    }

    struct Scripted {
        script: Script,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Translator for Scripted {
        async fn translate(
            &self,
            text: &str,
            _source: &LanguageCode,
            _target: &LanguageCode,
        ) -> Result<Translation, TranslationError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.script {
                Script::Succeed(out, confidence) => Ok(Translation {
                    text: out.to_string(),
                    confidence,
                }),
                Script::Echo => Ok(Translation {
                    text: text.to_string(),
                    confidence: 0.0,
                }),
                Script::Fail => Err(TranslationError::Backend("scripted failure".to_string())),
            }
        }
    }

    fn chain(primary: &Arc<Scripted>, fallback: &Arc<Scripted>) -> FallbackTranslator {
        FallbackTranslator::new(
            Arc::clone(primary) as Arc<dyn Translator>,
            Arc::clone(fallback) as Arc<dyn Translator>,
        )
    }

    fn en() -> LanguageCode {
        LanguageCode::new("en")
    }

    fn es() -> LanguageCode {
        LanguageCode::new("es")
    }

    #[tokio::test]
    async fn primary_success_skips_the_fallback() {
        let primary = Scripted::new(Script::Succeed("buenos días", 0.8));
        let fallback = Scripted::new(Script::Succeed("unused", 0.7));
        let result = chain(&primary, &fallback)
            .translate("good morning", &en(), &es())
            .await
            .unwrap();
        assert_eq!(result.text, "buenos días");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn failing_primary_falls_through() {
        let primary = Scripted::new(Script::Fail);
        let fallback = Scripted::new(Script::Succeed("buenos días", 0.7));
        let result = chain(&primary, &fallback)
            .translate("good morning", &en(), &es())
            .await
            .unwrap();
        assert_eq!(result.text, "buenos días");
        assert!((result.confidence - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn echoed_primary_retries_on_the_fallback() {
        let primary = Scripted::new(Script::Echo);
        let fallback = Scripted::new(Script::Succeed("buenos días", 0.6));
        let result = chain(&primary, &fallback)
            .translate("good morning", &en(), &es())
            .await
            .unwrap();
        assert_eq!(result.text, "buenos días");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn echo_survives_a_failing_fallback() {
        let primary = Scripted::new(Script::Echo);
        let fallback = Scripted::new(Script::Fail);
        let result = chain(&primary, &fallback)
            .translate("good morning", &en(), &es())
            .await
            .unwrap();
        assert_eq!(result.text, "good morning");
        assert!(result.confidence.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn both_providers_failing_surfaces_the_error() {
        let primary = Scripted::new(Script::Fail);
        let fallback = Scripted::new(Script::Fail);
        let result = chain(&primary, &fallback)
            .translate("good morning", &en(), &es())
            .await;
        assert!(matches!(result, Err(TranslationError::Backend(_))));
    }
}
