//! Caption translation: backend trait, HTTP providers, cache and fan-out

pub mod backend;
pub mod cache;
pub mod http;
pub mod mymemory;
pub mod router;

pub use backend::{FallbackTranslator, Translation, Translator};
pub use cache::{CacheKey, TranslationCache};
pub use http::GtxTranslator;
pub use mymemory::MyMemoryTranslator;
pub use router::TranslationRouter;
