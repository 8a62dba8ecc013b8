//! External Provider Seams
//!
//! The lexical segmenter and the embedding model are consumed as black-box
//! functions behind async traits. Real implementations live in the embedding
//! application; this crate only defines the boundary and the retry policy.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of an external provider call (network, auth, model).
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Lexical segmentation provider: `text -> token string`.
///
/// Pure function of its input; the token string is whitespace-joined
/// tokens, stored verbatim as the `lexical_form` of a chunk.
#[async_trait]
pub trait LexicalProvider: Send + Sync {
    async fn segment(&self, text: &str) -> Result<String, ProviderError>;
}

/// Embedding provider: `texts -> vectors`, batchable.
///
/// May fail per call; callers retry a bounded number of times with backoff
/// before degrading the affected chunks.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// The provider pair handed to the engine at construction.
///
/// Either side may be absent: fields requesting the missing signal are
/// indexed without it (degraded retrieval, never an indexing failure).
#[derive(Clone, Default)]
pub struct Providers {
    pub lexical: Option<Arc<dyn LexicalProvider>>,
    pub embedding: Option<Arc<dyn EmbeddingProvider>>,
}

impl Providers {
    pub fn new(
        lexical: Option<Arc<dyn LexicalProvider>>,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self { lexical, embedding }
    }
}

/// Call the embedding provider with bounded retries and doubling backoff.
///
/// Returns the error of the last attempt once retries are exhausted; the
/// caller decides whether that degrades a chunk or fails the operation.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    max_retries: u32,
    base_backoff: Duration,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let mut backoff = base_backoff;
    let mut attempt = 0;
    loop {
        match provider.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries,
                    "Embedding provider call failed, retrying: {}",
                    err
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    //! Counting fakes shared by unit and integration tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lowercases and strips punctuation; counts invocations.
    #[derive(Default)]
    pub struct FakeLexical {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl LexicalProvider for FakeLexical {
        async fn segment(&self, text: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tokens: Vec<String> = text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_lowercase())
                .collect();
            Ok(tokens.join(" "))
        }
    }

    /// Deterministic toy embedding (letter histogram); counts invocations
    /// and can be made to fail a set number of times.
    #[derive(Default)]
    pub struct FakeEmbedding {
        pub calls: AtomicUsize,
        pub failures_remaining: AtomicUsize,
    }

    impl FakeEmbedding {
        pub fn failing(times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures_remaining: AtomicUsize::new(times),
            }
        }

        pub fn embed_one(text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; 26];
            for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
                v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut v {
                    *x /= norm;
                }
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::new("simulated embedding outage"));
            }
            Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let provider = FakeEmbedding::failing(2);
        let result = embed_with_retry(
            &provider,
            &["hello".to_string()],
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_error_when_exhausted() {
        let provider = FakeEmbedding::failing(10);
        let result = embed_with_retry(
            &provider,
            &["hello".to_string()],
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
