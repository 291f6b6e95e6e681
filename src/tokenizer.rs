//! Token counting and token-prefix extraction

use crate::cache::{CacheKey, TtlCache};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn count_tokens(&self, text: &str) -> Result<usize>;

    /// The first `n` tokens of `text`, concatenated back into a string
    async fn prefix(&self, text: &str, n: usize) -> Result<String>;
}

/// Offline tokenizer approximating BPE counts.
///
/// A token is a run of alphanumeric characters or any single other character,
/// so `"Hello "` is two tokens.
#[derive(Clone, Default)]
pub struct HeuristicTokenizer {
    cache: Option<Arc<TtlCache>>,
}

impl HeuristicTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoize counts of long texts in `cache`
    pub fn with_cache(cache: Arc<TtlCache>) -> Self {
        Self { cache: Some(cache) }
    }

    /// Byte ranges of every token in `text`
    pub fn spans(text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut run_start: Option<usize> = None;

        for (i, c) in text.char_indices() {
            if c.is_alphanumeric() {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                continue;
            }
            if let Some(start) = run_start.take() {
                spans.push((start, i));
            }
            spans.push((i, i + c.len_utf8()));
        }
        if let Some(start) = run_start {
            spans.push((start, text.len()));
        }
        spans
    }
}

const CACHE_MIN_LEN: usize = 256;

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    async fn count_tokens(&self, text: &str) -> Result<usize> {
        let Some(cache) = self.cache.as_ref().filter(|_| text.len() >= CACHE_MIN_LEN) else {
            return Ok(Self::spans(text).len());
        };

        let key = CacheKey::tokens(text);
        if let Some(count) = cache.get::<usize>(&key).await {
            return Ok(count);
        }
        let count = Self::spans(text).len();
        cache.put(key, &count).await?;
        Ok(count)
    }

    async fn prefix(&self, text: &str, n: usize) -> Result<String> {
        let spans = Self::spans(text);
        let end = match n {
            0 => 0,
            n if n >= spans.len() => text.len(),
            n => spans[n - 1].1,
        };
        Ok(text[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    #[tokio::test]
    async fn words_and_separators_are_tokens() {
        let tokenizer = HeuristicTokenizer::new();
        assert_eq!(tokenizer.count_tokens("Hello ").await.unwrap(), 2);
        assert_eq!(tokenizer.count_tokens("Hello world, friend").await.unwrap(), 6);
        assert_eq!(tokenizer.count_tokens("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prefix_keeps_whole_tokens() {
        let tokenizer = HeuristicTokenizer::new();
        assert_eq!(tokenizer.prefix("Hello world, friend", 2).await.unwrap(), "Hello ");
        assert_eq!(tokenizer.prefix("Hi", 5).await.unwrap(), "Hi");
        assert_eq!(tokenizer.prefix("Hi", 0).await.unwrap(), "");
    }

    #[tokio::test]
    async fn multibyte_text_splits_on_char_boundaries() {
        let tokenizer = HeuristicTokenizer::new();
        assert_eq!(tokenizer.count_tokens("café → ok").await.unwrap(), 5);
        assert_eq!(tokenizer.prefix("café → ok", 3).await.unwrap(), "café →");
    }

    #[tokio::test]
    async fn long_counts_are_cached() {
        let cache = Arc::new(TtlCache::new(CacheConfig::default()));
        let tokenizer = HeuristicTokenizer::with_cache(Arc::clone(&cache));
        let text = "word ".repeat(100);

        assert_eq!(tokenizer.count_tokens(&text).await.unwrap(), 200);
        assert_eq!(tokenizer.count_tokens(&text).await.unwrap(), 200);
        assert_eq!(cache.stats().await.hits, 1);
    }
}
