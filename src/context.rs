//! Short- and long-term context assembly within a token budget

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::scoring::{combined_similarity, long_term_score, short_term_score};
use crate::store::MemoryStore;
use crate::tokenizer::Tokenizer;
use crate::types::{Consolidation, Element, Embedding, LongTermStream, SessionKey};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ScoredElement {
    pub element: Element,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ScoredConsolidation {
    pub consolidation: Consolidation,
    pub score: f32,
}

/// One selected memory item as reported in diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    /// "element", "level N" or "imagination"
    pub stream: String,
    pub index: i64,
    pub score: f32,
}

/// Selected memory, in prompt order
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    /// Chronological
    pub short_term: Vec<ScoredElement>,
    /// Grouped by stream (levels ascending, imaginations last), chronological within each
    pub long_term: Vec<ScoredConsolidation>,
    /// Selected items dropped to fit the token budget
    pub dropped: usize,
}

impl MemoryContext {
    pub fn short_term_lines(&self) -> Vec<String> {
        self.short_term.iter().map(|s| s.element.render()).collect()
    }

    /// Every selected item with its score, short-term first
    pub fn hits(&self) -> Vec<MemoryHit> {
        let short = self.short_term.iter().map(|s| MemoryHit {
            stream: "element".into(),
            index: s.element.index,
            score: s.score,
        });
        let long = self.long_term.iter().map(|s| MemoryHit {
            stream: s.consolidation.stream.to_string(),
            index: s.consolidation.index,
            score: s.score,
        });
        short.chain(long).collect()
    }

    pub fn long_term_lines(&self) -> Vec<String> {
        self.long_term
            .iter()
            .map(|s| render_consolidation(&s.consolidation))
            .collect()
    }
}

fn render_consolidation(c: &Consolidation) -> String {
    match c.stream {
        LongTermStream::Level(lvl) => format!("[summary L{lvl}#{}] {}", c.index, c.consolidation.text()),
        LongTermStream::Imagination => format!("[reflection #{}] {}", c.index, c.consolidation.text()),
    }
}

fn stream_order(stream: LongTermStream) -> (u8, u32) {
    match stream {
        LongTermStream::Level(lvl) => (0, lvl),
        LongTermStream::Imagination => (1, 0),
    }
}

/// Builds the memory sections of a prompt from the store and the scoring rules
pub struct ContextBuilder {
    store: Arc<MemoryStore>,
    tokenizer: Arc<dyn Tokenizer>,
    config: ScoringConfig,
}

impl ContextBuilder {
    pub fn new(store: Arc<MemoryStore>, tokenizer: Arc<dyn Tokenizer>, config: ScoringConfig) -> Self {
        Self {
            store,
            tokenizer,
            config,
        }
    }

    /// Select memory relevant to `targets` (the query embedding, plus the
    /// recursed query's when present)
    pub async fn build(&self, key: &SessionKey, targets: &[Embedding]) -> Result<MemoryContext> {
        let targets: Vec<&[f32]> = targets.iter().map(Vec::as_slice).collect();
        let now = Utc::now();
        let config = &self.config;

        let short = self
            .store
            .short_term_search(
                key,
                |element, position, timestamp| {
                    let elapsed_ms = (now - timestamp).num_milliseconds() as f64;
                    let sim = combined_similarity(element.embedding(), &targets);
                    short_term_score(config, position, elapsed_ms, sim)
                },
                config.short_term_items,
            )
            .await?;

        let long = self
            .store
            .long_term_search(
                key,
                |scan, item| long_term_score(config, scan, item, &targets),
                config.long_term_items,
            )
            .await?;

        // Highest scores claim the budget first, short-term before long-term
        let mut budget = config.context_tokens;
        let mut dropped = 0;

        let mut short_term = Vec::new();
        for (element, score) in short {
            let cost = self.tokenizer.count_tokens(&element.render()).await?;
            if cost > budget {
                dropped += 1;
                continue;
            }
            budget -= cost;
            short_term.push(ScoredElement { element, score });
        }

        let mut long_term = Vec::new();
        for (consolidation, score) in long {
            let cost = self
                .tokenizer
                .count_tokens(&render_consolidation(&consolidation))
                .await?;
            if cost > budget {
                dropped += 1;
                continue;
            }
            budget -= cost;
            long_term.push(ScoredConsolidation {
                consolidation,
                score,
            });
        }

        short_term.sort_by_key(|s| s.element.index);
        long_term.sort_by_key(|s| (stream_order(s.consolidation.stream), s.consolidation.index));

        debug!(
            doc_id = %key,
            short_term = short_term.len(),
            long_term = long_term.len(),
            dropped,
            remaining_tokens = budget,
            "memory context built"
        );

        Ok(MemoryContext {
            short_term,
            long_term,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::embedding::{EmbeddingProvider, HashEmbeddingProvider};
    use crate::tokenizer::HeuristicTokenizer;
    use crate::types::{ConsolidationBody, ElementPayload, Extra};

    async fn seeded_store(embedder: &HashEmbeddingProvider) -> Arc<MemoryStore> {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = SessionKey::new("u", "s");
        let topics = [
            "my dog is called Rex",
            "the weather is rainy",
            "I like green tea",
            "rust lifetimes confuse me",
            "the cat sleeps all day",
            "the train was late",
            "green tea again",
            "pasta for dinner",
        ];
        for topic in topics {
            let embedding = embedder.embed_one(topic).await.unwrap();
            let payload = ElementPayload::exchange(topic, "noted").with_embeddings(None, Some(embedding));
            store.append_element(&key, &payload, &Extra::new(), false).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn recent_turns_always_included_then_similar_ones() {
        let embedder = HashEmbeddingProvider::new(128);
        let store = seeded_store(&embedder).await;
        let key = SessionKey::new("u", "s");
        let config = ScoringConfig {
            always_include: 2,
            short_term_items: 3,
            ..ScoringConfig::default()
        };
        let builder = ContextBuilder::new(store, Arc::new(HeuristicTokenizer::new()), config);

        let query = embedder.embed_one("what is my dog called").await.unwrap();
        let context = builder.build(&key, &[query]).await.unwrap();

        let indices: Vec<i64> = context.short_term.iter().map(|s| s.element.index).collect();
        assert_eq!(indices, vec![0, 6, 7]);

        let hits = context.hits();
        assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), indices);
        assert!(hits.iter().all(|h| h.stream == "element" && h.score.is_finite()));
    }

    #[tokio::test]
    async fn budget_drops_what_does_not_fit() {
        let embedder = HashEmbeddingProvider::new(64);
        let store = seeded_store(&embedder).await;
        let key = SessionKey::new("u", "s");
        let config = ScoringConfig {
            context_tokens: 14,
            ..ScoringConfig::default()
        };
        let builder = ContextBuilder::new(store, Arc::new(HeuristicTokenizer::new()), config);

        let context = builder.build(&key, &[]).await.unwrap();
        assert_eq!(context.short_term.len(), 1);
        assert!(context.dropped > 0);
    }

    #[tokio::test]
    async fn long_term_groups_levels_before_imaginations() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = SessionKey::new("u", "s");
        store
            .append_imagination(&key, &ConsolidationBody::imagination("a daydream", Some(vec![1.0, 0.0])), &Extra::new())
            .await
            .unwrap();
        let builder = ContextBuilder::new(
            Arc::clone(&store),
            Arc::new(HeuristicTokenizer::new()),
            ScoringConfig::default(),
        );

        let context = builder.build(&key, &[vec![1.0, 0.0]]).await.unwrap();
        assert_eq!(context.long_term.len(), 1);
        assert!(context.long_term_lines()[0].starts_with("[reflection #0]"));

        let hits = context.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stream, "imagination");
        assert!(hits[0].score > 0.0);
    }
}
