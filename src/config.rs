//! Configuration for the store, scoring, query loop, completion client and imagination scheduler

use crate::error::{ReverieError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Window and lookback sizes for the tiered memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Elements per level-0 consolidation window
    pub base_size: i64,
    /// Elements between consecutive level-0 windows
    pub base_freq: i64,
    /// Lower-level consolidations per higher-level window
    pub higher_size: i64,
    /// Lower-level consolidations between consecutive higher-level windows
    pub higher_freq: i64,
    /// Number of consolidation levels
    pub max_lvl: u32,
    /// Most recent elements scanned for short-term context
    pub short_term_lookback: i64,
    /// Most recent consolidations scanned per level for long-term context
    pub summary_lookback: i64,
    /// Most recent imaginations scanned for long-term context
    pub imagination_lookback: i64,
    /// Attempts per transaction before a conflict becomes fatal
    pub transaction_attempts: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_size: 10,
            base_freq: 5,
            higher_size: 6,
            higher_freq: 3,
            max_lvl: 3,
            short_term_lookback: 64,
            summary_lookback: 24,
            imagination_lookback: 48,
            transaction_attempts: 5,
        }
    }
}

impl MemoryConfig {
    /// Window size and frequency for a consolidation level
    pub fn window(&self, lvl: u32) -> (i64, i64) {
        if lvl == 0 {
            (self.base_size, self.base_freq)
        } else {
            (self.higher_size, self.higher_freq)
        }
    }
}

/// Weights for recency and similarity scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Newest positions always included regardless of similarity
    pub always_include: usize,
    /// Score of the newest element; each older always-included position loses `recent_step`
    pub recent_base: f32,
    pub recent_step: f32,
    pub factor: f32,
    pub offset: f32,
    pub exponent: f32,
    pub time_penalty_factor: f32,
    pub time_penalty_ms_scale: f32,
    /// Rank decay applied within each long-term stream
    pub long_term_offset: f32,
    pub long_term_exponent: f32,
    /// Short-term items placed in the prompt
    pub short_term_items: usize,
    /// Long-term items placed in the prompt
    pub long_term_items: usize,
    /// Token budget for the rendered memory sections
    pub context_tokens: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            always_include: 4,
            recent_base: 100.0,
            recent_step: 1.0,
            factor: 10.0,
            offset: 1.0,
            exponent: 0.5,
            time_penalty_factor: 0.5,
            time_penalty_ms_scale: 1.0 / 60_000.0,
            long_term_offset: 2.0,
            long_term_exponent: 0.25,
            short_term_items: 12,
            long_term_items: 8,
            context_tokens: 6_000,
        }
    }
}

/// Bounds for the agentic query loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iters: usize,
    /// Deepest recursion level whose loop may still call functions
    pub max_action_level: u32,
    pub max_think: usize,
    pub max_research: usize,
    pub max_reply: usize,
    /// Persisted actions compared against when filtering duplicates
    pub action_history: i64,
    pub query_token_limit: usize,
    pub note_token_limit: usize,
    pub think_timeout_ms: u64,
    pub research_timeout_ms: u64,
    pub background_timeout_ms: u64,
    pub introspection_delay_ms: u64,
    /// Recent elements an introspection reflects on
    pub introspection_window: i64,
    /// Concurrent background jobs before new submissions are dropped
    pub background_slots: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iters: 4,
            max_action_level: 1,
            max_think: 3,
            max_research: 2,
            max_reply: 1,
            action_history: 16,
            query_token_limit: 2_000,
            note_token_limit: 1_000,
            think_timeout_ms: 120_000,
            research_timeout_ms: 60_000,
            background_timeout_ms: 60_000,
            introspection_delay_ms: 30_000,
            introspection_window: 8,
            background_slots: 16,
        }
    }
}

/// Streaming completion client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    /// Wait before retry `i` after a rate-limit response
    pub backoff_ms: Vec<u64>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Hard wall-clock bound on one streamed generation
    pub cutover_ms: u64,
    /// Token prefix length used to key known completions
    pub short_circuit_tokens: usize,
    pub known_completions: usize,
    pub known_completion_ttl_secs: i64,
    pub prompt_padding: usize,
    pub completion_padding: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimension: 1_536,
            backoff_ms: vec![1_000, 2_000, 4_000, 8_000],
            connect_timeout_ms: 10_000,
            request_timeout_ms: 180_000,
            cutover_ms: 90_000,
            short_circuit_tokens: 8,
            known_completions: 512,
            known_completion_ttl_secs: 3_600,
            prompt_padding: 7,
            completion_padding: 3,
        }
    }
}

/// Due-time drawing for imaginations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImaginationConfig {
    pub min_delay_secs: i64,
    pub max_delay_secs: i64,
    /// Partners drawn alongside the reference item
    pub partners: usize,
    pub poll_interval_secs: u64,
}

impl Default for ImaginationConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 10 * 60,
            max_delay_secs: 3 * 24 * 60 * 60,
            partners: 2,
            poll_interval_secs: 60,
        }
    }
}

/// Auxiliary knowledge lookup and web research
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Search endpoint returning `organic` results
    pub search_url: String,
    /// Structured knowledge endpoint; lookups are skipped when unset
    pub knowledge_url: Option<String>,
    /// Pages scraped per research action
    pub max_pages: usize,
    /// Characters kept from each scraped page
    pub max_page_chars: usize,
    /// Snippets placed in recursion prompts
    pub max_snippets: usize,
    /// Attempts per auxiliary call before degrading to empty
    pub attempts: u32,
    pub request_timeout_ms: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            search_url: "https://google.serper.dev/search".into(),
            knowledge_url: None,
            max_pages: 3,
            max_page_chars: 4_000,
            max_snippets: 5,
            attempts: 2,
            request_timeout_ms: 15_000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverieConfig {
    pub memory: MemoryConfig,
    pub scoring: ScoringConfig,
    pub agent: AgentConfig,
    pub completion: CompletionConfig,
    pub imagination: ImaginationConfig,
    pub research: ResearchConfig,
}

impl ReverieConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ReverieError::Configuration(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        if m.base_size <= 0 || m.base_freq <= 0 || m.higher_size <= 0 || m.higher_freq <= 0 {
            return Err(ReverieError::Configuration(
                "consolidation window sizes and frequencies must be positive".into(),
            ));
        }
        if m.transaction_attempts == 0 {
            return Err(ReverieError::Configuration(
                "transaction_attempts must be at least 1".into(),
            ));
        }
        let i = &self.imagination;
        if i.min_delay_secs <= 0 || i.min_delay_secs > i.max_delay_secs {
            return Err(ReverieError::Configuration(format!(
                "imagination delay range [{}, {}] is invalid",
                i.min_delay_secs, i.max_delay_secs
            )));
        }
        if self.agent.max_iters == 0 {
            return Err(ReverieError::Configuration("max_iters must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration builder
#[derive(Debug, Default)]
pub struct ReverieConfigBuilder {
    config: ReverieConfig,
}

impl ReverieConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_window(mut self, size: i64, freq: i64) -> Self {
        self.config.memory.base_size = size;
        self.config.memory.base_freq = freq;
        self
    }

    pub fn higher_window(mut self, size: i64, freq: i64) -> Self {
        self.config.memory.higher_size = size;
        self.config.memory.higher_freq = freq;
        self
    }

    pub fn max_lvl(mut self, max_lvl: u32) -> Self {
        self.config.memory.max_lvl = max_lvl;
        self
    }

    pub fn max_iters(mut self, max_iters: usize) -> Self {
        self.config.agent.max_iters = max_iters;
        self
    }

    pub fn introspection_delay_ms(mut self, delay: u64) -> Self {
        self.config.agent.introspection_delay_ms = delay;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.completion.model = model.into();
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.completion.base_url = base_url.into();
        self
    }

    pub fn backoff_ms(mut self, schedule: Vec<u64>) -> Self {
        self.config.completion.backoff_ms = schedule;
        self
    }

    pub fn imagination_delay_secs(mut self, min: i64, max: i64) -> Self {
        self.config.imagination.min_delay_secs = min;
        self.config.imagination.max_delay_secs = max;
        self
    }

    pub fn build(self) -> Result<ReverieConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
