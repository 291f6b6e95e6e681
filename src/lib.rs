//! # Reverie - Tiered conversational memory and agentic reasoning
//!
//! Every session keeps an append-only log of exchanges. Sliding windows of
//! that log are summarized into a hierarchy of consolidations, a randomized
//! scheduler occasionally synthesizes "imaginations" from long-term memory,
//! and a recursive query loop answers user questions from scored short- and
//! long-term context.

pub mod agent;
pub mod cache;
pub mod completion;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod embedding;
pub mod error;
pub mod imagination;
pub mod prompt;
pub mod research;
pub mod scoring;
pub mod store;
pub mod tasks;
pub mod tokenizer;
pub mod types;

pub use agent::{ActionRecord, Agent, Diagnostics, QueryOutcome, Services};
pub use cache::{CacheConfig, CacheConfigBuilder, CacheKey, CacheStats, TtlCache};
pub use completion::{
    CompletionRequest, CompletionResponse, CompletionService, FinishReason, FunctionDef, KnownCompletions,
    OpenAiCompletionClient, PartialFn, ToolCall, Usage,
};
pub use config::{
    AgentConfig, CompletionConfig, ImaginationConfig, MemoryConfig, ResearchConfig, ReverieConfig,
    ReverieConfigBuilder, ScoringConfig,
};
pub use consolidation::{ConsolidationEngine, Summarizer};
pub use context::{ContextBuilder, MemoryContext, MemoryHit, ScoredConsolidation, ScoredElement};
pub use embedding::{EmbeddingProvider, HashEmbeddingProvider, OpenAiEmbeddingProvider};
pub use error::{Result, ReverieError};
pub use imagination::ImaginationScheduler;
pub use research::{HttpKnowledgeSource, KnowledgeSource, NoResearch, Researcher, WebResearcher};
pub use store::{ConsolidationOutput, ConsolidationRequest, ImagineReport, MemoryStore};
pub use tasks::{BackgroundTasks, TaskStats};
pub use tokenizer::{HeuristicTokenizer, Tokenizer};
pub use types::{
    Action, ActionKind, ActionPayload, Consolidation, ConsolidationBody, ConsolidationStamp, Element,
    ElementPayload, Embedding, Extra, Latest, LongTermStream, Pinpoint, Pinpointed, SessionKey, Stamp,
};

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main entry point: a store plus the agent built on it
#[derive(Clone)]
pub struct Reverie {
    agent: Agent,
    data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Reverie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverie")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Reverie {
    /// Open (or create) a file-backed memory under `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>, config: ReverieConfig, services: Services) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let store = MemoryStore::connect(data_dir.join("reverie.db"), config.memory.clone()).await?;
        Ok(Self {
            agent: Agent::new(store, services, config),
            data_dir: Some(data_dir),
        })
    }

    /// Memory that lives only as long as the process
    pub async fn in_memory(config: ReverieConfig, services: Services) -> Result<Self> {
        config.validate()?;
        let store = MemoryStore::connect_in_memory(config.memory.clone()).await?;
        Ok(Self {
            agent: Agent::new(store, services, config),
            data_dir: None,
        })
    }

    pub fn from_store(store: Arc<MemoryStore>, services: Services, config: ReverieConfig) -> Self {
        Self {
            agent: Agent::new(store, services, config),
            data_dir: None,
        }
    }

    /// Answer a user query in a session
    pub async fn ask(&self, key: &SessionKey, query: &str) -> Result<QueryOutcome> {
        self.agent.query(key, query).await
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.agent.store()
    }

    pub fn imagination(&self) -> &ImaginationScheduler {
        self.agent.imagination()
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Sweep due imaginations every `poll` until `shutdown` resolves
    pub async fn run_imagination_daemon<S>(&self, poll: Duration, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        futures::pin_mut!(shutdown);

        info!(poll_secs = poll.as_secs(), "imagination daemon started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.imagination().run_due(Utc::now()).await {
                        warn!(error = %e, "imagination sweep failed");
                    }
                }
            }
        }
        self.agent.tasks().wait_idle().await;
        info!("imagination daemon stopped");
        Ok(())
    }
}
