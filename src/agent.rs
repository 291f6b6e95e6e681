//! Agentic query loop
//!
//! One invocation builds a prompt from memory, calls the completion service
//! with the `act` function, dispatches the surviving calls concurrently and
//! folds their results back in until the model answers in plain text. `think`
//! calls recurse into the same loop one level deeper. A top-level answer is
//! persisted as an element; consolidation and introspection follow in the
//! background.

use crate::cache::{CacheConfigBuilder, TtlCache};
use crate::completion::{
    CompletionRequest, CompletionService, FinishReason, KnownCompletions, OpenAiCompletionClient, PartialFn, Usage,
};
use crate::config::ReverieConfig;
use crate::consolidation::{ConsolidationEngine, Summarizer};
use crate::context::{ContextBuilder, MemoryHit};
use crate::embedding::{EmbeddingProvider, HashEmbeddingProvider, OpenAiEmbeddingProvider};
use crate::error::{ReverieError, Result};
use crate::imagination::ImaginationScheduler;
use crate::prompt::{act_function, normalize, parse_action_call, ActionCall, ActionView, PromptContext};
use crate::research::{HttpKnowledgeSource, KnowledgeSource, NoResearch, Researcher, WebResearcher};
use crate::store::MemoryStore;
use crate::tasks::BackgroundTasks;
use crate::tokenizer::{HeuristicTokenizer, Tokenizer};
use crate::types::{ActionKind, ActionPayload, Embedding, ElementPayload, Extra, SessionKey, Stamp};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// External collaborators of the loop
#[derive(Clone)]
pub struct Services {
    pub completion: Arc<dyn CompletionService>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub researcher: Arc<dyn Researcher>,
    pub knowledge: Arc<dyn KnowledgeSource>,
}

impl Services {
    /// Remote completion only; hashed embeddings, heuristic tokens, no research
    pub fn offline(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            embedder: Arc::new(HashEmbeddingProvider::new(256)),
            tokenizer: Arc::new(HeuristicTokenizer::new()),
            researcher: Arc::new(NoResearch),
            knowledge: Arc::new(NoResearch),
        }
    }

    /// OpenAI-compatible completion and embeddings; web research when a search key is given
    pub fn remote(config: &ReverieConfig, api_key: &str, search_api_key: Option<&str>) -> Result<Self> {
        let cache = Arc::new(TtlCache::new(CacheConfigBuilder::new().max_entries(4_096).build()));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(HeuristicTokenizer::with_cache(cache));
        let completion: Arc<dyn CompletionService> = Arc::new(OpenAiCompletionClient::new(
            config.completion.clone(),
            api_key,
            Arc::clone(&tokenizer),
        )?);
        let embedder = Arc::new(OpenAiEmbeddingProvider::new(
            &config.completion,
            api_key,
            config.completion.embedding_dimension,
        )?);

        let (researcher, knowledge): (Arc<dyn Researcher>, Arc<dyn KnowledgeSource>) = match search_api_key {
            Some(key) => {
                let researcher: Arc<dyn Researcher> = Arc::new(WebResearcher::new(
                    config.research.clone(),
                    &config.completion,
                    key,
                    Arc::clone(&completion),
                )?);
                let knowledge: Arc<dyn KnowledgeSource> = match &config.research.knowledge_url {
                    Some(url) => Arc::new(HttpKnowledgeSource::new(url, key, &config.research, &config.completion)?),
                    None => Arc::new(NoResearch),
                };
                (researcher, knowledge)
            }
            None => (Arc::new(NoResearch) as Arc<dyn Researcher>, Arc::new(NoResearch) as Arc<dyn KnowledgeSource>),
        };

        Ok(Self {
            completion,
            embedder,
            tokenizer,
            researcher,
            knowledge,
        })
    }
}

/// One sub-action as reported to the caller
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub query: Option<String>,
    pub note: Option<String>,
    pub result: Option<String>,
    /// Index of the persisted action, when persistence succeeded
    pub index: Option<i64>,
    pub repairs: Vec<&'static str>,
}

impl From<&ActionCall> for ActionRecord {
    fn from(call: &ActionCall) -> Self {
        Self {
            kind: call.kind,
            query: call.query.clone(),
            note: call.note.clone(),
            result: None,
            index: None,
            repairs: call.repairs.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub correlation_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub depth: u32,
    pub iterations: usize,
    pub actions: Vec<ActionRecord>,
    /// Includes every recursive sub-call
    pub usage: Usage,
    pub warnings: Vec<String>,
    pub finish_reason: Option<FinishReason>,
    /// Index of the persisted element (top level only)
    pub element_index: Option<i64>,
    /// Memory shown to the model on the first turn, with its scores
    pub memory: Vec<MemoryHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub reply: String,
    pub diagnostics: Diagnostics,
}

#[derive(Clone)]
struct Invocation {
    correlation_id: Uuid,
    parent_id: Option<Uuid>,
    depth: u32,
    query: String,
    recursed_query: Option<String>,
    recursed_note: Option<String>,
    /// Normalized queries of every invocation above this one
    stack: Vec<String>,
    /// Results seen by this query tree, for short-circuiting later generations
    known: Arc<KnownCompletions>,
}

impl Invocation {
    fn top_level(query: &str, known: KnownCompletions) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            parent_id: None,
            depth: 0,
            query: query.to_string(),
            recursed_query: None,
            recursed_note: None,
            stack: Vec::new(),
            known: Arc::new(known),
        }
    }

    /// The query this invocation is answering
    fn focus(&self) -> &str {
        self.recursed_query.as_deref().unwrap_or(&self.query)
    }

    fn on_stack(&self, normalized: &str) -> bool {
        normalize(self.focus()) == normalized || self.stack.iter().any(|q| q == normalized)
    }

    fn child(&self, call: &ActionCall) -> Self {
        let mut stack = self.stack.clone();
        stack.push(normalize(self.focus()));
        Self {
            correlation_id: Uuid::new_v4(),
            parent_id: Some(self.correlation_id),
            depth: self.depth + 1,
            query: self.query.clone(),
            recursed_query: call.query.clone(),
            recursed_note: call.note.clone(),
            stack,
            known: Arc::clone(&self.known),
        }
    }
}

#[derive(Default)]
struct DispatchOutcome {
    result: Option<String>,
    usage: Usage,
    warnings: Vec<String>,
}

impl DispatchOutcome {
    fn failed(warning: String) -> Self {
        Self {
            warnings: vec![warning],
            ..Default::default()
        }
    }
}

struct AgentInner {
    store: Arc<MemoryStore>,
    services: Services,
    context: ContextBuilder,
    consolidation: ConsolidationEngine,
    imagination: ImaginationScheduler,
    tasks: BackgroundTasks,
    config: ReverieConfig,
}

/// The reasoning core. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(store: Arc<MemoryStore>, services: Services, config: ReverieConfig) -> Self {
        let context = ContextBuilder::new(
            Arc::clone(&store),
            Arc::clone(&services.tokenizer),
            config.scoring.clone(),
        );
        let summarizer = Arc::new(Summarizer::new(
            Arc::clone(&services.completion),
            Arc::clone(&services.embedder),
        ));
        let consolidation = ConsolidationEngine::new(Arc::clone(&store), summarizer);
        let imagination = ImaginationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&services.completion),
            Arc::clone(&services.embedder),
            config.imagination.clone(),
        );
        let tasks = BackgroundTasks::new(
            config.agent.background_slots,
            Duration::from_millis(config.agent.background_timeout_ms),
        );

        Self {
            inner: Arc::new(AgentInner {
                store,
                services,
                context,
                consolidation,
                imagination,
                tasks,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.inner.store
    }

    pub fn consolidation(&self) -> &ConsolidationEngine {
        &self.inner.consolidation
    }

    pub fn imagination(&self) -> &ImaginationScheduler {
        &self.inner.imagination
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Answer a user query
    pub async fn query(&self, key: &SessionKey, query: &str) -> Result<QueryOutcome> {
        self.run(key, self.top_level(query), None).await
    }

    /// Answer a user query, reporting partial output as it streams
    pub async fn query_streaming(&self, key: &SessionKey, query: &str, on_partial: PartialFn<'_>) -> Result<QueryOutcome> {
        self.run(key, self.top_level(query), Some(on_partial)).await
    }

    /// Each top-level query starts with no known completions; its `think`
    /// children share the parent's
    fn top_level(&self, query: &str) -> Invocation {
        let known = KnownCompletions::new(
            Arc::clone(&self.inner.services.tokenizer),
            &self.inner.config.completion,
        );
        Invocation::top_level(query, known)
    }

    fn run<'a>(
        &'a self,
        key: &'a SessionKey,
        invocation: Invocation,
        on_partial: Option<PartialFn<'a>>,
    ) -> BoxFuture<'a, Result<QueryOutcome>> {
        let span = info_span!(
            "query",
            correlation_id = %invocation.correlation_id,
            depth = invocation.depth
        );
        async move { self.run_loop(key, invocation, on_partial).await }
            .instrument(span)
            .boxed()
    }

    async fn run_loop(&self, key: &SessionKey, inv: Invocation, on_partial: Option<PartialFn<'_>>) -> Result<QueryOutcome> {
        let cfg = &self.inner.config.agent;

        if inv.query.trim().is_empty() {
            return Err(ReverieError::Validation("query is empty".into()));
        }
        self.check_tokens("query", &inv.query, cfg.query_token_limit).await?;
        if let Some(query) = &inv.recursed_query {
            self.check_tokens("recursed query", query, cfg.query_token_limit).await?;
        }
        if let Some(note) = &inv.recursed_note {
            self.check_tokens("recursed note", note, cfg.note_token_limit).await?;
        }

        let mut diag = Diagnostics {
            correlation_id: inv.correlation_id,
            parent_id: inv.parent_id,
            depth: inv.depth,
            ..Default::default()
        };

        let query_embedding = self.embed_or_warn(&inv.query, &mut diag.warnings).await;
        let mut targets: Vec<Embedding> = query_embedding.iter().cloned().collect();
        if let Some(recursed) = &inv.recursed_query {
            targets.extend(self.embed_or_warn(recursed, &mut diag.warnings).await);
        }

        let knowledge = if inv.depth > 0 {
            self.enrich(inv.focus(), &mut diag.warnings).await
        } else {
            Vec::new()
        };
        let memory = self.inner.context.build(key, &targets).await?;
        diag.memory = memory.hits();
        let history = self
            .inner
            .store
            .get_actions(key, inv.depth, cfg.action_history)
            .await?;

        let persisted: HashSet<(ActionKind, String)> = history
            .iter()
            .filter_map(|a| a.payload.query.as_deref().map(|q| (a.payload.kind, normalize(q))))
            .collect();

        let mut prompt = PromptContext {
            knowledge,
            action_history: history.iter().map(ActionView::from).collect(),
            action_results: Vec::new(),
            long_term_memory: memory.long_term_lines(),
            short_term_memory: memory.short_term_lines(),
            query: inv.query.clone(),
            recursed_query: inv.recursed_query.clone(),
            recursed_note: inv.recursed_note.clone(),
        };

        let mut attempted = HashSet::new();
        let mut dispatched: HashMap<ActionKind, usize> = HashMap::new();
        let mut force_final = inv.depth > cfg.max_action_level;
        let mut reply = None;
        let mut reply_note = None;

        for iteration in 0..cfg.max_iters {
            let final_turn = force_final || iteration + 1 == cfg.max_iters;
            diag.iterations = iteration + 1;

            let mut request = CompletionRequest::new(prompt.render(final_turn));
            if !final_turn {
                request = request.with_functions(vec![act_function()]);
            }
            let response = self
                .inner
                .services
                .completion
                .complete(&request, on_partial, Some(inv.known.as_ref()))
                .await?;
            diag.usage.add(response.usage);
            diag.finish_reason = Some(response.finish_reason.clone());

            if final_turn || response.tool_calls.is_empty() {
                if !response.tool_calls.is_empty() {
                    diag.warnings.push("function calls on the final turn were ignored".into());
                }
                reply = Some(response.content);
                break;
            }

            let mut batch = Vec::new();
            for call in &response.tool_calls {
                let action = match parse_action_call(call) {
                    Ok(action) => action,
                    Err(reason) => {
                        debug!(reason = %reason, "dropping malformed call");
                        diag.warnings.push(format!("dropped call: {reason}"));
                        continue;
                    }
                };
                if let Some(reason) = self.rejection(&inv, &action, &mut attempted, &persisted, &mut dispatched) {
                    debug!(kind = %action.kind, reason, "dropping call");
                    diag.warnings.push(format!("dropped {} call: {reason}", action.kind));
                    continue;
                }
                batch.push(action);
            }

            info!(iteration, dispatched = batch.len(), "dispatching actions");
            let outcomes = join_all(batch.iter().map(|action| self.dispatch(key, &inv, action))).await;

            let mut produced = false;
            let mut replied = false;
            for (action, outcome) in batch.iter().zip(outcomes) {
                diag.usage.add(outcome.usage);
                diag.warnings.extend(outcome.warnings);

                let mut record = ActionRecord::from(action);
                if let Some(result) = outcome.result.filter(|r| !r.trim().is_empty()) {
                    produced = true;
                    if action.kind == ActionKind::Reply {
                        replied = true;
                        reply_note = Some(result.clone());
                    }
                    record.index = self.persist_action(key, &inv, action, &result, &mut diag.warnings).await;
                    if let Err(e) = inv.known.register(&result).await {
                        debug!(error = %e, "could not register known completion");
                    }
                    prompt.action_results.insert(
                        0,
                        ActionView {
                            kind: action.kind,
                            query: action.query.clone(),
                            note: action.note.clone(),
                            result: result.clone(),
                        },
                    );
                    record.result = Some(result);
                }
                diag.actions.push(record);
            }

            if !produced || replied {
                force_final = true;
            }
        }

        let mut reply = reply.ok_or_else(|| ReverieError::Configuration("max_iters must be at least 1".into()))?;
        if reply.trim().is_empty() {
            if let Some(note) = reply_note {
                diag.warnings.push("final turn was empty, answering with the reply action's note".into());
                reply = note;
            }
        }

        if inv.depth == 0 {
            if reply.trim().is_empty() {
                warn!("final turn produced no reply, nothing persisted");
                diag.warnings.push("empty reply was not persisted".into());
            } else {
                let stamp = self
                    .finish_top_level(key, &inv, &reply, query_embedding, &mut diag.warnings)
                    .await?;
                diag.element_index = Some(stamp.index);
            }
        }

        info!(
            iterations = diag.iterations,
            actions = diag.actions.len(),
            tokens = diag.usage.total(),
            "query answered"
        );
        Ok(QueryOutcome {
            reply,
            diagnostics: diag,
        })
    }

    /// Why `action` must not be dispatched, if anything
    fn rejection(
        &self,
        inv: &Invocation,
        action: &ActionCall,
        attempted: &mut HashSet<(ActionKind, String, String)>,
        persisted: &HashSet<(ActionKind, String)>,
        dispatched: &mut HashMap<ActionKind, usize>,
    ) -> Option<&'static str> {
        if !attempted.insert(action.signature()) {
            return Some("already attempted in this loop");
        }
        let query = action.query.as_deref().map(normalize);
        if let Some(query) = &query {
            if persisted.contains(&(action.kind, query.clone())) {
                return Some("repeats a persisted action");
            }
            if action.kind == ActionKind::Think && inv.on_stack(query) {
                return Some("repeats a query on the recursion stack");
            }
        }

        let cfg = &self.inner.config.agent;
        let limit = match action.kind {
            ActionKind::Think => cfg.max_think,
            ActionKind::Research => cfg.max_research,
            ActionKind::Reply => cfg.max_reply,
        };
        let used = dispatched.entry(action.kind).or_default();
        if *used >= limit {
            return Some("per-kind limit reached");
        }
        *used += 1;
        None
    }

    async fn dispatch(&self, key: &SessionKey, inv: &Invocation, action: &ActionCall) -> DispatchOutcome {
        let cfg = &self.inner.config.agent;
        match action.kind {
            ActionKind::Think => {
                let child = inv.child(action);
                let child_id = child.correlation_id;
                let timeout_ms = cfg.think_timeout_ms;
                match tokio::time::timeout(Duration::from_millis(timeout_ms), self.run(key, child, None)).await {
                    Ok(Ok(outcome)) => DispatchOutcome {
                        result: Some(outcome.reply),
                        usage: outcome.diagnostics.usage,
                        warnings: outcome.diagnostics.warnings,
                    },
                    Ok(Err(e)) => {
                        warn!(child = %child_id, error = %e, "think sub-call failed");
                        DispatchOutcome::failed(format!("think failed: {e}"))
                    }
                    Err(_) => {
                        warn!(child = %child_id, timeout_ms, "think sub-call timed out");
                        let e = ReverieError::Timeout {
                            operation: "think",
                            after_ms: timeout_ms,
                        };
                        DispatchOutcome::failed(e.to_string())
                    }
                }
            }
            ActionKind::Research => {
                let query = action.query.as_deref().unwrap_or_default();
                let timeout_ms = cfg.research_timeout_ms;
                let research = self.inner.services.researcher.research(query, action.note.as_deref());
                match tokio::time::timeout(Duration::from_millis(timeout_ms), research).await {
                    Ok(Ok(result)) => DispatchOutcome {
                        result: Some(result),
                        ..Default::default()
                    },
                    Ok(Err(e)) => {
                        warn!(error = %e, "research failed");
                        DispatchOutcome::failed(format!("research failed: {e}"))
                    }
                    Err(_) => {
                        warn!(timeout_ms, "research timed out");
                        let e = ReverieError::Timeout {
                            operation: "research",
                            after_ms: timeout_ms,
                        };
                        DispatchOutcome::failed(e.to_string())
                    }
                }
            }
            ActionKind::Reply => DispatchOutcome {
                result: action.note.clone(),
                ..Default::default()
            },
        }
    }

    async fn persist_action(
        &self,
        key: &SessionKey,
        inv: &Invocation,
        action: &ActionCall,
        result: &str,
        warnings: &mut Vec<String>,
    ) -> Option<i64> {
        let payload = ActionPayload {
            kind: action.kind,
            query: action.query.clone(),
            note: action.note.clone(),
            result: result.to_string(),
        };
        let mut extra = Extra::new();
        extra.insert("correlation_id".into(), json!(inv.correlation_id));

        match self.inner.store.append_action(key, inv.depth, &payload, &extra).await {
            Ok(stamp) => Some(stamp.index),
            Err(e) => {
                warn!(error = %e, "could not persist action");
                warnings.push(format!("action not persisted: {e}"));
                None
            }
        }
    }

    /// Knowledge lookups and search snippets; failures degrade to nothing
    async fn enrich(&self, focus: &str, warnings: &mut Vec<String>) -> Vec<String> {
        let (knowledge, snippets) = tokio::join!(
            self.inner.services.knowledge.lookup(focus),
            self.inner.services.researcher.snippets(focus),
        );

        let mut out = Vec::new();
        for (source, result) in [("knowledge", knowledge), ("search", snippets)] {
            match result {
                Ok(items) => out.extend(items),
                Err(e) => {
                    warn!(source, error = %e, "enrichment failed");
                    warnings.push(format!("{source} unavailable: {e}"));
                }
            }
        }
        out
    }

    async fn finish_top_level(
        &self,
        key: &SessionKey,
        inv: &Invocation,
        reply: &str,
        query_embedding: Option<Embedding>,
        warnings: &mut Vec<String>,
    ) -> Result<Stamp> {
        let reply_embedding = self.embed_or_warn(reply, warnings).await;
        let payload = ElementPayload::exchange(&inv.query, reply).with_embeddings(query_embedding, reply_embedding);
        let mut extra = Extra::new();
        extra.insert("correlation_id".into(), json!(inv.correlation_id));

        let stamp = self.inner.store.append_element(key, &payload, &extra, false).await?;

        if let Err(e) = self.inner.imagination.schedule(key).await {
            warn!(error = %e, "could not schedule imagination");
            warnings.push(format!("imagination not scheduled: {e}"));
        }

        let engine = self.inner.consolidation.clone();
        let session = key.clone();
        self.inner
            .tasks
            .submit("consolidation", key.doc_id(), async move {
                engine.run(&session).await.map(|_| ())
            })
            .await;

        let agent = self.clone();
        let session = key.clone();
        let trigger = stamp.index;
        self.inner
            .tasks
            .submit_after(
                "introspection",
                key.doc_id(),
                Duration::from_millis(self.inner.config.agent.introspection_delay_ms),
                async move { agent.introspect(&session, trigger).await.map(|_| ()) },
            )
            .await;

        Ok(stamp)
    }

    /// Reflect on the recent exchanges, unless newer elements arrived after `trigger_index`
    pub async fn introspect(&self, key: &SessionKey, trigger_index: i64) -> Result<Option<Stamp>> {
        let latest = self
            .inner
            .store
            .get_latest(key, self.inner.config.agent.introspection_window)
            .await?;
        if latest.latest_index != Some(trigger_index) {
            debug!(doc_id = %key, trigger_index, latest = ?latest.latest_index, "newer elements exist, skipping introspection");
            return Ok(None);
        }

        let exchanges: Vec<String> = latest.elements.iter().map(|e| e.render()).collect();
        let input = format!(
            "Read the latest exchanges with the user and write a brief private reflection: what the user \
             seems to want, what was left unresolved, and what to keep in mind next time.\n\n{}",
            exchanges.join("\n\n")
        );
        let response = self
            .inner
            .services
            .completion
            .complete(&CompletionRequest::new(input), None, None)
            .await?;
        let reflection = response.content.trim().to_string();
        if reflection.is_empty() {
            return Ok(None);
        }

        let mut warnings = Vec::new();
        let embedding = self.embed_or_warn(&reflection, &mut warnings).await;
        let payload = ElementPayload {
            query: String::new(),
            reply: reflection,
            query_embedding: None,
            reply_embedding: embedding,
        };
        let mut extra = Extra::new();
        extra.insert("introspection_of".into(), json!(trigger_index));

        let stamp = self.inner.store.append_element(key, &payload, &extra, true).await?;
        info!(doc_id = %key, index = stamp.index, "introspection appended");
        Ok(Some(stamp))
    }

    async fn check_tokens(&self, field: &'static str, text: &str, limit: usize) -> Result<()> {
        let tokens = self.inner.services.tokenizer.count_tokens(text).await?;
        if tokens > limit {
            return Err(ReverieError::TokenLimit { field, tokens, limit });
        }
        Ok(())
    }

    async fn embed_or_warn(&self, text: &str, warnings: &mut Vec<String>) -> Option<Embedding> {
        match self.inner.services.embedder.embed_one(text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(error = %e, "embedding failed");
                warnings.push(format!("embedding unavailable: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::scripted::{act, content, ScriptedCompletion};
    use crate::types::{Pinpoint, Pinpointed};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoResearch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Researcher for EchoResearch {
        async fn research(&self, query: &str, _note: Option<&str>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("found: {query}"))
        }

        async fn snippets(&self, _query: &str) -> Result<Vec<String>> {
            Err(ReverieError::Validation("search offline".into()))
        }
    }

    async fn agent_with(completion: Arc<ScriptedCompletion>, researcher: Arc<dyn Researcher>) -> Agent {
        let config = ReverieConfig::default();
        let store = MemoryStore::connect_in_memory(config.memory.clone()).await.unwrap();
        let services = Services {
            completion,
            embedder: Arc::new(HashEmbeddingProvider::new(64)),
            tokenizer: Arc::new(HeuristicTokenizer::new()),
            researcher,
            knowledge: Arc::new(NoResearch),
        };
        Agent::new(store, services, config)
    }

    fn session() -> SessionKey {
        SessionKey::new("user", "s1")
    }

    #[tokio::test]
    async fn empty_session_gets_a_direct_reply() {
        let completion = Arc::new(ScriptedCompletion::reply("Hi there!"));
        let agent = agent_with(completion.clone(), Arc::new(NoResearch)).await;
        let key = session();

        let outcome = agent.query(&key, "hello").await.unwrap();

        assert_eq!(outcome.reply, "Hi there!");
        assert_eq!(outcome.diagnostics.iterations, 1);
        assert!(outcome.diagnostics.actions.is_empty());
        assert_eq!(outcome.diagnostics.element_index, Some(0));

        let latest = agent.store().get_latest(&key, 10).await.unwrap();
        assert_eq!(latest.latest_index, Some(0));
        assert_eq!(latest.elements.len(), 1);
        assert_eq!(latest.elements[0].payload.query, "hello");
        assert!(latest.elements[0].payload.reply_embedding.is_some());
        assert!(agent.store().scheduled_imagination(&key).await.unwrap().is_some());
        assert_eq!(completion.requests()[0].functions.len(), 1);
    }

    #[tokio::test]
    async fn think_recurses_and_folds_the_result_back() {
        let completion = Arc::new(ScriptedCompletion::new(|request| {
            if request.input.contains("\"recursed_query\"") {
                Ok(content("4"))
            } else if request.input.contains("\"action_results\"") {
                Ok(content("The answer is 4"))
            } else {
                Ok(act(&[json!({"kind": "think", "query": "what is 2+2"})]))
            }
        }));
        let agent = agent_with(completion.clone(), Arc::new(NoResearch)).await;
        let key = session();

        let outcome = agent.query(&key, "add two and two").await.unwrap();

        assert_eq!(outcome.reply, "The answer is 4");
        let diag = &outcome.diagnostics;
        assert_eq!(diag.actions.len(), 1);
        assert_eq!(diag.actions[0].result.as_deref(), Some("4"));
        assert_eq!(diag.actions[0].index, Some(0));
        assert_eq!(diag.usage.prompt_tokens, 30);

        let actions = agent.store().get_actions(&key, 0, 10).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].payload.kind, ActionKind::Think);
        assert_eq!(actions[0].payload.result, "4");

        let requests = completion.requests();
        let child = requests
            .iter()
            .find(|r| r.input.contains("\"recursed_query\""))
            .unwrap();
        assert!(child.input.contains("what is 2+2"));
    }

    #[tokio::test]
    async fn duplicate_invalid_and_excess_calls_are_filtered() {
        let completion = Arc::new(ScriptedCompletion::new(|request| {
            if request.input.contains("\"action_results\"") {
                Ok(content("done"))
            } else {
                Ok(act(&[
                    json!({"kind": "research", "query": "tides"}),
                    json!({"kind": "research", "query": "Tides "}),
                    json!({"kind": "research", "query": "moon"}),
                    json!({"kind": "research", "query": "sun"}),
                    json!({"kind": "reply"}),
                ]))
            }
        }));
        let researcher = Arc::new(EchoResearch {
            calls: AtomicUsize::new(0),
        });
        let agent = agent_with(completion, researcher.clone()).await;

        let outcome = agent.query(&session(), "why are there tides").await.unwrap();

        assert_eq!(outcome.reply, "done");
        assert_eq!(researcher.calls.load(Ordering::SeqCst), 2);
        let results: Vec<_> = outcome
            .diagnostics
            .actions
            .iter()
            .map(|a| a.result.clone().unwrap_or_default())
            .collect();
        assert_eq!(results, vec!["found: tides", "found: moon"]);
        assert_eq!(outcome.diagnostics.warnings.len(), 3);
    }

    #[tokio::test]
    async fn reply_action_forces_a_plain_final_turn() {
        let note = "Hello world, it is good to see you.";
        let completion = Arc::new(
            ScriptedCompletion::new(move |request| {
                if request.functions.is_empty() {
                    Ok(content("Hello world, it is nice to meet you."))
                } else {
                    Ok(act(&[json!({"kind": "reply", "note": note})]))
                }
            })
            .streaming(),
        );
        let agent = agent_with(completion.clone(), Arc::new(NoResearch)).await;

        let outcome = agent.query(&session(), "greet me").await.unwrap();

        assert_eq!(outcome.reply, note);
        assert_eq!(outcome.diagnostics.finish_reason, Some(FinishReason::ShortCircuit));
        let requests = completion.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].functions.is_empty());
        assert!(requests[1].functions.is_empty());
    }

    #[tokio::test]
    async fn known_completions_stay_within_one_query() {
        let alice_note = "Your account details are: alice@example.com, password hunter2.";
        let completion = Arc::new(
            ScriptedCompletion::new(move |request| {
                if request.input.contains("show me my account") {
                    Ok(content("Your account details are: not available, please log in."))
                } else if request.functions.is_empty() {
                    Ok(content("Your account details are: listed above."))
                } else {
                    Ok(act(&[json!({"kind": "reply", "note": alice_note})]))
                }
            })
            .streaming(),
        );
        let agent = agent_with(completion, Arc::new(NoResearch)).await;

        let alice = agent
            .query(&SessionKey::new("alice", "s1"), "what are my account details")
            .await
            .unwrap();
        assert_eq!(alice.reply, alice_note);
        assert_eq!(alice.diagnostics.finish_reason, Some(FinishReason::ShortCircuit));

        let bob = agent
            .query(&SessionKey::new("bob", "s1"), "show me my account details")
            .await
            .unwrap();
        assert_eq!(bob.reply, "Your account details are: not available, please log in.");
        assert_eq!(bob.diagnostics.finish_reason, Some(FinishReason::Stop));
        assert!(!bob.reply.contains("hunter2"));
    }

    #[tokio::test]
    async fn empty_final_turn_falls_back_to_the_reply_note() {
        let note = "Sure, the meeting moved to Thursday.";
        let completion = Arc::new(ScriptedCompletion::new(move |request| {
            if request.functions.is_empty() {
                Ok(act(&[json!({"kind": "think", "query": "anything else"})]))
            } else {
                Ok(act(&[json!({"kind": "reply", "note": note})]))
            }
        }));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;
        let key = session();

        let outcome = agent.query(&key, "when is the meeting").await.unwrap();

        assert_eq!(outcome.reply, note);
        let warnings = &outcome.diagnostics.warnings;
        assert!(warnings.iter().any(|w| w == "function calls on the final turn were ignored"));
        assert!(warnings.iter().any(|w| w.starts_with("final turn was empty")));
        let latest = agent.store().get_latest(&key, 5).await.unwrap();
        assert_eq!(latest.elements.len(), 1);
        assert_eq!(latest.elements[0].payload.reply, note);
    }

    #[tokio::test]
    async fn empty_reply_is_not_persisted() {
        let completion = Arc::new(ScriptedCompletion::reply(""));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;
        let key = session();

        let outcome = agent.query(&key, "hello?").await.unwrap();

        assert_eq!(outcome.reply, "");
        assert_eq!(outcome.diagnostics.element_index, None);
        assert!(outcome
            .diagnostics
            .warnings
            .iter()
            .any(|w| w == "empty reply was not persisted"));
        assert_eq!(agent.store().latest_element_index(&key).await.unwrap(), None);
        assert_eq!(agent.store().scheduled_imagination(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn diagnostics_list_the_memory_shown() {
        let completion = Arc::new(ScriptedCompletion::reply("noted"));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;
        let key = session();

        let first = agent.query(&key, "my cat is called Miso").await.unwrap();
        assert!(first.diagnostics.memory.is_empty());

        let second = agent.query(&key, "what is my cat called").await.unwrap();
        let hits = &second.diagnostics.memory;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stream, "element");
        assert_eq!(hits[0].index, 0);
        assert!(hits[0].score.is_finite());
    }

    #[tokio::test]
    async fn persisted_actions_are_not_repeated() {
        let completion = Arc::new(ScriptedCompletion::new(|request| {
            if request.functions.is_empty() {
                Ok(content("final"))
            } else {
                Ok(act(&[json!({"kind": "think", "query": "Why?"})]))
            }
        }));
        let agent = agent_with(completion.clone(), Arc::new(NoResearch)).await;
        let key = session();
        let earlier = ActionPayload {
            kind: ActionKind::Think,
            query: Some("why?".into()),
            note: None,
            result: "because".into(),
        };
        agent.store().append_action(&key, 0, &earlier, &Extra::new()).await.unwrap();

        let outcome = agent.query(&key, "tell me").await.unwrap();

        assert_eq!(outcome.reply, "final");
        assert!(outcome.diagnostics.actions.is_empty());
        assert_eq!(completion.requests().len(), 2);
        assert_eq!(agent.store().get_actions(&key, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_think_degrades_to_no_result() {
        let completion = Arc::new(ScriptedCompletion::new(|request| {
            if request.input.contains("\"recursed_query\"") {
                Err(ReverieError::Upstream {
                    service: "completion",
                    status: 500,
                    message: "boom".into(),
                })
            } else if request.functions.is_empty() {
                Ok(content("best effort"))
            } else {
                Ok(act(&[json!({"kind": "think", "query": "deeper"})]))
            }
        }));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;

        let outcome = agent.query(&session(), "question").await.unwrap();

        assert_eq!(outcome.reply, "best effort");
        assert_eq!(outcome.diagnostics.actions.len(), 1);
        assert!(outcome.diagnostics.actions[0].result.is_none());
        assert!(outcome.diagnostics.warnings.iter().any(|w| w.starts_with("think failed")));
    }

    #[tokio::test]
    async fn oversized_query_fails_before_any_model_call() {
        let completion = Arc::new(ScriptedCompletion::reply("never"));
        let agent = agent_with(completion.clone(), Arc::new(NoResearch)).await;

        let long_query = "word ".repeat(1_500);
        let err = agent.query(&session(), &long_query).await.unwrap_err();

        assert!(matches!(err, ReverieError::TokenLimit { field: "query", .. }));
        assert!(completion.requests().is_empty());
        assert_eq!(agent.store().latest_element_index(&session()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn introspection_skips_when_stale() {
        let completion = Arc::new(ScriptedCompletion::reply("The user likes short answers."));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;
        let key = session();
        agent.query(&key, "hello").await.unwrap();

        let stamp = agent.introspect(&key, 0).await.unwrap().unwrap();
        assert_eq!(stamp.index, 1);
        assert!(agent.introspect(&key, 0).await.unwrap().is_none());

        let latest = agent.store().get_latest(&key, 5).await.unwrap();
        assert!(latest.elements[1].is_internal);
        let history = agent.store().get_history(&key, 0, 5).await.unwrap();
        assert_eq!(history.len(), 1);
        let newest = agent
            .store()
            .get_pinpoint(&key, Pinpoint::Element { offset: 0 })
            .await
            .unwrap();
        assert!(matches!(newest, Some(Pinpointed::Element(e)) if e.index == 0));
    }

    #[tokio::test]
    async fn streaming_reports_partials() {
        let completion = Arc::new(ScriptedCompletion::reply("streamed"));
        let agent = agent_with(completion, Arc::new(NoResearch)).await;
        let seen = std::sync::Mutex::new(Vec::new());
        let record = |partial: &str| seen.lock().unwrap().push(partial.to_string());

        agent.query_streaming(&session(), "hi", &record).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["streamed".to_string()]);
    }
}
