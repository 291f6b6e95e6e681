//! Multi-level summarization on top of `MemoryStore::consolidate`

use crate::completion::{CompletionRequest, CompletionService};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::store::{ConsolidationOutput, ConsolidationRequest, MemoryStore};
use crate::types::{ConsolidationBody, ConsolidationStamp, Extra, SessionKey, WindowItem};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns one consolidation window into a summary node
pub struct Summarizer {
    completion: Arc<dyn CompletionService>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Summarizer {
    pub fn new(completion: Arc<dyn CompletionService>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            completion,
            embedder,
        }
    }

    fn prompt(request: &ConsolidationRequest) -> String {
        let what = if request.lvl == 0 {
            "conversation exchanges"
        } else {
            "summaries of earlier conversation"
        };
        let items: Vec<String> = request
            .window
            .iter()
            .map(|item| format!("- {}", item.render().replace('\n', " ")))
            .collect();

        let mut input = format!(
            "Summarize the following {what} into one dense paragraph. Keep names, facts, \
             preferences and open questions; drop pleasantries.\n\n"
        );
        if let Some(previous) = request.pass_on.as_ref().and_then(Value::as_str) {
            input.push_str(&format!(
                "The summary just before this window, for continuity (do not repeat it):\n{previous}\n\n"
            ));
        }
        input.push_str(&items.join("\n"));
        input
    }

    pub async fn summarize(&self, request: ConsolidationRequest) -> Result<ConsolidationOutput> {
        let response = self
            .completion
            .complete(&CompletionRequest::new(Self::prompt(&request)), None, None)
            .await?;
        let summary = response.content.trim().to_string();

        let embedding = match self.embedder.embed_one(&summary).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(lvl = request.lvl, index = request.index, error = %e, "summary embedding failed");
                None
            }
        };

        let mut extra = Extra::new();
        extra.insert("first".into(), json!(request.window.first().map(WindowItem::index)));
        extra.insert("last".into(), json!(request.window.last().map(WindowItem::index)));
        extra.insert(
            "window_end".into(),
            json!(request.window.last().map(|item| item.timestamp())),
        );
        extra.insert("usage".into(), json!(response.usage));

        debug!(lvl = request.lvl, index = request.index, chars = summary.len(), "window summarized");

        Ok(ConsolidationOutput {
            pass_on: Some(Value::String(summary.clone())),
            consolidation: ConsolidationBody::summary(summary, embedding),
            extra,
        })
    }
}

/// Drives consolidation for a session
#[derive(Clone)]
pub struct ConsolidationEngine {
    store: Arc<MemoryStore>,
    summarizer: Arc<Summarizer>,
}

impl ConsolidationEngine {
    pub fn new(store: Arc<MemoryStore>, summarizer: Arc<Summarizer>) -> Self {
        Self { store, summarizer }
    }

    /// Append every consolidation that has become computable
    pub async fn run(&self, key: &SessionKey) -> Result<Vec<ConsolidationStamp>> {
        let summarizer = &self.summarizer;
        let written = self
            .store
            .consolidate(key, |request| summarizer.summarize(request))
            .await?;
        if !written.is_empty() {
            info!(doc_id = %key, count = written.len(), "consolidations appended");
        }
        Ok(written)
    }
}
