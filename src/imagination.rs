//! Randomized scheduling and synthesis of unsolicited reflections

use crate::completion::{CompletionRequest, CompletionService};
use crate::config::ImaginationConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::scoring::{imagination_weight, log_uniform_delay, similarity};
use crate::store::{ImagineReport, MemoryStore};
use crate::types::{Consolidation, ConsolidationBody, Extra, SessionKey};

use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Keep a pending due time; otherwise draw one log-uniformly in `[min, max]` from `now`
pub fn next_due<R: Rng>(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ImaginationConfig,
    rng: &mut R,
) -> Option<DateTime<Utc>> {
    if current.is_some() {
        return current;
    }
    let secs = log_uniform_delay(config.min_delay_secs, config.max_delay_secs, rng.gen::<f64>());
    Some(now + Duration::seconds(secs))
}

/// Pick a reference item uniformly, then `partners` others weighted by
/// `exp(r * ln(similarity))` with a fresh `r` per draw. Returns scan positions.
pub fn select_partners<R: Rng>(scan: &[Consolidation], partners: usize, rng: &mut R) -> Option<(usize, Vec<usize>)> {
    if scan.len() < 2 {
        return None;
    }
    let reference = rng.gen_range(0..scan.len());
    let reference_embedding = scan[reference].consolidation.embedding().unwrap_or_default();

    let mut candidates: Vec<usize> = (0..scan.len()).filter(|i| *i != reference).collect();
    let mut chosen = Vec::new();

    while chosen.len() < partners && !candidates.is_empty() {
        let r: f32 = rng.gen();
        let weights: Vec<f32> = candidates
            .iter()
            .map(|i| {
                let embedding = scan[*i].consolidation.embedding().unwrap_or_default();
                imagination_weight(similarity(reference_embedding, embedding), r)
            })
            .collect();

        let pick = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..candidates.len()),
        };
        chosen.push(candidates.remove(pick));
    }

    Some((reference, chosen))
}

/// Schedules and runs imaginations
#[derive(Clone)]
pub struct ImaginationScheduler {
    store: Arc<MemoryStore>,
    completion: Arc<dyn CompletionService>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ImaginationConfig,
}

impl ImaginationScheduler {
    pub fn new(
        store: Arc<MemoryStore>,
        completion: Arc<dyn CompletionService>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ImaginationConfig,
    ) -> Self {
        Self {
            store,
            completion,
            embedder,
            config,
        }
    }

    /// Set the session's due time unless one is pending
    pub async fn schedule(&self, key: &SessionKey) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let config = &self.config;
        self.store
            .schedule_imagination(key, |current| next_due(current, now, config, &mut rand::thread_rng()))
            .await
    }

    /// Imagine for every session due at `ref_time`
    pub async fn run_due(&self, ref_time: DateTime<Utc>) -> Result<ImagineReport> {
        let report = self
            .store
            .imagine(ref_time, |key| async move { self.imagine_session(&key).await })
            .await?;
        if report.due > 0 {
            info!(
                due = report.due,
                processed = report.processed,
                skipped = report.skipped,
                failed = report.failed,
                "imagination sweep finished"
            );
        }
        Ok(report)
    }

    /// Synthesize one imagination from the session's long-term memory
    pub async fn imagine_session(&self, key: &SessionKey) -> Result<()> {
        let scan = self.store.long_term_scan(key).await?;
        let selection = {
            let mut rng = rand::thread_rng();
            select_partners(&scan, self.config.partners, &mut rng)
        };
        let Some((reference, partners)) = selection else {
            debug!(doc_id = %key, items = scan.len(), "not enough long-term memory to imagine from");
            return Ok(());
        };

        let render = |i: usize| format!("- ({}) {}", scan[i].stream, scan[i].consolidation.text());
        let mut input = String::from(
            "You are reflecting, unprompted, on memories of past conversations with a user. \
             Connect the first memory with the others: look for a pattern, an unresolved thread, \
             or something worth bringing up next time. Write a short first-person reflection.\n\n",
        );
        input.push_str(&render(reference));
        for partner in &partners {
            input.push('\n');
            input.push_str(&render(*partner));
        }

        let response = self
            .completion
            .complete(&CompletionRequest::new(input), None, None)
            .await?;
        let imagination = response.content.trim().to_string();
        if imagination.is_empty() {
            debug!(doc_id = %key, "empty imagination, nothing appended");
            return Ok(());
        }

        let embedding = self.embedder.embed_one(&imagination).await.ok();
        let mut extra = Extra::new();
        let source = |i: usize| json!({"stream": scan[i].stream, "index": scan[i].index});
        extra.insert("reference".into(), source(reference));
        extra.insert(
            "partners".into(),
            json!(partners.iter().map(|i| source(*i)).collect::<Vec<_>>()),
        );

        let stamp = self
            .store
            .append_imagination(key, &ConsolidationBody::imagination(imagination, embedding), &extra)
            .await?;
        info!(doc_id = %key, index = stamp.index, "imagination appended");
        Ok(())
    }
}
