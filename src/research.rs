//! Auxiliary knowledge lookup and web research
//!
//! Everything here is advisory: callers degrade to empty context when a
//! lookup fails after its retries.

use crate::completion::{http_client, CompletionRequest, CompletionService};
use crate::config::{CompletionConfig, ResearchConfig};
use crate::error::{ReverieError, Result};

use async_trait::async_trait;
use futures::future::join_all;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Researcher: Send + Sync {
    /// Answer `query` from outside sources
    async fn research(&self, query: &str, note: Option<&str>) -> Result<String>;

    /// Short search snippets for prompt enrichment
    async fn snippets(&self, query: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Vec<String>>;
}

/// Researcher for deployments without a search backend
#[derive(Debug, Clone, Default)]
pub struct NoResearch;

#[async_trait]
impl Researcher for NoResearch {
    async fn research(&self, _query: &str, _note: Option<&str>) -> Result<String> {
        Ok(String::new())
    }

    async fn snippets(&self, _query: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl KnowledgeSource for NoResearch {
    async fn lookup(&self, _query: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Run `op` up to `attempts` times with a short linear pause between tries
pub async fn with_retries<T, F, Fut>(service: &'static str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(service, attempt, error = %e, "auxiliary call failed");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| ReverieError::Validation(format!("{service}: no attempts made"))))
}

/// One organic search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<SearchHit>,
}

/// Readable text of an HTML page: paragraphs and headings, falling back to all body text
pub fn extract_page_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<String> = Vec::new();

    if let Ok(selector) = Selector::parse("h1, h2, h3, p, li, blockquote, pre") {
        for element in document.select(&selector) {
            let text = collapse_whitespace(&element.text().collect::<String>());
            if text.len() > 20 {
                parts.push(text);
            }
        }
    }
    parts.dedup();

    if parts.is_empty() {
        if let Ok(body) = Selector::parse("body") {
            if let Some(element) = document.select(&body).next() {
                parts.push(collapse_whitespace(&element.text().collect::<String>()));
            }
        }
    }

    parts.join("\n").chars().take(max_chars).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Search API + page scraping + a completion call that answers from the pages
pub struct WebResearcher {
    http: reqwest::Client,
    api_key: String,
    config: ResearchConfig,
    completion: Arc<dyn CompletionService>,
}

impl WebResearcher {
    pub fn new(
        config: ResearchConfig,
        completion_config: &CompletionConfig,
        api_key: impl Into<String>,
        completion: Arc<dyn CompletionService>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(completion_config.connect_timeout_ms))
            .user_agent("Mozilla/5.0 (compatible; reverie/0.1)")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            config,
            completion,
        })
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        with_retries("search", self.config.attempts, || async {
            let response = self
                .http
                .post(&self.config.search_url)
                .header("X-API-KEY", &self.api_key)
                .json(&json!({ "q": query }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ReverieError::Upstream {
                    service: "search",
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default().chars().take(200).collect(),
                });
            }
            let parsed: SearchResponse = response.json().await?;
            Ok(parsed.organic)
        })
        .await
    }

    pub async fn scrape(&self, url: &str) -> Result<String> {
        let html = with_retries("scrape", self.config.attempts, || async {
            let response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ReverieError::Upstream {
                    service: "scrape",
                    status: status.as_u16(),
                    message: url.to_string(),
                });
            }
            Ok(response.text().await?)
        })
        .await?;
        Ok(extract_page_text(&html, self.config.max_page_chars))
    }
}

#[async_trait]
impl Researcher for WebResearcher {
    async fn research(&self, query: &str, note: Option<&str>) -> Result<String> {
        let hits = match self.search(query).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "search failed, researching without sources");
                Vec::new()
            }
        };

        let top: Vec<&SearchHit> = hits.iter().take(self.config.max_pages).collect();
        let pages = join_all(top.iter().map(|hit| self.scrape(&hit.link))).await;

        let mut sources = Vec::new();
        for (hit, page) in top.iter().zip(pages) {
            let text = match page {
                Ok(text) => text,
                Err(e) => {
                    debug!(link = %hit.link, error = %e, "scrape failed, keeping snippet");
                    String::new()
                }
            };
            sources.push(json!({
                "title": hit.title,
                "link": hit.link,
                "snippet": hit.snippet,
                "text": text,
            }));
        }

        if sources.is_empty() {
            info!(query, "no sources found");
            return Ok(String::new());
        }

        let input = format!(
            "Answer the research question using only the sources below. Cite links inline. \
             Say so when the sources do not answer it.\n\nQuestion: {query}\n{}\nSources:\n{}",
            note.map(|n| format!("Context: {n}\n")).unwrap_or_default(),
            serde_json::to_string_pretty(&Value::Array(sources))?,
        );
        let response = self
            .completion
            .complete(&CompletionRequest::new(input), None, None)
            .await?;
        Ok(response.content)
    }

    async fn snippets(&self, query: &str) -> Result<Vec<String>> {
        Ok(self
            .search(query)
            .await?
            .into_iter()
            .take(self.config.max_snippets)
            .map(|hit| format!("{}: {} ({})", hit.title, hit.snippet, hit.link))
            .collect())
    }
}

/// Structured knowledge lookup against a Knowledge-Graph-style search API
pub struct HttpKnowledgeSource {
    http: reqwest::Client,
    url: String,
    api_key: String,
    attempts: u32,
    limit: usize,
}

impl HttpKnowledgeSource {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, config: &ResearchConfig, completion_config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            http: http_client(completion_config)?,
            url: url.into(),
            api_key: api_key.into(),
            attempts: config.attempts,
            limit: config.max_snippets,
        })
    }
}

/// `itemListElement[].result` entries as "name (type): description"
pub fn parse_knowledge(body: &Value, limit: usize) -> Vec<String> {
    body["itemListElement"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let result = &item["result"];
                    let name = result["name"].as_str()?;
                    let description = result["detailedDescription"]["articleBody"]
                        .as_str()
                        .or_else(|| result["description"].as_str())
                        .unwrap_or_default();
                    Some(match result["description"].as_str() {
                        Some(kind) if !description.is_empty() && kind != description => {
                            format!("{name} ({kind}): {description}")
                        }
                        _ => format!("{name}: {description}"),
                    })
                })
                .take(limit)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl KnowledgeSource for HttpKnowledgeSource {
    async fn lookup(&self, query: &str) -> Result<Vec<String>> {
        let limit = self.limit.to_string();
        let body: Value = with_retries("knowledge", self.attempts, || async {
            let response = self
                .http
                .get(&self.url)
                .query(&[("query", query), ("key", self.api_key.as_str()), ("limit", limit.as_str())])
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ReverieError::Upstream {
                    service: "knowledge",
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default().chars().take(200).collect(),
                });
            }
            Ok(response.json::<Value>().await?)
        })
        .await?;

        Ok(parse_knowledge(&body, self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn page_text_keeps_paragraphs_and_drops_markup() {
        let html = r#"
            <html><head><script>var x = 1;</script></head>
            <body>
              <nav>Home</nav>
              <h1>Borrowing in depth and in detail</h1>
              <p>References   let you use a value without taking ownership of it.</p>
              <p>short</p>
            </body></html>"#;
        let text = extract_page_text(html, 10_000);
        assert_eq!(
            text,
            "Borrowing in depth and in detail\nReferences let you use a value without taking ownership of it."
        );
        assert_eq!(extract_page_text(html, 9), "Borrowing");
    }

    #[test]
    fn knowledge_results_are_flattened() {
        let body = json!({
            "itemListElement": [
                {"result": {"name": "Rust", "description": "Programming language",
                            "detailedDescription": {"articleBody": "Rust is a systems language."}}},
                {"result": {"name": "Ferris", "description": "Mascot"}},
                {"result": {}}
            ]
        });
        assert_eq!(
            parse_knowledge(&body, 5),
            vec![
                "Rust (Programming language): Rust is a systems language.".to_string(),
                "Ferris: Mascot".to_string(),
            ]
        );
        assert!(parse_knowledge(&json!({}), 5).is_empty());
    }

    #[tokio::test]
    async fn retries_stop_at_first_success() {
        let calls = AtomicU32::new(0);
        let value = with_retries("test", 3, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ReverieError::Validation("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_surface_the_last_error() {
        let result: Result<()> = with_retries("test", 2, || async {
            Err(ReverieError::Validation("down".into()))
        })
        .await;
        assert!(matches!(result, Err(ReverieError::Validation(_))));
    }

    #[tokio::test]
    async fn no_research_is_empty() {
        assert!(NoResearch.research("q", None).await.unwrap().is_empty());
        assert!(KnowledgeSource::lookup(&NoResearch, "q").await.unwrap().is_empty());
    }
}
