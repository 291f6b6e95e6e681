//! Streaming chat-completion client
//!
//! One system message in, an SSE stream of deltas out. Content and tool-call
//! fragments are accumulated as they arrive; a registered known completion
//! can end the stream early, and a wall-clock cutover bounds every call.

use crate::cache::{CacheConfig, CacheKey, TtlCache};
use crate::config::CompletionConfig;
use crate::error::{ReverieError, Result};
use crate::tokenizer::Tokenizer;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Callback receiving the running content total
pub type PartialFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Sent as the only (system-role) message
    pub input: String,
    pub functions: Vec<FunctionDef>,
    pub json_mode: bool,
    pub logprobs: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_functions(mut self, functions: Vec<FunctionDef>) -> Self {
        self.functions = functions;
        self
    }

    pub fn json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// A known completion was substituted
    ShortCircuit,
    /// The wall-clock cutover fired
    Cutover,
    /// The stream ended without a finish event
    Incomplete,
    Other(String),
}

impl FinishReason {
    fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    /// Raw JSON argument text as streamed
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_partial: Option<PartialFn<'_>>,
        known: Option<&KnownCompletions>,
    ) -> Result<CompletionResponse>;
}

// ─── Known completions ────────────────────────────────────────────────────

/// Previously generated completions keyed by their first `prefix_tokens` tokens
pub struct KnownCompletions {
    cache: TtlCache,
    tokenizer: Arc<dyn Tokenizer>,
    prefix_tokens: usize,
}

impl KnownCompletions {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, config: &CompletionConfig) -> Self {
        let cache = TtlCache::new(CacheConfig {
            max_entries: config.known_completions,
            default_ttl: chrono::Duration::seconds(config.known_completion_ttl_secs),
        });
        Self {
            cache,
            tokenizer,
            prefix_tokens: config.short_circuit_tokens,
        }
    }

    pub fn prefix_tokens(&self) -> usize {
        self.prefix_tokens
    }

    /// Register a completion; returns false when it is too short to key
    pub async fn register(&self, completion: &str) -> Result<bool> {
        if self.prefix_tokens == 0 || self.tokenizer.count_tokens(completion).await? < self.prefix_tokens {
            return Ok(false);
        }
        let prefix = self.tokenizer.prefix(completion, self.prefix_tokens).await?;
        self.cache
            .put(CacheKey::completion(&prefix), &completion.to_string())
            .await?;
        Ok(true)
    }

    /// Known completion that `partial` is still a prefix of
    pub async fn lookup(&self, partial: &str) -> Result<Option<String>> {
        if self.prefix_tokens == 0 || self.tokenizer.count_tokens(partial).await? < self.prefix_tokens {
            return Ok(None);
        }
        let prefix = self.tokenizer.prefix(partial, self.prefix_tokens).await?;
        Ok(self
            .cache
            .get::<String>(&CacheKey::completion(&prefix))
            .await
            .filter(|known| known.starts_with(partial)))
    }
}

// ─── SSE decoding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` events, buffering partial lines across reads
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl StreamDelta {
    pub fn parse(data: &str) -> Result<Option<Self>> {
        let v: Value = serde_json::from_str(data)?;
        let Some(choice) = v["choices"].get(0) else {
            return Ok(None);
        };
        let delta = &choice["delta"];

        let tool_calls = delta["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| ToolCallDelta {
                        index: tc["index"].as_u64().unwrap_or(0) as usize,
                        id: tc["id"].as_str().map(str::to_string),
                        name: tc["function"]["name"].as_str().map(str::to_string),
                        arguments: tc["function"]["arguments"].as_str().map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(StreamDelta {
            content: delta["content"].as_str().map(str::to_string),
            tool_calls,
            finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        }))
    }
}

// ─── Accumulation ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Running state of one streamed generation
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, ToolCallBuilder>,
    finish_reason: Option<FinishReason>,
    short_circuit_open: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            short_circuit_open: true,
            ..Default::default()
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn finish(&mut self, reason: FinishReason) {
        if self.finish_reason.is_none() {
            self.finish_reason = Some(reason);
        }
    }

    /// Fold one delta in; returns true once the generation is finished.
    ///
    /// `on_partial` sees the content accumulated before each non-terminal
    /// delta, so the terminal delta never triggers it.
    pub async fn feed(
        &mut self,
        delta: StreamDelta,
        on_partial: Option<PartialFn<'_>>,
        known: Option<&KnownCompletions>,
    ) -> Result<bool> {
        let terminal = delta.finish_reason.is_some();

        if !terminal && !self.content.is_empty() {
            if let Some(callback) = on_partial {
                callback(&self.content);
            }
        }

        if let Some(text) = delta.content {
            self.content.push_str(&text);
        }

        for fragment in delta.tool_calls {
            let call = self.tool_calls.entry(fragment.index).or_default();
            if fragment.id.is_some() {
                call.id = fragment.id;
            }
            if let Some(name) = fragment.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = fragment.arguments {
                call.arguments.push_str(&arguments);
            }
        }

        if let Some(reason) = delta.finish_reason {
            self.finish(FinishReason::parse(&reason));
            return Ok(true);
        }

        if let Some(known) = known {
            if self.short_circuit_open && self.tool_calls.is_empty() && !self.content.is_empty() {
                match known.lookup(&self.content).await? {
                    Some(completion) => {
                        debug!(prefix = %self.content, "short-circuiting with known completion");
                        self.content = completion;
                        self.finish(FinishReason::ShortCircuit);
                        return Ok(true);
                    }
                    None => {
                        // Once long enough to key and still unmatched, it never will
                        let tokens = known.tokenizer.count_tokens(&self.content).await?;
                        if tokens >= known.prefix_tokens() {
                            self.short_circuit_open = false;
                        }
                    }
                }
            }
        }

        Ok(false)
    }

    /// Read SSE bytes until the terminal event, `[DONE]` or end of stream
    pub async fn drain<S, B, E>(
        &mut self,
        stream: S,
        on_partial: Option<PartialFn<'_>>,
        known: Option<&KnownCompletions>,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<ReverieError>,
    {
        let mut decoder = SseDecoder::default();
        futures::pin_mut!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            for event in decoder.push(chunk.as_ref()) {
                let data = match event {
                    SseEvent::Done => {
                        self.finish(FinishReason::Stop);
                        return Ok(());
                    }
                    SseEvent::Data(data) => data,
                };
                match StreamDelta::parse(&data) {
                    Ok(Some(delta)) => {
                        if self.feed(delta, on_partial, known).await? {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping malformed stream chunk"),
                }
            }
        }

        self.finish(FinishReason::Incomplete);
        Ok(())
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .values()
            .map(|call| ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .collect()
    }

    pub fn into_response(self, usage: Usage) -> CompletionResponse {
        let tool_calls = self.tool_calls();
        CompletionResponse {
            content: self.content,
            tool_calls,
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Incomplete),
            usage,
        }
    }
}

// ─── Token accounting ─────────────────────────────────────────────────────

/// Client-side usage estimate; any tokenizer failure yields zero usage
pub async fn estimate_usage(
    tokenizer: &dyn Tokenizer,
    config: &CompletionConfig,
    request: &CompletionRequest,
    content: &str,
    tool_calls: &[ToolCall],
) -> Usage {
    let estimate = async {
        let mut prompt = tokenizer.count_tokens(&request.input).await? + config.prompt_padding;
        if !request.functions.is_empty() {
            let schema = serde_json::to_string(&request.functions)?;
            prompt += tokenizer.count_tokens(&schema).await?;
        }

        let mut completion = tokenizer.count_tokens(content).await? + config.completion_padding;
        for call in tool_calls {
            completion += tokenizer.count_tokens(&call.name).await?;
            completion += tokenizer.count_tokens(&call.arguments).await?;
        }

        Ok::<_, ReverieError>(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        })
    };

    match estimate.await {
        Ok(usage) => usage,
        Err(e) => {
            debug!(error = %e, "usage estimate failed, reporting zero");
            Usage::default()
        }
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────

/// Send a request, waiting `backoff_ms[i]` before retry `i` on 429.
/// Any other non-success status fails immediately.
pub(crate) async fn send_with_backoff<F>(
    service: &'static str,
    backoff_ms: &[u64],
    mut request: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let response = request().send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(wait) = backoff_ms.get(attempt) {
                warn!(service, attempt, wait_ms = *wait, "rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(*wait)).await;
                attempt += 1;
                continue;
            }
            return Err(ReverieError::RateLimited {
                service,
                attempts: attempt + 1,
            });
        }

        let body = response.text().await.unwrap_or_default();
        return Err(ReverieError::Upstream {
            service,
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }
}

pub(crate) fn http_client(config: &CompletionConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()?)
}

/// OpenAI-compatible `/chat/completions` streaming client
pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    api_key: String,
    config: CompletionConfig,
    tokenizer: Arc<dyn Tokenizer>,
}

impl OpenAiCompletionClient {
    pub fn new(config: CompletionConfig, api_key: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        Ok(Self {
            http: http_client(&config)?,
            api_key: api_key.into(),
            config,
            tokenizer,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [{"role": "system", "content": request.input}],
            "stream": true,
        });

        if !request.functions.is_empty() {
            let tools: Vec<Value> = request
                .functions
                .iter()
                .map(|f| json!({"type": "function", "function": f}))
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if request.logprobs {
            body["logprobs"] = json!(true);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_partial: Option<PartialFn<'_>>,
        known: Option<&KnownCompletions>,
    ) -> Result<CompletionResponse> {
        let deadline = Instant::now() + Duration::from_millis(self.config.cutover_ms);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.body(request);

        let response = send_with_backoff("completion", &self.config.backoff_ms, || {
            self.http.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await?;

        let mut acc = StreamAccumulator::new();
        let drained = tokio::time::timeout_at(
            deadline,
            acc.drain(response.bytes_stream(), on_partial, known),
        )
        .await;

        match drained {
            Ok(result) => result?,
            Err(_) => {
                warn!(cutover_ms = self.config.cutover_ms, "completion cut over");
                acc.finish(FinishReason::Cutover);
            }
        }

        let tool_calls = acc.tool_calls();
        let usage = estimate_usage(
            self.tokenizer.as_ref(),
            &self.config,
            request,
            acc.content(),
            &tool_calls,
        )
        .await;

        debug!(
            finish = ?acc.finish_reason,
            tool_calls = tool_calls.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion finished"
        );
        Ok(acc.into_response(usage))
    }
}


/// Deterministic completion double for tests
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync>;

    pub(crate) struct ScriptedCompletion {
        responder: Responder,
        requests: Mutex<Vec<CompletionRequest>>,
        streams: bool,
    }

    impl ScriptedCompletion {
        pub(crate) fn new<F>(responder: F) -> Self
        where
            F: Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
                streams: false,
            }
        }

        /// Replay plain content word by word through a real accumulator
        pub(crate) fn streaming(mut self) -> Self {
            self.streams = true;
            self
        }

        /// Always answers `text` with no tool calls
        pub(crate) fn reply(text: &str) -> Self {
            let text = text.to_string();
            Self::new(move |_| Ok(content(&text)))
        }

        pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    pub(crate) fn content(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.to_string(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
            },
        }
    }

    pub(crate) fn act(calls: &[Value]) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: calls
                .iter()
                .enumerate()
                .map(|(i, args)| ToolCall {
                    id: Some(format!("call_{i}")),
                    name: "act".to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
            finish_reason: FinishReason::ToolCalls,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(
            &self,
            request: &CompletionRequest,
            on_partial: Option<PartialFn<'_>>,
            known: Option<&KnownCompletions>,
        ) -> Result<CompletionResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let response = (self.responder)(request)?;
            if self.streams && response.tool_calls.is_empty() {
                return replay(response, on_partial, known).await;
            }
            if let Some(callback) = on_partial {
                if !response.content.is_empty() {
                    callback(&response.content);
                }
            }
            Ok(response)
        }
    }

    async fn replay(
        response: CompletionResponse,
        on_partial: Option<PartialFn<'_>>,
        known: Option<&KnownCompletions>,
    ) -> Result<CompletionResponse> {
        let mut events: Vec<String> = response
            .content
            .split_inclusive(' ')
            .map(|word| {
                format!(
                    "data: {}\n\n",
                    json!({"choices": [{"delta": {"content": word}, "finish_reason": null}]})
                )
            })
            .collect();
        events.push("data: [DONE]\n\n".to_string());

        let mut acc = StreamAccumulator::new();
        acc.drain(
            futures::stream::iter(events.into_iter().map(Ok::<_, ReverieError>)),
            on_partial,
            known,
        )
        .await?;
        Ok(acc.into_response(response.usage))
    }
}
