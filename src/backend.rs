//! External collaborators: web search, chat completions, and the result store.
//!
//! Each collaborator is a trait so handlers and tests can swap
//! implementations. The HTTP clients here do one request per call; retry,
//! timeout, and caching are applied around them by the orchestrator.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::GatewayError;

/// Query parameters sent to the search backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchParams {
    pub q: String,
    pub max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl SearchParams {
    pub const DEFAULT_MAX_RESULTS: u32 = 3;

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("q", self.q.clone()), ("max_results", self.max_results.to_string())];
        if let Some(time) = &self.time {
            pairs.push(("time", time.clone()));
        }
        if let Some(region) = &self.region {
            pairs.push(("region", region.clone()));
        }
        pairs
    }
}

/// One search result as returned upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub href: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync + fmt::Debug {
    async fn search(&self, params: &SearchParams) -> Result<Vec<SearchHit>, GatewayError>;
}

/// Search over an HTTP JSON endpoint (`GET url?q=..&max_results=..`).
pub struct HttpSearchBackend {
    client: Client,
    url: Option<String>,
}

impl HttpSearchBackend {
    const ORIGIN: &'static str = "https://chat.openai.com";
    const USER_AGENT: &'static str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 11_1_0) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/87.0.4280.141 Safari/537.36";

    /// `url = None` leaves search disabled.
    pub fn new(client: Client, url: Option<String>) -> Self {
        Self { client, url }
    }
}

impl fmt::Debug for HttpSearchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSearchBackend").field("url", &self.url).finish()
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, params: &SearchParams) -> Result<Vec<SearchHit>, GatewayError> {
        let url = self.url.as_deref().ok_or(GatewayError::NoCredential("SEARCH_URL"))?;
        tracing::info!(url, q = %params.q, "invoking search");

        let response = self
            .client
            .get(url)
            .query(&params.query_pairs())
            .header(reqwest::header::ORIGIN, Self::ORIGIN)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "*/*")
            .header(reqwest::header::USER_AGENT, Self::USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UpstreamUnavailable(format!("search returned {}", status)));
        }
        let hits: Vec<SearchHit> = response.json().await?;
        tracing::info!(results = hits.len(), "search completed");
        Ok(hits)
    }
}

/// A chat message, as exchanged with the completion API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// Completion text plus the tokens the provider charged for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_consumed: u64,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync + fmt::Debug {
    /// Complete `messages`. Fails with `NoCredential` when the backend is
    /// not configured.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GatewayError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

/// OpenAI-compatible `/chat/completions` client.
///
/// Every request is prefixed with a system prompt and the current date.
pub struct OpenAiCompletionBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
    clock: Arc<dyn Clock>,
}

impl OpenAiCompletionBackend {
    pub const DEFAULT_URL: &'static str = "https://api.openai.com/v1/chat/completions";
    pub const DEFAULT_MODEL: &'static str = "gpt-3.5-turbo";
    const SYSTEM_PROMPT: &'static str = "You are a helpful assistant.";

    pub fn new(client: Client, url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self { client, url: url.into(), api_key, model: model.into(), clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn framed(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let now = i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default();
        let mut framed = vec![
            ChatMessage::system(Self::SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Current date: {}",
                now.to_rfc3339_opts(SecondsFormat::Millis, true)
            )),
        ];
        framed.extend_from_slice(messages);
        framed
    }
}

impl fmt::Debug for OpenAiCompletionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompletionBackend")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionBackend {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GatewayError> {
        let api_key = self.api_key.as_deref().ok_or(GatewayError::NoCredential("OPENAI_API_KEY"))?;
        let request = ChatRequest { model: &self.model, messages: self.framed(messages) };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            tracing::warn!(%status, %detail, "completion request failed");
            return Err(GatewayError::UpstreamUnavailable(format!("completion returned {}", status)));
        }

        let body: ChatResponse = response.json().await?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| GatewayError::UpstreamUnavailable("no response text".into()))?;
        let tokens_consumed = body.usage.map(|u| u.total_tokens).unwrap_or(0);
        Ok(Completion { text, tokens_consumed })
    }
}

/// What a vote is about: a generated answer or one search result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VoteSubject {
    Chat(String),
    Result { id: String, index: u32 },
}

impl fmt::Display for VoteSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteSubject::Chat(id) => write!(f, "{}", id),
            VoteSubject::Result { id, index } => write!(f, "{}:{}", id, index),
        }
    }
}

/// Vote tallies for one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Votes {
    pub positive: u64,
    pub negative: u64,
}

/// Persistence for search results, generated answers, and votes.
#[async_trait]
pub trait ResultStore: Send + Sync + fmt::Debug {
    /// Save a result list and return its id. Saving the same
    /// (industry, country) again on the same UTC day returns the same id.
    async fn save_results(
        &self,
        industry: &str,
        country: &str,
        items: &[SearchHit],
    ) -> Result<String, GatewayError>;

    async fn save_chat(
        &self,
        industry: &str,
        country: &str,
        result_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<String, GatewayError>;

    /// Count one vote from `session`. Only the sign of `upvote` matters. A
    /// repeated vote from the same session, or a zero vote, changes nothing
    /// and returns `false`.
    async fn record_vote(
        &self,
        session: &str,
        subject: &VoteSubject,
        upvote: i64,
    ) -> Result<bool, GatewayError>;

    async fn get_votes(&self, subject: &VoteSubject) -> Result<Votes, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedResults {
    pub industry: String,
    pub country: String,
    pub items: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedChat {
    pub industry: String,
    pub country: String,
    pub result_id: String,
    pub prompt: String,
    pub answer: String,
}

#[derive(Debug, Default)]
struct StoreState {
    // (day, industry, country) -> id; only the current day is kept
    result_ids: HashMap<(String, String, String), String>,
    results: HashMap<String, SavedResults>,
    chat_ids: HashMap<(String, String, String), String>,
    chats: HashMap<String, SavedChat>,
    votes: HashMap<String, Votes>,
    voted: HashSet<String>,
}

/// Process-local result store.
///
/// Id lookups for past days are dropped once a new day starts. Saved lists,
/// chats, tallies and per-session vote markers are kept for the life of the
/// process, so memory grows with traffic.
#[derive(Debug, Clone)]
pub struct InMemoryResultStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(Mutex::new(StoreState::default())), clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn day(&self) -> String {
        i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default()
            .format("%Y-%m-%d")
            .to_string()
    }

    pub fn results(&self, id: &str) -> Option<SavedResults> {
        self.lock().results.get(id).cloned()
    }

    pub fn chat(&self, id: &str) -> Option<SavedChat> {
        self.lock().chats.get(id).cloned()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save_results(
        &self,
        industry: &str,
        country: &str,
        items: &[SearchHit],
    ) -> Result<String, GatewayError> {
        let today = self.day();
        let mut state = self.lock();
        state.result_ids.retain(|(day, _, _), _| *day == today);
        let id = state
            .result_ids
            .entry((today, industry.to_string(), country.to_string()))
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        state.results.insert(
            id.clone(),
            SavedResults { industry: industry.into(), country: country.into(), items: items.to_vec() },
        );
        Ok(id)
    }

    async fn save_chat(
        &self,
        industry: &str,
        country: &str,
        result_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<String, GatewayError> {
        let today = self.day();
        let mut state = self.lock();
        state.chat_ids.retain(|(day, _, _), _| *day == today);
        let id = state
            .chat_ids
            .entry((today, industry.to_string(), country.to_string()))
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        state.chats.insert(
            id.clone(),
            SavedChat {
                industry: industry.into(),
                country: country.into(),
                result_id: result_id.into(),
                prompt: prompt.into(),
                answer: answer.into(),
            },
        );
        Ok(id)
    }

    async fn record_vote(
        &self,
        session: &str,
        subject: &VoteSubject,
        upvote: i64,
    ) -> Result<bool, GatewayError> {
        if upvote == 0 {
            return Ok(false);
        }
        let subject = subject.to_string();
        let mut state = self.lock();
        if !state.voted.insert(format!("voted:{}:{}", session, subject)) {
            tracing::info!(session, %subject, "already voted");
            return Ok(false);
        }
        let tally = state.votes.entry(format!("like:{}", subject)).or_default();
        if upvote > 0 {
            tally.positive += 1;
        } else {
            tally.negative += 1;
        }
        Ok(true)
    }

    async fn get_votes(&self, subject: &VoteSubject) -> Result<Votes, GatewayError> {
        Ok(self.lock().votes.get(&format!("like:{}", subject)).copied().unwrap_or_default())
    }
}
