//! The query flow behind `/api/query`, and vote bookkeeping behind `/api/like`.
//!
//! A query searches the web for journalists covering a topic in a country,
//! saves the hits, asks the completion backend to summarise them, and returns
//! both. Anything that goes wrong after admission turns into the canned
//! [`fallback`] payload rather than an error status.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::backend::{
    ChatMessage, CompletionBackend, ResultStore, SearchBackend, SearchHit, SearchParams, VoteSubject,
    Votes,
};
use crate::cache::{hashed_key, COMPLETION_TTL, SEARCH_TTL};
use crate::error::GatewayError;
use crate::orchestrator::{Metered, RequestOrchestrator};
use crate::quota::COMPLETION_COUNTER;

const SEARCH_KEY_PREFIX: &str = "ddg-v3-";
const COMPLETION_KEY_PREFIX: &str = "openai-v2-";
const EXCLUDED_SITES: &str = " -site:wikipedia.org -site:upwork.com";

/// Parameters of `/api/query`, from the query string or a JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub value: Option<String>,
    pub country: Option<String>,
    /// Unparsable counts read as absent rather than failing the request.
    #[serde(default, deserialize_with = "lenient_count")]
    pub num_results: Option<u32>,
    pub time_period: Option<String>,
    pub region: Option<String>,
}

/// Accepts `5`, `"5"`, or anything else as `None`. Query strings only carry
/// text, JSON bodies carry numbers.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    #[allow(dead_code)]
    enum Raw {
        Number(u32),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

/// A search hit as shown to clients, tagged with the id of its saved list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLink {
    pub id: String,
    pub title: String,
    pub body: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub links: Vec<ResultLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload returned whenever a query cannot be answered.
pub fn fallback() -> QueryResponse {
    QueryResponse {
        links: vec![ResultLink {
            id: "0".into(),
            title: "None found :-/".into(),
            body: "Well, we tried. But we couldn't find any journalists".into(),
            href: "https://valosan.com?utm_source=jojogpt&utm_medium=referral&utm_campaign=none_found"
                .into(),
        }],
        chat_id: None,
        message: None,
    }
}

/// Strip everything that is not a letter, number, punctuation, separator,
/// `^`, `$` or newline, then trim.
pub fn remove_emoji(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"[^\p{L}\p{N}\p{P}\p{Z}^$\n]").expect("valid emoji pattern"));
    pattern.replace_all(input, "").trim().to_string()
}

/// The question sent to search.
pub fn journalist_query(value: &str, country: &str) -> String {
    format!("Who is the best journalist in {} who writes about {}?", country, value)
}

/// Build the completion prompt from search results.
pub fn generate_prompt(links: &[ResultLink], query: &str, max_results: Option<usize>) -> String {
    let cited = links
        .iter()
        .take(max_results.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(i, link)| format!("[{}] \"{}\"\nURL: {}\n", i + 1, link.title, link.href))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Web search results:\n{cited}\n\n\
         Instructions: Write summary of your knowledge based on provided search results and\n\
         cite results using [[number](URL)] notation after the reference.\n\
         If search results are not relevant, write based on your own knowledge. \n\
         Do not write \"I am sorry\", that you are AI model, do not know, etc. \n\
         Query: {query}"
    )
}

#[derive(Debug, Clone)]
pub struct QueryService {
    orchestrator: RequestOrchestrator,
    search: Arc<dyn SearchBackend>,
    completions: Arc<dyn CompletionBackend>,
    store: Arc<dyn ResultStore>,
}

impl QueryService {
    pub fn new(
        orchestrator: RequestOrchestrator,
        search: Arc<dyn SearchBackend>,
        completions: Arc<dyn CompletionBackend>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self { orchestrator, search, completions, store }
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    /// Answer a query, falling back to the canned payload on any failure.
    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        match self.try_query(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "query failed, serving fallback");
                fallback()
            }
        }
    }

    async fn try_query(&self, request: QueryRequest) -> Result<QueryResponse, GatewayError> {
        let value = request.value.as_deref().map(remove_emoji).unwrap_or_default();
        let country = request.country.as_deref().map(remove_emoji).unwrap_or_default();
        if value.is_empty() || country.is_empty() {
            return Err(GatewayError::InvalidInput("value and country are required".into()));
        }

        let query = journalist_query(&value, &country);
        let params = SearchParams {
            q: format!("{}{}", query, EXCLUDED_SITES),
            max_results: request.num_results.unwrap_or(SearchParams::DEFAULT_MAX_RESULTS),
            time: request.time_period.filter(|t| !t.is_empty()),
            region: request.region.filter(|r| !r.is_empty()),
        };
        let links = self.search_links(&value, &country, &params).await?;
        let Some(first) = links.first() else {
            return Err(GatewayError::UpstreamUnavailable("search returned nothing".into()));
        };

        let prompt = generate_prompt(&links, &query, None);
        let message = match self.complete(&prompt).await {
            Ok(text) => Some(text),
            Err(err) if err.is_disabled() => {
                tracing::info!(reason = %err, "completions disabled, returning links only");
                None
            }
            Err(err) => return Err(err),
        };

        let chat_id = match self
            .store
            .save_chat(&value, &country, &first.id, &prompt, message.as_deref().unwrap_or_default())
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(error = %err, "failed to save chat");
                None
            }
        };

        Ok(QueryResponse { links, chat_id, message })
    }

    async fn search_links(
        &self,
        industry: &str,
        country: &str,
        params: &SearchParams,
    ) -> Result<Vec<ResultLink>, GatewayError> {
        let key = hashed_key(SEARCH_KEY_PREFIX, &serde_json::to_string(params)?);
        tracing::info!(q = %params.q, key, "search query");

        // Links are cached with their saved-list id, so the store is written
        // once per cache fill.
        self.orchestrator
            .fetch(&key, SEARCH_TTL, || async {
                let hits = self.search.search(params).await?;
                Ok(self.save_links(industry, country, hits).await)
            })
            .await
    }

    async fn save_links(&self, industry: &str, country: &str, hits: Vec<SearchHit>) -> Vec<ResultLink> {
        if hits.is_empty() {
            return Vec::new();
        }
        let id = match self.store.save_results(industry, country, &hits).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(error = %err, "failed to save results");
                "0".to_string()
            }
        };
        hits.into_iter()
            .map(|hit| ResultLink { id: id.clone(), title: hit.title, body: hit.body, href: hit.href })
            .collect()
    }

    async fn complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let messages = vec![ChatMessage::user(prompt)];
        let key = hashed_key(COMPLETION_KEY_PREFIX, &serde_json::to_string(&messages)?);
        tracing::info!(key, "completion query");

        self.orchestrator
            .metered(&key, COMPLETION_TTL, COMPLETION_COUNTER, || async {
                let completion = self.completions.complete(&messages).await?;
                Ok(Metered { value: completion.text, cost: completion.tokens_consumed })
            })
            .await
    }

    pub async fn votes(&self, subject: &VoteSubject) -> Result<Votes, GatewayError> {
        self.store.get_votes(subject).await
    }

    /// Record a vote; repeated votes from one session are ignored.
    pub async fn vote(&self, session: &str, subject: &VoteSubject, upvote: i64) -> Result<(), GatewayError> {
        let counted = self.store.record_vote(session, subject, upvote).await?;
        tracing::info!(%subject, upvote, counted, "vote");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(title: &str, href: &str) -> ResultLink {
        ResultLink { id: "r".into(), title: title.into(), body: String::new(), href: href.into() }
    }

    #[test]
    fn remove_emoji_keeps_text_and_punctuation() {
        assert_eq!(remove_emoji("  Fintech 🚀💰 "), "Fintech");
        assert_eq!(remove_emoji("Åland, Suomi!"), "Åland, Suomi!");
        assert_eq!(remove_emoji("a+b=c"), "abc");
        assert_eq!(remove_emoji("$5^2"), "$5^2");
    }

    #[test]
    fn query_text() {
        assert_eq!(
            journalist_query("fintech", "Finland"),
            "Who is the best journalist in Finland who writes about fintech?"
        );
    }

    #[test]
    fn prompt_cites_each_result() {
        let links = vec![link("One", "https://a"), link("Two", "https://b")];
        let prompt = generate_prompt(&links, "Q?", None);
        assert!(prompt.starts_with("Web search results:\n[1] \"One\"\nURL: https://a\n\n[2] \"Two\"\nURL: https://b\n"));
        assert!(prompt.contains("[[number](URL)]"));
        assert!(prompt.ends_with("Query: Q?"));
    }

    #[test]
    fn prompt_respects_max_results() {
        let links = vec![link("One", "https://a"), link("Two", "https://b")];
        let prompt = generate_prompt(&links, "Q?", Some(1));
        assert!(prompt.contains("[1] \"One\""));
        assert!(!prompt.contains("Two"));
    }

    #[test]
    fn fallback_serializes_links_only() {
        let json = serde_json::to_value(fallback()).unwrap();
        assert_eq!(json["links"][0]["id"], "0");
        assert_eq!(json["links"][0]["title"], "None found :-/");
        assert!(json.get("chatId").is_none());
        assert!(json.get("message").is_none());
    }

    #[test]
    fn response_uses_camel_case() {
        let response = QueryResponse { links: vec![], chat_id: Some("c".into()), message: Some("m".into()) };
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            serde_json::json!({"links": [], "chatId": "c", "message": "m"})
        );
    }

    #[test]
    fn request_accepts_camel_case() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"value": "ai", "country": "Peru", "numResults": 5, "timePeriod": "m"}"#)
                .unwrap();
        assert_eq!(request.num_results, Some(5));
        assert_eq!(request.time_period.as_deref(), Some("m"));
        assert_eq!(request.region, None);
    }

    #[test]
    fn bad_result_counts_read_as_absent() {
        let parse = |json: &str| serde_json::from_str::<QueryRequest>(json).unwrap().num_results;
        assert_eq!(parse(r#"{"value": "ai", "numResults": "4"}"#), Some(4));
        assert_eq!(parse(r#"{"value": "ai", "numResults": "abc"}"#), None);
        assert_eq!(parse(r#"{"value": "ai", "numResults": -2}"#), None);
        assert_eq!(parse(r#"{"value": "ai", "numResults": null}"#), None);

        let request = parse_query("value=ai&country=Peru&numResults=abc");
        assert_eq!(request.value.as_deref(), Some("ai"));
        assert_eq!(request.num_results, None);
        assert_eq!(parse_query("value=ai&numResults=7").num_results, Some(7));
    }

    fn parse_query(query: &str) -> QueryRequest {
        let uri: axum::http::Uri = format!("/api/query?{query}").parse().unwrap();
        axum::extract::Query::<QueryRequest>::try_from_uri(&uri).unwrap().0
    }
}
