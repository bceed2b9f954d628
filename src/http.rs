//! HTTP surface.
//!
//! | Route | Gate |
//! |---|---|
//! | `GET\|POST /api/query` | `query-`: 10/min, slowed after 5 |
//! | `GET /api/like` | `like-get-`: 100/min |
//! | `POST /api/like` | `like-post-`: 20/min |
//! | `GET /api/tokens` | none |
//! | `GET /health` | none |
//!
//! Clients are identified by IP (see [`client_identity`]) for admission, and
//! by a long-lived `sid` cookie for vote deduplication.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionGate;
use crate::backend::VoteSubject;
use crate::error::ResilienceError;
use crate::gateway::Gateway;
use crate::quota::COMPLETION_COUNTER;
use crate::service::QueryRequest;

pub const SESSION_COOKIE: &str = "sid";
const SESSION_MAX_AGE_SECS: u64 = 10 * 365 * 24 * 3600;

/// Session id taken from (or newly issued as) the `sid` cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session(pub String);

pub fn router(gateway: Arc<Gateway>) -> Router {
    let query = Router::new()
        .route("/api/query", get(query_get).post(query_post))
        .route_layer(middleware::from_fn_with_state(gateway.clone(), admit_query));
    let like = Router::new()
        .route("/api/like", get(like_get).post(like_post))
        .route_layer(middleware::from_fn_with_state(gateway.clone(), admit_like));

    Router::new()
        .merge(query)
        .merge(like)
        .route("/api/tokens", get(tokens))
        .route("/health", get(health))
        .layer(middleware::from_fn(session))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Client identity for admission: the first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    forwarded
        .or_else(real)
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn session_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn session(mut request: Request, next: Next) -> Response {
    let (id, issued) = match session_from_cookies(request.headers()) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };
    request.extensions_mut().insert(Session(id.clone()));

    let mut response = next.run(request).await;
    if issued {
        let cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            SESSION_COOKIE, id, SESSION_MAX_AGE_SECS
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

async fn admit_query(State(gateway): State<Arc<Gateway>>, request: Request, next: Next) -> Response {
    admit(&gateway.gates().query, request, next).await
}

async fn admit_like(State(gateway): State<Arc<Gateway>>, request: Request, next: Next) -> Response {
    let gate = if request.method() == axum::http::Method::GET {
        &gateway.gates().like_read
    } else {
        &gateway.gates().like_write
    };
    admit(gate, request, next).await
}

async fn admit(gate: &AdmissionGate, request: Request, next: Next) -> Response {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(request.headers(), peer);

    match gate.check(&identity).await {
        Ok(()) => next.run(request).await,
        Err(ResilienceError::RateLimited { wait }) => too_many_requests(wait),
        Err(err) => {
            // a broken counter store must not take the site down
            tracing::warn!(error = %err, %identity, "admission check failed, letting request through");
            next.run(request).await
        }
    }
}

fn too_many_requests(wait: Duration) -> Response {
    let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let mut response =
        (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "message": "Too Many Requests" }))).into_response();
    response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
    response
}

fn invalid() -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "message": "Invalid" }))).into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": "Internal Server Error" })))
        .into_response()
}

async fn query_get(
    State(gateway): State<Arc<Gateway>>,
    request: Option<Query<QueryRequest>>,
) -> Response {
    let request = request.map(|Query(r)| r).unwrap_or_default();
    Json(gateway.service().query(request).await).into_response()
}

async fn query_post(
    State(gateway): State<Arc<Gateway>>,
    request: Option<Json<QueryRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Json(gateway.service().query(request).await).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikeParams {
    chat_id: Option<String>,
    result_id: Option<String>,
    result_index: Option<String>,
}

impl LikeParams {
    fn subject(self) -> Option<VoteSubject> {
        match (self.result_id, self.result_index, self.chat_id) {
            (Some(id), Some(index), _) => {
                index.trim().parse().ok().map(|index| VoteSubject::Result { id, index })
            }
            (_, _, Some(chat)) if !chat.is_empty() => Some(VoteSubject::Chat(chat)),
            _ => None,
        }
    }
}

async fn like_get(State(gateway): State<Arc<Gateway>>, params: Option<Query<LikeParams>>) -> Response {
    let Some(subject) = params.and_then(|Query(p)| p.subject()) else {
        return invalid();
    };
    match gateway.service().votes(&subject).await {
        Ok(votes) => Json(votes).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to read votes");
            internal_error()
        }
    }
}

/// Accepts numbers and numeric strings, like a lenient form decoder.
fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn vote_from_body(body: &Value) -> Option<(VoteSubject, i64)> {
    let upvote = integer(body.get("upvote"))?;
    let result = text(body.get("resultId")).zip(integer(body.get("resultIndex")));
    let subject = match result {
        Some((id, index)) => VoteSubject::Result { id, index: u32::try_from(index).ok()? },
        None => VoteSubject::Chat(text(body.get("chatId"))?),
    };
    Some((subject, upvote))
}

async fn like_post(
    State(gateway): State<Arc<Gateway>>,
    Extension(Session(session)): Extension<Session>,
    body: Option<Json<Value>>,
) -> Response {
    let Some((subject, upvote)) = body.as_ref().and_then(|Json(b)| vote_from_body(b)) else {
        return invalid();
    };
    match gateway.service().vote(&session, &subject, upvote).await {
        Ok(()) => Json(json!({ "message": "OK" })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to record vote");
            internal_error()
        }
    }
}

async fn tokens(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.service().orchestrator().usage(COMPLETION_COUNTER).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to read token usage");
            internal_error()
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
