//! Forwarding to the backend API and translating its responses.

use axum::{
    body::Bytes,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{now_rfc3339, ApiError, ErrorBody, ErrorCode};
use crate::middleware::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_REQUEST_ID};
use crate::rate_limit::RateLimitSnapshot;
use crate::state::AppState;

/// How one gateway route reaches the backend.
#[derive(Debug, Clone)]
pub struct Forward<'a> {
    pub method: Method,
    pub backend_path: String,
    pub query: Option<&'a str>,
    pub requires_auth: bool,
    /// Code reported for a backend 404 without a code of its own.
    pub not_found: ErrorCode,
    /// Extra inbound headers copied to the backend request.
    pub pass_headers: &'static [&'static str],
}

impl<'a> Forward<'a> {
    pub fn new(method: Method, backend_path: impl Into<String>) -> Self {
        Self {
            method,
            backend_path: backend_path.into(),
            query: None,
            requires_auth: true,
            not_found: ErrorCode::NotFound,
            pass_headers: &[],
        }
    }

    pub fn query(mut self, query: Option<&'a str>) -> Self {
        self.query = query;
        self
    }

    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn not_found(mut self, code: ErrorCode) -> Self {
        self.not_found = code;
        self
    }

    pub fn pass_headers(mut self, names: &'static [&'static str]) -> Self {
        self.pass_headers = names;
        self
    }
}

fn request_id(headers: &HeaderMap) -> HeaderValue {
    headers
        .get(X_REQUEST_ID)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("unknown"))
}

fn bearer(headers: &HeaderMap) -> Option<&HeaderValue> {
    headers
        .get(AUTHORIZATION)
        .filter(|v| v.to_str().map(|s| !s.trim().is_empty()).unwrap_or(false))
}

/// Map a transport failure to a gateway error without leaking its text.
fn transport_error(err: &reqwest::Error, path: &str) -> ApiError {
    warn!(event = "proxy.backend.failed", path = path, error = %err, "Backend request failed");
    if err.is_timeout() {
        ApiError::GatewayTimeout
    } else {
        ApiError::ServiceUnavailable
    }
}

/// Send one request to the backend and render its answer.
pub async fn forward(
    state: &AppState,
    route: Forward<'_>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = request_id(headers);
    let credential = bearer(headers);
    if route.requires_auth && credential.is_none() {
        return Err(ApiError::Unauthorized);
    }

    let mut url = format!("{}{}", state.config.backend_url, route.backend_path);
    if let Some(query) = route.query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let mut request = state
        .client
        .request(route.method.clone(), &url)
        .header(X_REQUEST_ID, request_id.clone());
    if let Some(credential) = credential {
        request = request.header(AUTHORIZATION, credential.clone());
    }
    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        request = request.header(CONTENT_TYPE, content_type.clone());
    }
    for name in route.pass_headers {
        if let Some(value) = headers.get(*name) {
            request = request.header(*name, value.clone());
        }
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request
        .send()
        .await
        .map_err(|e| transport_error(&e, &route.backend_path))?;
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let payload = upstream
        .bytes()
        .await
        .map_err(|e| transport_error(&e, &route.backend_path))?;

    info!(
        event = "proxy.forwarded",
        method = %route.method,
        path = %route.backend_path,
        status = status.as_u16(),
        request_id = request_id.to_str().unwrap_or(""),
        "Proxied request"
    );

    let mut response = if status.is_success() {
        let content_type = upstream_headers
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        let mut response = (status, payload).into_response();
        response.headers_mut().insert(CONTENT_TYPE, content_type);
        response
    } else {
        ApiError::Backend {
            status,
            body: translate_error(status, &payload, route.not_found),
        }
        .into_response()
    };

    let out = response.headers_mut();
    if let Some(limit) = upstream_headers.get(X_RATELIMIT_LIMIT) {
        out.insert(X_RATELIMIT_LIMIT, limit.clone());
        if let Some(remaining) = upstream_headers.get(X_RATELIMIT_REMAINING) {
            out.insert(X_RATELIMIT_REMAINING, remaining.clone());
        }
        if let Some(reset) = upstream_headers.get(X_RATELIMIT_RESET) {
            out.insert(X_RATELIMIT_RESET, reset.clone());
        }
    } else if let Some(credential) = credential.and_then(|c| c.to_str().ok()) {
        let snapshot = state.rate_windows.hit(credential).await;
        insert_rate_limit(out, snapshot);
    }
    out.insert(X_REQUEST_ID, request_id);

    Ok(response)
}

fn insert_rate_limit(headers: &mut HeaderMap, snapshot: RateLimitSnapshot) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(snapshot.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(snapshot.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(snapshot.reset_secs));
}

/// Turn a backend error body of any shape into the stable contract.
pub fn translate_error(status: StatusCode, payload: &[u8], not_found: ErrorCode) -> ErrorBody {
    let parsed: Option<Value> = serde_json::from_slice(payload).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let message = field("error")
        .or_else(|| field("message"))
        .or_else(|| field("detail"))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Backend request failed")
                .to_string()
        });

    let code = field("code")
        .unwrap_or_else(|| ErrorCode::from_status(status, not_found).as_str().to_string());

    let details = parsed.as_ref().and_then(|v| match (v.get("details"), v.get("detail")) {
        (Some(details @ Value::Object(_)), _) => Some(details.clone()),
        (_, Some(detail)) if !detail.is_string() => Some(json!({ "detail": detail })),
        _ => None,
    });

    ErrorBody {
        error: message,
        code,
        details,
        timestamp: field("timestamp").or_else(|| Some(now_rfc3339())),
    }
}
