//! Request Handler
//!
//! Every path is a candidate workflow entry. The handler normalises the path
//! (stripping `nfnext`/`nftk` segments), reads the body once, resolves the
//! session cookie, routes to a starter and hands the request to the engine,
//! then turns the buffered response (or the error) into the wire response.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::engine::context::{RequestContext, ResponseBuffer};
use crate::engine::LOG_SESSION;
use crate::router::match_starter;
use crate::session::SessionScope;
use crate::types::Error;

use super::state::AppState;

/// Cookie carrying the session id
pub const SESSION_COOKIE: &str = "nflow_session";
/// Query/form parameter selecting an explicit entry node
pub const NEXT_NODE_PARAM: &str = "nflow_next_node_run";

const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Result of path normalisation
#[derive(Debug, Default, PartialEq)]
pub struct NormalizedPath {
    pub path: String,
    /// Node id captured from an `nfnext/<id>` segment pair
    pub next_node: Option<String>,
    /// Token captured from an `nftk/<token>` segment pair
    pub token: Option<String>,
}

/// Strip `nfnext/<id>` and `nftk/<token>` segment pairs before matching
pub fn normalize_path(path: &str) -> NormalizedPath {
    let mut out = NormalizedPath::default();
    let mut kept: Vec<&str> = Vec::new();
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        match segment {
            "nfnext" => {
                if let Some(id) = segments.next() {
                    out.next_node = Some(id.to_string());
                }
            }
            "nftk" => {
                if let Some(token) = segments.next() {
                    out.token = Some(token.to_string());
                }
            }
            other => kept.push(other),
        }
    }
    out.path = kept.join("/");
    if out.path.is_empty() {
        out.path = "/".to_string();
    }
    out
}

/// Parse a query string into a flat map (last value wins)
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut kv = pair.splitn(2, '=');
        let key = url_decode(kv.next().unwrap_or(""));
        let value = url_decode(kv.next().unwrap_or(""));
        out.insert(key, value);
    }
    out
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = &input[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn cookie_value(headers: &BTreeMap<String, String>, name: &str) -> Option<String> {
    let cookies = headers.get("cookie")?;
    for part in cookies.split(';') {
        let mut kv = part.trim().splitn(2, '=');
        if kv.next() == Some(name) {
            return kv.next().map(|v| v.to_string());
        }
    }
    None
}

/// Parse the request body by content type: JSON object, urlencoded form, or
/// raw string.
fn parse_post_data(content_type: &str, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    if content_type.contains("application/json") {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    } else if content_type.contains("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(bytes);
        Value::Object(
            parse_query(&text)
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        )
    } else {
        Value::String(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// The `ANY /*` workflow entry point
pub async fn handle_any(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let method = request.method().as_str().to_string();
    let uri = request.uri().clone();
    let raw_path = uri.path().to_string();
    let query_string = uri.query().unwrap_or("").to_string();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let host = headers.get("host").cloned().unwrap_or_default();

    let body = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(&Error::Backend(format!("body read: {}", e)));
        }
    };
    let content_type = headers.get("content-type").cloned().unwrap_or_default();
    let post_data = parse_post_data(&content_type, &body);

    let normalized = normalize_path(&raw_path);
    let query = parse_query(&query_string);
    let explicit_next = query
        .get(NEXT_NODE_PARAM)
        .cloned()
        .or_else(|| {
            post_data
                .get(NEXT_NODE_PARAM)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .or(normalized.next_node.clone());

    // Session cookie: reuse or mint.
    let (cookie, minted) = match cookie_value(&headers, SESSION_COOKIE) {
        Some(value) => (value, false),
        None => (Uuid::new_v4().to_string(), true),
    };

    let ctx = RequestContext {
        method: method.clone(),
        path: normalized.path.clone(),
        raw_path,
        query_string,
        headers,
        post_data,
        token: normalized.token.unwrap_or_default(),
        remote_addr: connect
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default(),
        host,
        hostname: state.config().server.host.clone(),
        scope: SessionScope::new(cookie.clone()),
        response: Arc::new(Mutex::new(ResponseBuffer::new())),
        isolated: false,
    };

    let engine = state.engine().clone();

    // Load the app and route.
    let loaded = match engine.playbooks.load(state.app_name()).await {
        Ok(loaded) => loaded,
        Err(e) => return error_response(&e),
    };
    let Some(matched) = match_starter(state.app_name(), &method, &ctx.path, &loaded.playbooks)
    else {
        return error_response(&Error::NotFound(format!("{} {}", method, ctx.path)));
    };

    if matched.reset_order_box {
        if let Err(e) =
            engine
                .sessions
                .set_value(LOG_SESSION, "order_box", serde_json::json!(0), &ctx.scope)
        {
            tracing::warn!(error = %e, "order_box reset failed");
        }
    }

    let result = engine
        .handle(&matched, explicit_next, &loaded.default_js, &ctx)
        .await;

    let set_cookie = minted.then(|| format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, cookie));

    match result {
        Ok(()) => buffer_response(&ctx, set_cookie),
        Err(e @ Error::ResourceLimit(_)) => error_response_with_cookie(&e, set_cookie),
        Err(e) => {
            if ctx.response.lock().is_written() {
                tracing::warn!(error = %e, "run failed after response was written");
                buffer_response(&ctx, set_cookie)
            } else {
                error_response_with_cookie(&e, set_cookie)
            }
        }
    }
}

/// Turn the run's buffered response into the wire response
fn buffer_response(ctx: &RequestContext, set_cookie: Option<String>) -> Response {
    let buffer = ctx.response.lock();
    let status = StatusCode::from_u16(buffer.status()).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (name, value) in buffer.headers() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        headers.insert(name, value);
    }
    append_cookie(&mut headers, set_cookie);

    (status, headers, buffer.body().to_vec()).into_response()
}

fn error_response(error: &Error) -> Response {
    error_response_with_cookie(error, None)
}

/// Engine errors always render as JSON with at least `message` and a code
fn error_response_with_cookie(error: &Error, set_cookie: Option<String>) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static("application/json"),
    );
    append_cookie(&mut headers, set_cookie);
    (status, headers, error.to_body().to_string()).into_response()
}

fn append_cookie(headers: &mut HeaderMap, set_cookie: Option<String>) {
    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(HeaderName::from_static("set-cookie"), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_path() {
        let n = normalize_path("/users/42");
        assert_eq!(n.path, "/users/42");
        assert!(n.next_node.is_none());
        assert!(n.token.is_none());
    }

    #[test]
    fn test_normalize_strips_nfnext() {
        let n = normalize_path("/users/nfnext/7/detail");
        assert_eq!(n.path, "/users/detail");
        assert_eq!(n.next_node.as_deref(), Some("7"));
    }

    #[test]
    fn test_normalize_strips_nftk() {
        let n = normalize_path("/api/nftk/abc123/run");
        assert_eq!(n.path, "/api/run");
        assert_eq!(n.token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_path("/").path, "/");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("a=1&b=x%20y&c=&flag");
        assert_eq!(q.get("a").map(String::as_str), Some("1"));
        assert_eq!(q.get("b").map(String::as_str), Some("x y"));
        assert_eq!(q.get("c").map(String::as_str), Some(""));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_post_data_json() {
        let v = parse_post_data("application/json", br#"{"a":1}"#);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_parse_post_data_form() {
        let v = parse_post_data("application/x-www-form-urlencoded", b"a=1&b=two");
        assert_eq!(v["a"], "1");
        assert_eq!(v["b"], "two");
    }

    #[test]
    fn test_parse_post_data_raw() {
        let v = parse_post_data("text/plain", b"hello");
        assert_eq!(v, Value::String("hello".into()));
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "cookie".to_string(),
            "other=1; nflow_session=abc; x=2".to_string(),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("abc")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
