//! Request Context
//!
//! The engine-facing view of one HTTP request: immutable request data, the
//! buffered response the run writes into, and the session scope. Fan-out
//! branches get an isolated surrogate whose response buffer goes nowhere and
//! whose session writes stay in a local overlay.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::session::SessionScope;

/// Buffered response a run writes into.
///
/// Steps and scripts write here; the HTTP handler turns the buffer into the
/// wire response at the end of the run. Isolated buffers are dropped.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    /// Replace or insert a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Insert a header only if absent; reports whether it was written
    pub fn set_header_once(&mut self, name: &str, value: &str) -> bool {
        if self.header(name).is_some() {
            return false;
        }
        self.headers.push((name.to_string(), value.to_string()));
        true
    }

    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Overwrite the body (last writer wins, matching handler semantics)
    pub fn write_body(&mut self, bytes: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(bytes);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether anything was explicitly written
    pub fn is_written(&self) -> bool {
        self.status.is_some() || !self.body.is_empty()
    }
}

/// One request as the engine sees it
#[derive(Clone)]
pub struct RequestContext {
    pub method: String,
    /// Path after `nfnext`/`nftk` stripping; the one patterns match against
    pub path: String,
    /// Path as received on the wire
    pub raw_path: String,
    pub query_string: String,
    pub headers: BTreeMap<String, String>,
    /// Body read once and parsed; exposed to scripts as `post_data`
    pub post_data: Value,
    /// Token captured from an `nftk` path segment
    pub token: String,
    pub remote_addr: String,
    pub host: String,
    pub hostname: String,
    pub scope: SessionScope,
    pub response: Arc<Mutex<ResponseBuffer>>,
    pub isolated: bool,
}

impl RequestContext {
    /// Bare context for tests and embedded callers
    pub fn bare(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            raw_path: path.to_string(),
            query_string: String::new(),
            headers: BTreeMap::new(),
            post_data: Value::Null,
            token: String::new(),
            remote_addr: String::new(),
            host: String::new(),
            hostname: String::new(),
            scope: SessionScope::new(""),
            response: Arc::new(Mutex::new(ResponseBuffer::new())),
            isolated: false,
        }
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Client IP as reported by proxies, falling back to the peer address
    pub fn real_ip(&self) -> &str {
        self.header("x-real-ip")
            .or_else(|| {
                self.header("x-forwarded-for")
                    .map(|v| v.split(',').next().unwrap_or(v).trim())
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.remote_addr)
    }

    /// Header map as a JSON object for the `header` script global
    pub fn headers_json(&self) -> Value {
        Value::Object(
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    /// Isolated surrogate for a fan-out branch.
    ///
    /// The request data is shallow-cloned, the response goes to a fresh
    /// buffer nobody reads, and session operations run against a local
    /// overlay seeded from the real session.
    pub fn isolated_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.response = Arc::new(Mutex::new(ResponseBuffer::new()));
        clone.scope = self.scope.isolated();
        clone.isolated = true;
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_header_once() {
        let mut buffer = ResponseBuffer::new();
        assert!(buffer.set_header_once("Nflow-Wid-1", "a"));
        assert!(!buffer.set_header_once("Nflow-Wid-1", "b"));
        assert_eq!(buffer.header("nflow-wid-1").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_buffer_body_last_writer_wins() {
        let mut buffer = ResponseBuffer::new();
        buffer.write_body(b"first");
        buffer.write_body(b"second");
        assert_eq!(buffer.body(), b"second");
        assert!(buffer.is_written());
    }

    #[test]
    fn test_real_ip_priority() {
        let mut ctx = RequestContext::bare("GET", "/");
        ctx.remote_addr = "10.0.0.1".into();
        assert_eq!(ctx.real_ip(), "10.0.0.1");

        ctx.headers
            .insert("x-forwarded-for".into(), "1.2.3.4, 5.6.7.8".into());
        assert_eq!(ctx.real_ip(), "1.2.3.4");

        ctx.headers.insert("x-real-ip".into(), "9.9.9.9".into());
        assert_eq!(ctx.real_ip(), "9.9.9.9");
    }

    #[test]
    fn test_isolated_clone_detaches_response() {
        let ctx = RequestContext::bare("GET", "/");
        let branch = ctx.isolated_clone();
        assert!(branch.isolated);
        assert!(branch.scope.is_isolated());

        branch.response.lock().write_body(b"branch");
        assert!(ctx.response.lock().body().is_empty());
    }
}
