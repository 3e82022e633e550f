//! HTTP surface over a live listener: catch-all routing, error JSON, the run
//! id header, cookie minting, health, and `nfnext` entry selection.

mod common;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use nflow::config::Config;
use nflow::server::{create_router, AppState};

use common::{build, default_vm_config, drawflow, js_node, starter_node, APP};

async fn serve(harness: &common::Harness) -> SocketAddr {
    let state = AppState::new(harness.engine.clone(), APP.to_string(), Config::default());
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Minimal HTTP/1.1 client: returns (status, raw headers, body)
async fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "{} {} HTTP/1.1\r\nHost: testhost\r\nUser-Agent: nflow-test\r\nConnection: close\r\n\r\n",
        method, path
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("no status line");

    (status, head, body)
}

fn app_document() -> serde_json::Value {
    drawflow(vec![
        starter_node("1", "GET", "/users/:id", "2"),
        js_node(
            "2",
            "function main() { rsp({ id: vars.id, from: 'two' }, 200); next = ''; }",
            None,
        ),
        js_node(
            "3",
            "function main() { rsp({ from: 'three' }, 200); next = ''; }",
            None,
        ),
    ])
}

/// Body may be chunked (axum picks the encoding with `Connection: close`);
/// just check for a fragment.
fn body_contains(body: &[u8], needle: &str) -> bool {
    String::from_utf8_lossy(body).contains(needle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routes_and_sets_run_id_header() {
    let harness = build(app_document(), "", default_vm_config());
    let addr = serve(&harness).await;

    let (status, head, body) = request(addr, "GET", "/users/42").await;
    assert_eq!(status, 200);
    assert!(body_contains(&body, r#""id":"42""#));
    assert!(head.to_ascii_lowercase().contains("nflow-wid-1:"));
    assert!(head.to_ascii_lowercase().contains("set-cookie:"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unmatched_path_is_json_404() {
    let harness = build(app_document(), "", default_vm_config());
    let addr = serve(&harness).await;

    let (status, _head, body) = request(addr, "GET", "/nope").await;
    assert_eq!(status, 404);
    assert!(body_contains(&body, r#""code":404"#));
    assert!(body_contains(&body, "message"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn method_mismatch_is_404() {
    let harness = build(app_document(), "", default_vm_config());
    let addr = serve(&harness).await;

    let (status, _head, _body) = request(addr, "POST", "/users/42").await;
    assert_eq!(status, 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nfnext_segment_selects_entry_node() {
    let harness = build(app_document(), "", default_vm_config());
    let addr = serve(&harness).await;

    let (status, _head, body) = request(addr, "GET", "/nfnext/3/users/42").await;
    assert_eq!(status, 200);
    assert!(body_contains(&body, r#""from":"three""#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_reports_runtime_state() {
    let harness = build(app_document(), "", default_vm_config());
    let addr = serve(&harness).await;

    let (status, _head, body) = request(addr, "GET", "/health").await;
    assert_eq!(status, 200);
    assert!(body_contains(&body, r#""status":"ok""#));
    assert!(body_contains(&body, r#""app":"testapp""#));
    assert!(body_contains(&body, "vm_pool"));
    assert!(body_contains(&body, "tracker"));
}
