//! Integration tests for deferred (async) results

use sagewire::result::{AsyncResult, HttpResult};
use sagewire::router::RouteTable;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

mod common;
use common::{send_request, TestServer};

fn routes(completions: Arc<AtomicUsize>) -> RouteTable {
    let mut routes = RouteTable::new();
    routes
        .get("/slow", move |_ctx| {
            let completions = Arc::clone(&completions);
            Ok(AsyncResult::new(move |_ctx| {
                may::coroutine::sleep(Duration::from_millis(300));
                completions.fetch_add(1, Ordering::SeqCst);
                Ok(HttpResult::ok_text("slow").as_text())
            })
            .with("X-Deferred", "yes")
            .with("Cache-Control", "no-store"))
        })
        .get("/fast", |_ctx| Ok(HttpResult::ok_text("fast").as_text()))
        .get("/broken", |_ctx| {
            Ok(AsyncResult::new(|_ctx| -> anyhow::Result<HttpResult> {
                Err(anyhow::anyhow!("backend timed out"))
            }))
        })
        .get("/exploding", |_ctx| {
            Ok(AsyncResult::new(|_ctx| -> anyhow::Result<HttpResult> {
                panic!("deferred panic")
            }))
        });
    routes
}

#[test]
fn test_async_result_does_not_block_other_requests() {
    let completions = Arc::new(AtomicUsize::new(0));
    let server = TestServer::start(routes(Arc::clone(&completions)));
    let addr = server.addr();
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    let slow_tx = tx.clone();
    let slow = thread::spawn(move || {
        let resp = send_request(&addr, "GET /slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        slow_tx.send("slow").unwrap();
        resp
    });
    thread::sleep(Duration::from_millis(50));
    let fast = send_request(&addr, "GET /fast HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    tx.send("fast").unwrap();
    assert_eq!(fast.status, 200);
    assert_eq!(completions.load(Ordering::SeqCst), 0, "fast request waited for the async one");

    let slow = slow.join().unwrap();
    assert_eq!(rx.recv().unwrap(), "fast");
    assert_eq!(rx.recv().unwrap(), "slow");
    assert!(start.elapsed() >= Duration::from_millis(300));

    assert_eq!(slow.status, 200);
    assert_eq!(slow.text(), "slow");
    assert_eq!(slow.header("X-Deferred"), Some("yes"));
    assert_eq!(slow.header("Cache-Control"), Some("no-store"));
    assert_eq!(slow.header("Content-Type"), Some("text/plain"));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_failures_become_500() {
    let server = TestServer::start(routes(Arc::new(AtomicUsize::new(0))));
    let resp = send_request(&server.addr(), "GET /broken HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.status, 500);
    assert_eq!(resp.json()["error"], "backend timed out");

    let resp = send_request(&server.addr(), "GET /exploding HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.status, 500);
}

#[test]
fn test_connection_is_reused_after_async_result() {
    let server = TestServer::start(routes(Arc::new(AtomicUsize::new(0))));
    let raw = common::send_raw(
        &server.addr(),
        b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\nGET /fast HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let responses = common::parse_responses(&raw);
    let bodies: Vec<String> = responses.iter().map(|r| r.text()).collect();
    assert_eq!(bodies, vec!["slow", "fast"]);
}
