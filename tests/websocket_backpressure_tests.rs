//! A WebSocket peer that stops reading must not stall the rest of the engine
//!
//! Runs on a single may worker thread, so this file holds one test and stays
//! its own test binary.

use sagewire::result::HttpResult;
use sagewire::router::RouteTable;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::ws::{WsClient, PING};
use common::{eventually, send_request, TestServer};

#[test]
fn test_stalled_reader_does_not_block_other_connections() {
    may::config().set_workers(1);

    let mut routes = RouteTable::new();
    routes.get("/x", |_ctx| Ok(HttpResult::ok_text("hi").as_text()));
    let server = TestServer::start(routes);

    let mut client = WsClient::connect(&server.addr(), "/ws");
    assert!(eventually(|| server.dispatcher().channels().clients("/ws").len() == 1));

    // far more than loopback socket buffers hold, so the publisher parks mid-write
    let dispatcher = Arc::clone(server.dispatcher());
    let _publisher = may::go!(move || {
        dispatcher.publish_binary("/ws", &vec![0u8; 64 << 20]);
    });
    std::thread::sleep(Duration::from_millis(200));

    // the pong queues behind the publisher on the same connection
    client.send(PING, b"are you there");
    std::thread::sleep(Duration::from_millis(200));

    let resp = send_request(&server.addr(), "GET /x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi");
}
