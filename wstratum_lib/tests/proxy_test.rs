// Copyright (C) 2024, 2025 Wstratum Developers (see AUTHORS)
//
// This file is part of Wstratum
//
// Wstratum is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wstratum is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Wstratum. If not, see <https://www.gnu.org/licenses/>.

mod common;

use common::spawn_fake_pool;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use wstratum_lib::config::Config;
use wstratum_lib::proxy::ProxyServer;
use wstratum_lib::target::difficulty_to_target;
use wstratum_lib::upstream::SessionRole;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_ws(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn base_config(pool_addr: std::net::SocketAddr) -> Config {
    Config::default()
        .with_host(pool_addr.ip().to_string())
        .with_port(pool_addr.port())
        .with_listen_hostname("127.0.0.1".to_string())
        .with_listen_port(0)
        .with_purge_interval(0)
}

#[tokio::test]
async fn test_login_roundtrip_preserves_client_id() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "x"}}),
    )
    .await;

    let response = recv_json(&mut ws).await;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["result"]["id"], json!("w1"));
    assert_eq!(response["result"]["job"]["job_id"], json!("j1"));
    assert_eq!(response["result"]["job"]["target"], json!("ffff0000"));

    // The pool saw the client's login and the configured pass.
    let login = pool
        .wait_for(|request| request["method"] == json!("login"))
        .await;
    assert_eq!(login["params"]["login"], json!("A"));
    assert_eq!(login["params"]["pass"], json!("x"));

    server.kill().await;
}

#[tokio::test]
async fn test_submit_carries_server_issued_worker_id() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "x"}}),
    )
    .await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"id": 2, "method": "submit", "params": {
            "id": "whatever-the-client-says",
            "job_id": "j1",
            "nonce": "deadbeef",
            "result": "00ff",
        }}),
    )
    .await;

    let response = recv_json(&mut ws).await;
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["result"]["status"], json!("OK"));

    let submit = pool
        .wait_for(|request| request["method"] == json!("submit"))
        .await;
    assert_eq!(submit["params"]["id"], json!("w1"));

    server.kill().await;
}

#[tokio::test]
async fn test_submit_before_login_fails_locally() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "submit", "params": {
            "job_id": "j1", "nonce": "00", "result": "00",
        }}),
    )
    .await;

    let response = recv_json(&mut ws).await;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["error"]["message"], json!("unauthenticated"));
    assert_eq!(pool.request_count("submit").await, 0);

    server.kill().await;
}

#[tokio::test]
async fn test_difficulty_override_rewrites_target() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).with_diff(5000).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "x"}}),
    )
    .await;

    let response = recv_json(&mut ws).await;
    assert_eq!(
        response["result"]["job"]["target"],
        json!(difficulty_to_target(5000))
    );

    server.kill().await;
}

#[tokio::test]
async fn test_address_override_hidden_from_client() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(
        base_config(pool.addr)
            .with_address("proxy-wallet".to_string())
            .proxy,
    );
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "client-wallet", "pass": "x"}}),
    )
    .await;
    recv_json(&mut ws).await;

    let login = pool
        .wait_for(|request| request["method"] == json!("login"))
        .await;
    assert_eq!(login["params"]["login"], json!("proxy-wallet"));

    server.kill().await;
}

#[tokio::test]
async fn test_capacity_splits_miners_across_connections() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(
        base_config(pool.addr)
            .with_max_miners_per_connection(2)
            .proxy,
    );
    let addr = server.listen().await.unwrap();

    let mut sockets = Vec::new();
    for n in 1..=3 {
        let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
        send_json(
            &mut ws,
            json!({"id": n, "method": "login", "params": {"login": format!("miner-{}", n), "pass": "x"}}),
        )
        .await;
        recv_json(&mut ws).await;
        sockets.push(ws);
    }

    let stats: Value = reqwest::get(format!("http://{}/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats, json!({"miners": 3, "connections": 2}));

    server.kill().await;
}

#[tokio::test]
async fn test_dynamic_pool_dials_the_queried_host() {
    let default_pool = spawn_fake_pool("ffff0000").await;
    let other_pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(default_pool.addr).with_dynamic_pool(true).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!(
        "ws://{}/?pool=127.0.0.1:{}:sekret",
        addr,
        other_pool.addr.port()
    ))
    .await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "ignored"}}),
    )
    .await;
    recv_json(&mut ws).await;

    let login = other_pool
        .wait_for(|request| request["method"] == json!("login"))
        .await;
    assert_eq!(login["params"]["pass"], json!("sekret"));
    assert_eq!(default_pool.request_count("login").await, 0);

    server.kill().await;
}

#[tokio::test]
async fn test_purge_keeps_one_empty_connection_per_key() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(
        base_config(pool.addr)
            .with_max_miners_per_connection(1)
            .proxy,
    );

    let host = pool.addr.ip().to_string();
    let first = server.get_connection(&host, pool.addr.port(), false).await.unwrap();

    // Occupy the first connection so the next request opens a second one.
    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(16);
    first.register(1, SessionRole::Miner, events_tx).await.unwrap();
    let second = server.get_connection(&host, pool.addr.port(), false).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(server.stats().await.connections, 2);

    // Both empty now; purge keeps exactly one.
    first.unregister(1).await;
    server.purge().await;
    let stats = server.stats().await;
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.miners, 0);

    // Purging again changes nothing.
    server.purge().await;
    assert_eq!(server.stats().await.connections, 1);

    server.kill().await;
}

#[tokio::test]
async fn test_kill_closes_downstream_sockets() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "x"}}),
    )
    .await;
    recv_json(&mut ws).await;

    server.kill().await;

    // The session unwinds; the client observes its socket closing.
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "socket never closed after kill");
}

#[tokio::test]
async fn test_upstream_close_propagates_to_miner() {
    let pool = spawn_fake_pool("ffff0000").await;
    let server = ProxyServer::new(base_config(pool.addr).proxy);
    let addr = server.listen().await.unwrap();

    let mut ws = connect_ws(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        json!({"id": 1, "method": "login", "params": {"login": "A", "pass": "x"}}),
    )
    .await;
    recv_json(&mut ws).await;

    // Kill only the upstream connection; the miner must observe failure
    // through its own socket closing.
    let handle = server
        .get_connection(&pool.addr.ip().to_string(), pool.addr.port(), false)
        .await
        .unwrap();
    handle.shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "socket never closed after upstream loss");

    server.kill().await;
}
