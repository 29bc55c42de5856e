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

//! A minimal in-process pool speaking the newline-framed dialect, used
//! as the upstream for the end-to-end tests.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub struct FakePool {
    pub addr: SocketAddr,
    /// Every request line the pool parsed, in arrival order.
    pub requests: Arc<Mutex<Vec<Value>>>,
}

/// Logins are answered with sequential worker ids `w1`, `w2`, ... and an
/// embedded job `j1`, `j2`, ... with the given target. Submits and
/// keepalives are acknowledged.
pub async fn spawn_fake_pool(target: &str) -> FakePool {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let workers = Arc::new(AtomicU64::new(0));
    let target = target.to_string();

    let requests_for_task = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let requests = requests_for_task.clone();
            let workers = workers.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = socket.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(request) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    requests.lock().await.push(request.clone());

                    let id = request.get("id").cloned().unwrap_or(Value::Null);
                    let response = match request.get("method").and_then(Value::as_str) {
                        Some("login") => {
                            let n = workers.fetch_add(1, Ordering::SeqCst) + 1;
                            json!({
                                "id": id,
                                "result": {
                                    "id": format!("w{}", n),
                                    "job": {
                                        "job_id": format!("j{}", n),
                                        "blob": "0101",
                                        "target": target,
                                    },
                                    "status": "OK",
                                },
                                "error": null,
                            })
                        }
                        Some("submit") => json!({
                            "id": id,
                            "result": { "status": "OK" },
                            "error": null,
                        }),
                        Some("keepalived") => json!({
                            "id": id,
                            "result": { "status": "KEEPALIVED" },
                            "error": null,
                        }),
                        _ => continue,
                    };

                    let line = format!("{}\n", response);
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    FakePool { addr, requests }
}

impl FakePool {
    /// Wait until some recorded request satisfies the predicate.
    pub async fn wait_for<F>(&self, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..100 {
            {
                let requests = self.requests.lock().await;
                if let Some(found) = requests.iter().find(|request| predicate(request)) {
                    return found.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("fake pool never saw the expected request");
    }

    pub async fn request_count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|request| request.get("method").and_then(Value::as_str) == Some(method))
            .count()
    }
}
