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

//! Message schema shared by the two JSON-RPC-like dialects the proxy
//! mediates between: the browser-facing WebSocket dialect and the
//! newline-framed pool dialect. The shapes are identical; only the id
//! space differs, since ids on the pool side are proxy-assigned integers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id as clients are allowed to send it. The proxy never
/// interprets a client id, it only echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Num(u64),
    Str(String),
}

/// A request in either dialect. `id` is absent on server-push
/// notifications such as `job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: Id, method: &str, params: Value) -> Self {
        Self {
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// A server-push `job` notification carrying the job as params.
    pub fn new_job_notification(job: &Job) -> Self {
        Self {
            id: None,
            method: "job".to_string(),
            params: serde_json::to_value(job).unwrap_or(Value::Null),
        }
    }
}

/// A response in either dialect. Both `result` and `error` are always
/// serialized; pools treat a missing field and a null field the same,
/// but the browser dialect expects both keys present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<Id>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl Response {
    pub fn new_ok(id: Option<Id>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn new_err(id: Option<Id>, message: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(serde_json::json!({ "code": -1, "message": message })),
        }
    }
}

/// Permissive parse target for inbound pool lines, which may be a
/// response to one of our requests or an unsolicited notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Id>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// A unit of work pushed by the pool. Pools attach fields the proxy does
/// not interpret (`algo`, `height`, `seed_hash`, ...); those pass through
/// untouched via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub blob: String,
    pub target: String,
    /// Worker id the job is addressed to, when the pool includes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginParams {
    pub login: String,
    pub pass: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// The result object of a successful login: the pool-issued worker id
/// and the first job to work on. Pools add fields of their own (`status`,
/// `extensions`, an echoed `login`, ...); those ride along in `extra` so
/// forwarding a login result loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    /// Worker id to attach to every subsequent submit.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitParams {
    /// Worker id issued by the pool at login. Whatever the client put
    /// here is overwritten before the request goes upstream.
    #[serde(default)]
    pub id: Option<String>,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}
