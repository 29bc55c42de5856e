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

//! One multiplexed TCP/TLS session to a pool.
//!
//! The connection is an actor owning the socket and its request
//! registries. Sessions talk to it through an [`UpstreamHandle`]; the
//! actor rewrites outbound request ids into its own integer id space and
//! restores the original id when the matching response arrives, so many
//! logical miners can share one socket without their requests colliding.

use crate::error::Error;
use crate::messages::{Envelope, Id, Job, Request};
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Maximum accepted line length from a pool, to bound buffering.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Buffer sizes for the command mailbox and per-session event channels.
const CMD_CHANNEL_SIZE: usize = 64;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Miner,
    Donation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Login,
    Submit,
    Keepalive,
}

impl RequestKind {
    fn method(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Submit => "submit",
            Self::Keepalive => "keepalived",
        }
    }
}

/// Events fanned out to sessions, tagged with the session they belong to
/// so a miner can multiplex its own events and its donations' over one
/// channel.
#[derive(Debug)]
pub enum UpstreamEvent {
    Response {
        kind: RequestKind,
        original_id: Option<Id>,
        result: Option<Value>,
        error: Option<Value>,
    },
    Job(Job),
    Closed,
}

pub type EventSender = mpsc::Sender<(SessionId, UpstreamEvent)>;

enum Command {
    Register {
        session_id: SessionId,
        role: SessionRole,
        events: EventSender,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Unregister {
        session_id: SessionId,
    },
    Send {
        session_id: SessionId,
        kind: RequestKind,
        original_id: Option<Id>,
        params: Value,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Counts {
        resp: oneshot::Sender<(usize, usize)>,
    },
    Shutdown,
}

/// A handle to one upstream connection actor. Cloned freely; the actor
/// dies when its socket does, after which every call returns
/// [`Error::SocketClosed`].
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    pub id: u64,
    pub host: String,
    pub port: u16,
    /// Connections created for donation sessions are excluded from the
    /// reported connection count.
    pub donation: bool,
    cmd_tx: mpsc::Sender<Command>,
}

impl UpstreamHandle {
    pub async fn register(
        &self,
        session_id: SessionId,
        role: SessionRole,
        events: EventSender,
    ) -> Result<(), Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                session_id,
                role,
                events,
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::SocketClosed)?;
        resp_rx.await.map_err(|_| Error::SocketClosed)?
    }

    pub async fn unregister(&self, session_id: SessionId) {
        let _ = self.cmd_tx.send(Command::Unregister { session_id }).await;
    }

    /// Enqueue a request for the pool. The caller's `original_id` is
    /// replaced on the wire and restored on the response event.
    pub async fn send(
        &self,
        session_id: SessionId,
        kind: RequestKind,
        original_id: Option<Id>,
        params: Value,
    ) -> Result<(), Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                session_id,
                kind,
                original_id,
                params,
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::SocketClosed)?;
        resp_rx.await.map_err(|_| Error::SocketClosed)?
    }

    /// Current `(miners, donations)` registry sizes.
    pub async fn counts(&self) -> Result<(usize, usize), Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Counts { resp: resp_tx })
            .await
            .map_err(|_| Error::SocketClosed)?;
        resp_rx.await.map_err(|_| Error::SocketClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

struct SessionEntry {
    login: String,
    worker_id: Option<String>,
    events: EventSender,
}

struct PendingRequest {
    session_id: SessionId,
    original_id: Option<Id>,
    kind: RequestKind,
}

struct UpstreamConnection {
    id: u64,
    miners: HashMap<SessionId, SessionEntry>,
    donations: HashMap<SessionId, SessionEntry>,
    pending: HashMap<u64, PendingRequest>,
    worker_id_by_login: HashMap<String, String>,
    next_request_id: u64,
    max_sessions: usize,
}

/// Spawn a connection actor over an already-dialed stream and return its
/// handle.
pub fn spawn_upstream<S>(
    id: u64,
    host: String,
    port: u16,
    donation: bool,
    max_sessions: usize,
    stream: S,
) -> UpstreamHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
    let handle = UpstreamHandle {
        id,
        host: host.clone(),
        port,
        donation,
        cmd_tx,
    };

    let connection = UpstreamConnection {
        id,
        miners: HashMap::new(),
        donations: HashMap::new(),
        pending: HashMap::new(),
        worker_id_by_login: HashMap::new(),
        next_request_id: 1,
        max_sessions,
    };

    tokio::spawn(async move {
        connection.run(host, port, stream, cmd_rx).await;
    });

    handle
}

impl UpstreamConnection {
    async fn run<S>(
        mut self,
        host: String,
        port: u16,
        stream: S,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut framed =
            FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            debug!("Upstream connection {} to {}:{} shutting down", self.id, host, port);
                            self.close();
                            break;
                        }
                        Some(Command::Register { session_id, role, events, resp }) => {
                            let _ = resp.send(self.register(session_id, role, events));
                        }
                        Some(Command::Unregister { session_id }) => {
                            self.unregister(session_id);
                        }
                        Some(Command::Send { session_id, kind, original_id, params, resp }) => {
                            match self.rewrite(session_id, kind, original_id, params) {
                                Ok(line) => {
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        warn!("Write to {}:{} failed: {}", host, port, e);
                                        let _ = resp.send(Err(Error::SocketError(e)));
                                        self.close();
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        warn!("Flush to {}:{} failed: {}", host, port, e);
                                        let _ = resp.send(Err(Error::SocketError(e)));
                                        self.close();
                                        break;
                                    }
                                    let _ = resp.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = resp.send(Err(e));
                                }
                            }
                        }
                        Some(Command::Counts { resp }) => {
                            let _ = resp.send((self.miners.len(), self.donations.len()));
                        }
                    }
                }
                line = framed.next() => {
                    match line {
                        Some(Ok(line)) => {
                            if line.is_empty() {
                                continue;
                            }
                            self.handle_line(&line);
                        }
                        Some(Err(e)) => {
                            warn!("Read error on {}:{}: {}", host, port, e);
                            self.close();
                            break;
                        }
                        None => {
                            info!("Pool {}:{} closed connection {}", host, port, self.id);
                            self.close();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn entry(&self, session_id: SessionId) -> Option<&SessionEntry> {
        self.miners
            .get(&session_id)
            .or_else(|| self.donations.get(&session_id))
    }

    fn register(
        &mut self,
        session_id: SessionId,
        role: SessionRole,
        events: EventSender,
    ) -> Result<(), Error> {
        let registry = match role {
            SessionRole::Miner => &mut self.miners,
            SessionRole::Donation => &mut self.donations,
        };
        if registry.len() >= self.max_sessions {
            return Err(Error::CapacityExceeded);
        }
        registry.insert(
            session_id,
            SessionEntry {
                login: String::new(),
                worker_id: None,
                events,
            },
        );
        Ok(())
    }

    /// Removes the session and every in-flight request it still owns.
    fn unregister(&mut self, session_id: SessionId) {
        self.miners.remove(&session_id);
        self.donations.remove(&session_id);
        self.pending
            .retain(|_, pending| pending.session_id != session_id);
    }

    /// Replace the caller's request id with a connection-unique integer,
    /// record the mapping, and serialize the wire line.
    fn rewrite(
        &mut self,
        session_id: SessionId,
        kind: RequestKind,
        original_id: Option<Id>,
        mut params: Value,
    ) -> Result<String, Error> {
        let entry = self
            .miners
            .get_mut(&session_id)
            .or_else(|| self.donations.get_mut(&session_id))
            .ok_or(Error::UnknownSession(session_id))?;

        match kind {
            RequestKind::Login => {
                if let Some(login) = params.get("login").and_then(Value::as_str) {
                    entry.login = login.to_string();
                }
            }
            RequestKind::Submit | RequestKind::Keepalive => {
                // The worker id issued at login must ride on every
                // follow-up request.
                let missing = params.get("id").and_then(Value::as_str).is_none();
                if missing {
                    let worker_id = entry
                        .worker_id
                        .clone()
                        .or_else(|| self.worker_id_by_login.get(&entry.login).cloned());
                    if let (Some(worker_id), Some(obj)) = (worker_id, params.as_object_mut()) {
                        obj.insert("id".to_string(), Value::String(worker_id));
                    }
                }
            }
        }

        let internal_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(
            internal_id,
            PendingRequest {
                session_id,
                original_id,
                kind,
            },
        );

        let request = Request::new(Id::Num(internal_id), kind.method(), params);
        Ok(format!("{}\n", serde_json::to_string(&request)?))
    }

    fn handle_line(&mut self, line: &str) {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed line from pool: {}", e);
                return;
            }
        };

        if let Some(Id::Num(internal_id)) = &envelope.id {
            if let Some(pending) = self.pending.remove(internal_id) {
                self.dispatch_response(pending, envelope);
                return;
            }
        }

        match envelope.method.as_deref() {
            Some("job") => self.dispatch_job(envelope.params.unwrap_or(Value::Null)),
            Some(method) => debug!("Ignoring upstream notification: {}", method),
            None => {
                let unknown = match &envelope.id {
                    Some(Id::Num(n)) => *n,
                    _ => 0,
                };
                warn!(
                    "Connection {}: {}",
                    self.id,
                    Error::UnknownResponseId(unknown)
                );
            }
        }
    }

    fn dispatch_response(&mut self, pending: PendingRequest, envelope: Envelope) {
        if pending.kind == RequestKind::Login && envelope.error.is_none() {
            if let Some(worker_id) = envelope
                .result
                .as_ref()
                .and_then(|result| result.get("id"))
                .and_then(Value::as_str)
            {
                if let Some(entry) = self
                    .miners
                    .get_mut(&pending.session_id)
                    .or_else(|| self.donations.get_mut(&pending.session_id))
                {
                    // Worker ids never change once issued.
                    if entry.worker_id.is_none() {
                        entry.worker_id = Some(worker_id.to_string());
                    }
                    if !entry.login.is_empty() {
                        self.worker_id_by_login
                            .insert(entry.login.clone(), worker_id.to_string());
                    }
                }
            }
        }

        self.deliver(
            pending.session_id,
            UpstreamEvent::Response {
                kind: pending.kind,
                original_id: pending.original_id,
                result: envelope.result,
                error: envelope.error,
            },
        );
    }

    /// Route a `job` notification to the session whose worker id the
    /// pool addressed; jobs for unknown workers are dropped.
    fn dispatch_job(&mut self, params: Value) {
        let job: Job = match serde_json::from_value(params) {
            Ok(job) => job,
            Err(e) => {
                warn!("Dropping malformed job from pool: {}", e);
                return;
            }
        };
        let Some(worker_id) = job.id.clone() else {
            debug!("Dropping job without worker id on connection {}", self.id);
            return;
        };

        let session_id = self
            .miners
            .iter()
            .chain(self.donations.iter())
            .find(|(_, entry)| entry.worker_id.as_deref() == Some(worker_id.as_str()))
            .map(|(session_id, _)| *session_id);

        match session_id {
            Some(session_id) => self.deliver(session_id, UpstreamEvent::Job(job)),
            None => debug!(
                "Dropping job for unknown worker {} on connection {}",
                worker_id, self.id
            ),
        }
    }

    fn deliver(&mut self, session_id: SessionId, event: UpstreamEvent) {
        let Some(entry) = self.entry(session_id) else {
            return;
        };
        if entry.events.try_send((session_id, event)).is_err() {
            // A session that cannot take events is as good as gone.
            warn!(
                "Session {} is not draining its events, dropping it",
                session_id
            );
            self.unregister(session_id);
        }
    }

    /// Fail every outstanding request, notify every session, and clear
    /// the registries. No further sends are accepted once this runs.
    fn close(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, request) in pending {
            self.deliver(
                request.session_id,
                UpstreamEvent::Response {
                    kind: request.kind,
                    original_id: request.original_id,
                    result: None,
                    error: Some(serde_json::json!({
                        "code": -1,
                        "message": "upstream connection closed",
                    })),
                },
            );
        }

        let session_ids: Vec<SessionId> = self
            .miners
            .keys()
            .chain(self.donations.keys())
            .copied()
            .collect();
        for session_id in session_ids {
            self.deliver(session_id, UpstreamEvent::Closed);
        }
        self.miners.clear();
        self.donations.clear();
    }
}
