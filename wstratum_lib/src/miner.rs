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

//! One logical browser miner.
//!
//! The session sits between a downstream WebSocket and one upstream
//! connection, forwarding login/submit/keepalive requests and relaying
//! responses and jobs back. Donations owned by the session may take over
//! individual job turns; whichever job was delivered downstream last
//! decides where the next submit goes.

use crate::donation::{pick_turn, Donation};
use crate::error::Error;
use crate::messages::{Id, Job, LoginParams, LoginResult, Request, Response};
use crate::target::difficulty_to_target;
use crate::upstream::{
    RequestKind, SessionId, UpstreamEvent, UpstreamHandle,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Options fixed at session creation from the proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct MinerOptions {
    /// Force this difficulty on every job delivered downstream.
    pub diff: Option<u64>,
    /// Replace the client's wallet address on the upstream login.
    pub address: Option<String>,
    /// Replace the client's pool user on the upstream login; `address`
    /// wins when both are set.
    pub user: Option<String>,
}

/// Who the job last delivered downstream belongs to; submits follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Host,
    Donation(usize),
}

pub struct Miner {
    session_id: SessionId,
    upstream: UpstreamHandle,
    pass: String,
    options: MinerOptions,
    donations: Vec<Donation>,
    events_rx: mpsc::Receiver<(SessionId, UpstreamEvent)>,
    client_login: Option<String>,
    worker_id: Option<String>,
    job: Option<Job>,
    turn: Turn,
    accepted: u64,
    rejected: u64,
}

impl Miner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        upstream: UpstreamHandle,
        pass: String,
        options: MinerOptions,
        donations: Vec<Donation>,
        events_rx: mpsc::Receiver<(SessionId, UpstreamEvent)>,
    ) -> Self {
        Self {
            session_id,
            upstream,
            pass,
            options,
            donations,
            events_rx,
            client_login: None,
            worker_id: None,
            job: None,
            turn: Turn::Host,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Drive the session until either socket closes. Consumes the miner;
    /// all cleanup happens before returning.
    pub async fn run(self, socket: WebSocket) {
        let (ws_tx, ws_rx) = socket.split();
        self.drive(ws_tx, ws_rx).await;
    }

    async fn drive<W, R>(mut self, mut ws_tx: W, mut ws_rx: R)
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                message = ws_rx.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_downstream(&text, &mut ws_tx).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Miner {} closed its socket", self.session_id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Miner {} socket error: {}", self.session_id, e);
                            break;
                        }
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some((session_id, event)) => {
                            if self.handle_upstream(session_id, event, &mut ws_tx).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.teardown().await;
    }

    /// Unregister everywhere so the connection registries never hold a
    /// dead session.
    async fn teardown(&mut self) {
        self.upstream.unregister(self.session_id).await;
        for donation in &self.donations {
            donation.upstream.unregister(donation.session_id).await;
        }
        info!(
            "Miner {} closed ({} accepted, {} rejected)",
            self.session_id, self.accepted, self.rejected
        );
    }

    /// Handle one message from the browser. `Err` means the session is
    /// over; downstream protocol mistakes are logged and dropped instead.
    async fn handle_downstream<W>(&mut self, text: &str, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Miner {}: dropping malformed message: {}", self.session_id, e);
                return Ok(());
            }
        };

        match request.method.as_str() {
            "login" => self.forward_login(request, ws_tx).await,
            "submit" => self.forward_submit(request, ws_tx).await,
            "keepalived" => self.forward_keepalive(request, ws_tx).await,
            other => {
                debug!("Miner {}: ignoring method {}", self.session_id, other);
                Ok(())
            }
        }
    }

    async fn forward_login<W>(&mut self, request: Request, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let client_login = request
            .params
            .get("login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let agent = request
            .params
            .get("agent")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.client_login = Some(client_login.clone());

        let params = LoginParams {
            login: self
                .options
                .address
                .clone()
                .or_else(|| self.options.user.clone())
                .unwrap_or(client_login),
            pass: self.pass.clone(),
            agent,
        };
        let params = serde_json::to_value(&params)?;

        if let Err(e) = self
            .upstream
            .send(self.session_id, RequestKind::Login, request.id.clone(), params)
            .await
        {
            warn!("Miner {}: login send failed: {}", self.session_id, e);
            self.send_response(ws_tx, Response::new_err(request.id, "upstream connection closed"))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn forward_submit<W>(&mut self, mut request: Request, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let submitted_job = request.params.get("job_id").and_then(Value::as_str);
        if let Some(job) = &self.job {
            if submitted_job != Some(job.job_id.as_str()) {
                debug!(
                    "Miner {}: submit for job {:?}, current is {}",
                    self.session_id, submitted_job, job.job_id
                );
            }
        }

        // A submit answers whichever job was last delivered downstream.
        if let Turn::Donation(index) = self.turn {
            if let Some(donation) = self.donations.get(index) {
                if donation.alive {
                    if let Some(obj) = request.params.as_object_mut() {
                        obj.insert(
                            "id".to_string(),
                            Value::String(donation.worker_id.clone().unwrap_or_default()),
                        );
                    }
                    let result = donation
                        .upstream
                        .send(
                            donation.session_id,
                            RequestKind::Submit,
                            request.id.clone(),
                            request.params,
                        )
                        .await;
                    if let Err(e) = result {
                        debug!("Donation submit failed, answering locally: {}", e);
                        self.send_response(
                            ws_tx,
                            Response::new_err(request.id, "upstream connection closed"),
                        )
                        .await?;
                    }
                    return Ok(());
                }
            }
        }

        let Some(worker_id) = self.worker_id.clone() else {
            debug!(
                "Miner {}: {}",
                self.session_id,
                Error::UnauthenticatedSubmit
            );
            return self
                .send_response(ws_tx, Response::new_err(request.id, "unauthenticated"))
                .await;
        };

        if let Some(obj) = request.params.as_object_mut() {
            obj.insert("id".to_string(), Value::String(worker_id));
        }

        if let Err(e) = self
            .upstream
            .send(
                self.session_id,
                RequestKind::Submit,
                request.id.clone(),
                request.params,
            )
            .await
        {
            warn!("Miner {}: submit send failed: {}", self.session_id, e);
            self.send_response(ws_tx, Response::new_err(request.id, "upstream connection closed"))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn forward_keepalive<W>(&mut self, mut request: Request, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let Some(worker_id) = self.worker_id.clone() else {
            // Nothing to keep alive upstream yet.
            return self
                .send_response(
                    ws_tx,
                    Response::new_ok(request.id, serde_json::json!({ "status": "KEEPALIVED" })),
                )
                .await;
        };

        if let Some(obj) = request.params.as_object_mut() {
            obj.insert("id".to_string(), Value::String(worker_id));
        }
        self.upstream
            .send(
                self.session_id,
                RequestKind::Keepalive,
                request.id,
                request.params,
            )
            .await
            .ok();
        Ok(())
    }

    /// Handle one event from an upstream connection, ours or a
    /// donation's. `Err` ends the session.
    async fn handle_upstream<W>(
        &mut self,
        session_id: SessionId,
        event: UpstreamEvent,
        ws_tx: &mut W,
    ) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        if session_id == self.session_id {
            return self.handle_own_event(event, ws_tx).await;
        }
        self.handle_donation_event(session_id, event, ws_tx).await
    }

    async fn handle_own_event<W>(&mut self, event: UpstreamEvent, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        match event {
            UpstreamEvent::Response {
                kind: RequestKind::Login,
                original_id,
                mut result,
                error,
            } => {
                if error.is_none() {
                    if let Some(result) = result.as_mut() {
                        self.absorb_login_result(result);
                    }
                }
                self.send_response(
                    ws_tx,
                    Response {
                        id: original_id,
                        result,
                        error,
                    },
                )
                .await
            }
            UpstreamEvent::Response {
                kind: RequestKind::Submit,
                original_id,
                result,
                error,
            } => {
                if error.is_some() {
                    self.rejected += 1;
                    debug!(
                        "Miner {}: share rejected by pool: {:?}",
                        self.session_id, error
                    );
                } else {
                    self.accepted += 1;
                }
                self.send_response(
                    ws_tx,
                    Response {
                        id: original_id,
                        result,
                        error,
                    },
                )
                .await
            }
            UpstreamEvent::Response {
                kind: RequestKind::Keepalive,
                original_id,
                result,
                error,
            } => {
                self.send_response(
                    ws_tx,
                    Response {
                        id: original_id,
                        result,
                        error,
                    },
                )
                .await
            }
            UpstreamEvent::Job(job) => self.deliver_job(job, ws_tx).await,
            UpstreamEvent::Closed => {
                info!(
                    "Miner {}: upstream connection closed, ending session",
                    self.session_id
                );
                Err(Error::SocketClosed)
            }
        }
    }

    async fn handle_donation_event<W>(
        &mut self,
        session_id: SessionId,
        event: UpstreamEvent,
        ws_tx: &mut W,
    ) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let Some(index) = self
            .donations
            .iter()
            .position(|donation| donation.session_id == session_id)
        else {
            return Ok(());
        };

        match event {
            UpstreamEvent::Response {
                kind: RequestKind::Login,
                result,
                error,
                ..
            } => {
                if let Some(error) = error {
                    warn!("Donation login failed: {:?}", error);
                    self.donations[index].alive = false;
                    return Ok(());
                }
                if let Some(result) = result {
                    match serde_json::from_value::<LoginResult>(result) {
                        Ok(login) => {
                            let donation = &mut self.donations[index];
                            if donation.worker_id.is_none() {
                                donation.worker_id = Some(login.id);
                            }
                            if let Some(job) = login.job {
                                donation.job = Some(job);
                            }
                        }
                        Err(e) => debug!("Donation login result in unexpected shape: {}", e),
                    }
                }
                Ok(())
            }
            UpstreamEvent::Response {
                kind: RequestKind::Submit,
                original_id,
                result,
                error,
            } => {
                if error.is_some() {
                    self.donations[index].rejected += 1;
                } else {
                    self.donations[index].accepted += 1;
                }
                self.send_response(
                    ws_tx,
                    Response {
                        id: original_id,
                        result,
                        error,
                    },
                )
                .await
            }
            UpstreamEvent::Response {
                kind: RequestKind::Keepalive,
                ..
            } => Ok(()),
            UpstreamEvent::Job(job) => {
                self.donations[index].job = Some(job.clone());
                // Refresh the browser only while this donation holds the
                // turn; otherwise the job waits for its slot.
                if self.turn == Turn::Donation(index) {
                    self.job = Some(job.clone());
                    self.send_job(ws_tx, &job).await?;
                }
                Ok(())
            }
            UpstreamEvent::Closed => {
                debug!("Donation upstream closed");
                self.donations[index].alive = false;
                if self.turn == Turn::Donation(index) {
                    self.turn = Turn::Host;
                }
                Ok(())
            }
        }
    }

    /// Take the worker id and initial job out of a login result, leaving
    /// the client-visible identity and a possibly rewritten target in
    /// place.
    fn absorb_login_result(&mut self, result: &mut Value) {
        let mut login = match serde_json::from_value::<LoginResult>(result.clone()) {
            Ok(login) => login,
            Err(e) => {
                debug!(
                    "Miner {}: login result in unexpected shape: {}",
                    self.session_id, e
                );
                return;
            }
        };

        if self.worker_id.is_none() {
            self.worker_id = Some(login.id.clone());
        }

        // The browser keeps seeing the identity it logged in with.
        if let (Some(echoed), Some(client_login)) =
            (login.extra.get_mut("login"), &self.client_login)
        {
            *echoed = Value::String(client_login.clone());
        }

        if let Some(job) = login.job.as_mut() {
            if let Some(diff) = self.options.diff {
                job.target = difficulty_to_target(diff);
            }
            self.turn = Turn::Host;
            self.job = Some(job.clone());
        }

        match serde_json::to_value(&login) {
            Ok(rewritten) => *result = rewritten,
            Err(e) => debug!(
                "Miner {}: could not reserialize login result: {}",
                self.session_id, e
            ),
        }
    }

    /// Deliver a job from the host's own pool, unless a donation has
    /// earned the turn.
    async fn deliver_job<W>(&mut self, mut job: Job, ws_tx: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let now = Instant::now();
        if let Some(index) = pick_turn(&mut self.donations, now) {
            let donation = &mut self.donations[index];
            if let Some(donation_job) = donation.job.clone() {
                donation.settle();
                self.turn = Turn::Donation(index);
                self.job = Some(donation_job.clone());
                return self.send_job(ws_tx, &donation_job).await;
            }
        }

        if let Some(diff) = self.options.diff {
            job.target = difficulty_to_target(diff);
        }
        self.turn = Turn::Host;
        self.job = Some(job.clone());
        self.send_job(ws_tx, &job).await
    }

    async fn send_job<W>(&mut self, ws_tx: &mut W, job: &Job) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let notification = Request::new_job_notification(job);
        self.send_json(ws_tx, &serde_json::to_value(&notification)?)
            .await
    }

    async fn send_response<W>(&mut self, ws_tx: &mut W, response: Response) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        self.send_json(ws_tx, &serde_json::to_value(&response)?)
            .await
    }

    async fn send_json<W>(&mut self, ws_tx: &mut W, value: &Value) -> Result<(), Error>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let text = serde_json::to_string(value)?;
        ws_tx
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::SocketError(std::io::Error::other(e)))
    }
}
