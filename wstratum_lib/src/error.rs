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

use std::fmt;

/// Error types for the proxy, used to propagate failures between the
/// pool, upstream connections and miner sessions.
#[derive(Debug)]
pub enum Error {
    /// The upstream connection is closed and no longer accepts sends.
    SocketClosed,
    SocketError(std::io::Error),
    MalformedMessage(String),
    UnauthenticatedSubmit,
    UnknownResponseId(u64),
    /// Registering a session on a connection that is already at capacity.
    /// The pool checks availability before assignment, so this is asserted
    /// rather than expected.
    CapacityExceeded,
    UnknownSession(u64),
    ConfigError(String),
    TlsError(String),
    BindError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketClosed => write!(f, "upstream connection closed"),
            Self::SocketError(err) => write!(f, "socket error: {}", err),
            Self::MalformedMessage(msg) => write!(f, "malformed message: {}", msg),
            Self::UnauthenticatedSubmit => write!(f, "submit before login completed"),
            Self::UnknownResponseId(id) => write!(f, "response with unknown id: {}", id),
            Self::CapacityExceeded => write!(f, "connection capacity exceeded"),
            Self::UnknownSession(id) => write!(f, "unknown session: {}", id),
            Self::ConfigError(msg) => write!(f, "configuration error: {}", msg),
            Self::TlsError(msg) => write!(f, "TLS error: {}", msg),
            Self::BindError(msg) => write!(f, "bind failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::SocketError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}
