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

use crate::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Anything an upstream connection can be framed over.
pub trait PoolStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PoolStream for T {}

/// Dials upstream pool sockets, plain TCP or TLS with webpki roots.
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
    ) -> Result<Box<dyn PoolStream>, Error> {
        let stream = TcpStream::connect((host, port)).await?;
        // Shares are latency sensitive.
        stream.set_nodelay(true).ok();
        debug!("Connected to {}:{} (ssl: {})", host, port, ssl);

        if !ssl {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::TlsError(format!("invalid server name: {}", host)))?;
        let tls_stream = self.tls.connect(server_name, stream).await?;
        Ok(Box::new(tls_stream))
    }
}
