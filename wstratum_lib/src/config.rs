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

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Default upstream pool host
    #[serde(default = "default_host")]
    pub host: String,
    /// Default upstream pool port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pass sent on every upstream login
    #[serde(default = "default_pass")]
    pub pass: String,
    /// Dial upstream pools over TLS
    #[serde(default)]
    pub ssl: bool,
    /// Replace the wallet address clients log in with
    #[serde(default)]
    pub address: Option<String>,
    /// Replace the pool user clients log in with; `address` wins when both are set
    #[serde(default)]
    pub user: Option<String>,
    /// Force this difficulty on every job delivered downstream
    #[serde(default)]
    pub diff: Option<u64>,
    /// Honor the `?pool=host:port:pass` query parameter on new WebSockets
    #[serde(default)]
    pub dynamic_pool: bool,
    /// Per-role session cap on one upstream connection
    #[serde(default = "default_max_miners")]
    pub max_miners_per_connection: usize,
    #[serde(default)]
    pub donations: Vec<DonationConfig>,
    /// PEM key/cert pair; both present means the listener serves HTTPS
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    /// Path the WebSocket acceptor is mounted at
    #[serde(default = "default_path")]
    pub path: String,
    /// Idle-connection purge interval in milliseconds, 0 disables
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
    /// The hostname the HTTP(S) listener binds
    #[serde(default = "default_listen_hostname")]
    pub listen_hostname: String,
    /// The port the HTTP(S) listener binds
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DonationConfig {
    /// Wallet address the donation mines to
    pub address: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_pass")]
    pub pass: String,
    /// Share of job time carved out of each host miner, in (0, 1]
    pub percentage: f64,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Log to file if specified
    pub file: Option<String>,
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to console; defaults to on
    #[serde(default)]
    pub console: Option<bool>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_pass() -> String {
    "x".to_string()
}

fn default_max_miners() -> usize {
    100
}

fn default_path() -> String {
    "/".to_string()
}

fn default_purge_interval() -> u64 {
    60_000
}

fn default_listen_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8892
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pass: default_pass(),
            ssl: false,
            address: None,
            user: None,
            diff: None,
            dynamic_pool: false,
            max_miners_per_connection: default_max_miners(),
            donations: Vec::new(),
            key: None,
            cert: None,
            path: default_path(),
            purge_interval: default_purge_interval(),
            listen_hostname: default_listen_hostname(),
            listen_port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WSTRATUM").separator("_"))
            .build()?
            .try_deserialize()
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.proxy.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.proxy.port = port;
        self
    }

    pub fn with_pass(mut self, pass: String) -> Self {
        self.proxy.pass = pass;
        self
    }

    pub fn with_diff(mut self, diff: u64) -> Self {
        self.proxy.diff = Some(diff);
        self
    }

    pub fn with_address(mut self, address: String) -> Self {
        self.proxy.address = Some(address);
        self
    }

    pub fn with_dynamic_pool(mut self, dynamic_pool: bool) -> Self {
        self.proxy.dynamic_pool = dynamic_pool;
        self
    }

    pub fn with_max_miners_per_connection(mut self, max: usize) -> Self {
        self.proxy.max_miners_per_connection = max;
        self
    }

    pub fn with_purge_interval(mut self, purge_interval: u64) -> Self {
        self.proxy.purge_interval = purge_interval;
        self
    }

    pub fn with_listen_hostname(mut self, listen_hostname: String) -> Self {
        self.proxy.listen_hostname = listen_hostname;
        self
    }

    pub fn with_listen_port(mut self, listen_port: u16) -> Self {
        self.proxy.listen_port = listen_port;
        self
    }

    pub fn with_donation(mut self, donation: DonationConfig) -> Self {
        self.proxy.donations.push(donation);
        self
    }
}
