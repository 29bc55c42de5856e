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

use clap::Parser;
use std::error::Error;
use tracing::{error, info};
use wstratum_lib::config::Config;
use wstratum_lib::logging::setup_logging;
use wstratum_lib::proxy::ProxyServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return Err(format!("Failed to load config: {}", e).into());
        }
    };

    let _guard = setup_logging(&config.logging)?;
    info!("Starting wstratum proxy...");

    let server = ProxyServer::new(config.proxy);
    if let Err(e) = server.listen().await {
        error!("Failed to start proxy: {}", e);
        return Err(Box::new(e) as Box<dyn Error>);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    server.kill().await;
    Ok(())
}
