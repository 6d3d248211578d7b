mod cli;
mod config;
mod tracing_helper;

use std::{process::ExitCode, sync::Arc};

use anyhow::Result;
use clap::Parser;
use sendrecv_lib::{transport::WebSocketConnector, Client, ClientId, Event, Session};
use tokio::{signal::ctrl_c, spawn};
use tracing::{error, info};

use crate::{cli::Args, config::Config};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).await?;
    config.apply_args(&args);
    tracing_helper::init_tracing(config.log_dir.as_deref())?;

    let client_id = args.client_id.unwrap_or_else(ClientId::random);
    info!("calling {} as {} via {}", args.peer_id, client_id, config.server);

    let client = Client::new(
        Session::new(client_id, args.peer_id),
        Arc::new(config.peer_connection_factory()),
        config.early_candidates,
        config.close_timeout(),
    );
    let events = client.event_sender();
    spawn(async move {
        if ctrl_c().await.is_ok() {
            let _ = events.send(Event::Hangup("interrupted".to_owned()));
        }
    });

    let connector = WebSocketConnector::new(config.server.clone(), config.websocket());
    match client.run(&connector).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!("session failed: {}", err);
            Ok(ExitCode::FAILURE)
        }
    }
}
