//! CLI for SeqRelay
//!
//! Subcommands:
//! - `serve`: run a standalone relay (local log and local bus)
//! - `coordinator`: run the cluster coordinator that owns the log
//! - `worker`: run a relay that reaches the log and bus through the coordinator
//! - `client`: connect (optionally resuming a session), optionally publish,
//!   and print frames (smoke tests)

use std::sync::Arc;

use clap::Parser;
use seqrelay::broker::Broker;
use seqrelay::bus::LocalBus;
use seqrelay::cluster::{ClusterLink, Coordinator};
use seqrelay::config::{Settings, load_config};
use seqrelay::persistence::SledLog;
use seqrelay::transport::{ClientMessage, ConnectParams, Gateway, start_websocket_server};
use seqrelay::utils::{RelayError, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "seqrelay")]
enum Command {
    /// Start a standalone relay
    Serve,
    /// Start the cluster coordinator
    Coordinator,
    /// Start a relay worker attached to the coordinator
    Worker {
        /// Port for client connections (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a simple client (connects, optionally publishes, prints frames)
    Client {
        /// Relay URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:3000")]
        url: String,
        /// Last sequence id already seen
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Session to resume
        #[arg(long)]
        session: Option<String>,
        /// Message to publish once connected
        #[arg(long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Serve => run_standalone(settings).await,
        Command::Coordinator => run_coordinator(settings).await,
        Command::Worker { port } => run_worker(settings, port).await,
        Command::Client {
            url,
            offset,
            session,
            message,
        } => {
            let params = ConnectParams {
                last_known_offset: offset,
                session_id: session,
            };
            run_client(&url, params, message).await
        }
    };

    if let Err(e) = result {
        error!("Relay failed: {}", e);
    }
}

async fn run_standalone(settings: Settings) -> Result<(), RelayError> {
    let log = SledLog::open(&settings.storage.path, settings.storage.sync_writes)?;
    let bus = LocalBus::new(settings.broker.bus_capacity);
    let broker = Broker::new(Arc::new(log.clone()), Arc::new(bus), &settings.broker);

    let port = settings.server.port;
    run_gateway(broker, &settings, port).await;

    log.flush().await?;
    Ok(())
}

async fn run_coordinator(settings: Settings) -> Result<(), RelayError> {
    let log = SledLog::open(&settings.storage.path, settings.storage.sync_writes)?;
    let coordinator = Coordinator::new(Arc::new(log.clone()), settings.broker.bus_capacity);

    tokio::select! {
        result = coordinator.start(&settings.cluster.coordinator_addr) => {
            if let Err(e) = result {
                error!("Coordinator exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    log.flush().await?;
    Ok(())
}

async fn run_worker(settings: Settings, port: Option<u16>) -> Result<(), RelayError> {
    let link = ClusterLink::connect(&settings.cluster, settings.broker.bus_capacity).await?;
    let broker = Broker::new(link.clone(), link, &settings.broker);

    let port = port.unwrap_or(settings.server.port);
    run_gateway(broker, &settings, port).await;
    Ok(())
}

/// Serves clients until ctrl-c, the server fails, or the bus closes.
async fn run_gateway(broker: Broker, settings: &Settings, port: u16) {
    let addr = format!("{}:{}", settings.server.host, port);
    let gateway = Gateway::new(broker, settings);
    let fanout = gateway.spawn_fanout();
    let sweeper = gateway.spawn_session_sweeper();

    tokio::select! {
        result = start_websocket_server(addr, gateway.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server exited: {}", e);
            }
        }
        _ = fanout => {
            error!("Fan-out stopped; shutting down.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
}

async fn run_client(
    url: &str,
    params: ConnectParams,
    message: Option<String>,
) -> Result<(), RelayError> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use url::Url;

    let mut url = Url::parse(url)?;
    url.set_query(Some(&params.to_query()));

    let (mut ws_stream, _response) = connect_async(url.as_str()).await?;
    info!(%url, "Connected");

    if let Some(content) = message {
        let publish = ClientMessage::Publish {
            content,
            dedup_token: uuid::Uuid::new_v4().to_string(),
        };
        ws_stream
            .send(WsMessage::Text(serde_json::to_string(&publish)?.into()))
            .await?;
    }

    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => println!("{text}"),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
