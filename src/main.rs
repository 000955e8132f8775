//! Multinet Server
//!
//! Runs one network server until Ctrl-C. The configuration comes from the
//! JSON file named by the first argument, or from `NETSERVER_*` environment
//! variables when no argument is given.

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use multinet::{Diagnostic, EventChannel, NetworkServer, ServerConfig, VERSION};

/// Bytes of each payload shown in debug logs.
const PAYLOAD_PREVIEW: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Multinet Server v{}", VERSION);

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => ServerConfig::from_env().context("loading config from environment")?,
    };
    info!("Transport: {}", config.network_type);
    info!("Max connections: {}", config.max_connections);

    let server = NetworkServer::new(config.network_type);
    log_events(server.events());

    let addr = server.start(config).await?;
    info!("Listening on {}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    server.stop().await?;
    Ok(())
}

fn log_events(events: &EventChannel) {
    events.on_connect(|id, addr| {
        info!("Connection {} from {}", id, addr);
        Ok(())
    });
    events.on_game_packet(|id, payload| {
        let preview = &payload[..payload.len().min(PAYLOAD_PREVIEW)];
        debug!("Packet from {}: {} bytes [{}]", id, payload.len(), hex::encode(preview));
        Ok(())
    });
    events.on_disconnect(|id, reason| {
        info!("Connection {} closed: {:?}", id, reason);
        Ok(())
    });
    events.on_diagnostic(|diagnostic| {
        match diagnostic {
            Diagnostic::HandshakeRejected { remote_addr, error } => {
                warn!("Rejected {}: {}", remote_addr, error);
            }
            Diagnostic::MalformedPacket {
                remote_addr,
                reason,
                ..
            } => {
                debug!("Malformed packet from {}: {}", remote_addr, reason);
            }
            Diagnostic::TransportFault {
                network_type,
                message,
            } => {
                warn!("{} transport failed: {}", network_type, message);
            }
        }
        Ok(())
    });
}
