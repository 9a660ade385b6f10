//! bigmouth: an animatronic figure driven by a live bidirectional voice
//! session. Microphone audio streams out; synthesized speech streams back
//! and moves the mouth and torso in real time.

mod audio;
mod config;
mod error;
mod pipeline;
mod supervisor;

use std::sync::Arc;

use bigmouth_sonic::{SonicSession, TcpConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audio::{AudioBackend, CpalBackend};
use crate::config::AppConfig;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[bigmouth] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    // Connection establishment is the one failure that is fatal: no retry,
    // report and exit.
    let Some(endpoint) = config.endpoint.clone() else {
        error!("BIGMOUTH_ENDPOINT is not set; cannot reach the voice model");
        std::process::exit(1);
    };
    let connector = TcpConnector::new(endpoint);
    let session = match SonicSession::connect(&connector, config.session_config()).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!(error = %e, "connection failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = session.open_session().await {
        error!(error = %e, "session initialization failed");
        std::process::exit(1);
    }

    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend);
    let supervisor = Supervisor::new(
        session,
        backend,
        config.supervisor_config(),
        config.motion_parts(),
    );
    info!("🐟 bigmouth is listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("CTRL-C received; shutting down");
                shutdown.cancel();
            }
        });
    }

    supervisor.run(shutdown).await;
}
