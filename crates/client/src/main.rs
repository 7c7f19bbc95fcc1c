//! sona entry point

use clap::{Parser, ValueEnum};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use sona_client::{AppCommand, ResourceManager, TransportFactory};
use sona_config::{DeviceIdentity, Settings, TokenCache, TransportKind};
use sona_core::Error;
use sona_transport::{MqttTransport, WebSocketTransport};

const EXIT_OK: i32 = 0;
const EXIT_FATAL_INIT: i32 = 1;
const EXIT_TRANSPORT_FATAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Gui,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Websocket,
    Mqtt,
}

#[derive(Parser, Debug)]
#[command(name = "sona", about = "Voice-first conversational client")]
struct Cli {
    /// Front-end surface to notify
    #[arg(long, value_enum, default_value_t = Mode::Cli)]
    mode: Mode,

    /// Transport variant
    #[arg(long, value_enum)]
    protocol: Option<Protocol>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = std::env::var("SONA_ENV").ok();
    let settings = match Settings::load(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(EXIT_FATAL_INIT);
        }
    };

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        "starting sona"
    );

    let exit_code = match run(cli, settings).await {
        Ok(()) => EXIT_OK,
        Err(Error::Transport(e)) => {
            tracing::error!(error = %e, "transport fatal");
            EXIT_TRANSPORT_FATAL
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            EXIT_FATAL_INIT
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli, settings: Settings) -> Result<(), Error> {
    // Device identity and session token come from the activation collaborator.
    let identity = DeviceIdentity::load_or_create("config/efuse.json")?;
    let token = TokenCache::load("config/token.json")?;
    if token.is_empty() {
        tracing::warn!("no cached session token, connecting unauthenticated");
    }

    let protocol = cli.protocol.map_or(settings.network.transport, |p| match p {
        Protocol::Websocket => TransportKind::Websocket,
        Protocol::Mqtt => TransportKind::Mqtt,
    });

    let (transport_name, factory) = transport_factory(&settings, &identity, protocol);

    let (mut manager, handle) =
        ResourceManager::start(settings.clone(), token.access_token, transport_name, factory)
            .await?;

    // Without a wake scorer there is nothing to trigger the pipeline; start
    // the conversation immediately.
    if !settings.wake_word.enabled {
        let _ = handle.command_tx.send(AppCommand::Start).await;
    }

    // Front-ends consume `handle.events`; in CLI mode we only log them. The
    // broadcast closing means the session core exited on its own (fatal).
    let mut events = handle.events;
    let app_ended = async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "client event"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            let _ = handle.command_tx.send(AppCommand::Stop).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        _ = app_ended => {
            tracing::warn!("session core exited");
        }
    }

    manager.shutdown().await
}

fn transport_factory(
    settings: &Settings,
    identity: &DeviceIdentity,
    protocol: TransportKind,
) -> (&'static str, TransportFactory) {
    let connect_timeout = Duration::from_secs(settings.network.connect_timeout_secs);
    let device_id = identity.device_id();
    let client_id = identity.client_id.to_string();

    match protocol {
        TransportKind::Websocket => {
            let url = settings.network.websocket_url.clone();
            (
                "websocket",
                Box::new(move || {
                    Box::new(WebSocketTransport::new(
                        url.clone(),
                        device_id.clone(),
                        client_id.clone(),
                        connect_timeout,
                    )) as Box<dyn sona_transport::Transport>
                }),
            )
        }
        TransportKind::Mqtt => {
            let options = settings.network.mqtt.clone();
            (
                "mqtt",
                Box::new(move || {
                    Box::new(MqttTransport::new(
                        options.clone(),
                        device_id.clone(),
                        client_id.clone(),
                        connect_timeout,
                    )) as Box<dyn sona_transport::Transport>
                }),
            )
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sona={}", settings.observability.log_level).into());

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
