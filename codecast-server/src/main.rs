//! Codecast: live code broadcast server.
//!
//! `codecast serve` runs the sync server; `codecast watch` attaches a
//! client that logs everything the server sends, optionally as the
//! developer publishing local files.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use codecast_sync::{
    ClientConfig, Packet, ServerConfig, SyncClient, SyncError, SyncEvent, SyncServer,
    DEFAULT_ENDPOINT_PATH, MAX_USER_CODE_ENTRIES, MAX_USER_CODE_LENGTH,
};

#[derive(Parser, Debug)]
#[command(name = "codecast")]
#[command(about = "Broadcast reference code to many participants and collect their variants")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Bind address
        #[arg(short, long, env = "CODECAST_BIND", default_value = "0.0.0.0:8080")]
        bind: String,

        /// WebSocket endpoint path
        #[arg(long, env = "CODECAST_ENDPOINT", default_value = DEFAULT_ENDPOINT_PATH)]
        endpoint: String,

        /// Developer secret; developer logins are disabled when empty
        #[arg(long, env = "CODECAST_SECRET", default_value = "", hide_env_values = true)]
        secret: String,

        /// Maximum lines per user submission
        #[arg(long, env = "CODECAST_MAX_ENTRIES", default_value_t = MAX_USER_CODE_ENTRIES)]
        max_entries: usize,

        /// Maximum characters per submitted line
        #[arg(long, env = "CODECAST_MAX_LINE_LENGTH", default_value_t = MAX_USER_CODE_LENGTH)]
        max_line_length: usize,

        /// Processing tick in milliseconds
        #[arg(long, env = "CODECAST_TICK_MS", default_value_t = 10)]
        tick_ms: u64,

        /// Handshake timeout in seconds
        #[arg(long, env = "CODECAST_HANDSHAKE_TIMEOUT", default_value_t = 10)]
        handshake_timeout: u64,
    },

    /// Connect and log every packet the server sends
    Watch {
        /// Server endpoint URL
        #[arg(short, long, env = "CODECAST_URL", default_value = "ws://localhost:8080/connection")]
        url: String,

        /// Log in as developer with this secret
        #[arg(long, env = "CODECAST_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Project name announced by a developer
        #[arg(long, default_value = "codecast")]
        project: String,

        /// Files to publish once connected (developer only)
        #[arg(long = "publish")]
        publish: Vec<PathBuf>,

        /// Seconds between reconnect attempts
        #[arg(long, env = "CODECAST_RECONNECT_DELAY", default_value_t = 5)]
        reconnect_delay: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            bind,
            endpoint,
            secret,
            max_entries,
            max_line_length,
            tick_ms,
            handshake_timeout,
        } => {
            info!("Starting Codecast server v{}", env!("CARGO_PKG_VERSION"));
            let server = SyncServer::new(ServerConfig {
                bind_addr: bind,
                endpoint_path: endpoint,
                developer_secret: secret,
                max_submission_entries: max_entries,
                max_line_length,
                tick_interval: Duration::from_millis(tick_ms.max(1)),
                handshake_timeout: Duration::from_secs(handshake_timeout),
            });
            server.run().await
        }
        Commands::Watch {
            url,
            secret,
            project,
            publish,
            reconnect_delay,
        } => {
            let developer = secret.is_some();
            let mut config = match secret {
                Some(secret) => ClientConfig::developer(url, secret, project),
                None => ClientConfig::user(url),
            };
            config.reconnect_delay = Duration::from_secs(reconnect_delay);
            if !developer && !publish.is_empty() {
                warn!("Only developers can publish; ignoring --publish");
            }
            watch(config, if developer { publish } else { Vec::new() }).await;
            Ok(())
        }
    }
}

async fn watch(config: ClientConfig, publish: Vec<PathBuf>) {
    let mut client = SyncClient::new(config);
    let Some(mut events) = client.take_event_rx() else {
        return;
    };
    if let Err(e) = client.connect() {
        error!("Failed to start client: {e}");
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SyncEvent::Connected) => {
                    info!("Connected to {}", client.config().url);
                    publish_files(&client, &publish).await;
                }
                Some(SyncEvent::Packet(packet)) => print_packet(&packet),
                Some(SyncEvent::Closed { reason, reconnecting, .. }) => {
                    warn!("Disconnected: {reason}");
                    if !reconnecting {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                client.disconnect().await;
                break;
            }
        }
    }
}

async fn publish_files(client: &SyncClient, files: &[PathBuf]) {
    for file in files {
        match tokio::fs::read_to_string(file).await {
            Ok(text) => {
                let path = publish_path(file);
                if client.send_unsafe(&Packet::developer_update(path.as_str(), text)).await {
                    info!("Published {path}");
                } else {
                    warn!("Could not publish {path}: session closed");
                }
            }
            Err(e) => error!("Failed to read {}: {e}", file.display()),
        }
    }
}

/// Server-side path for a local file: its normal components joined under one `/`.
fn publish_path(file: &Path) -> String {
    let parts: Vec<_> = file
        .components()
        .filter_map(|part| match part {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect();
    format!("/{}", parts.join("/"))
}

fn print_packet(packet: &Packet) {
    match packet {
        Packet::DeveloperUpdate { path, text } => {
            println!("── {path} ({} bytes)", text.len());
            println!("{text}");
        }
        Packet::CompleteSnapshot { submissions } => {
            for (path, by_user) in submissions {
                for (id, lines) in by_user {
                    println!("── {path} [#{id}]");
                    for line in lines {
                        println!("{line}");
                    }
                }
            }
        }
        Packet::Acknowledgement { message } => println!("ack: {message}"),
        other => info!("Received {:?}", other.kind()),
    }
}
