//! courier command line chat client

use clap::{Parser, Subcommand};
use courier::client::{Client, ClientEvent, HandlerError};
use courier::config::ClientConfig;
use courier::crypto::{PlaintextSealer, SealedMessenger, StaticKeyStore};
use courier::observability::{init_default_logging, metrics};
use courier::protocol::{Identity, PresenceStatus};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Resilient mailbox chat over an MQTT broker
#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Per-identity messaging with durable mailboxes and presence")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect as an identity and chat over stdin/stdout
    Chat {
        /// Identity owning the mailbox
        #[arg(short, long, env = "COURIER_IDENTITY")]
        identity: String,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Chat { identity } => run_chat(config, identity).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for candidate in ["courier.toml", "config/courier.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using localhost:1883");
    Ok(ClientConfig::for_broker("localhost", 1883))
}

fn handle_config_command(config: ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

/// Split `recipient: text` into its parts
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (recipient, text) = line.split_once(':')?;
    let recipient = recipient.trim();
    let text = text.trim();
    if recipient.is_empty() || text.is_empty() {
        return None;
    }
    Some((recipient, text))
}

async fn run_chat(config: ClientConfig, identity: String) -> Result<(), Box<dyn std::error::Error>> {
    let identity = Identity::new(identity)?;
    info!(identity = %identity, broker = %config.broker.host, "Starting chat client");

    let client = Arc::new(Client::connect_mqtt(config, identity.clone()).await?);
    let mut events = client.events().ok_or("event stream already taken")?;

    let sealer = PlaintextSealer::new();
    let keys = StaticKeyStore::permissive(&identity);
    let (incoming_tx, mut incoming) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
    client
        .subscribe(move |sender: &str, sealed: &[u8]| -> Result<(), HandlerError> {
            incoming_tx.send((sender.to_string(), sealed.to_vec()))?;
            Ok(())
        })
        .await?;

    let messenger = SealedMessenger::new(client.clone(), sealer, keys);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    println!("Connected as {identity}. Send with `recipient: message`.");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => match parse_line(&line) {
                    Some((recipient, text)) => match Identity::new(recipient) {
                        Ok(recipient) => {
                            if let Err(e) = messenger.send_text(recipient, text) {
                                eprintln!("! could not send: {e}");
                            }
                        }
                        Err(e) => eprintln!("! {e}"),
                    },
                    None if line.trim().is_empty() => {}
                    None => eprintln!("! expected `recipient: message`"),
                },
            },
            Some((sender, sealed)) = incoming.recv() => match messenger.open_text(&sealed) {
                Ok(text) => println!("{sender}: {text}"),
                Err(e) => eprintln!("! message from {sender} could not be opened: {e}"),
            },
            Some(event) = events.recv() => print_event(&event),
        }
    }

    client.close().await;
    let snapshot = metrics().snapshot();
    info!(
        published = snapshot.delivery.messages_published,
        received = snapshot.consume.messages_received,
        "Chat client stopped"
    );
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::PresenceChanged { identity, status } => match status {
            PresenceStatus::Online => println!("* {identity} is online"),
            PresenceStatus::Offline => println!("* {identity} went offline"),
        },
        ClientEvent::DeliveryExhausted {
            recipient, reason, ..
        } => eprintln!("! message to {recipient} was dropped: {reason}"),
        ClientEvent::ListenerStopped { reason, .. } => {
            eprintln!("! no longer receiving messages: {reason}")
        }
        ClientEvent::AuthenticationFailed { reason } => {
            eprintln!("! broker rejected credentials: {reason}")
        }
    }
}
