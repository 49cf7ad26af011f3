//! Peerlink CLI binary.
//!
//! # Commands
//!
//! - `simulate` - Run two in-process nodes through a handshake and send messages
//! - `config` - Print the effective configuration as TOML
//! - `modes` - List protocol modes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlink::{
    ChannelTransport, CollectingSink, Config, DeliveryResult, Identity, InMemoryDirectory,
    InMemoryStateStore, InboundDispatcher, MemberInfo, MembershipStatus, OutboundQueue,
    ProtocolMode, SessionManager, VERSION,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(version = VERSION)]
#[command(about = "Peerlink - authenticated peer-to-peer sessions", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/peerlink/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handshake between two in-process nodes and exchange messages
    Simulate {
        /// Initiating identity
        #[arg(long, default_value = "alice")]
        initiator: String,

        /// Responding identity
        #[arg(long, default_value = "bob")]
        responder: String,

        /// Initiator modes, comma-separated (default: from config)
        #[arg(long, value_delimiter = ',')]
        initiator_modes: Vec<ProtocolMode>,

        /// Responder modes, comma-separated (default: from config)
        #[arg(long, value_delimiter = ',')]
        responder_modes: Vec<ProtocolMode>,

        /// Messages to send
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,

        /// Print each delivery as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,

    /// List protocol modes in default preference order
    Modes,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            initiator,
            responder,
            initiator_modes,
            responder_modes,
            count,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start runtime")?;
            runtime.block_on(cmd_simulate(
                config,
                SimulateArgs {
                    initiator,
                    responder,
                    initiator_modes,
                    responder_modes,
                    count,
                    json,
                },
            ))
        },

        Commands::Config => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        },

        Commands::Modes => {
            for mode in ProtocolMode::ALL {
                let encrypts = if mode.encrypts_payload() {
                    "encrypted"
                } else {
                    "authenticated only"
                };
                println!("{:<22} {}", mode.name(), encrypts);
            }
            Ok(())
        },
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

struct SimulateArgs {
    initiator: String,
    responder: String,
    initiator_modes: Vec<ProtocolMode>,
    responder_modes: Vec<ProtocolMode>,
    count: usize,
    json: bool,
}

struct Node {
    manager: Arc<SessionManager>,
    dispatcher: InboundDispatcher,
    sink: Arc<CollectingSink>,
    wire: UnboundedReceiver<Vec<u8>>,
}

impl Node {
    fn new(config: &Config, modes: Vec<ProtocolMode>, directory: Arc<InMemoryDirectory>) -> Self {
        let mut session = config.session.clone();
        if !modes.is_empty() {
            session.supported_modes = modes;
        }

        let (transport, wire) = ChannelTransport::new();
        let manager = Arc::new(SessionManager::new(
            session,
            Arc::new(InMemoryStateStore::new()),
            Arc::new(OutboundQueue::new(config.queue.capacity_per_session)),
            Arc::new(transport),
            directory,
        ));
        let sink = Arc::new(CollectingSink::new());
        let dispatcher = InboundDispatcher::new(manager.clone(), sink.clone());

        Self {
            manager,
            dispatcher,
            sink,
            wire,
        }
    }
}

async fn cmd_simulate(config: Config, args: SimulateArgs) -> anyhow::Result<()> {
    let initiator_id = Identity::new(args.initiator.as_str());
    let responder_id = Identity::new(args.responder.as_str());

    let initiator_dir = Arc::new(InMemoryDirectory::new());
    let responder_dir = Arc::new(InMemoryDirectory::new());
    let initiator_key = initiator_dir.host(initiator_id.clone(), 1);
    let responder_key = responder_dir.host(responder_id.clone(), 1);
    initiator_dir.register(MemberInfo {
        identity: responder_id.clone(),
        status: MembershipStatus::Active,
        serial: 1,
        verifying_key: responder_key,
    });
    responder_dir.register(MemberInfo {
        identity: initiator_id.clone(),
        status: MembershipStatus::Active,
        serial: 1,
        verifying_key: initiator_key,
    });

    let mut a = Node::new(&config, args.initiator_modes, initiator_dir);
    let mut b = Node::new(&config, args.responder_modes, responder_dir);

    let counterparties = a
        .manager
        .counterparties_for(&initiator_id, &responder_id)?;
    let mut handles = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let payload = format!("message {} from {}", i + 1, args.initiator);
        handles.push(
            a.manager
                .send(&counterparties, format!("sim-{}", i + 1), payload.into_bytes())?,
        );
    }

    pump(&mut a, &mut b).await;

    // Anything still queued never got a session
    if a.manager.queue().total_pending() > 0 {
        let past_deadline = chrono::Utc::now() + config.session.handshake_timeout();
        let summary = a.manager.expire_stale_sessions(past_deadline)?;
        warn!(
            expired = summary.expired,
            failed = summary.failed_messages,
            "Handshake did not complete"
        );
    }

    let mut delivered = 0;
    for handle in handles {
        let trace_id = handle.trace_id().to_string();
        let result: DeliveryResult = handle.wait().await;
        match result {
            Ok(receipt) => {
                delivered += 1;
                if args.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "trace_id": receipt.trace_id,
                            "session_id": receipt.session_id.as_str(),
                            "sequence_number": receipt.sequence_number,
                        })
                    );
                } else {
                    println!(
                        "{trace_id}: sealed as #{} on {}",
                        receipt.sequence_number, receipt.session_id
                    );
                }
            },
            Err(failure) => println!("{trace_id}: {failure}"),
        }
    }

    for payload in b.sink.received() {
        info!(
            session_id = %payload.session_id,
            sequence = payload.sequence_number,
            "{} received: {}",
            payload.destination,
            String::from_utf8_lossy(&payload.payload)
        );
    }

    println!(
        "{delivered}/{} delivered, {} received by {}",
        args.count,
        b.sink.len(),
        args.responder
    );
    Ok(())
}

/// Shuttle wire bytes between the two nodes until both sides go quiet
async fn pump(a: &mut Node, b: &mut Node) {
    let idle = Duration::from_millis(200);
    loop {
        tokio::select! {
            Some(bytes) = a.wire.recv() => {
                if let Err(err) = b.dispatcher.dispatch_wire(&bytes) {
                    warn!(error = %err, "Responder rejected message");
                }
            },
            Some(bytes) = b.wire.recv() => {
                if let Err(err) = a.dispatcher.dispatch_wire(&bytes) {
                    warn!(error = %err, "Initiator rejected message");
                }
            },
            () = tokio::time::sleep(idle) => break,
        }
    }
}
