//! Pedal-Link command-line entry point.
//!
//! Loads configuration, picks a transport for this host, and runs the
//! connection service until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()               -- TOML settings, defaults on first run
//!  └─ select_transport()          -- native or bridge, decided once
//!  └─ ConnectionService::from_probe()
//!       ├─ ConnectionStore        -- snapshot rendered as log lines
//!       ├─ MessageLog             -- sent/received messages
//!       └─ InboundListener        -- optional MIDI input
//! ```
//!
//! # Subcommands
//!
//! - `run` (default) – connect and keep the link healthy until Ctrl-C,
//!   sending MIDI clock when `--clock-bpm` or `[midi] clock_bpm` is set.
//! - `list-outputs` – print the MIDI outputs and inputs this host can see.
//! - `cc` / `pc` – connect, send one message, disconnect.
//! - `bridge-host` – serve the bridge protocol on stdin/stdout.  Spawned by
//!   the bridge transport; stdout carries the protocol, so logs go to stderr.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pedal_link::application::connection_service::ConnectionService;
use pedal_link::application::connection_store::ConnectionStore;
use pedal_link::infrastructure::device::{LoopbackDevice, MidirOutputDevice, OutputDevice};
use pedal_link::infrastructure::inbound::{list_inputs, InboundListener};
use pedal_link::infrastructure::storage::config::{self, AppConfig};
use pedal_link::infrastructure::transport::bridge::{
    serve_bridge, BridgeConnector, InProcessConnector, ProcessConnector,
};
use pedal_link::infrastructure::transport::{
    select_transport, BridgeTransport, HostCapabilities, HostKind, HostTransport, NativeTransport,
    OutputSelector, TransportMode,
};
use pedal_link_core::{ConnectionSnapshot, MessageLog};

#[derive(Debug, Parser)]
#[command(name = "pedal-link", version, about = "Keeps a MIDI link to a delay/reverb pedal healthy")]
struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, global = true, env = "PEDAL_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `[transport] mode`.
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportMode>,

    /// Output index; overrides `[midi] output_index` and `output_name`.
    #[arg(long, global = true)]
    output: Option<usize>,

    /// Input index to log inbound messages from.
    #[arg(long, global = true)]
    input: Option<usize>,

    /// Send MIDI clock at this tempo while linked; overrides
    /// `[midi] clock_bpm`.
    #[arg(long, global = true)]
    clock_bpm: Option<f64>,

    /// Use an in-memory output instead of a real MIDI port.
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect and monitor the link until Ctrl-C.
    Run,
    /// List MIDI outputs and inputs.
    ListOutputs,
    /// Send one Control Change.
    Cc { control: u8, value: u8 },
    /// Send one Program Change.
    Pc { program: u8 },
    /// Serve the bridge protocol on stdin/stdout.
    BridgeHost,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("loading configuration")?;

    let command = cli.command.as_ref().unwrap_or(&Command::Run);
    init_tracing(&config.general.log_level, matches!(command, Command::BridgeHost));

    // Everything runs on one event loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the Tokio runtime")?;

    runtime.block_on(async {
        match command {
            Command::Run => run(&cli, &config).await,
            Command::ListOutputs => list_outputs(&cli, &config),
            Command::Cc { .. } | Command::Pc { .. } => send_once(&cli, &config, command).await,
            Command::BridgeHost => bridge_host(&config).await,
        }
    })
}

/// Initialises structured logging.  `RUST_LOG` overrides the configured level.
fn init_tracing(level: &str, to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ── Transport wiring ──────────────────────────────────────────────────────────

fn output_selector(cli: &Cli, config: &AppConfig) -> OutputSelector {
    match cli.output {
        Some(index) => OutputSelector { index, name: None },
        None => config.midi.output_selector(),
    }
}

/// Builds the transport for this host.  Called once, before the service
/// starts.
fn build_transport(cli: &Cli, config: &AppConfig) -> HostTransport {
    let caps = HostCapabilities::detect();
    let mode = cli.transport.unwrap_or(config.transport.mode);
    let kind = select_transport(mode, &caps);
    let output = output_selector(cli, config);
    info!(?mode, ?kind, loopback = cli.loopback, "transport selected");

    match kind {
        HostKind::Native => {
            let device: Arc<dyn OutputDevice> = if cli.loopback {
                Arc::new(LoopbackDevice::single())
            } else {
                Arc::new(MidirOutputDevice::new(config.midi.client_name.clone()))
            };
            HostTransport::Native(NativeTransport::new(device, output))
        }
        HostKind::Bridge => {
            let connector: Box<dyn BridgeConnector> = if cli.loopback {
                Box::new(InProcessConnector::new(Arc::new(LoopbackDevice::single())))
            } else {
                Box::new(bridge_process(cli, &caps))
            };
            HostTransport::Bridge(BridgeTransport::new(
                connector,
                output,
                config.transport.bridge_call_timeout(),
            ))
        }
    }
}

/// The advertised bridge host, or this executable in `bridge-host` mode.
fn bridge_process(cli: &Cli, caps: &HostCapabilities) -> ProcessConnector {
    if let Some(program) = &caps.bridge_host {
        return ProcessConnector::new(program, Vec::new());
    }
    let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pedal-link"));
    let mut args = Vec::new();
    if let Some(path) = &cli.config {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.push("bridge-host".to_string());
    ProcessConnector::new(program, args)
}

fn start_service(cli: &Cli, config: &AppConfig, log: &Arc<MessageLog>) -> ConnectionService {
    ConnectionService::from_probe(
        config.connection.service_config(),
        Arc::clone(log),
        || build_transport(cli, config),
    )
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    info!("Pedal-Link starting");

    let log = Arc::new(MessageLog::with_capacity(config.log.capacity));
    let service = start_service(cli, config, &log);

    // ── Observers ─────────────────────────────────────────────────────────────
    let store = Arc::new(ConnectionStore::new(service.events()));
    let _render = {
        let weak = Arc::downgrade(&store);
        store.subscribe(move || {
            if let Some(store) = weak.upgrade() {
                render(&store.get_snapshot());
            }
        })
    };
    let _log_tail = tail_log(&log);

    // ── Inbound MIDI ──────────────────────────────────────────────────────────
    let listener = match cli.input.or(config.midi.input_index) {
        Some(index) => match InboundListener::start(&config.midi.client_name, index, Arc::clone(&log)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("inbound MIDI disabled: {e}");
                None
            }
        },
        None => None,
    };

    service.connect().await;
    if let Some(bpm) = cli.clock_bpm.or(config.midi.clock_bpm) {
        service.start_clock(bpm).await;
    }
    info!("Pedal-Link running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    if let Some(listener) = listener {
        if let (true, Some(bpm)) = listener.clock_status() {
            info!(bpm = %format!("{bpm:.1}"), "inbound clock");
        }
        let received = listener.stop().await;
        info!(received, "MIDI input closed");
    }

    service.stop_clock().await;
    service.disconnect().await;
    service.shutdown().await;
    info!("Pedal-Link stopped");
    Ok(())
}

fn list_outputs(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let outputs = if cli.loopback {
        LoopbackDevice::single().list_outputs()
    } else {
        MidirOutputDevice::new(config.midi.client_name.clone()).list_outputs()
    }
    .context("listing MIDI outputs")?;

    let chosen = (!outputs.is_empty()).then(|| output_selector(cli, config).pick(&outputs));
    println!("Outputs:");
    if outputs.is_empty() {
        println!("  (none)");
    }
    for (i, name) in outputs.iter().enumerate() {
        let marker = if Some(i) == chosen { '*' } else { ' ' };
        println!(" {marker}{i}: {name}");
    }

    if !cli.loopback {
        let inputs = list_inputs(&config.midi.client_name).context("listing MIDI inputs")?;
        println!("Inputs:");
        if inputs.is_empty() {
            println!("  (none)");
        }
        for (i, name) in inputs.iter().enumerate() {
            println!("  {i}: {name}");
        }
    }
    Ok(())
}

/// Connects, sends the message `command` names, and disconnects.
async fn send_once(cli: &Cli, config: &AppConfig, command: &Command) -> anyhow::Result<()> {
    let log = Arc::new(MessageLog::with_capacity(config.log.capacity));
    let service = start_service(cli, config, &log);
    let store = ConnectionStore::new(service.events());

    service.connect().await;
    let snapshot = store.get_snapshot();
    if !snapshot.status.is_linked() {
        service.shutdown().await;
        anyhow::bail!(
            "could not connect: {}",
            snapshot.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    let channel = config.midi.channel();
    match command {
        Command::Cc { control, value } => service.send_control_change(channel, *control, *value).await,
        Command::Pc { program } => service.send_program_change(channel, *program).await,
        _ => {}
    }
    service.shutdown().await;

    for entry in log.get_snapshot().entries.iter() {
        info!(direction = ?entry.direction, kind = ?entry.kind, detail = ?entry.detail, "{}", entry.summary);
    }
    Ok(())
}

async fn bridge_host(config: &AppConfig) -> anyhow::Result<()> {
    let device = Arc::new(MidirOutputDevice::new(config.midi.client_name.clone()));
    info!("bridge host serving on stdin/stdout");

    let served = serve_bridge(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        Arc::clone(&device) as Arc<dyn OutputDevice>,
        &config.midi.client_name,
    )
    .await;
    device.release();

    let served = served.context("serving bridge requests")?;
    info!(served, "bridge host finished");
    Ok(())
}

// ── Presentation ──────────────────────────────────────────────────────────────

fn render(snapshot: &ConnectionSnapshot) {
    let latency = snapshot
        .metrics
        .latency_ms
        .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
    match (&snapshot.backoff, &snapshot.last_error) {
        (Some(backoff), error) => warn!(
            status = %snapshot.status,
            dropped = snapshot.metrics.dropped,
            error = error.as_deref().unwrap_or(""),
            "retrying in {:.1}s (attempt {})",
            backoff.delay_ms as f64 / 1000.0,
            backoff.attempt
        ),
        (None, _) => info!(
            status = %snapshot.status,
            latency = %latency,
            dropped = snapshot.metrics.dropped,
            "connection"
        ),
    }
}

/// Logs each new message-log entry once.
fn tail_log(log: &Arc<MessageLog>) -> pedal_link_core::Subscription {
    let seen = Arc::new(AtomicU64::new(0));
    let weak = Arc::downgrade(log);
    log.subscribe(move || {
        let Some(log) = weak.upgrade() else { return };
        let snapshot = log.get_snapshot();
        let last = seen.load(Ordering::Relaxed);
        for entry in snapshot.entries.iter().filter(|e| e.id > last) {
            info!(direction = ?entry.direction, kind = ?entry.kind, detail = ?entry.detail, "{}", entry.summary);
            seen.store(entry.id, Ordering::Relaxed);
        }
    })
}
