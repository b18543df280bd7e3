//! Orca CLI
//!
//! Thin command-line surface over `orca-core`:
//!
//! - `orca send-file <path>` fragments a file and hands it to the broker,
//!   printing the `file_id`. With `--wait-secs` it stays up serving retry
//!   requests until the receiver acks or the deadline lapses.
//! - `orca receive-files` runs the receiver daemon until Ctrl+C, writing
//!   reconstructed files under the storage directory.
//!
//! Broker settings come from the `MQTT_*` environment (see `BusConfig`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use orca_core::transfer::chunking::DEFAULT_CHUNK_SIZE;
use orca_core::{BusConfig, FileReceiver, FileSender, MqttBus, StateStore, CONNECT_TIMEOUT};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "orca", version, about = "Chunked file transfer over MQTT")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file over the bus in chunks
    SendFile {
        /// Path to the file to send
        path: PathBuf,

        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "CHUNK_SIZE")]
        chunk_size: usize,

        /// QoS level (0, 1 or 2); defaults to the configured MQTT_QOS
        #[arg(long)]
        qos: Option<u8>,

        /// Stay up serving retries until the ack arrives or this many
        /// seconds pass
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Receive chunked files and write them to disk until interrupted
    ReceiveFiles {
        /// Directory for incoming files and resume state
        #[arg(long, default_value = ".transfer", env = "STORAGE_DIR")]
        storage_dir: PathBuf,
    },
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orca_cli=info,orca_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = BusConfig::from_env();

    match cli.command {
        Command::SendFile {
            path,
            chunk_size,
            qos,
            wait_secs,
        } => send_file(config, path, chunk_size, qos, wait_secs).await,
        Command::ReceiveFiles { storage_dir } => receive_files(config, storage_dir).await,
    }
}

// ── Send ──────────────────────────────────────────────────────────────────────

async fn send_file(
    config: BusConfig,
    path: PathBuf,
    chunk_size: usize,
    qos: Option<u8>,
    wait_secs: Option<u64>,
) -> ExitCode {
    let qos = qos.unwrap_or(config.qos);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let bus = MqttBus::start(&config, &config.client_id, inbound_tx);

    if let Err(e) = bus.wait_connected(CONNECT_TIMEOUT).await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let sender = FileSender::new(Arc::new(bus.clone()), config.topic_prefix.as_str());
    let mut handle = match sender.stage(&path, chunk_size, qos).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Subscribe before publishing so a fast receiver's retry or ack cannot
    // slip past; only needed when we intend to wait for it.
    if wait_secs.is_some() {
        for topic in [handle.retry_topic().to_string(), handle.ack_topic().to_string()] {
            if let Err(e) = bus.subscribe(&topic, qos).await {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = handle.publish_all().await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    println!("File enqueued for transfer with id: {}", handle.file_id());

    let result = match wait_secs {
        None => ExitCode::SUCCESS,
        Some(secs) => {
            match handle
                .wait_for_ack(&mut inbound_rx, Duration::from_secs(secs))
                .await
            {
                Ok(true) => {
                    println!("Transfer acknowledged by receiver");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    eprintln!("No ack within {} seconds", secs);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    };

    bus.disconnect().await;
    result
}

// ── Receive ───────────────────────────────────────────────────────────────────

async fn receive_files(config: BusConfig, storage_dir: PathBuf) -> ExitCode {
    let store = match StateStore::new(&storage_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let bus = MqttBus::start(&config, &config.subscriber_client_id(), inbound_tx);

    // A slow broker is not fatal here: the adapter keeps reconnecting and the
    // subscription is replayed once the session comes up.
    if let Err(e) = bus.wait_connected(CONNECT_TIMEOUT).await {
        tracing::warn!(error = %e, "Broker not reachable yet; will keep retrying");
    }

    let receiver = FileReceiver::new(
        Arc::new(bus.clone()),
        store,
        config.topic_prefix.clone(),
        config.qos,
    );
    if let Err(e) = bus.subscribe(&receiver.subscription_filter(), config.qos).await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    println!("Receiver running. Storage directory: {}", storage_dir.display());
    println!("Press Ctrl+C to stop.");

    tokio::select! {
        _ = receiver.run(&mut inbound_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping receiver...");
        }
    }

    bus.disconnect().await;
    ExitCode::SUCCESS
}
