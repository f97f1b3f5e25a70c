//! `tandem` — joins a collaboration room from the terminal.
//!
//! Every stdin line is recorded as a local operation and sent to the room.
//! Lines starting with `/` are commands:
//!
//! - `/cursor <text>` sends ephemeral awareness state
//! - `/flush` seals the open undo batch
//! - `/status` prints the connection status
//!
//! **Usage:**
//! ```
//! tandem --room <id> --user <id> [--client-id <id>] [--config <path>]
//! ```
//!
//! Status transitions, remote events and sealed undo units are printed as
//! they happen. EOF or Ctrl-C closes the session.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tandem_collab::{
    CollabAdapter, CollabConfig, CollabError, SessionEvent, SessionHandle, StaticIdentity,
    UserIdentity,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Join a collaboration room and exchange operations over stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Collaboration room client")]
struct Args {
    /// TOML configuration file (defaults apply when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Room to join.
    #[arg(long)]
    room: String,

    /// User id presented to the room.
    #[arg(long)]
    user: String,

    /// Client id for this connection (random when omitted).
    #[arg(long)]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CollabConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CollabConfig::default(),
    };
    let client_id = args
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let identity = StaticIdentity(
        UserIdentity::new(args.user.clone(), client_id)
            .with_metadata(serde_json::json!({ "name": args.user })),
    );

    let adapter = CollabAdapter::new(config, identity)?;
    info!("Starting tandem with {} transport", adapter.strategy().kind());
    let _status = adapter.subscribe(|status| eprintln!("[status] {status}"));

    let mut handle = adapter.open(args.room.as_str()).await?;
    spawn_printers(&mut handle);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match handle_line(&handle, &line) {
                    Ok(()) => {}
                    Err(CollabError::SessionEnded) => {
                        eprintln!("session ended: {}", handle.status());
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    handle.close().await;
    eprintln!("[status] {}", adapter.status());
    Ok(())
}

fn handle_line(handle: &SessionHandle, line: &str) -> Result<(), CollabError> {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/cursor", state) => handle.send(state.as_bytes().to_vec()),
        ("/flush", _) => {
            if !handle.flush() {
                eprintln!("nothing to flush");
            }
            Ok(())
        }
        ("/status", _) => {
            eprintln!("[status] {}", handle.status());
            Ok(())
        }
        _ if line.is_empty() => Ok(()),
        _ => handle.record_operation(line.as_bytes().to_vec()),
    }
}

fn spawn_printers(handle: &mut SessionHandle) {
    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Connected { url } => println!("connected to {url}"),
                    SessionEvent::RemoteUpdate { client_id, seq, payload } => {
                        println!("{client_id}#{seq}: {}", String::from_utf8_lossy(&payload));
                    }
                    SessionEvent::RemoteAwareness { client_id, payload } => {
                        println!("{client_id} cursor: {}", String::from_utf8_lossy(&payload));
                    }
                    SessionEvent::PeerJoined(peer) => {
                        println!("+ {} ({})", peer.user_id, peer.client_id);
                    }
                    SessionEvent::PeerLeft { client_id } => println!("- {client_id}"),
                    SessionEvent::ProtocolError(e) => eprintln!("protocol error: {e}"),
                    SessionEvent::OperationDropped { bytes } => {
                        eprintln!("offline queue full, dropped {bytes} bytes");
                    }
                }
            }
        });
    }

    if let Some(mut units) = handle.take_undo_units() {
        tokio::spawn(async move {
            while let Some(unit) = units.recv().await {
                println!("[undo] sealed {} ops ({:?})", unit.ops.len(), unit.cause);
            }
        });
    }
}
