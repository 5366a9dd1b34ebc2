//! `mesh-room`: join a room from the terminal.
//!
//! Usage: `mesh-room <room-code>`. Reads commands from stdin: `a` toggles audio,
//! `v` toggles video, `p` lists peers, `q` leaves. Ctrl-C also leaves.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mesh_room::audio::DeviceMediaAcquirer;
use mesh_room::signaling::WebSocketConnector;
use mesh_room::webrtc::WebRtcNegotiator;
use mesh_room::{Collaborators, Config, RoomSession, RoomSessionHandle, SessionEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh=info,mesh_room=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let room_id = std::env::args()
        .nth(1)
        .context("usage: mesh-room <room-code>")?;
    let config = Config::from_env().context("loading configuration")?;

    let collaborators = Collaborators {
        connector: Arc::new(WebSocketConnector::new(config.connect_timeout())),
        media: Arc::new(DeviceMediaAcquirer),
        negotiator: Arc::new(WebRtcNegotiator::new(&config.ice_servers)?),
    };

    let (session, mut events) = RoomSession::join(&room_id, &config, collaborators)
        .await
        .with_context(|| format!("joining room {room_id}"))?;

    info!(
        local_id = %session.local_id(),
        room_id = %room_id,
        "In room. Commands: a (audio), v (video), p (peers), q (leave)"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !run_command(&session, line.trim()).await? {
                        break;
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    session.leave().await;
    info!(metrics = ?session.metrics(), "Left room");
    Ok(())
}

/// Returns false when the user asked to leave.
async fn run_command(session: &RoomSessionHandle, command: &str) -> Result<bool> {
    match command {
        "a" => match session.toggle_local_audio().await? {
            Some(enabled) => info!(enabled, "Audio toggled"),
            None => warn!("No local audio track"),
        },
        "v" => match session.toggle_local_video().await? {
            Some(enabled) => info!(enabled, "Video toggled"),
            None => warn!("No local video track"),
        },
        "p" => {
            let peers = session.peers();
            if peers.is_empty() {
                info!("No peers");
            }
            for peer in peers {
                info!(
                    peer_id = %peer.peer,
                    role = %peer.role,
                    state = %peer.state,
                    remote_streams = peer.remote_streams,
                    "Peer"
                );
            }
        }
        "q" => return Ok(false),
        "" => {}
        other => warn!(command = other, "Unknown command"),
    }
    Ok(true)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerAdded { peer, role } => info!(peer_id = %peer, %role, "Peer added"),
        SessionEvent::PeerConnected { peer } => info!(peer_id = %peer, "Peer connected"),
        SessionEvent::RemoteStream { peer, stream } => info!(
            peer_id = %peer,
            stream_id = %stream.stream_id,
            kind = %stream.kind,
            "Receiving remote media"
        ),
        SessionEvent::PeerRemoved { peer, reason } => {
            info!(peer_id = %peer, ?reason, "Peer removed");
        }
        SessionEvent::LocalSourceChanged { source_id, kind } => {
            info!(source_id = %source_id, ?kind, "Local source changed");
        }
        SessionEvent::SignalingLost => {
            warn!("Relay connection lost; existing peers stay connected");
        }
    }
}
