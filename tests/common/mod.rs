#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use mesh_room::media::{MediaAcquirer, StaticMediaAcquirer};
use mesh_room::negotiator::{LoopbackBehavior, LoopbackNegotiator};
use mesh_room::relay::{LocalConnector, Relay};
use mesh_room::signaling::Connector;
use mesh_room::{Collaborators, LinkState, PeerSnapshot, RoomSessionHandle, SessionEvent};

pub const SETTLE: Duration = Duration::from_secs(5);

pub fn collaborators(connector: Arc<dyn Connector>) -> Collaborators {
    with_media(connector, Arc::new(StaticMediaAcquirer::Grant))
}

pub fn with_media(connector: Arc<dyn Connector>, media: Arc<dyn MediaAcquirer>) -> Collaborators {
    Collaborators {
        connector,
        media,
        negotiator: Arc::new(LoopbackNegotiator::new(LoopbackBehavior::Connect)),
    }
}

pub fn local(relay: &Arc<Relay>) -> Collaborators {
    collaborators(Arc::new(LocalConnector::new(Arc::clone(relay))))
}

/// Wait until the session's peer set satisfies `done`.
pub async fn peers_until(
    handle: &RoomSessionHandle,
    done: impl Fn(&[PeerSnapshot]) -> bool,
) -> Vec<PeerSnapshot> {
    let mut rx = handle.subscribe_peers();
    timeout(SETTLE, async {
        loop {
            let peers = rx.borrow_and_update().clone();
            if done(&peers) {
                return peers;
            }
            rx.changed().await.expect("session dropped its monitor");
        }
    })
    .await
    .expect("peer set did not settle")
}

pub async fn connected_to(handle: &RoomSessionHandle, count: usize) -> Vec<PeerSnapshot> {
    peers_until(handle, |peers| {
        peers.len() == count && peers.iter().all(|p| p.state == LinkState::Connected)
    })
    .await
}

/// Next event matching `wanted`, skipping others.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(SETTLE, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}
