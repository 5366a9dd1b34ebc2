//! Local view of a room: its id, our identity, and the owned peer link map.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{PeerLink, PeerSnapshot};
use crate::error::ProtocolError;
use crate::media::LocalMediaSource;
use crate::negotiator::LinkId;
use crate::signaling::ParticipantId;

#[derive(Debug)]
pub struct RoomState {
    id: String,
    local_id: ParticipantId,
    links: HashMap<ParticipantId, PeerLink>,
    next_link: LinkId,
}

impl RoomState {
    pub fn new(id: String, local_id: ParticipantId) -> Self {
        Self {
            id,
            local_id,
            links: HashMap::new(),
            next_link: 1,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn next_link_id(&mut self) -> LinkId {
        let id = self.next_link;
        self.next_link += 1;
        id
    }

    #[must_use]
    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.links.contains_key(peer)
    }

    /// Register a link; at most one per remote participant.
    pub fn add_peer(&mut self, link: PeerLink) -> Result<(), ProtocolError> {
        if self.links.contains_key(link.remote()) {
            return Err(ProtocolError::DuplicateJoin(link.remote().clone()));
        }
        self.links.insert(link.remote().clone(), link);
        Ok(())
    }

    pub fn get_mut(&mut self, peer: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(peer)
    }

    /// The link for `peer`, only if it is still generation `link`.
    pub fn current_mut(&mut self, peer: &ParticipantId, link: LinkId) -> Option<&mut PeerLink> {
        self.links.get_mut(peer).filter(|l| l.id() == link)
    }

    pub fn remove_peer(&mut self, peer: &ParticipantId) -> Option<PeerLink> {
        self.links.remove(peer)
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut PeerLink> {
        self.links.values_mut()
    }

    /// Whether any link still sends media from `source`.
    #[must_use]
    pub fn uses_source(&self, source: &Arc<LocalMediaSource>) -> bool {
        self.links.values().any(|link| Arc::ptr_eq(link.source(), source))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerLink> + '_ {
        self.links.drain().map(|(_, link)| link)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Snapshots ordered by participant id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.links.values().map(PeerLink::snapshot).collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }
}
