//! WebRTC negotiation engine.
//!
//! Every peer link gets its own `RTCPeerConnection`, owned by a task that applies
//! inbound signals in order. Signals are complete session descriptions: ICE gathering
//! finishes before an offer or answer is emitted, so a link exchanges exactly one
//! offer and one answer. Candidate updates are still accepted from peers that trickle.
//!
//! Local tracks are shared across links: one `TrackLocalStaticSample` per captured
//! track, fanned out to every connection and dropped once its source is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::Role;
use crate::error::{Error, Result};
use crate::media::{LocalMediaSource, MediaKind, RemoteStream};
use crate::negotiator::{LinkEvent, LinkEvents, LinkTransport, Negotiator};
use crate::signaling::Signal;

type LocalTrack = (MediaKind, Arc<TrackLocalStaticSample>);

pub struct WebRtcNegotiator {
    api: Arc<API>,
    config: RTCConfiguration,
    tracks: Arc<TrackCache>,
}

impl WebRtcNegotiator {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        Ok(Self {
            api: Arc::new(api),
            config,
            tracks: Arc::new(TrackCache::default()),
        })
    }
}

/// One outgoing track per captured track, keyed by `MediaTrack` id.
#[derive(Default)]
struct TrackCache(Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>);

impl TrackCache {
    #[cfg(test)]
    fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(track_id)
            .cloned()
    }

    fn tracks_for(&self, source: &LocalMediaSource) -> Vec<LocalTrack> {
        let mut cache = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        source
            .tracks()
            .iter()
            .map(|track| {
                let local = cache.entry(track.id().to_owned()).or_insert_with(|| {
                    let mime_type = match track.kind() {
                        MediaKind::Audio => MIME_TYPE_OPUS,
                        MediaKind::Video => MIME_TYPE_VP8,
                    };
                    Arc::new(TrackLocalStaticSample::new(
                        RTCRtpCodecCapability {
                            mime_type: mime_type.to_owned(),
                            ..Default::default()
                        },
                        track.id().to_owned(),
                        source.id().to_owned(),
                    ))
                });
                (track.kind(), Arc::clone(local))
            })
            .collect()
    }

    fn evict(&self, source: &LocalMediaSource) {
        let mut cache = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for track in source.tracks() {
            cache.remove(track.id());
        }
    }
}

impl Negotiator for WebRtcNegotiator {
    fn create(
        &self,
        role: Role,
        source: Arc<LocalMediaSource>,
        events: LinkEvents,
    ) -> Result<Box<dyn LinkTransport>> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let link = LinkTask {
            api: Arc::clone(&self.api),
            config: self.config.clone(),
            role,
            tracks: self.tracks.tracks_for(&source),
            events,
        };
        tokio::spawn(link.run(receiver));
        Ok(Box::new(WebRtcTransport {
            commands,
            tracks: Arc::clone(&self.tracks),
        }))
    }

    fn release_source(&self, source: &LocalMediaSource) {
        debug!(target: "mesh.webrtc", source_id = source.id(), "Dropping local tracks");
        self.tracks.evict(source);
    }
}

enum LinkCommand {
    Signal(Signal),
    Replace(Vec<LocalTrack>),
    Close,
}

struct WebRtcTransport {
    commands: mpsc::UnboundedSender<LinkCommand>,
    tracks: Arc<TrackCache>,
}

impl LinkTransport for WebRtcTransport {
    fn signal(&self, payload: Signal) {
        let _ = self.commands.send(LinkCommand::Signal(payload));
    }

    fn replace_source(&self, source: Arc<LocalMediaSource>) {
        let tracks = self.tracks.tracks_for(&source);
        let _ = self.commands.send(LinkCommand::Replace(tracks));
    }

    fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

struct LinkTask {
    api: Arc<API>,
    config: RTCConfiguration,
    role: Role,
    tracks: Vec<LocalTrack>,
    events: LinkEvents,
}

impl LinkTask {
    async fn run(self, commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let events = self.events.clone();
        if let Err(e) = self.negotiate(commands).await {
            warn!(target: "mesh.webrtc", peer_id = %events.peer(), error = %e, "Negotiation failed");
            events.emit(LinkEvent::Failed(e.to_string())).await;
        }
    }

    async fn negotiate(self, commands: mpsc::UnboundedReceiver<LinkCommand>) -> Result<()> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let result = self.drive(&pc, commands).await;

        if let Err(e) = pc.close().await {
            debug!(target: "mesh.webrtc", peer_id = %self.events.peer(), error = %e, "Error closing peer connection");
        }
        result
    }

    async fn drive(
        &self,
        pc: &Arc<RTCPeerConnection>,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<()> {
        let mut senders = Vec::with_capacity(self.tracks.len());
        for (kind, track) in &self.tracks {
            let sender = pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            drain_rtcp(Arc::clone(&sender));
            senders.push((*kind, sender));
        }
        install_handlers(pc, &self.events);

        if self.role == Role::Initiator {
            let offer = pc.create_offer(None).await?;
            if let Some(signal) = self.gathered(pc, offer).await? {
                self.events.emit(LinkEvent::Signal(signal)).await;
            }
        }

        loop {
            let command = tokio::select! {
                () = self.events.cancelled() => return Ok(()),
                command = commands.recv() => command,
            };
            match command {
                Some(LinkCommand::Signal(signal)) => self.apply(pc, signal).await?,
                Some(LinkCommand::Replace(tracks)) => replace_tracks(&senders, &tracks).await?,
                Some(LinkCommand::Close) | None => return Ok(()),
            }
        }
    }

    async fn apply(&self, pc: &RTCPeerConnection, signal: Signal) -> Result<()> {
        let value = signal.into_value();

        if let Some(candidate) = value.get("candidate").cloned() {
            let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)?;
            pc.add_ice_candidate(candidate).await?;
            return Ok(());
        }

        let description: RTCSessionDescription = serde_json::from_value(value)?;
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        pc.set_remote_description(description).await?;

        if is_offer {
            let answer = pc.create_answer(None).await?;
            if let Some(signal) = self.gathered(pc, answer).await? {
                self.events.emit(LinkEvent::Signal(signal)).await;
            }
        }
        Ok(())
    }

    /// Apply a local description and wait for ICE gathering so it carries every
    /// candidate. `None` if the link was torn down while gathering.
    async fn gathered(
        &self,
        pc: &RTCPeerConnection,
        description: RTCSessionDescription,
    ) -> Result<Option<Signal>> {
        let mut gathering = pc.gathering_complete_promise().await;
        pc.set_local_description(description).await?;
        tokio::select! {
            biased;
            () = self.events.cancelled() => {
                debug!(target: "mesh.webrtc", peer_id = %self.events.peer(), "Link torn down during ICE gathering");
                return Ok(None);
            }
            _ = gathering.recv() => {}
        }

        let local = pc.local_description().await.ok_or_else(|| Error::Negotiation {
            peer: self.events.peer().clone(),
            reason: "no local description after gathering".to_string(),
        })?;
        debug!(
            target: "mesh.webrtc",
            peer_id = %self.events.peer(),
            sdp_type = %local.sdp_type,
            "Local description ready"
        );
        Ok(Some(Signal::new(serde_json::to_value(local)?)))
    }
}

fn install_handlers(pc: &RTCPeerConnection, events: &LinkEvents) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!(target: "mesh.webrtc", peer_id = %events.peer(), %state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => events.emit(LinkEvent::Connected).await,
                RTCPeerConnectionState::Failed => {
                    events
                        .emit(LinkEvent::Failed("peer connection failed".to_string()))
                        .await;
                }
                RTCPeerConnectionState::Closed => events.emit(LinkEvent::Closed).await,
                _ => {}
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                info!(
                    target: "mesh.webrtc",
                    peer_id = %events.peer(),
                    %kind,
                    track_id = %track.id(),
                    "Remote track received"
                );
                let stream = RemoteStream {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                    track: Some(track),
                };
                events.emit(LinkEvent::Stream(stream)).await;
            })
        },
    ));
}

/// Swap each sender's track for the new source's track of the same kind, or mute
/// the sender when the new source has none.
async fn replace_tracks(
    senders: &[(MediaKind, Arc<RTCRtpSender>)],
    tracks: &[LocalTrack],
) -> Result<()> {
    for (kind, sender) in senders {
        let replacement = tracks
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, track)| Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await?;
    }
    Ok(())
}

/// Read incoming RTCP so interceptors keep running.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::room::SessionCommand;

    fn link_events(peer: &str) -> (LinkEvents, mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let events = LinkEvents::new(peer.into(), 1, tx.downgrade(), CancellationToken::new());
        (events, tx, rx)
    }

    fn link_event(command: Option<SessionCommand>) -> LinkEvent {
        match command {
            Some(SessionCommand::Link { event, .. }) => event,
            other => panic!("expected link event, got {other:?}"),
        }
    }

    #[test]
    fn test_local_tracks_shared_across_links() {
        let negotiator = WebRtcNegotiator::new(&[]).unwrap();
        let source = LocalMediaSource::camera("cam", true, true);

        let first = negotiator.tracks.tracks_for(&source);
        let second = negotiator.tracks.tracks_for(&source);

        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first[0].1, &second[0].1));
        assert!(negotiator.tracks.get("cam-audio").is_some());
        assert!(negotiator.tracks.get("cam-video").is_some());
        assert!(negotiator.tracks.get("screen").is_none());
    }

    #[test]
    fn test_released_source_drops_its_tracks() {
        let negotiator = WebRtcNegotiator::new(&[]).unwrap();
        let camera = LocalMediaSource::camera("cam", true, true);
        let screen = LocalMediaSource::screen("screen-1");
        negotiator.tracks.tracks_for(&camera);
        negotiator.tracks.tracks_for(&screen);

        negotiator.release_source(&camera);

        assert!(negotiator.tracks.get("cam-audio").is_none());
        assert!(negotiator.tracks.get("cam-video").is_none());
        assert!(negotiator.tracks.get("screen-1-screen").is_some());
    }

    #[test]
    fn test_codecs_follow_track_kind() {
        let negotiator = WebRtcNegotiator::new(&["stun:stun.l.google.com:19302".into()]).unwrap();
        let tracks = negotiator.tracks.tracks_for(&LocalMediaSource::camera("cam", true, true));

        let (kind, audio) = &tracks[0];
        assert_eq!(*kind, MediaKind::Audio);
        assert_eq!(audio.codec().mime_type, MIME_TYPE_OPUS);
        assert_eq!(tracks[1].1.codec().mime_type, MIME_TYPE_VP8);
        assert_eq!(negotiator.config.ice_servers.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initiator_and_responder_connect() {
        let initiator_side = WebRtcNegotiator::new(&[]).unwrap();
        let responder_side = WebRtcNegotiator::new(&[]).unwrap();
        let (a_events, _a_tx, mut a_rx) = link_events("b");
        let (b_events, _b_tx, mut b_rx) = link_events("a");

        let a = initiator_side
            .create(
                Role::Initiator,
                Arc::new(LocalMediaSource::camera("cam-a", true, true)),
                a_events,
            )
            .unwrap();
        let b = responder_side
            .create(
                Role::Responder,
                Arc::new(LocalMediaSource::camera("cam-b", true, false)),
                b_events,
            )
            .unwrap();

        let mut a_connected = false;
        let mut b_connected = false;
        timeout(Duration::from_secs(10), async {
            while !(a_connected && b_connected) {
                tokio::select! {
                    command = a_rx.recv() => match link_event(command) {
                        LinkEvent::Signal(offer) => {
                            assert_eq!(offer.as_value()["type"], "offer");
                            b.signal(offer);
                        }
                        LinkEvent::Connected => a_connected = true,
                        LinkEvent::Stream(_) => {}
                        other => panic!("initiator reported {other:?}"),
                    },
                    command = b_rx.recv() => match link_event(command) {
                        LinkEvent::Signal(answer) => {
                            assert_eq!(answer.as_value()["type"], "answer");
                            a.signal(answer);
                        }
                        LinkEvent::Connected => b_connected = true,
                        LinkEvent::Stream(_) => {}
                        other => panic!("responder reported {other:?}"),
                    },
                }
            }
        })
        .await
        .expect("links did not connect");

        // Closing without cancelling the link token still reports the transition.
        a.close();
        timeout(Duration::from_secs(5), async {
            while !matches!(link_event(a_rx.recv().await), LinkEvent::Closed) {}
        })
        .await
        .expect("closed link did not report Closed");
        b.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_torn_down_link_stops_waiting_for_gathering() {
        // An unroutable STUN server keeps gathering open for seconds.
        let negotiator = WebRtcNegotiator::new(&["stun:192.0.2.1:3478".into()]).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = LinkTask {
            api: Arc::clone(&negotiator.api),
            config: negotiator.config.clone(),
            role: Role::Initiator,
            tracks: negotiator.tracks.tracks_for(&LocalMediaSource::camera("cam", true, false)),
            events: LinkEvents::new("b".into(), 1, tx.downgrade(), cancel.clone()),
        };
        let (_commands, receiver) = mpsc::unbounded_channel();

        cancel.cancel();
        timeout(Duration::from_secs(2), task.run(receiver))
            .await
            .expect("torn-down link kept gathering");
        assert!(rx.try_recv().is_err());
        drop(tx);
    }

    #[tokio::test]
    async fn test_screen_replacement_mutes_audio_sender() {
        let negotiator = WebRtcNegotiator::new(&[]).unwrap();
        let pc = negotiator
            .api
            .new_peer_connection(negotiator.config.clone())
            .await
            .unwrap();

        let mut senders = Vec::new();
        for (kind, track) in negotiator
            .tracks
            .tracks_for(&LocalMediaSource::camera("cam", true, true))
        {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .unwrap();
            senders.push((kind, sender));
        }

        let screen = negotiator.tracks.tracks_for(&LocalMediaSource::screen("screen-1"));
        replace_tracks(&senders, &screen).await.unwrap();

        assert_eq!(senders[0].0, MediaKind::Audio);
        assert!(senders[0].1.track().await.is_none());
        let video = senders[1].1.track().await.unwrap();
        assert_eq!(video.id(), "screen-1-screen");

        pc.close().await.unwrap();
    }
}
