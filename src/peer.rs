use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use derivative::Derivative;
use enclose::enc;
use tokio::{
    sync::{mpsc, Mutex},
    time::{timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp,
};

use crate::{
    config::PeerConfig,
    error::{Error, PeerErrorKind, TransportErrorKind},
    relay::{
        buffer::{Ingest, LostPacket, RelayBuffer, MAX_LOST_PER_PACKET},
        loss::LossBatcher,
        sender::Sender,
        NackRequest, PublishedTrack,
    },
    transport::{
        rtc::OPUS_PAYLOAD_TYPE, Connection, ConnectionEvent, ConnectionEventReceiver,
        InboundTrack, RtcpPacket,
    },
};

pub(crate) type CloseCallback = Box<dyn Fn(&Peer) + Send + Sync>;

/// Lifecycle of a [`Peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PeerState {
    /// The connection handshake is pending.
    Idle,
    /// Connected, waiting for the client's audio track.
    AwaitingTrack,
    /// Relaying the client's audio.
    Active,
    /// Receives the other participants but never publishes from this session.
    ListenOnly,
    Closed,
}

#[derive(Debug)]
struct PeerInner {
    state: PeerState,
    track: Option<Arc<PublishedTrack>>,
    /// Streams of other participants forwarded to this peer, keyed by their uid.
    senders: HashMap<String, Arc<Sender>>,
    buffer: Option<Arc<StdMutex<RelayBuffer>>>,
    /// The connection has reached `connected` at least once.
    connected: bool,
}

/// One participant's session in a room. A peer publishes at most one audio track and receives the tracks of everybody else over the same connection.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Peer {
    pub rid: String,
    pub uid: String,
    /// Session id, minted for every publish attempt.
    pub cid: String,
    connection: Arc<dyn Connection>,
    config: PeerConfig,
    inner: Mutex<PeerInner>,
    closed: CancellationToken,
    #[derivative(Debug = "ignore")]
    close_callback: CloseCallback,
}

impl Peer {
    pub(crate) fn new(
        rid: String,
        uid: String,
        connection: Arc<dyn Connection>,
        events: ConnectionEventReceiver,
        config: PeerConfig,
        close_callback: CloseCallback,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            rid,
            uid,
            cid: Uuid::new_v4().to_string(),
            connection,
            config,
            inner: Mutex::new(PeerInner {
                state: PeerState::Idle,
                track: None,
                senders: HashMap::new(),
                buffer: None,
                connected: false,
            }),
            closed: CancellationToken::new(),
            close_callback,
        });

        let weak = Arc::downgrade(&peer);
        let closed = peer.closed.clone();
        tokio::spawn(enc!((weak, closed) async move {
            Self::event_loop(weak, events, closed).await;
        }));
        let connection_timeout = peer.config.connection_timeout;
        tokio::spawn(async move {
            Self::watch_connection(weak, closed, connection_timeout).await;
        });

        tracing::debug!("Peer {} is created", peer.id());
        peer
    }

    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.rid, self.uid, self.cid)
    }

    pub async fn state(&self) -> PeerState {
        self.inner.lock().await.state
    }

    /// Marks a peer which has not received a track yet as receive-only.
    pub(crate) async fn set_listen_only(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, PeerState::Idle | PeerState::AwaitingTrack) {
            inner.state = PeerState::ListenOnly;
            tracing::info!("Peer {} is listen-only", self.id());
        }
    }

    /// The stream this peer publishes, if it is relaying one.
    pub async fn published(&self) -> Option<Arc<PublishedTrack>> {
        let inner = self.inner.lock().await;
        match inner.state {
            PeerState::Active => inner.track.clone(),
            _ => None,
        }
    }

    /// Session ids of the streams forwarded to this peer, keyed by publishing uid.
    pub async fn subscriptions(&self) -> HashMap<String, String> {
        let inner = self.inner.lock().await;
        inner
            .senders
            .iter()
            .map(|(uid, sender)| (uid.clone(), sender.cid.clone()))
            .collect()
    }

    pub(crate) async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        if let Err(err) = self.connection.set_remote_description(description).await {
            drop(inner);
            tracing::warn!("Peer {} failed to set remote description: {}", self.id(), err);
            self.close_logged().await;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        self.connection.create_answer().await
    }

    pub(crate) async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        if let Err(err) = self.connection.add_ice_candidate(candidate).await {
            let established = inner.state != PeerState::Idle;
            drop(inner);
            tracing::warn!("Peer {} failed to add ICE candidate: {}", self.id(), err);
            if established {
                self.close_logged().await;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Brings the forwarded streams in line with `remotes`, the streams currently published by the other peers of the room.
    ///
    /// Returns an offer when at least one sender was added or removed, and `None` when nothing changed.
    pub(crate) async fn renegotiate(
        &self,
        remotes: &[Arc<PublishedTrack>],
    ) -> Result<Option<RTCSessionDescription>, Error> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let mut changed = false;
        let stale: Vec<(String, Arc<Sender>)> = inner
            .senders
            .iter()
            .filter(|(uid, sender)| {
                !remotes
                    .iter()
                    .any(|remote| &remote.uid == *uid && remote.cid == sender.cid)
            })
            .map(|(uid, sender)| (uid.clone(), Arc::clone(sender)))
            .collect();
        for (uid, sender) in stale {
            match self.connection.remove_track(&sender.cid).await {
                Ok(()) => {
                    sender.stop();
                    inner.senders.remove(&uid);
                    changed = true;
                    tracing::debug!("Peer {} removed sender {}:{}", self.id(), uid, sender.cid);
                }
                Err(err) => {
                    tracing::warn!(
                        "Peer {} failed to remove sender {}:{}: {}",
                        self.id(),
                        uid,
                        sender.cid,
                        err
                    );
                }
            }
        }

        for remote in remotes {
            if remote.uid == self.uid || inner.senders.contains_key(&remote.uid) {
                continue;
            }
            let track = match self.connection.add_track(&remote.cid, &remote.uid).await {
                Ok(track) => track,
                Err(err) => {
                    tracing::warn!(
                        "Peer {} failed to add sender {}:{}: {}",
                        self.id(),
                        remote.uid,
                        remote.cid,
                        err
                    );
                    continue;
                }
            };
            let id = track.id();
            if id != remote.cid {
                tracing::error!(
                    "Peer {} got track {} for stream {}:{}",
                    self.id(),
                    id,
                    remote.uid,
                    remote.cid
                );
                if let Err(err) = self.connection.remove_track(&remote.cid).await {
                    tracing::warn!("Peer {} failed to remove track {}: {}", self.id(), id, err);
                }
                return Err(Error::new_transport(
                    format!("malformed track id {} for stream {}", id, remote.cid),
                    TransportErrorKind::TrackIdMismatchError,
                ));
            }
            let sender = Sender::start(self.uid.clone(), remote, track, self.config.nack_timeout);
            inner.senders.insert(remote.uid.clone(), sender);
            changed = true;
            tracing::debug!("Peer {} added sender {}:{}", self.id(), remote.uid, remote.cid);
        }

        if !changed {
            return Ok(None);
        }

        match self.connection.create_offer().await {
            Ok(offer) => Ok(Some(offer)),
            Err(err) => {
                drop(inner);
                tracing::error!("Peer {} failed to create offer: {}", self.id(), err);
                self.close_logged().await;
                Err(err)
            }
        }
    }

    /// Closes the peer. A listen-only peer only drops its inbound state and keeps its connection, since it still receives the others.
    pub async fn close(&self) -> Result<(), Error> {
        self.shutdown(false).await
    }

    /// Closes the peer and its connection, whatever its state.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, force: bool) -> Result<(), Error> {
        let senders = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                PeerState::Closed => {
                    tracing::debug!("Peer {} is already closed", self.id());
                    return Ok(());
                }
                PeerState::ListenOnly if !force => {
                    inner.track = None;
                    inner.buffer = None;
                    tracing::info!("Peer {} is listen-only, keeping connection open", self.id());
                    return Ok(());
                }
                _ => {}
            }
            inner.state = PeerState::Closed;
            inner.track = None;
            inner.buffer = None;
            inner
                .senders
                .drain()
                .map(|(_, sender)| sender)
                .collect::<Vec<_>>()
        };

        for sender in senders {
            sender.stop();
        }
        self.closed.cancel();

        match self.connection.close().await {
            Ok(()) => tracing::info!("Peer {} is closed", self.id()),
            Err(err) => tracing::warn!("Peer {} is closed with {}", self.id(), err),
        }
        (self.close_callback)(self);
        Ok(())
    }

    async fn close_logged(&self) {
        if let Err(err) = self.close().await {
            tracing::error!("Peer {} failed to close: {}", self.id(), err);
        }
    }

    fn ensure_open(&self, inner: &PeerInner) -> Result<(), Error> {
        if inner.state == PeerState::Closed {
            return Err(Error::new_peer(
                format!("peer {} is closed", self.id()),
                PeerErrorKind::PeerClosedError,
            ));
        }
        Ok(())
    }

    async fn event_loop(
        peer: Weak<Self>,
        mut events: ConnectionEventReceiver,
        closed: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(peer) = peer.upgrade() else {
                break;
            };
            match event {
                ConnectionEvent::StateChanged(state) => peer.on_state_changed(state).await,
                ConnectionEvent::Track(track) => peer.on_track(track).await,
            }
        }
        tracing::debug!("Peer event loop has finished");
    }

    async fn watch_connection(peer: Weak<Self>, closed: CancellationToken, limit: Duration) {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep(limit) => {}
        }
        let Some(peer) = peer.upgrade() else {
            return;
        };
        let (state, connected) = {
            let inner = peer.inner.lock().await;
            (inner.state, inner.connected)
        };
        match state {
            PeerState::Idle | PeerState::AwaitingTrack => {
                tracing::info!("Peer {} got no track within {:?}", peer.id(), limit);
                peer.close_logged().await;
            }
            PeerState::ListenOnly if !connected => {
                tracing::info!("Peer {} did not connect within {:?}", peer.id(), limit);
                if let Err(err) = peer.terminate().await {
                    tracing::error!("Peer {} failed to close: {}", peer.id(), err);
                }
            }
            _ => {}
        }
    }

    async fn on_state_changed(&self, state: RTCPeerConnectionState) {
        tracing::debug!("Peer {} connection state changed: {}", self.id(), state);
        match state {
            RTCPeerConnectionState::Connected => {
                let mut inner = self.inner.lock().await;
                inner.connected = true;
                if inner.state == PeerState::Idle {
                    inner.state = PeerState::AwaitingTrack;
                }
            }
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                if let Err(err) = self.terminate().await {
                    tracing::error!("Peer {} failed to close: {}", self.id(), err);
                }
            }
            _ => {}
        }
    }

    async fn on_track(self: &Arc<Self>, track: Arc<dyn InboundTrack>) {
        if track.payload_type() != OPUS_PAYLOAD_TYPE {
            tracing::warn!(
                "Peer {} ignores track ssrc={} with payload type {}",
                self.id(),
                track.ssrc(),
                track.payload_type()
            );
            return;
        }

        let (nack_sender, nacks) = mpsc::channel(self.config.nack_queue_size);
        let published = Arc::new(PublishedTrack::new(
            self.uid.clone(),
            self.cid.clone(),
            track.ssrc(),
            self.config.fanout_queue_size,
            nack_sender,
        ));
        let buffer = Arc::new(StdMutex::new(RelayBuffer::new()));
        {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.state, PeerState::Idle | PeerState::AwaitingTrack) {
                tracing::debug!(
                    "Peer {} ignores track ssrc={} in state {}",
                    self.id(),
                    track.ssrc(),
                    inner.state
                );
                return;
            }
            inner.state = PeerState::Active;
            inner.track = Some(Arc::clone(&published));
            inner.buffer = Some(Arc::clone(&buffer));
        }
        tracing::info!("Peer {} is relaying track ssrc={}", self.id(), track.ssrc());

        let (ingest_sender, ingest) = mpsc::channel(self.config.ingest_queue_size);
        let (lost_sender, lost) = mpsc::channel(MAX_LOST_PER_PACKET as usize + 1);
        let id = self.id();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            Self::read_loop(id, track, ingest_sender, closed).await;
        });
        let peer = Arc::clone(self);
        tokio::spawn(enc!((buffer) async move {
            peer.relay_loop(published, buffer, ingest, nacks, lost_sender).await;
        }));
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            peer.loss_loop(buffer, lost).await;
        });
    }

    async fn read_loop(
        id: String,
        track: Arc<dyn InboundTrack>,
        ingest: mpsc::Sender<rtp::packet::Packet>,
        closed: CancellationToken,
    ) {
        tracing::debug!("Peer {} read loop has started", id);
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                res = track.read_rtp() => {
                    match res {
                        Ok(Some(packet)) => {
                            if ingest.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Peer {} track has ended", id);
                            break;
                        }
                        Err(err) => {
                            tracing::warn!("Peer {} failed to read rtp: {}", id, err);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("Peer {} read loop has finished", id);
    }

    async fn relay_loop(
        self: Arc<Self>,
        published: Arc<PublishedTrack>,
        buffer: Arc<StdMutex<RelayBuffer>>,
        mut ingest: mpsc::Receiver<rtp::packet::Packet>,
        mut nacks: mpsc::Receiver<NackRequest>,
        lost: mpsc::Sender<LostPacket>,
    ) {
        let read_timeout = self.config.read_timeout;
        let deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                _ = self.closed.cancelled() => break None,
                _ = &mut deadline => break Some("track read timeout"),
                Some(request) = nacks.recv() => {
                    self.serve_nack(&buffer, request).await;
                }
                res = ingest.recv() => {
                    let Some(packet) = res else {
                        break Some("track closed");
                    };
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                    self.relay_packet(&buffer, &published, &lost, packet).await;
                }
            }
        };

        if let Some(reason) = reason {
            tracing::info!("Peer {} stops relaying: {}", self.id(), reason);
            self.close_logged().await;
        }
        tracing::debug!("Peer {} relay loop has finished", self.id());
    }

    async fn relay_packet(
        &self,
        buffer: &StdMutex<RelayBuffer>,
        published: &PublishedTrack,
        lost: &mpsc::Sender<LostPacket>,
        packet: rtp::packet::Packet,
    ) {
        let outcome = lock(buffer).ingest(&packet);
        match outcome {
            Ingest::Forward(missing) => {
                for m in missing {
                    if lost.send(m).await.is_err() {
                        break;
                    }
                }
                published.forward(&packet);
            }
            other => {
                tracing::trace!(
                    "Peer {} keeps packet seq={} timestamp={} from subscribers: {:?}",
                    self.id(),
                    packet.header.sequence_number,
                    packet.header.timestamp,
                    other
                );
            }
        }
    }

    async fn serve_nack(&self, buffer: &StdMutex<RelayBuffer>, request: NackRequest) {
        if request.cid != self.cid || !request.sender.is_active() {
            tracing::debug!(
                "Peer {} drops stale NACK from {} for {}",
                self.id(),
                request.uid,
                request.cid
            );
            return;
        }

        let packets: Vec<rtp::packet::Packet> = {
            let buffer = lock(buffer);
            request
                .pair
                .packet_list()
                .into_iter()
                .filter_map(|seq| buffer.lookup(seq).cloned())
                .collect()
        };
        for packet in packets.iter() {
            match request.sender.write_rtp(packet).await {
                Ok(()) => tracing::trace!(
                    "Peer {} resent seq={} to {}",
                    self.id(),
                    packet.header.sequence_number,
                    request.uid
                ),
                Err(err) => tracing::warn!(
                    "Peer {} failed to resend seq={} to {}: {}",
                    self.id(),
                    packet.header.sequence_number,
                    request.uid,
                    err
                ),
            }
        }
    }

    async fn loss_loop(
        self: Arc<Self>,
        buffer: Arc<StdMutex<RelayBuffer>>,
        mut lost: mpsc::Receiver<LostPacket>,
    ) {
        let mut batcher = LossBatcher::default();
        let mut ticker = tokio::time::interval(self.config.loss_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                res = lost.recv() => {
                    match res {
                        Some(l) => batcher.push(l),
                        None => break,
                    }
                }
                _ = ticker.tick() => {}
            }

            let current = lock(&buffer).timestamp();
            let Some(nack) = batcher.poll(current) else {
                continue;
            };
            tracing::debug!("Peer {} sends NACK {:?}", self.id(), nack.nacks);
            let packets: Vec<RtcpPacket> = vec![Box::new(nack)];
            let result = match timeout(self.config.nack_timeout, self.connection.write_rtcp(&packets)).await {
                Ok(result) => result,
                Err(_) => Err(Error::new_transport(
                    "NACK write timed out".to_owned(),
                    TransportErrorKind::NackTimeoutError,
                )),
            };
            if let Err(err) = result {
                tracing::error!("Peer {} failed to write NACK: {}", self.id(), err);
                self.close_logged().await;
                break;
            }
        }
        tracing::debug!("Peer {} loss loop has finished", self.id());
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        tracing::debug!("Peer {} is dropped", self.id());
    }
}

fn lock(buffer: &StdMutex<RelayBuffer>) -> MutexGuard<'_, RelayBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
