use std::sync::Arc;

use serde::Serialize;
use webrtc::peer_connection::sdp::{
    sdp_type::RTCSdpType, session_description::RTCSessionDescription,
};

use crate::{
    config::PeerConfig,
    error::{Error, PeerErrorKind, RequestErrorKind},
    peer::{Peer, PeerState},
    room::RoomRegistry,
    signaling::{
        id::validate_id,
        sdp::{is_listen_only, parse_candidate, parse_description},
    },
    transport::Connector,
};

/// A participant as reported by [`Router::list`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub track: String,
    pub state: String,
}

/// Router implements publish, trickle, subscribe and answer on top of the [`RoomRegistry`]. It keeps no state of its own.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<RoomRegistry>,
    connector: Arc<dyn Connector>,
    config: PeerConfig,
}

impl Router {
    pub fn new(
        registry: Arc<RoomRegistry>,
        connector: Arc<dyn Connector>,
        config: PeerConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            config,
        }
    }

    /// Creates a peer for `uid` in room `rid` from the client's offer and returns its session id with the answer.
    /// A previous peer of the same participant is closed before the new one is registered. Publishes into the same room run one at a time.
    /// * `limit` - Maximum number of other participants in the room. `0` means unlimited.
    pub async fn publish(
        &self,
        rid: &str,
        uid: &str,
        offer: &str,
        limit: usize,
    ) -> Result<(String, RTCSessionDescription), Error> {
        validate_id(rid)?;
        validate_id(uid)?;
        let offer = parse_description(offer, RTCSdpType::Offer)?;
        let listen_only = is_listen_only(&offer)?;

        let _admission = self.registry.admit(rid).await;
        if limit > 0 && self.registry.count_others(rid, uid) >= limit {
            return Err(Error::new_peer(
                format!("room {} is full", rid),
                PeerErrorKind::RoomFullError,
            ));
        }

        let (connection, events) = self.connector.connect().await?;
        let registry = Arc::downgrade(&self.registry);
        let peer = Peer::new(
            rid.to_owned(),
            uid.to_owned(),
            connection,
            events,
            self.config.clone(),
            Box::new(move |peer: &Peer| {
                if let Some(registry) = registry.upgrade() {
                    if registry.unregister(&peer.rid, &peer.uid, &peer.cid) {
                        tracing::debug!("Peer {} is unregistered", peer.id());
                    }
                }
            }),
        );
        if listen_only {
            peer.set_listen_only().await;
        }

        if let Err(err) = peer.set_remote_description(offer).await {
            Self::discard(&peer).await;
            return Err(Error::new_request(
                format!("failed to apply offer: {}", err),
                RequestErrorKind::InvalidSdpError,
            ));
        }
        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                Self::discard(&peer).await;
                return Err(err);
            }
        };

        if let Some(previous) = self.registry.lookup(rid, uid) {
            Self::replace(&previous).await;
        }
        if let Some(previous) = self.registry.register(Arc::clone(&peer)) {
            Self::replace(&previous).await;
        }
        if peer.state().await == PeerState::Closed {
            self.registry.unregister(rid, uid, &peer.cid);
            return Err(Error::new_peer(
                format!("peer {} closed during publish", peer.id()),
                PeerErrorKind::PeerClosedError,
            ));
        }
        tracing::info!("Peer {} is published", peer.id());
        Ok((peer.cid.clone(), answer))
    }

    pub async fn trickle(&self, rid: &str, uid: &str, cid: &str, candidate: &str) -> Result<(), Error> {
        let candidate = parse_candidate(candidate)?;
        let peer = self.find_peer(rid, uid, cid).await?;
        peer.add_ice_candidate(candidate).await
    }

    /// Renegotiates the streams forwarded to the peer. Returns `None` when it already receives every live stream in the room.
    pub async fn subscribe(
        &self,
        rid: &str,
        uid: &str,
        cid: &str,
    ) -> Result<Option<RTCSessionDescription>, Error> {
        let peer = self.find_peer(rid, uid, cid).await?;

        let mut others = Vec::new();
        self.registry.for_each(rid, |other| {
            if other.uid != peer.uid {
                others.push(Arc::clone(other));
            }
        });
        let mut remotes = Vec::with_capacity(others.len());
        for other in others.iter() {
            if let Some(track) = other.published().await {
                remotes.push(track);
            }
        }

        let offer = peer.renegotiate(&remotes).await?;
        match &offer {
            Some(_) => tracing::info!("Peer {} renegotiates", peer.id()),
            None => tracing::debug!("Peer {} has nothing to renegotiate", peer.id()),
        }
        Ok(offer)
    }

    pub async fn answer(&self, rid: &str, uid: &str, cid: &str, answer: &str) -> Result<(), Error> {
        let answer = parse_description(answer, RTCSdpType::Answer)?;
        let peer = self.find_peer(rid, uid, cid).await?;
        peer.set_remote_description(answer).await
    }

    pub async fn list(&self, rid: &str) -> Result<Vec<PeerInfo>, Error> {
        validate_id(rid)?;
        let mut peers = Vec::new();
        for peer in self.registry.peers(rid) {
            let state = peer.state().await;
            if state == PeerState::Closed {
                continue;
            }
            peers.push(PeerInfo {
                id: peer.uid.clone(),
                track: peer.cid.clone(),
                state: state.to_string(),
            });
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    async fn find_peer(&self, rid: &str, uid: &str, cid: &str) -> Result<Arc<Peer>, Error> {
        validate_id(rid)?;
        validate_id(uid)?;
        let peer = self.registry.lookup(rid, uid).ok_or(Error::new_peer(
            format!("peer {}:{} not found", rid, uid),
            PeerErrorKind::PeerNotFoundError,
        ))?;
        if peer.cid != cid || peer.state().await == PeerState::Closed {
            return Err(Error::new_peer(
                format!("track {}:{}:{} not found", rid, uid, cid),
                PeerErrorKind::TrackNotFoundError,
            ));
        }
        Ok(peer)
    }

    async fn replace(previous: &Peer) {
        if let Err(err) = previous.terminate().await {
            tracing::error!("Failed to close replaced peer {}: {}", previous.id(), err);
        }
        tracing::debug!("Peer {} is replaced", previous.id());
    }

    async fn discard(peer: &Peer) {
        if let Err(err) = peer.terminate().await {
            tracing::error!("Failed to close peer {}: {}", peer.id(), err);
        }
    }
}
