use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtcp, rtp,
};

use crate::error::Error;

#[cfg(test)]
pub(crate) mod mock;
/// [`Connection`] implemented on top of [`webrtc::peer_connection::RTCPeerConnection`].
pub mod rtc;

pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// Notifications emitted by a [`Connection`]. They are delivered in order over the receiver returned by [`Connector::connect`].
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(RTCPeerConnectionState),
    Track(Arc<dyn InboundTrack>),
}

pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Creates a new [`Connection`] for every publish attempt.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, ConnectionEventReceiver), Error>;
}

/// One bidirectional media and control session with a single client.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    async fn set_remote_description(&self, description: RTCSessionDescription)
        -> Result<(), Error>;

    /// Creates an answer for the current remote offer and applies it as the local description.
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;

    /// Adds an outbound audio track. The returned track reports `id` as its id.
    async fn add_track(&self, id: &str, stream_id: &str) -> Result<Arc<dyn OutboundTrack>, Error>;

    async fn remove_track(&self, id: &str) -> Result<(), Error>;

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Audio received from the client.
#[async_trait]
pub trait InboundTrack: Send + Sync + Debug {
    fn ssrc(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// Returns `Ok(None)` once the track has ended.
    async fn read_rtp(&self) -> Result<Option<rtp::packet::Packet>, Error>;
}

/// Audio sent to the client, together with the control packets the client reports about it.
#[async_trait]
pub trait OutboundTrack: Send + Sync + Debug {
    fn id(&self) -> String;

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error>;

    async fn read_rtcp(&self) -> Result<Vec<RtcpPacket>, Error>;
}
