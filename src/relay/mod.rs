//! Packet relay between a publishing peer and the peers receiving its stream.
use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};
use webrtc::{rtcp::transport_feedbacks::transport_layer_nack::NackPair, rtp};

use crate::error::{Error, TransportErrorKind};

/// Ring buffer of relayed packets and sequence gap detection.
pub mod buffer;
/// Batching of detected losses into NACKs sent back to the publisher.
pub mod loss;
pub mod sender;

use sender::Sender;

/// A retransmission request from a receiving peer, queued to the peer that published the stream.
#[derive(Debug)]
pub struct NackRequest {
    /// The receiving participant.
    pub uid: String,
    /// Session id of the stream the receiver believes it is getting.
    pub cid: String,
    pub pair: NackPair,
    pub sender: Arc<Sender>,
}

/// The live inbound stream of an active peer, as seen by the peers forwarding it.
#[derive(Debug)]
pub struct PublishedTrack {
    pub uid: String,
    pub cid: String,
    pub ssrc: u32,
    packets: broadcast::Sender<rtp::packet::Packet>,
    nacks: mpsc::Sender<NackRequest>,
}

impl PublishedTrack {
    pub(crate) fn new(
        uid: String,
        cid: String,
        ssrc: u32,
        fanout_queue_size: usize,
        nacks: mpsc::Sender<NackRequest>,
    ) -> Self {
        let (packets, _) = broadcast::channel(fanout_queue_size);
        Self {
            uid,
            cid,
            ssrc,
            packets,
            nacks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<rtp::packet::Packet> {
        self.packets.subscribe()
    }

    pub(crate) fn nack_queue(&self) -> NackQueue {
        NackQueue {
            cid: self.cid.clone(),
            queue: self.nacks.clone(),
        }
    }

    /// Hands a packet to every sender currently forwarding this stream.
    pub(crate) fn forward(&self, packet: &rtp::packet::Packet) {
        if self.packets.receiver_count() == 0 {
            return;
        }
        if let Err(err) = self.packets.send(packet.clone()) {
            tracing::trace!("PublishedTrack {} has no receivers: {}", self.cid, err);
        }
    }
}

/// Sending half of a publisher's NACK queue.
#[derive(Debug, Clone)]
pub(crate) struct NackQueue {
    pub cid: String,
    queue: mpsc::Sender<NackRequest>,
}

impl NackQueue {
    /// Waits at most `timeout` for room in the queue.
    pub async fn push(&self, request: NackRequest, timeout: Duration) -> Result<(), Error> {
        self.queue
            .send_timeout(request, timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => Error::new_transport(
                    format!("nack queue of {} is full", self.cid),
                    TransportErrorKind::NackTimeoutError,
                ),
                mpsc::error::SendTimeoutError::Closed(_) => Error::new_transport(
                    format!("nack queue of {} is closed", self.cid),
                    TransportErrorKind::TrackClosedError,
                ),
            })
    }
}
