use std::{sync::Arc, time::Duration};

use enclose::enc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use webrtc::{rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack, rtp};

use crate::{error::Error, transport::OutboundTrack};

use super::{NackQueue, NackRequest, PublishedTrack};

/// Forwards one publisher's stream to one receiving peer and passes the receiver's NACKs back to the publisher.
#[derive(Debug)]
pub struct Sender {
    /// Session id of the forwarded stream. The outbound track carries the same id.
    pub cid: String,
    /// The publishing participant.
    pub uid: String,
    /// The receiving participant.
    receiver: String,
    track: Arc<dyn OutboundTrack>,
    stopped: CancellationToken,
}

impl Sender {
    pub(crate) fn start(
        receiver: String,
        published: &PublishedTrack,
        track: Arc<dyn OutboundTrack>,
        nack_timeout: Duration,
    ) -> Arc<Self> {
        let sender = Arc::new(Self {
            cid: published.cid.clone(),
            uid: published.uid.clone(),
            receiver,
            track,
            stopped: CancellationToken::new(),
        });

        let packets = published.subscribe();
        tokio::spawn(enc!((sender) async move {
            Self::forward_loop(sender, packets).await;
        }));
        let nacks = published.nack_queue();
        tokio::spawn(enc!((sender) async move {
            Self::rtcp_loop(sender, nacks, nack_timeout).await;
        }));

        tracing::debug!("Sender {}->{} is created", sender.uid, sender.receiver);
        sender
    }

    pub fn is_active(&self) -> bool {
        !self.stopped.is_cancelled()
    }

    pub(crate) fn stop(&self) {
        self.stopped.cancel();
    }

    pub(crate) async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        self.track.write_rtp(packet).await
    }

    async fn forward_loop(sender: Arc<Self>, mut packets: broadcast::Receiver<rtp::packet::Packet>) {
        tracing::debug!(
            "Sender {}->{} forward loop has started",
            sender.uid,
            sender.receiver
        );

        loop {
            tokio::select! {
                _ = sender.stopped.cancelled() => {
                    break;
                }
                res = packets.recv() => {
                    match res {
                        Ok(packet) => {
                            tracing::trace!(
                                "Sender {}->{} write RTP seq={} timestamp={}",
                                sender.uid,
                                sender.receiver,
                                packet.header.sequence_number,
                                packet.header.timestamp
                            );
                            if let Err(err) = sender.track.write_rtp(&packet).await {
                                tracing::warn!("Sender {}->{} failed to write rtp: {}", sender.uid, sender.receiver, err);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Sender {}->{} skipped {} packets", sender.uid, sender.receiver, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            sender.stop();
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "Sender {}->{} forward loop has finished",
            sender.uid,
            sender.receiver
        );
    }

    async fn rtcp_loop(sender: Arc<Self>, nacks: NackQueue, timeout: Duration) {
        tracing::debug!(
            "Sender {}->{} RTCP loop has started",
            sender.uid,
            sender.receiver
        );

        'outer: loop {
            tokio::select! {
                _ = sender.stopped.cancelled() => {
                    break;
                }
                res = sender.track.read_rtcp() => {
                    let packets = match res {
                        Ok(packets) => packets,
                        Err(err) => {
                            tracing::debug!("Sender {}->{} stopped reading rtcp: {}", sender.uid, sender.receiver, err);
                            break;
                        }
                    };
                    for packet in packets.iter() {
                        let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() else {
                            continue;
                        };
                        for pair in nack.nacks.iter() {
                            tracing::trace!(
                                "Sender {}->{} received NACK {:?}",
                                sender.uid,
                                sender.receiver,
                                pair.packet_list()
                            );
                            let request = NackRequest {
                                uid: sender.receiver.clone(),
                                cid: sender.cid.clone(),
                                pair: pair.clone(),
                                sender: Arc::clone(&sender),
                            };
                            if let Err(err) = nacks.push(request, timeout).await {
                                tracing::warn!("Sender {}->{} failed to queue NACK: {}", sender.uid, sender.receiver, err);
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "Sender {}->{} RTCP loop has finished",
            sender.uid,
            sender.receiver
        );
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        tracing::debug!("Sender {}->{} is dropped", self.uid, self.receiver);
    }
}
