use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
    },
    rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack},
    rtp,
};

use crate::error::{Error, TransportErrorKind};

use super::{
    Connection, ConnectionEvent, ConnectionEventReceiver, Connector, InboundTrack,
    OutboundTrack, RtcpPacket,
};

pub(crate) fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
    let mut description = RTCSessionDescription::default();
    description.sdp_type = sdp_type;
    description.sdp = sdp.to_owned();
    description
}

#[derive(Debug, Default)]
pub(crate) struct MockConnection {
    pub remote_descriptions: StdMutex<Vec<RTCSessionDescription>>,
    pub candidates: StdMutex<Vec<RTCIceCandidateInit>>,
    pub tracks: StdMutex<Vec<Arc<MockOutboundTrack>>>,
    pub removed: StdMutex<Vec<String>>,
    pub nacks: StdMutex<Vec<NackPair>>,
    pub offers: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_rtcp: AtomicBool,
    pub fail_remote_description: AtomicBool,
    /// Makes `add_track` report a track id different from the requested one.
    pub corrupt_track_id: AtomicBool,
    /// Time `close` takes before it returns.
    pub close_delay: StdMutex<Duration>,
}

impl MockConnection {
    pub fn track(&self, id: &str) -> Option<Arc<MockOutboundTrack>> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.requested_id == id)
            .cloned()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn nack_pairs(&self) -> Vec<NackPair> {
        self.nacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(webrtc::Error::ErrSessionDescriptionNoFingerprint.into());
        }
        self.remote_descriptions.lock().unwrap().push(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        Ok(description(RTCSdpType::Answer, "v=0 answer"))
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(description(RTCSdpType::Offer, &format!("v=0 offer {}", n)))
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn add_track(&self, id: &str, stream_id: &str) -> Result<Arc<dyn OutboundTrack>, Error> {
        let reported = if self.corrupt_track_id.load(Ordering::SeqCst) {
            format!("{}-corrupt", id)
        } else {
            id.to_owned()
        };
        let track = Arc::new(MockOutboundTrack::new(id, &reported, stream_id));
        self.tracks.lock().unwrap().push(Arc::clone(&track));
        Ok(track)
    }

    async fn remove_track(&self, id: &str) -> Result<(), Error> {
        self.removed.lock().unwrap().push(id.to_owned());
        if let Some(track) = self.track(id) {
            track.close_rtcp();
        }
        Ok(())
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), Error> {
        if self.fail_rtcp.load(Ordering::SeqCst) {
            return Err(Error::new_transport(
                "rtcp write failed".to_owned(),
                TransportErrorKind::ConnectionClosedError,
            ));
        }
        for packet in packets {
            if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                self.nacks.lock().unwrap().extend(nack.nacks.iter().cloned());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let delay = *self.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockInboundTrack {
    ssrc: u32,
    payload_type: u8,
    packets: Mutex<mpsc::UnboundedReceiver<rtp::packet::Packet>>,
}

impl MockInboundTrack {
    pub fn new(
        ssrc: u32,
        payload_type: u8,
    ) -> (Arc<Self>, mpsc::UnboundedSender<rtp::packet::Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            ssrc,
            payload_type,
            packets: Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl InboundTrack for MockInboundTrack {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    async fn read_rtp(&self) -> Result<Option<rtp::packet::Packet>, Error> {
        Ok(self.packets.lock().await.recv().await)
    }
}

#[derive(Debug)]
pub(crate) struct MockOutboundTrack {
    pub requested_id: String,
    reported_id: String,
    pub stream_id: String,
    pub written: StdMutex<Vec<rtp::packet::Packet>>,
    pub fail_writes: AtomicBool,
    rtcp_sender: StdMutex<Option<mpsc::UnboundedSender<Vec<RtcpPacket>>>>,
    rtcp_receiver: Mutex<mpsc::UnboundedReceiver<Vec<RtcpPacket>>>,
}

impl MockOutboundTrack {
    fn new(requested_id: &str, reported_id: &str, stream_id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            requested_id: requested_id.to_owned(),
            reported_id: reported_id.to_owned(),
            stream_id: stream_id.to_owned(),
            written: StdMutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            rtcp_sender: StdMutex::new(Some(tx)),
            rtcp_receiver: Mutex::new(rx),
        }
    }

    /// Simulates the client reporting losses about this track.
    pub fn send_nack(&self, media_ssrc: u32, pair: NackPair) {
        let packet: RtcpPacket = Box::new(TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc,
            nacks: vec![pair],
        });
        if let Some(tx) = self.rtcp_sender.lock().unwrap().as_ref() {
            let _ = tx.send(vec![packet]);
        }
    }

    pub fn close_rtcp(&self) {
        self.rtcp_sender.lock().unwrap().take();
    }

    pub fn sequences(&self) -> Vec<u16> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }
}

#[async_trait]
impl OutboundTrack for MockOutboundTrack {
    fn id(&self) -> String {
        self.reported_id.clone()
    }

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::new_transport(
                "write failed".to_owned(),
                TransportErrorKind::TrackClosedError,
            ));
        }
        self.written.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn read_rtcp(&self) -> Result<Vec<RtcpPacket>, Error> {
        self.rtcp_receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::new_transport(
                "rtcp closed".to_owned(),
                TransportErrorKind::ConnectionClosedError,
            ))
    }
}

/// Hands out [`MockConnection`]s and keeps their event senders so tests can drive them.
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
    pub connections: StdMutex<Vec<(Arc<MockConnection>, mpsc::UnboundedSender<ConnectionEvent>)>>,
}

impl MockConnector {
    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index].0)
    }

    pub fn emit(&self, index: usize, event: ConnectionEvent) {
        let _ = self.connections.lock().unwrap()[index].1.send(event);
    }

    pub fn connect_and_publish(
        &self,
        index: usize,
        ssrc: u32,
    ) -> mpsc::UnboundedSender<rtp::packet::Packet> {
        self.emit(
            index,
            ConnectionEvent::StateChanged(RTCPeerConnectionState::Connected),
        );
        let (track, tx) = MockInboundTrack::new(ssrc, crate::transport::rtc::OPUS_PAYLOAD_TYPE);
        self.emit(index, ConnectionEvent::Track(track));
        tx
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, ConnectionEventReceiver), Error> {
        let connection = Arc::new(MockConnection::default());
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .unwrap()
            .push((Arc::clone(&connection), tx));
        Ok((connection, rx))
    }
}

pub(crate) fn packet(sequence_number: u16, timestamp: u32) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: crate::transport::rtc::OPUS_PAYLOAD_TYPE,
            sequence_number,
            timestamp,
            ssrc: 1234,
            ..Default::default()
        },
        payload: bytes::Bytes::from_static(&[0xf8, 0xff, 0xfe]),
    }
}
