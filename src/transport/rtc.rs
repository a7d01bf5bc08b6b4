use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use webrtc::{
    api::{
        media_engine::{MediaEngine, MIME_TYPE_OPUS},
        setting_engine::SettingEngine,
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::RTCIceCandidateInit, ice_candidate_type::RTCIceCandidateType,
        ice_connection_state::RTCIceConnectionState,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        policy::{bundle_policy::RTCBundlePolicy, rtcp_mux_policy::RTCRtcpMuxPolicy},
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::error::{Error, TransportErrorKind};

use super::{
    Connection, ConnectionEvent, ConnectionEventReceiver, Connector, InboundTrack,
    OutboundTrack, RtcpPacket,
};

pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CLOCK_RATE: u32 = 48000;

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(5);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        }],
    }
}

/// Builds ICE-lite connections bound to a single network interface, announcing only a host candidate.
#[derive(Debug, Clone)]
pub struct WebRTCConnector {
    interface: String,
    address: String,
}

impl WebRTCConnector {
    pub fn new(interface: String, address: String) -> Self {
        Self { interface, address }
    }

    fn build_api(&self) -> Result<API, Error> {
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_lite(true);
        let interface = self.interface.clone();
        setting_engine.set_interface_filter(Box::new(move |name: &str| name == interface));
        setting_engine.set_nat_1to1_ips(vec![self.address.clone()], RTCIceCandidateType::Host);
        setting_engine.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );

        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        // Loss recovery is done by the relay itself, so no NACK interceptors are registered here.
        let registry = Registry::new();

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl Connector for WebRTCConnector {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, ConnectionEventReceiver), Error> {
        let api = self.build_api()?;
        let configuration = RTCConfiguration {
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(configuration).await?);
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = WebRTCConnection::new(peer_connection, tx);
        Ok((Arc::new(connection), rx))
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCConnection {
    pub id: String,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebRTCConnection {
    fn new(
        peer_connection: Arc<RTCPeerConnection>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self::state_hooks(&id, &peer_connection, events);
        tracing::debug!("WebRTCConnection {} is created", id);
        Self {
            id,
            peer_connection,
            pending_candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn state_hooks(
        id: &str,
        peer_connection: &Arc<RTCPeerConnection>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let id = id.to_owned();
        peer_connection.on_signaling_state_change(Box::new(enc!((id) move |state| {
            tracing::debug!("WebRTCConnection {} signaling state changed: {}", id, state);
            Box::pin(async {})
        })));

        peer_connection.on_ice_connection_state_change(Box::new(
            enc!((id) move |state: RTCIceConnectionState| {
                tracing::debug!("WebRTCConnection {} ICE connection state changed: {}", id, state);
                Box::pin(async {})
            }),
        ));

        peer_connection.on_peer_connection_state_change(Box::new(
            enc!((id, events) move |state: RTCPeerConnectionState| {
                tracing::debug!("WebRTCConnection {} connection state changed: {}", id, state);
                if let Err(err) = events.send(ConnectionEvent::StateChanged(state)) {
                    tracing::debug!("WebRTCConnection {} dropped state event: {}", id, err);
                }
                Box::pin(async {})
            }),
        ));

        peer_connection.on_track(Box::new(enc!((id, events)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                tracing::info!(
                    "WebRTCConnection {} track received: ssrc={}, payload_type={}",
                    id,
                    track.ssrc(),
                    track.payload_type()
                );
                let inbound = Arc::new(WebRTCInboundTrack { track });
                if let Err(err) = events.send(ConnectionEvent::Track(inbound)) {
                    tracing::debug!("WebRTCConnection {} dropped track event: {}", id, err);
                }
                Box::pin(async {})
            }
        )));
    }
}

#[async_trait]
impl Connection for WebRTCConnection {
    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        let mut pendings = self.pending_candidates.lock().await;
        for candidate in pendings.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        self.peer_connection
            .local_description()
            .await
            .ok_or(Error::new_transport(
                "Failed to set local description".to_owned(),
                TransportErrorKind::LocalDescriptionError,
            ))
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.peer_connection
            .local_description()
            .await
            .ok_or(Error::new_transport(
                "Failed to set local description".to_owned(),
                TransportErrorKind::LocalDescriptionError,
            ))
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    async fn add_track(&self, id: &str, stream_id: &str) -> Result<Arc<dyn OutboundTrack>, Error> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            id.to_owned(),
            stream_id.to_owned(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.senders
            .lock()
            .await
            .insert(id.to_owned(), Arc::clone(&sender));
        Ok(Arc::new(WebRTCOutboundTrack { track, sender }))
    }

    async fn remove_track(&self, id: &str) -> Result<(), Error> {
        let sender = self.senders.lock().await.remove(id).ok_or(Error::new_transport(
            format!("Sender for track {} is not found", id),
            TransportErrorKind::SenderNotFoundError,
        ))?;
        self.peer_connection.remove_track(&sender).await?;
        Ok(())
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<(), Error> {
        self.peer_connection.write_rtcp(packets).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for WebRTCConnection {
    fn drop(&mut self) {
        tracing::debug!("WebRTCConnection {} is dropped", self.id);
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCInboundTrack {
    #[derivative(Debug = "ignore")]
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRTCInboundTrack {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn payload_type(&self) -> u8 {
        self.track.payload_type()
    }

    async fn read_rtp(&self) -> Result<Option<rtp::packet::Packet>, Error> {
        match self.track.read_rtp().await {
            Ok((packet, _attr)) => Ok(Some(packet)),
            Err(webrtc::error::Error::ErrDataChannelNotOpen) => Ok(None),
            Err(webrtc::error::Error::ErrClosedPipe) => Ok(None),
            Err(webrtc::error::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
            ))) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCOutboundTrack {
    #[derivative(Debug = "ignore")]
    track: Arc<TrackLocalStaticRTP>,
    #[derivative(Debug = "ignore")]
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl OutboundTrack for WebRTCOutboundTrack {
    fn id(&self) -> String {
        self.track.id().to_owned()
    }

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        self.track.write_rtp(packet).await?;
        Ok(())
    }

    async fn read_rtcp(&self) -> Result<Vec<RtcpPacket>, Error> {
        let (packets, _attr) = self.sender.read_rtcp().await?;
        Ok(packets)
    }
}
