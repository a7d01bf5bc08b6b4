use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
};
use webrtc_sdp::{attribute_type::SdpAttributeType, media_type::SdpMediaValue, parse_sdp, SdpSession};

use crate::error::{Error, RequestErrorKind};

/// Decodes a JSON session description, requiring the given type and a parsable SDP body.
pub fn parse_description(
    raw: &str,
    expected: RTCSdpType,
) -> Result<RTCSessionDescription, Error> {
    let description: RTCSessionDescription = serde_json::from_str(raw).map_err(|e| {
        Error::new_request(
            format!("invalid session description: {}", e),
            RequestErrorKind::InvalidSdpError,
        )
    })?;
    if description.sdp_type != expected {
        return Err(Error::new_request(
            format!("invalid sdp type {}", description.sdp_type),
            RequestErrorKind::InvalidSdpError,
        ));
    }
    parse_session(&description)?;
    Ok(description)
}

fn parse_session(description: &RTCSessionDescription) -> Result<SdpSession, Error> {
    parse_sdp(&description.sdp, false).map_err(|e| {
        Error::new_request(
            format!("Failed to parse SDP: {}", e),
            RequestErrorKind::InvalidSdpError,
        )
    })
}

/// A publish offer is listen-only when none of its audio sections sends media.
pub fn is_listen_only(description: &RTCSessionDescription) -> Result<bool, Error> {
    let session = parse_session(description)?;
    let audio: Vec<_> = session
        .media
        .iter()
        .filter(|m| *m.get_type() == SdpMediaValue::Audio)
        .collect();
    if audio.is_empty() {
        return Ok(false);
    }
    Ok(audio.iter().all(|m| {
        m.get_attribute(SdpAttributeType::Recvonly).is_some()
            || m.get_attribute(SdpAttributeType::Inactive).is_some()
    }))
}

/// Decodes a JSON ICE candidate. Empty candidates are rejected.
pub fn parse_candidate(raw: &str) -> Result<RTCIceCandidateInit, Error> {
    let candidate: RTCIceCandidateInit = serde_json::from_str(raw).map_err(|e| {
        Error::new_request(
            format!("invalid candidate: {}", e),
            RequestErrorKind::InvalidCandidateError,
        )
    })?;
    if candidate.candidate.is_empty() {
        return Err(Error::new_request(
            "empty candidate".to_owned(),
            RequestErrorKind::InvalidCandidateError,
        ));
    }
    Ok(candidate)
}
