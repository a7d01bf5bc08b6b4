//! Error types shared by the relay, the negotiation engine and the RPC surface.
use thiserror::Error;

/// Namespaced codes reported to RPC clients.
pub const CODE_INTERNAL: u32 = 5000000;
pub const CODE_INVALID_PARAMS: u32 = 5001000;
pub const CODE_INVALID_SDP: u32 = 5001001;
pub const CODE_INVALID_CANDIDATE: u32 = 5001002;
pub const CODE_ROOM_FULL: u32 = 5002000;
pub const CODE_PEER_NOT_FOUND: u32 = 5002001;
pub const CODE_PEER_CLOSED: u32 = 5002002;
pub const CODE_TRACK_NOT_FOUND: u32 = 5002003;

#[derive(Error, Debug)]
pub enum Error {
    #[error("request error: {0}")]
    RequestError(#[from] RequestError),
    #[error("peer error: {0}")]
    PeerError(#[from] PeerError),
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

impl Error {
    pub fn new_request(message: String, kind: RequestErrorKind) -> Self {
        Error::RequestError(RequestError { kind, message })
    }

    pub fn new_peer(message: String, kind: PeerErrorKind) -> Self {
        Error::PeerError(PeerError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Self {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Error::ConfigError(ConfigError { kind, message })
    }

    /// The code reported to RPC clients for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::RequestError(e) => match e.kind {
                RequestErrorKind::InvalidParamsError | RequestErrorKind::InvalidMethodError => {
                    CODE_INVALID_PARAMS
                }
                RequestErrorKind::InvalidSdpError => CODE_INVALID_SDP,
                RequestErrorKind::InvalidCandidateError => CODE_INVALID_CANDIDATE,
            },
            Error::PeerError(e) => match e.kind {
                PeerErrorKind::RoomFullError => CODE_ROOM_FULL,
                PeerErrorKind::PeerNotFoundError => CODE_PEER_NOT_FOUND,
                PeerErrorKind::PeerClosedError => CODE_PEER_CLOSED,
                PeerErrorKind::TrackNotFoundError => CODE_TRACK_NOT_FOUND,
            },
            _ => CODE_INTERNAL,
        }
    }
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RequestErrorKind {
    InvalidParamsError,
    InvalidMethodError,
    InvalidSdpError,
    InvalidCandidateError,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: PeerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PeerErrorKind {
    RoomFullError,
    PeerNotFoundError,
    PeerClosedError,
    TrackNotFoundError,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TransportErrorKind {
    LocalDescriptionError,
    TrackIdMismatchError,
    TrackClosedError,
    SenderNotFoundError,
    ConnectionClosedError,
    NackTimeoutError,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConfigErrorKind {
    InterfaceNotFoundError,
    InvalidAddressError,
    InvalidSecretError,
}
