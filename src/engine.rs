use std::{net::IpAddr, sync::Arc};

use serde::Serialize;

use crate::{
    config::{Configuration, PeerConfig, TurnConfig},
    error::{ConfigErrorKind, Error},
    room::RoomRegistry,
    router::Router,
    transport::{rtc::WebRTCConnector, Connector},
    turn::{ice_servers, IceServer},
};

/// Server descriptor returned by [`Engine::info`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineInfo {
    pub interface: String,
    pub address: String,
    pub rooms: usize,
    pub peers: usize,
    pub version: String,
}

/// Engine owns the room registry and the connector, and hands them to the [`Router`].
#[derive(Debug)]
pub struct Engine {
    pub interface: String,
    pub address: String,
    registry: Arc<RoomRegistry>,
    router: Router,
    turn: TurnConfig,
}

impl Engine {
    pub fn new(config: &Configuration) -> Result<Self, Error> {
        let interface = config.engine.interface.clone();
        let address = match &config.engine.address {
            Some(address) => {
                address.parse::<IpAddr>().map_err(|e| {
                    Error::new_config(
                        format!("invalid address {}: {}", address, e),
                        ConfigErrorKind::InvalidAddressError,
                    )
                })?;
                address.clone()
            }
            None => interface_address(&interface)?.to_string(),
        };
        tracing::info!("Engine uses interface {} with address {}", interface, address);

        let connector = Arc::new(WebRTCConnector::new(interface.clone(), address.clone()));
        Ok(Self::with_connector(
            interface,
            address,
            connector,
            PeerConfig::default(),
            config.turn.clone(),
        ))
    }

    pub fn with_connector(
        interface: String,
        address: String,
        connector: Arc<dyn Connector>,
        peer_config: PeerConfig,
        turn: TurnConfig,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let router = Router::new(Arc::clone(&registry), connector, peer_config);
        Self {
            interface,
            address,
            registry,
            router,
            turn,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            interface: self.interface.clone(),
            address: self.address.clone(),
            rooms: self.registry.room_count(),
            peers: self.registry.peer_count(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    pub fn turn(&self, uid: &str) -> Result<Vec<IceServer>, Error> {
        ice_servers(&self.turn, uid)
    }
}

/// First IPv4 or IPv6 address assigned to `interface`.
pub fn interface_address(interface: &str) -> Result<IpAddr, Error> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| {
        Error::new_config(
            format!("failed to list interfaces: {}", e),
            ConfigErrorKind::InterfaceNotFoundError,
        )
    })?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(v4) = address.as_sockaddr_in() {
            return Ok(IpAddr::V4(v4.ip()));
        }
        if let Some(v6) = address.as_sockaddr_in6() {
            return Ok(IpAddr::V6(v6.ip()));
        }
    }
    Err(Error::new_config(
        format!("no address for interface {}", interface),
        ConfigErrorKind::InterfaceNotFoundError,
    ))
}
