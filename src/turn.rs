//! Short-lived TURN credentials for clients, in the shared secret scheme of coturn's `static-auth-secret`.
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;

use crate::{
    config::TurnConfig,
    error::{ConfigErrorKind, Error},
};

const CREDENTIAL_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Returns a UDP and a TCP server entry valid for one hour.
pub fn ice_servers(config: &TurnConfig, uid: &str) -> Result<Vec<IceServer>, Error> {
    let expiry = Utc::now() + Duration::hours(CREDENTIAL_TTL_HOURS);
    credentials(config, uid, expiry.timestamp())
}

fn credentials(config: &TurnConfig, uid: &str, expiry: i64) -> Result<Vec<IceServer>, Error> {
    let username = format!("{}:{}", expiry, uid);
    let mut mac = Hmac::<Sha1>::new_from_slice(config.secret.as_bytes()).map_err(|e| {
        Error::new_config(
            format!("invalid turn secret: {}", e),
            ConfigErrorKind::InvalidSecretError,
        )
    })?;
    mac.update(username.as_bytes());
    let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(["udp", "tcp"]
        .iter()
        .map(|transport| IceServer {
            url: format!("{}?transport={}", config.host, transport),
            username: username.clone(),
            credential: credential.clone(),
        })
        .collect())
}
