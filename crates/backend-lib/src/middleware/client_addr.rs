// ============================
// crates/backend-lib/src/middleware/client_addr.rs
// ============================
//! Client network address extractor.
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};

/// Header consulted when the listener does not record peer addresses
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Address of the client, if it can be determined.
///
/// The connected peer wins; `x-real-ip` is only read when the server was
/// started without connect info (tests, some proxies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientAddr(Some(addr.ip())));
        }

        // Get client IP from the proxy header
        let forwarded = parts
            .headers
            .get(REAL_IP_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.trim().parse::<IpAddr>().ok());

        Ok(ClientAddr(forwarded))
    }
}
