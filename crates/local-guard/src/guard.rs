use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::origin::{self, OriginRejection};

/// Reasons a caller or configured endpoint is refused by the gate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// The caller's address is outside every local range.
    #[error("address {addr} is not on the local network")]
    NonLocal { addr: IpAddr },

    /// The remote address string could not be parsed.
    #[error("unparseable remote address '{raw}'")]
    Unparseable { raw: String },

    /// A configured URL points somewhere other than a local host.
    #[error("URL '{url}' does not point at a local host")]
    NonLocalUrl { url: String },
}

/// Access-control gate restricting the gateway to local-network callers.
///
/// When strict local mode is off every check admits the caller. Turning it
/// off is an explicit operator opt-out and is logged as a warning.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionGate {
    strict_local: bool,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self { strict_local: true }
    }
}

impl AdmissionGate {
    /// Create a gate. `strict_local = false` disables every check.
    pub fn new(strict_local: bool) -> Self {
        if strict_local {
            info!("strict local mode is enabled");
        } else {
            warn!("strict local mode is DISABLED; non-local callers will be admitted");
        }
        Self { strict_local }
    }

    /// Whether strict local mode is active.
    pub fn is_strict(&self) -> bool {
        self.strict_local
    }

    /// Decide whether a connection from `remote` may proceed.
    pub fn admit(&self, remote: &SocketAddr) -> Result<(), AdmissionDenied> {
        self.admit_ip(remote.ip())
    }

    /// Like [`admit`](Self::admit), but for an address in string form
    /// (`ip:port`, or a bare IP). Anything unparseable is denied.
    pub fn admit_remote(&self, remote: &str) -> Result<(), AdmissionDenied> {
        if !self.strict_local {
            return Ok(());
        }

        let ip = remote
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .or_else(|_| remote.parse::<IpAddr>())
            .map_err(|_| AdmissionDenied::Unparseable {
                raw: remote.to_string(),
            })?;

        self.admit_ip(ip)
    }

    /// Validate the `Origin` header of a cross-origin request.
    pub fn admit_origin(&self, origin_header: Option<&str>) -> Result<(), OriginRejection> {
        if !self.strict_local {
            return Ok(());
        }
        origin::validate_origin(origin_header)
    }

    /// Check that a configured URL (e.g. the inference backend) points at a
    /// local host.
    pub fn admit_url(&self, url: &str) -> Result<(), AdmissionDenied> {
        if !self.strict_local {
            return Ok(());
        }

        let denied = || AdmissionDenied::NonLocalUrl {
            url: url.to_string(),
        };
        let host = origin::host_of(url).ok_or_else(denied)?;

        if origin::is_loopback_host(host) {
            return Ok(());
        }

        match host.parse::<IpAddr>() {
            Ok(ip) if is_local_ip(ip) => Ok(()),
            _ => Err(denied()),
        }
    }

    fn admit_ip(&self, ip: IpAddr) -> Result<(), AdmissionDenied> {
        if !self.strict_local || is_local_ip(ip) {
            return Ok(());
        }
        debug!(%ip, "denying non-local address");
        Err(AdmissionDenied::NonLocal { addr: ip })
    }
}

/// Returns `true` if `ip` is loopback, private, link-local (unicast or
/// multicast), or inside the `100.64.0.0/10` shared address space.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are judged by their IPv4
/// form, which is how dual-stack listeners report IPv4 peers.
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => is_local_v6(v6),
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();

    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        // 224.0.0.0/24 link-local multicast
        || (a == 224 && b == 0 && c == 0)
        // 100.64.0.0/10 shared address space (Tailscale and friends)
        || (a == 100 && (64..=127).contains(&b))
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];

    ip.is_loopback()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local unicast
        || (first & 0xffc0) == 0xfe80
        // ff02::/16 link-local multicast
        || first == 0xff02
}
