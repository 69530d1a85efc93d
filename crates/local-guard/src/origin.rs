use std::net::IpAddr;

use thiserror::Error;

use crate::guard::is_local_ip;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginRejection {
    #[error("malformed Origin header")]
    Malformed,
    #[error("origin '{origin}' is not on the local network")]
    NotLocal { origin: String },
}

/// Returns `true` for the loopback host names that are always trusted.
pub(crate) fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

/// Extracts the host part of `scheme://host[:port][/path]`.
///
/// Brackets are removed from IPv6 literals (`[::1]:9000` yields `::1`).
/// Returns `None` for anything that does not have that shape, including
/// authorities carrying user info.
pub(crate) fn host_of(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return None;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    if authority.is_empty() || authority.contains('@') {
        return None;
    }

    // Bracketed IPv6 literal, optionally followed by a port.
    if let Some(bracketed) = authority.strip_prefix('[') {
        let end = bracketed.find(']')?;
        let after = &bracketed[end + 1..];
        if !after.is_empty() && !is_port_suffix(after) {
            return None;
        }
        return Some(&bracketed[..end]);
    }

    let host = match authority.rsplit_once(':') {
        Some((host, _)) if is_port_suffix(&authority[host.len()..]) => host,
        Some(_) => return None,
        None => authority,
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// `:` followed by one or more ASCII digits.
fn is_port_suffix(s: &str) -> bool {
    s.strip_prefix(':')
        .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
}

/// Validates the `Origin` header of a cross-origin request against the
/// local-network policy.
///
/// - No `Origin` header: allowed (non-browser clients do not send one).
/// - `file://` origins: allowed, for locally opened HTML files.
/// - `localhost`, `127.0.0.1` and `[::1]` on any port: allowed.
/// - Any other origin must carry an IP literal that is on the local
///   network. Host names and anything unparseable are rejected.
pub fn validate_origin(origin_header: Option<&str>) -> Result<(), OriginRejection> {
    let origin = match origin_header {
        None => return Ok(()),
        Some(o) if o.trim().is_empty() => return Err(OriginRejection::Malformed),
        Some(o) => o.trim(),
    };

    if origin.starts_with("file://") {
        return Ok(());
    }

    let host = host_of(origin).ok_or(OriginRejection::Malformed)?;

    if is_loopback_host(host) {
        return Ok(());
    }

    match host.parse::<IpAddr>() {
        Ok(ip) if is_local_ip(ip) => Ok(()),
        _ => Err(OriginRejection::NotLocal {
            origin: origin.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // validate_origin
    // -----------------------------------------------------------------------

    #[test]
    fn no_origin_header_is_allowed() {
        assert!(validate_origin(None).is_ok());
    }

    #[test]
    fn empty_origin_is_malformed() {
        assert_eq!(validate_origin(Some("")), Err(OriginRejection::Malformed));
        assert_eq!(validate_origin(Some("   ")), Err(OriginRejection::Malformed));
    }

    #[test]
    fn localhost_is_always_allowed() {
        assert!(validate_origin(Some("http://localhost")).is_ok());
        assert!(validate_origin(Some("http://localhost:3000")).is_ok());
        assert!(validate_origin(Some("http://127.0.0.1")).is_ok());
        assert!(validate_origin(Some("http://127.0.0.1:8080")).is_ok());
        assert!(validate_origin(Some("http://[::1]")).is_ok());
        assert!(validate_origin(Some("http://[::1]:9000")).is_ok());
        assert!(validate_origin(Some("https://localhost")).is_ok());
    }

    #[test]
    fn file_origins_are_allowed() {
        assert!(validate_origin(Some("file://")).is_ok());
        assert!(validate_origin(Some("file:///Users/me/chat.html")).is_ok());
    }

    #[test]
    fn lan_ip_origins_are_allowed() {
        assert!(validate_origin(Some("http://192.168.1.10:8443")).is_ok());
        assert!(validate_origin(Some("http://100.101.102.103")).is_ok());
        assert!(validate_origin(Some("http://[fe80::1]:8080")).is_ok());
    }

    #[test]
    fn public_ip_origin_is_rejected() {
        match validate_origin(Some("http://8.8.8.8")) {
            Err(OriginRejection::NotLocal { origin }) => assert_eq!(origin, "http://8.8.8.8"),
            other => panic!("expected NotLocal, got {other:?}"),
        }
    }

    #[test]
    fn host_names_are_rejected() {
        assert!(validate_origin(Some("https://example.com")).is_err());
        // Prefix tricks must not pass as localhost.
        assert!(validate_origin(Some("http://localhost.evil.com")).is_err());
        assert!(validate_origin(Some("http://127.0.0.1.nip.io")).is_err());
    }

    #[test]
    fn garbage_origins_are_malformed() {
        assert_eq!(validate_origin(Some("null")), Err(OriginRejection::Malformed));
        assert_eq!(
            validate_origin(Some("http://user@127.0.0.1")),
            Err(OriginRejection::Malformed)
        );
        assert_eq!(
            validate_origin(Some("http://127.0.0.1:abc")),
            Err(OriginRejection::Malformed)
        );
        assert_eq!(
            validate_origin(Some("http://[::1")),
            Err(OriginRejection::Malformed)
        );
    }

    // -----------------------------------------------------------------------
    // host_of
    // -----------------------------------------------------------------------

    #[test]
    fn host_of_strips_port_and_path() {
        assert_eq!(host_of("http://localhost:5173/app"), Some("localhost"));
        assert_eq!(host_of("https://10.0.0.2"), Some("10.0.0.2"));
        assert_eq!(host_of("http://[::1]:11434/api"), Some("::1"));
        assert_eq!(host_of("http://host?x=1"), Some("host"));
    }

    #[test]
    fn host_of_rejects_missing_scheme() {
        assert_eq!(host_of("localhost:5173"), None);
        assert_eq!(host_of("://localhost"), None);
        assert_eq!(host_of("http://"), None);
    }
}
