//! Client identity for admission and logging.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Fold IPv4-mapped IPv6 addresses back to IPv4.
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// The peer address, or the first `X-Forwarded-For` hop when trusted.
pub fn resolve(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return normalize(ip);
        }
    }
    normalize(peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "[::ffff:192.0.2.10]:4000".parse().unwrap()
    }

    #[test]
    fn mapped_addresses_fold_to_v4() {
        let ip = resolve(peer(), &HeaderMap::new(), false);
        assert_eq!(ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(normalize("::1".parse().unwrap()), "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4, 10.0.0.1"));

        assert_eq!(resolve(peer(), &headers, false), "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(resolve(peer(), &headers, true), "198.51.100.4".parse::<IpAddr>().unwrap());

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(resolve(peer(), &headers, true), "192.0.2.10".parse::<IpAddr>().unwrap());
    }
}
