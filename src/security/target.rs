//! Target URL validation.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::config::TargetConfig;
use crate::proxy::error::ProxyError;

/// A target that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: Url,
    /// `scheme://host[:port]`, the circuit breaker key.
    pub origin: String,
}

impl Target {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

pub fn validate(raw: Option<&str>, config: &TargetConfig) -> Result<Target, ProxyError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(ProxyError::MissingTarget)?;
    if raw.len() > config.max_url_length {
        return Err(ProxyError::TargetTooLong {
            max: config.max_url_length,
        });
    }

    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| ProxyError::InvalidTarget("missing host".to_string()))?;
    if !config.allow_private_networks && is_private_host(&host) {
        return Err(ProxyError::InvalidTarget(
            "private and loopback addresses are not allowed".to_string(),
        ));
    }

    let origin = url.origin().ascii_serialization();
    Ok(Target { url, origin })
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost") || name.ends_with(".localhost"),
        Host::Ipv4(v4) => is_private_v4(v4),
        Host::Ipv6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TargetConfig {
        TargetConfig::default()
    }

    #[test]
    fn accepts_public_http_targets() {
        let target = validate(Some("https://api.example.com:8443/v1/items?q=1"), &config()).unwrap();
        assert_eq!(target.origin, "https://api.example.com:8443");
        assert_eq!(target.as_str(), "https://api.example.com:8443/v1/items?q=1");

        let default_port = validate(Some("http://example.com:80/"), &config()).unwrap();
        assert_eq!(default_port.origin, "http://example.com");
    }

    #[test]
    fn missing_and_blank_targets() {
        assert_eq!(validate(None, &config()), Err(ProxyError::MissingTarget));
        assert_eq!(validate(Some("   "), &config()), Err(ProxyError::MissingTarget));
    }

    #[test]
    fn overlong_target_is_414() {
        let long = format!("https://example.com/{}", "a".repeat(5000));
        let err = validate(Some(&long), &config()).unwrap_err();
        assert_eq!(err, ProxyError::TargetTooLong { max: 4096 });
        assert_eq!(err.status().as_u16(), 414);
    }

    #[test]
    fn rejects_bad_schemes_and_garbage() {
        for bad in ["ftp://example.com/file", "file:///etc/passwd", "not a url", "javascript:alert(1)"] {
            let err = validate(Some(bad), &config()).unwrap_err();
            assert_eq!(err.status().as_u16(), 400, "{bad}");
        }
    }

    #[test]
    fn private_literals_need_opt_in() {
        for private in [
            "http://127.0.0.1:8080/",
            "http://10.1.2.3/",
            "http://192.168.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://localhost:3000/",
        ] {
            assert!(validate(Some(private), &config()).is_err(), "{private}");
        }

        let open = TargetConfig {
            allow_private_networks: true,
            ..config()
        };
        assert!(validate(Some("http://127.0.0.1:8080/"), &open).is_ok());
        assert!(validate(Some("http://8.8.8.8/"), &config()).is_ok());
    }
}
