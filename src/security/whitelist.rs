//! Admission whitelist: exact addresses and CIDR ranges.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{entry}' is not an IP address or CIDR range")]
pub struct WhitelistError {
    pub entry: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let network: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    exact: Vec<IpAddr>,
    ranges: Vec<Cidr>,
}

impl Whitelist {
    pub fn parse(entries: &[String]) -> Result<Self, WhitelistError> {
        let mut list = Self::default();
        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                let cidr = Cidr::parse(entry).ok_or_else(|| WhitelistError {
                    entry: entry.to_string(),
                })?;
                list.ranges.push(cidr);
            } else {
                let ip = entry.parse::<IpAddr>().map_err(|_| WhitelistError {
                    entry: entry.to_string(),
                })?;
                list.exact.push(super::client_ip::normalize(ip));
            }
        }
        Ok(list)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.ranges.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.exact.contains(&ip) || self.ranges.iter().any(|r| r.contains(ip))
    }
}
