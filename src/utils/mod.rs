//! Shared utilities for the Rivet PBX

pub mod logger;

pub use logger::setup_logging;

use std::net::IpAddr;
use std::str::FromStr;

use crate::Error;

/// Normalize a MAC address to lowercase hex with no separators.
/// Returns `None` when the input does not contain exactly 12 hex digits.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if hex.len() == 12 && raw.chars().all(|c| c.is_ascii_hexdigit() || ":-.".contains(c)) {
        Some(hex)
    } else {
        None
    }
}

/// An IPv4/IPv6 prefix used to map caller addresses to sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl IpNetwork {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - self.prefix_len as u32);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - self.prefix_len as u32);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix_len: u8 = prefix
                    .parse()
                    .map_err(|_| Error::parse(format!("Invalid prefix length: {}", prefix)))?;
                (addr, prefix_len)
            }
            None => (s, if s.contains(':') { 128 } else { 32 }),
        };

        let network: IpAddr = addr
            .parse()
            .map_err(|_| Error::parse(format!("Invalid network address: {}", addr)))?;

        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::parse(format!("Prefix length {} out of range", prefix)));
        }

        Ok(Self {
            network,
            prefix_len: prefix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac_mixed_separators() {
        assert_eq!(
            normalize_mac("00:15:65:12:34:56"),
            Some("001565123456".to_string())
        );
        assert_eq!(
            normalize_mac("00-15.65:12-34.56"),
            Some("001565123456".to_string())
        );
        assert_eq!(
            normalize_mac("001565ABCDEF"),
            Some("001565abcdef".to_string())
        );
    }

    #[test]
    fn test_normalize_mac_rejects_garbage() {
        assert_eq!(normalize_mac("not a mac"), None);
        assert_eq!(normalize_mac("0015651234"), None);
        assert_eq!(normalize_mac("001565123456ff"), None);
    }

    #[test]
    fn test_ip_network_contains() {
        let net: IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains("192.168.1.100".parse().unwrap()));
        assert!(!net.contains("192.168.2.100".parse().unwrap()));

        let all: IpNetwork = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_ip_network_parse_errors() {
        assert!("192.168.1.0/33".parse::<IpNetwork>().is_err());
        assert!("bogus/8".parse::<IpNetwork>().is_err());
    }
}
