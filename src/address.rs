//! Broker address parsing and identity formation.

use crate::error::{Error, Result};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5672;

/// One configured broker endpoint, positioned at a stable priority index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub index: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16, index: u16) -> Self {
        Self {
            host: host.into(),
            port,
            index,
        }
    }

    /// Short log label, e.g. `b0`.
    pub fn alias(&self) -> String {
        format!("b{}", self.index)
    }

    /// Stable identity: `rs-broker-<host with '-' -> '~'>-<port>`.
    pub fn identity(&self) -> String {
        format!("rs-broker-{}-{}", self.host.replace('-', "~"), self.port)
    }
}

struct SpecItem {
    value: String,
    index: Option<u16>,
}

fn parse_spec(spec: &str) -> Vec<SpecItem> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((value, idx)) => SpecItem {
                value: value.to_string(),
                index: idx.parse().ok(),
            },
            None => SpecItem {
                value: entry.to_string(),
                index: None,
            },
        })
        .collect()
}

/// Parse comma-separated `host[:index]` and `port[:index]` specs into an
/// ordered list of [`BrokerAddress`]. Equal-length lists pair element-wise;
/// a single-entry list broadcasts across the other.
pub fn parse_addresses(host_spec: Option<&str>, port_spec: Option<&str>) -> Result<Vec<BrokerAddress>> {
    let hosts = match host_spec {
        Some(s) if !s.trim().is_empty() => parse_spec(s),
        _ => vec![SpecItem {
            value: DEFAULT_HOST.to_string(),
            index: None,
        }],
    };
    let ports = match port_spec {
        Some(s) if !s.trim().is_empty() => parse_spec(s),
        _ => vec![SpecItem {
            value: DEFAULT_PORT.to_string(),
            index: None,
        }],
    };

    if hosts.is_empty() {
        return Err(if host_spec.is_some() {
            // A spec string was supplied but every entry was empty, e.g. ",,,".
            Error::NoUserData
        } else {
            Error::NoBrokerHosts
        });
    }

    let pairs: Vec<(&SpecItem, &SpecItem)> = if hosts.len() == ports.len() {
        hosts.iter().zip(ports.iter()).collect()
    } else if hosts.len() == 1 {
        ports.iter().map(|p| (&hosts[0], p)).collect()
    } else if ports.len() == 1 {
        hosts.iter().map(|h| (h, &ports[0])).collect()
    } else {
        return Err(Error::InvalidArgument(format!(
            "host list ({} entries) and port list ({} entries) cannot be paired",
            hosts.len(),
            ports.len()
        )));
    };

    pairs
        .into_iter()
        .enumerate()
        .map(|(position, (host, port))| {
            let port: u16 = port.value.parse().map_err(|_| {
                Error::InvalidArgument(format!("invalid port: {}", port.value))
            })?;
            let index = host.index.or(port.index).unwrap_or(position as u16);
            Ok(BrokerAddress::new(host.value.clone(), port, index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip() {
        let addr = BrokerAddress::new("broker0.example.com", 5672, 0);
        assert_eq!(addr.identity(), "rs-broker-broker0.example.com-5672");
        assert_eq!(addr.alias(), "b0");
    }

    #[test]
    fn identity_escapes_hyphen() {
        let addr = BrokerAddress::new("my-broker", 5673, 1);
        assert_eq!(addr.identity(), "rs-broker-my~broker-5673");
    }

    #[test]
    fn defaults_to_localhost_5672() {
        let addrs = parse_addresses(None, None).unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].host, "localhost");
        assert_eq!(addrs[0].port, 5672);
        assert_eq!(addrs[0].index, 0);
    }

    #[test]
    fn pairs_element_wise_when_equal_length() {
        let addrs = parse_addresses(Some("h0,h1"), Some("1111,2222")).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].host, "h0");
        assert_eq!(addrs[0].port, 1111);
        assert_eq!(addrs[1].host, "h1");
        assert_eq!(addrs[1].port, 2222);
    }

    #[test]
    fn broadcasts_single_host_over_ports() {
        let addrs = parse_addresses(Some("h0"), Some("1111,2222,3333")).unwrap();
        assert_eq!(addrs.len(), 3);
        assert!(addrs.iter().all(|a| a.host == "h0"));
        assert_eq!(addrs.iter().map(|a| a.port).collect::<Vec<_>>(), vec![1111, 2222, 3333]);
    }

    #[test]
    fn broadcasts_single_port_over_hosts() {
        let addrs = parse_addresses(Some("h0,h1,h2"), Some("1111")).unwrap();
        assert_eq!(addrs.len(), 3);
        assert!(addrs.iter().all(|a| a.port == 1111));
    }

    #[test]
    fn spec_string_with_no_real_entries_is_no_user_data() {
        let err = parse_addresses(Some(",,,"), None).unwrap_err();
        assert!(matches!(err, Error::NoUserData));
    }

    #[test]
    fn mismatched_lists_fail() {
        let err = parse_addresses(Some("h0,h1"), Some("1,2,3")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn explicit_index_overrides_position() {
        let addrs = parse_addresses(Some("h0:5,h1:2"), Some("1,2")).unwrap();
        assert_eq!(addrs[0].index, 5);
        assert_eq!(addrs[1].index, 2);
    }
}
