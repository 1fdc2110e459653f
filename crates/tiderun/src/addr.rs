//! Backend keys of the form `network@host:port`.

use std::fmt;

/// A parsed backend key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: String,
    pub address: String,
}

impl Endpoint {
    pub fn parse(key: &str) -> Option<Self> {
        let (network, address) = key.split_once('@')?;
        if network.is_empty() || address.is_empty() || address.contains('@') {
            return None;
        }
        Some(Self {
            network: network.to_owned(),
            address: address.to_owned(),
        })
    }

    /// Host part of the address, without brackets or port.
    pub fn host(&self) -> &str {
        let host = match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.network, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let ep = Endpoint::parse("tcp@127.0.0.1:8889").unwrap();
        assert_eq!(ep.network, "tcp");
        assert_eq!(ep.address, "127.0.0.1:8889");
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.to_string(), "tcp@127.0.0.1:8889");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for key in ["127.0.0.1:8889", "@127.0.0.1:1", "tcp@", "tcp@a@b"] {
            assert_eq!(Endpoint::parse(key), None, "{}", key);
        }
    }

    #[test]
    fn test_host_strips_ipv6_brackets() {
        let ep = Endpoint::parse("tcp@[::1]:80").unwrap();
        assert_eq!(ep.host(), "::1");
    }
}
