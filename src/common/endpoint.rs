//! Canonical `"<4|6>@<ip>@<port>@<u|t>"` endpoint encoding.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Longest possible endpoint string (`6@` + full IPv6 text + `@65535@u`).
pub const MAX_ENDPOINT_STRING_LEN: usize = 2 + 39 + 6 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// Stream transports carry packages of any size.
    pub fn is_stream(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A socket address plus the protocol it is reachable with.
pub struct Endpoint {
    pub address: SocketAddr,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(address: SocketAddr, protocol: Protocol) -> Self {
        Self { address, protocol }
    }

    pub fn udp(address: SocketAddr) -> Self {
        Self::new(address, Protocol::Udp)
    }

    pub fn tcp(address: SocketAddr) -> Self {
        Self::new(address, Protocol::Tcp)
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    /// Unspecified ip or port 0, never worth retaining.
    pub fn is_zero(&self) -> bool {
        self.address.ip().is_unspecified() || self.address.port() == 0
    }

    /// Address that cannot be reached from outside the local network.
    pub fn is_private(&self) -> bool {
        match self.address.ip() {
            IpAddr::V4(ip) => {
                ip.is_private() || ip.is_loopback() || ip.is_unspecified() || ip.is_link_local()
            }
            IpAddr::V6(ip) => {
                ip.is_loopback()
                    || ip.is_unspecified()
                    // fc00::/7 unique local, fe80::/10 link local
                    || (ip.segments()[0] & 0xfe00) == 0xfc00
                    || (ip.segments()[0] & 0xffc0) == 0xfe80
            }
        }
    }

    /// Same port, and same ip unless `self` listens on a wildcard ip.
    pub fn matches(&self, other: &Endpoint) -> bool {
        if self.protocol != other.protocol || self.address.port() != other.address.port() {
            return false;
        }

        self.address.ip().is_unspecified() || self.address.ip() == other.address.ip()
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let family = if self.address.is_ipv4() { 4 } else { 6 };
        let protocol = match self.protocol {
            Protocol::Udp => 'u',
            Protocol::Tcp => 't',
        };

        write!(
            f,
            "{family}@{}@{}@{protocol}",
            self.address.ip(),
            self.address.port()
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid endpoint string: {0}")]
pub struct ParseEndpointError(pub String);

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEndpointError(s.to_string());

        let mut parts = s.split('@');
        let (Some(family), Some(ip), Some(port), Some(protocol), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };

        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        match (family, &ip) {
            ("4", IpAddr::V4(_)) | ("6", IpAddr::V6(_)) => {}
            _ => return Err(invalid()),
        }

        let protocol = match protocol {
            "u" => Protocol::Udp,
            "t" => Protocol::Tcp,
            _ => return Err(invalid()),
        };

        Ok(Endpoint::new(SocketAddr::new(ip, port), protocol))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn to_and_from_string() {
        let ep = Endpoint::udp("1.2.3.4:5678".parse().unwrap());
        assert_eq!(ep.to_string(), "4@1.2.3.4@5678@u");
        assert_eq!("4@1.2.3.4@5678@u".parse::<Endpoint>().unwrap(), ep);

        let ep = Endpoint::tcp("[::1]:80".parse().unwrap());
        assert_eq!(ep.to_string(), "6@::1@80@t");
        assert_eq!("6@::1@80@t".parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn rejects_malformed() {
        for s in [
            "",
            "4@1.2.3.4@80",
            "4@1.2.3.4@80@x",
            "6@1.2.3.4@80@u",
            "4@::1@80@u",
            "4@1.2.3.4@99999@u",
            "4@1.2.3.4@80@u@extra",
        ] {
            assert!(s.parse::<Endpoint>().is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn longest_string_fits() {
        let ep = Endpoint::udp(
            "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535"
                .parse()
                .unwrap(),
        );
        assert!(ep.to_string().len() <= MAX_ENDPOINT_STRING_LEN);
    }

    #[test]
    fn wildcard_matches_port() {
        let listener = Endpoint::udp("0.0.0.0:4000".parse().unwrap());
        let seen = Endpoint::udp("8.8.8.8:4000".parse().unwrap());

        assert!(listener.matches(&seen));
        assert!(!seen.matches(&Endpoint::udp("8.8.8.8:4001".parse().unwrap())));
        assert!(!listener.matches(&Endpoint::tcp("8.8.8.8:4000".parse().unwrap())));
    }
}
