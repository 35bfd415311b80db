use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use address::Address;
use error::{Error, Result};

/// A self-describing network endpoint that couples transport coordinates
/// with the address reachable at them.
///
/// The canonical form is `/ip4/<host>/udp/<port>/kad/<hex address>`, with
/// `/ip6/…` for IPv6 hosts.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MultiAddress {
    host: IpAddr,
    port: u16,
    address: Address,
}

impl MultiAddress {
    pub fn new(host: IpAddr, port: u16, address: Address) -> MultiAddress {
        MultiAddress {
            host: host,
            port: port,
            address: address,
        }
    }

    /// The address component of the endpoint.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The transport coordinates of the endpoint.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for MultiAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let protocol = match self.host {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{}/{}/udp/{}/kad/{}",
            protocol, self.host, self.port, self.address,
        )
    }
}

impl fmt::Debug for MultiAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MultiAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<MultiAddress> {
        let mut components = s.split('/');
        if components.next() != Some("") {
            return Err(Error::Decode(format!(
                "a multiaddress must start with '/': {:?}",
                s,
            )));
        }
        let protocol = components.next();
        let host_component = components
            .next()
            .ok_or_else(|| Error::Decode(format!("missing host in {:?}", s)))?;
        let host = match protocol {
            Some("ip4") => {
                let host = host_component
                    .parse()
                    .map_err(|_| Error::Decode(format!("invalid IPv4 host in {:?}", s)))?;
                IpAddr::V4(host)
            }
            Some("ip6") => {
                let host = host_component
                    .parse()
                    .map_err(|_| Error::Decode(format!("invalid IPv6 host in {:?}", s)))?;
                IpAddr::V6(host)
            }
            _ => {
                return Err(Error::Decode(format!(
                    "unsupported host protocol in {:?}",
                    s,
                )))
            }
        };
        if components.next() != Some("udp") {
            return Err(Error::Decode(format!(
                "unsupported transport protocol in {:?}",
                s,
            )));
        }
        let port = components
            .next()
            .ok_or_else(|| Error::Decode(format!("missing port in {:?}", s)))?
            .parse::<u16>()
            .map_err(|_| Error::Decode(format!("invalid port in {:?}", s)))?;
        if components.next() != Some("kad") {
            return Err(Error::Decode(format!(
                "unsupported identity protocol in {:?}",
                s,
            )));
        }
        let address = Address::from_hex(
            components
                .next()
                .ok_or_else(|| Error::Decode(format!("missing address in {:?}", s)))?,
        )?;
        if components.next().is_some() {
            return Err(Error::Decode(format!(
                "trailing components in {:?}",
                s,
            )));
        }
        Ok(MultiAddress::new(host, port, address))
    }
}
