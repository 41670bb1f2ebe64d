use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// An IPv4/IPv6 socket address.
///
/// A thin value type over [`SocketAddr`] adding the classification helpers
/// the networking layer needs and an *unspecified* marker, which is what the
/// resolver hands out when a lookup fails. Immutable after construction
/// except for the port setter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InetAddr {
    addr: SocketAddr,
    unspecified: bool,
}

impl InetAddr {
    /// Address from an explicit IP and port.
    pub fn new(ip: IpAddr, port: u16) -> InetAddr {
        InetAddr {
            addr: SocketAddr::new(ip, port),
            unspecified: false,
        }
    }

    /// The IPv4 wildcard address (`0.0.0.0:port`), for listening.
    pub fn any(port: u16) -> InetAddr {
        InetAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// The IPv6 wildcard address (`[::]:port`), for listening.
    pub fn any_v6(port: u16) -> InetAddr {
        InetAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
    }

    /// The IPv4 loopback address (`127.0.0.1:port`).
    pub fn loopback(port: u16) -> InetAddr {
        InetAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// The "no address" value; what a failed name lookup resolves to.
    pub fn unspecified() -> InetAddr {
        InetAddr {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            unspecified: true,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    /// The `"ip:port"` rendition, `"[ip]:port"` for IPv6.
    pub fn to_ip_port(&self) -> String {
        self.addr.to_string()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn is_loopback(&self) -> bool {
        self.addr.ip().is_loopback()
    }

    /// True for addresses that never route on the public internet:
    /// loopback, RFC 1918 private ranges, link-local, and IPv6 ULA.
    pub fn is_intranet(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            IpAddr::V6(ip) => {
                ip.is_loopback()
                    // fc00::/7 (unique local) and fe80::/10 (link local).
                    || (ip.segments()[0] & 0xfe00) == 0xfc00
                    || (ip.segments()[0] & 0xffc0) == 0xfe80
            }
        }
    }

    /// True for the marker produced by [`InetAddr::unspecified`].
    pub fn is_unspecified(&self) -> bool {
        self.unspecified
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> InetAddr {
        InetAddr {
            addr,
            unspecified: false,
        }
    }
}

impl From<InetAddr> for SocketAddr {
    fn from(addr: InetAddr) -> SocketAddr {
        addr.addr
    }
}

impl FromStr for InetAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<InetAddr, Self::Err> {
        s.parse::<SocketAddr>().map(InetAddr::from)
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unspecified {
            write!(f, "(unspecified)")
        } else {
            self.addr.fmt(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InetAddr;

    #[test]
    fn string_round_trips() {
        for s in ["127.0.0.1:8080", "0.0.0.0:0", "10.1.2.3:65535", "[::1]:80"] {
            let addr: InetAddr = s.parse().unwrap();
            assert_eq!(addr.to_ip_port(), s);
            assert_eq!(addr.to_ip_port().parse::<InetAddr>().unwrap(), addr);
        }
    }

    #[test]
    fn classification() {
        let lo: InetAddr = "127.0.0.1:1".parse().unwrap();
        assert!(lo.is_loopback());
        assert!(lo.is_intranet());
        assert!(!lo.is_ipv6());

        let private: InetAddr = "192.168.1.10:1".parse().unwrap();
        assert!(private.is_intranet());
        assert!(!private.is_loopback());

        let public: InetAddr = "8.8.8.8:53".parse().unwrap();
        assert!(!public.is_intranet());

        let ula: InetAddr = "[fd00::1]:1".parse().unwrap();
        assert!(ula.is_ipv6());
        assert!(ula.is_intranet());
    }

    #[test]
    fn unspecified_marker() {
        let addr = InetAddr::unspecified();
        assert!(addr.is_unspecified());
        assert!(!InetAddr::any(0).is_unspecified());
    }

    #[test]
    fn port_setter() {
        let mut addr = InetAddr::loopback(0);
        addr.set_port(4096);
        assert_eq!(addr.port(), 4096);
    }
}
