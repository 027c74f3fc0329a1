use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr as StdSocketAddr};

/// The `AF_*` family a guest `socket(2)` call asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Inet,
    Inet6,
}

/// The `SOCK_*` type a guest `socket(2)` call asked for. `dbgcore` only
/// proxies stream and datagram sockets onto host TCP/UDP; anything else is
/// rejected with [`crate::SocketError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestAddr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

impl From<GuestAddr> for StdSocketAddr {
    fn from(addr: GuestAddr) -> StdSocketAddr {
        match addr {
            GuestAddr::V4(ip, port) => StdSocketAddr::from((ip, port)),
            GuestAddr::V6(ip, port) => StdSocketAddr::from((ip, port)),
        }
    }
}

impl From<StdSocketAddr> for GuestAddr {
    fn from(addr: StdSocketAddr) -> GuestAddr {
        match addr {
            StdSocketAddr::V4(v4) => GuestAddr::V4(*v4.ip(), v4.port()),
            StdSocketAddr::V6(v6) => GuestAddr::V6(*v6.ip(), v6.port()),
        }
    }
}
