use std::net::{TcpListener, TcpStream, UdpSocket};

use log::debug;

use crate::{Domain, GuestAddr, Result, SockType, SocketError};

/// One guest socket descriptor's backing host object. Listening and
/// connected stream sockets are kept separate because `accept` needs the
/// former and `send`/`recv` need the latter.
pub enum Socket {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    pub fn new(domain: Domain, ty: SockType) -> Result<Socket> {
        match ty {
            SockType::Datagram => {
                let bind_addr = match domain {
                    Domain::Inet => "0.0.0.0:0",
                    Domain::Inet6 => "[::]:0",
                };
                Ok(Socket::Udp(UdpSocket::bind(bind_addr)?))
            }
            // A stream socket starts out unbound; a host object is only
            // created once `connect` or `bind`+`listen` runs.
            SockType::Stream => Err(SocketError::Unsupported(
                "stream sockets are created lazily on connect/listen".into(),
            )),
        }
    }

    pub fn connect(addr: GuestAddr) -> Result<Socket> {
        let std_addr: std::net::SocketAddr = addr.into();
        debug!("socket: connect {}", std_addr);
        Ok(Socket::TcpStream(TcpStream::connect(std_addr)?))
    }

    pub fn listen(addr: GuestAddr, backlog: u32) -> Result<Socket> {
        let std_addr: std::net::SocketAddr = addr.into();
        let listener = TcpListener::bind(std_addr)?;
        let _ = backlog; // std::net has no explicit backlog knob to forward.
        Ok(Socket::TcpListener(listener))
    }

    pub fn accept(&self) -> Result<(Socket, GuestAddr)> {
        match self {
            Socket::TcpListener(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((Socket::TcpStream(stream), peer.into()))
            }
            _ => Err(SocketError::Unsupported("accept on a non-listening socket".into())),
        }
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        match self {
            Socket::TcpStream(stream) => Ok(stream.write(buf)?),
            Socket::Udp(sock) => Ok(sock.send(buf)?),
            Socket::TcpListener(_) => Err(SocketError::NotConnected),
        }
    }

    pub fn send_to(&mut self, buf: &[u8], addr: GuestAddr) -> Result<usize> {
        match self {
            Socket::Udp(sock) => {
                let std_addr: std::net::SocketAddr = addr.into();
                Ok(sock.send_to(buf, std_addr)?)
            }
            _ => Err(SocketError::Unsupported("send_to on a non-datagram socket".into())),
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        match self {
            Socket::TcpStream(stream) => Ok(stream.read(buf)?),
            Socket::Udp(sock) => Ok(sock.recv(buf)?),
            Socket::TcpListener(_) => Err(SocketError::NotConnected),
        }
    }

    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, GuestAddr)> {
        match self {
            Socket::Udp(sock) => {
                let (n, addr) = sock.recv_from(buf)?;
                Ok((n, addr.into()))
            }
            _ => Err(SocketError::Unsupported("recv_from on a non-datagram socket".into())),
        }
    }

    pub fn local_addr(&self) -> Result<GuestAddr> {
        let addr = match self {
            Socket::TcpListener(l) => l.local_addr()?,
            Socket::TcpStream(s) => s.local_addr()?,
            Socket::Udp(u) => u.local_addr()?,
        };
        Ok(addr.into())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Socket::TcpListener(l) => l.set_nonblocking(nonblocking)?,
            Socket::TcpStream(s) => s.set_nonblocking(nonblocking)?,
            Socket::Udp(u) => u.set_nonblocking(nonblocking)?,
        }
        Ok(())
    }
}

/// Maps guest socket descriptors onto [`Socket`] objects. `dbgcore`'s file
/// descriptor table hands out the same integer space for sockets and
/// files, same as the guest syscall ABI expects; this table only tracks
/// the socket half.
#[derive(Default)]
pub struct SocketTable {
    sockets: std::collections::HashMap<i32, Socket>,
    next_fd: i32,
}

impl SocketTable {
    pub fn new(first_fd: i32) -> Self {
        SocketTable {
            sockets: std::collections::HashMap::new(),
            next_fd: first_fd,
        }
    }

    pub fn insert(&mut self, socket: Socket) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.sockets.insert(fd, socket);
        fd
    }

    pub fn get_mut(&mut self, fd: i32) -> Result<&mut Socket> {
        self.sockets.get_mut(&fd).ok_or(SocketError::BadDescriptor(fd))
    }

    pub fn remove(&mut self, fd: i32) -> Result<Socket> {
        self.sockets.remove(&fd).ok_or(SocketError::BadDescriptor(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_socket_sends_and_receives_loopback() {
        let mut a = Socket::new(Domain::Inet, SockType::Datagram).unwrap();
        let mut b = Socket::new(Domain::Inet, SockType::Datagram).unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_to(b"ping", b_addr).unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn socket_table_hands_out_increasing_fds() {
        let mut table = SocketTable::new(3);
        let s1 = Socket::new(Domain::Inet, SockType::Datagram).unwrap();
        let s2 = Socket::new(Domain::Inet, SockType::Datagram).unwrap();
        let fd1 = table.insert(s1);
        let fd2 = table.insert(s2);
        assert_eq!(fd1, 3);
        assert_eq!(fd2, 4);
        assert!(table.get_mut(fd1).is_ok());
        assert!(table.remove(fd1).is_ok());
        assert!(table.get_mut(fd1).is_err());
    }
}
