//! The UDP endpoint the queue talks through.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

/// Datagram sink used by the operation queue.
pub trait Transport: Send + Sync + Sized {
    fn send_to(
        &self,
        bytes: &[u8],
        to: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// A UDP socket bound to an ephemeral local port.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a socket of the same address family as `server`. Must be
    /// called from within a tokio runtime.
    pub fn bind_for(server: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = std::net::UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let n = self.socket.send_to(bytes, to).await?;
        if n != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {n} of {} bytes", bytes.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_to_a_loopback_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::bind_for(peer.local_addr().unwrap()).unwrap();

        transport
            .send_to(&[0, 4, 0, 1], peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0, 4, 0, 1]);
        assert_eq!(from.port(), transport.local_addr().unwrap().port());
    }
}
