use crate::{decode, encode, Message};
use anyhow::{Context, Result};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket;

/// Largest datagram we will accept.
pub const RECV_BUFFER: usize = 65535;

/// One nonblocking UDP socket shared by all of a replica's traffic. The
/// socket binds an ephemeral localhost port; every send is addressed to the
/// cluster's well-known endpoint, which routes datagrams by replica id.
pub struct Transport {
    socket: UdpSocket,
    endpoint: SocketAddr,
    buf: Vec<u8>,
}

impl Transport {
    /// Bind a fresh socket and aim it at the shared endpoint on `port`.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating udp socket")?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into())
            .context("binding udp socket")?;
        let std_socket: StdUdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("registering udp socket")?;
        Ok(Transport {
            socket,
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            buf: vec![0u8; RECV_BUFFER],
        })
    }

    /// The local address this transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one message as one datagram. Failures are message loss; Raft
    /// retries at the protocol layer, not here.
    pub fn send(&self, msg: &Message) {
        let bytes = match encode(msg) {
            Ok(b) => b,
            Err(e) => {
                debug!("failed to encode outbound message: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.try_send_to(&bytes, self.endpoint) {
            debug!("send to {} failed (treated as loss): {}", self.endpoint, e);
        }
    }

    /// Drain every datagram currently pending on the socket. Undecodable
    /// datagrams are dropped.
    pub fn recv_ready(&mut self) -> Vec<Message> {
        let mut inbound = Vec::new();
        loop {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok((n, _)) => match decode(&self.buf[..n]) {
                    Ok(msg) => inbound.push(msg),
                    Err(e) => debug!("dropping undecodable datagram: {}", e),
                },
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("recv error: {}", e);
                    break;
                }
            }
        }
        inbound
    }
}
