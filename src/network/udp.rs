//! UDP sockets
//!
//! The data socket is created through `socket2` so the kernel receive
//! buffer can be enlarged before it is handed to tokio.

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Bind a non-blocking UDP socket with an enlarged receive buffer
pub fn bind_data_socket(addr: SocketAddr, recv_buffer_bytes: usize) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
        // Some systems cap the size; the default buffer still works
        warn!(requested = recv_buffer_bytes, error = %e, "could not set receive buffer size");
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    if let Ok(actual) = socket.recv_buffer_size() {
        debug!(%addr, recv_buffer = actual, "data socket bound");
    }

    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

/// Sends encoded block datagrams to one destination
pub struct BlockSender {
    socket: UdpSocket,
    target: SocketAddr,
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl BlockSender {
    /// Bind an ephemeral local socket sending to `target`
    pub async fn connect(target: SocketAddr) -> Result<Self, NetworkError> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        Ok(Self {
            socket,
            target,
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    pub async fn send(&self, datagram: &Bytes) -> Result<(), NetworkError> {
        match self.socket.send_to(datagram, self.target).await {
            Ok(len) => {
                self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::SendFailed(e.to_string()))
            }
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Sender statistics
#[derive(Debug, Clone)]
pub struct SenderStats {
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_bound_socket() {
        let receiver = bind_data_socket("127.0.0.1:0".parse().unwrap(), 1 << 20).unwrap();
        let target = receiver.local_addr().unwrap();

        let sender = BlockSender::connect(target).await.unwrap();
        sender.send(&Bytes::from_static(b"block")).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"block");
        assert_eq!(from.port(), sender.local_addr().unwrap().port());
        assert_eq!(sender.stats().datagrams_sent, 1);
    }
}
