//! SIP UDP transport
//!
//! A thin wrapper over a bound UDP socket: receive a datagram and parse
//! it, or serialize a message and send it. No retransmission, no
//! transaction state — SIP over UDP is unreliable by design here and the
//! engine above treats every datagram as fire-and-forget.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::message::SipMessage;
use crate::error::SipError;

pub struct SipTransport {
    socket: UdpSocket,
}

impl SipTransport {
    pub async fn bind(host: &str, port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((host, port)).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram and parse it. A malformed datagram is
    /// returned as `Err` so the caller can log and continue; it never
    /// tears down the socket.
    pub async fn recv(&self) -> Result<(SipMessage, SocketAddr), SipError> {
        let mut buf = [0u8; 8192];
        let (len, source) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| SipError::Internal(e.into()))?;
        let msg = SipMessage::parse(&buf[..len])?;
        Ok((msg, source))
    }

    pub async fn send(&self, msg: &SipMessage, dest: SocketAddr) -> Result<(), SipError> {
        let bytes = msg.serialize();
        self.socket
            .send_to(bytes.as_bytes(), dest)
            .await
            .map_err(|e| SipError::Internal(e.into()))?;
        Ok(())
    }
}
