//! UDP endpoint wrapped in the crypto envelope.
//!
//! Frame layout: one tag byte, then either a plaintext packet (handshake
//! only) or a sealed packet (everything else).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::crypto::{CryptoError, Encryption, NONCE_SIZE, TAG_SIZE};
use crate::packet::Packet;

const TAG_PLAIN: u8 = 0x00;
const TAG_SEALED: u8 = 0x01;

/// Largest datagram the receiver accepts.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Largest UDP payload an IPv4 socket will send.
pub const MAX_SEND: usize = 65_507;

/// Largest encoded packet that still fits one sealed frame.
pub const MAX_SEALED_PACKET: usize = MAX_SEND - 1 - NONCE_SIZE - TAG_SIZE;

/// Whether `packet` can be sealed into a single datagram.
pub fn fits_datagram(packet: &Packet) -> bool {
    packet
        .encoded_len()
        .is_ok_and(|len| len <= MAX_SEALED_PACKET as u64)
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty datagram")]
    Empty,

    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("plaintext frame carried a {0} packet")]
    PlaintextDataPlane(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// One UDP socket shared by the receiver and every sender.
pub struct Transport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    crypto: Encryption,
}

impl Transport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
            crypto: Encryption::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn crypto(&self) -> &Encryption {
        &self.crypto
    }

    /// The socket, unless [`Transport::close`] has been called.
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().clone()
    }

    /// Drops this transport's handle on the socket. The port is released once
    /// the receiver loop drops its own handle.
    pub fn close(&self) {
        self.socket.write().take();
    }

    /// Seals and sends a data-plane packet. Failures are logged and the
    /// packet dropped; returns whether the datagram left the socket.
    pub async fn send(&self, packet: &Packet, to: SocketAddr) -> bool {
        let frame = match self.seal(packet) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(kind = packet.kind(), %to, error = %err, "not sending packet");
                return false;
            }
        };
        match self.send_frame(&frame, to).await {
            Ok(()) => true,
            Err(err) => {
                warn!(kind = packet.kind(), %to, error = %err, "send failed, dropping packet");
                false
            }
        }
    }

    /// Sends a handshake packet in a plaintext frame. Errors propagate so a
    /// joiner can fail its bootstrap.
    pub async fn send_handshake(&self, packet: &Packet, to: SocketAddr) -> io::Result<()> {
        if !packet.is_handshake() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} packets must be sealed", packet.kind()),
            ));
        }
        let body = packet
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(TAG_PLAIN);
        frame.extend_from_slice(&body);
        self.send_frame(&frame, to).await
    }

    pub(crate) fn seal(&self, packet: &Packet) -> Result<Vec<u8>, EnvelopeError> {
        let body = packet
            .encode()
            .map_err(|err| EnvelopeError::Decode(err.to_string()))?;
        let sealed = self.crypto.seal(&body)?;
        let mut frame = Vec::with_capacity(sealed.len() + 1);
        frame.push(TAG_SEALED);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Unwraps a received frame into a packet.
    pub fn open(&self, frame: &[u8]) -> Result<Packet, EnvelopeError> {
        let (&tag, rest) = frame.split_first().ok_or(EnvelopeError::Empty)?;
        match tag {
            TAG_PLAIN => {
                let packet = decode(rest)?;
                if !packet.is_handshake() {
                    return Err(EnvelopeError::PlaintextDataPlane(packet.kind()));
                }
                Ok(packet)
            }
            TAG_SEALED => {
                let body = self.crypto.open(rest)?;
                decode(&body)
            }
            other => Err(EnvelopeError::UnknownTag(other)),
        }
    }

    async fn send_frame(&self, frame: &[u8], to: SocketAddr) -> io::Result<()> {
        let socket = self
            .socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        socket.send_to(frame, to).await?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<Packet, EnvelopeError> {
    Packet::decode(bytes).map_err(|err| EnvelopeError::Decode(err.to_string()))
}
