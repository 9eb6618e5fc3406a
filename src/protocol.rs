//! RCON wire format.
//!
//! Every packet is a little-endian `i32` length followed by
//! `request_id: i32`, `packet_type: i32`, the UTF-8 body and two NUL bytes.
//! The length counts everything after itself.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Packet type values. `EXEC_COMMAND` and `AUTH_RESPONSE` share a value;
/// the direction of the packet tells them apart.
pub mod packet_type {
    pub const AUTH: i32 = 3;
    pub const AUTH_RESPONSE: i32 = 2;
    pub const EXEC_COMMAND: i32 = 2;
    pub const RESPONSE_VALUE: i32 = 0;
}

/// Request id the host uses in an `AUTH_RESPONSE` to reject a password.
pub const AUTH_FAILED_ID: i32 = -1;

/// Largest command body the host accepts in a single request.
pub const MAX_REQUEST_BODY: usize = 1446;

const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 2;
const MIN_PACKET_LEN: usize = HEADER_LEN + TRAILER_LEN;
const MAX_PACKET_LEN: usize = 4 * 1024 * 1024;

/// A decoded RCON packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub request_id: i32,
    pub packet_type: i32,
    pub body: String,
}

impl Packet {
    pub fn new(request_id: i32, packet_type: i32, body: impl Into<String>) -> Self {
        Self {
            request_id,
            packet_type,
            body: body.into(),
        }
    }

    /// Encode the packet including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let len = HEADER_LEN + body.len() + TRAILER_LEN;

        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&(len as i32).to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.packet_type.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Decode a packet from the bytes that follow the length prefix.
    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() < MIN_PACKET_LEN {
            return Err(invalid(format!(
                "packet of {} bytes is shorter than the {} byte minimum",
                payload.len(),
                MIN_PACKET_LEN
            )));
        }

        let request_id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let packet_type = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let body = &payload[HEADER_LEN..payload.len() - TRAILER_LEN];

        Ok(Self {
            request_id,
            packet_type,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

/// Read one framed packet.
///
/// A frame too short to hold a header is consumed whole and rejected with
/// `InvalidData`, so the next read starts on a frame boundary. A negative
/// or oversized length leaves no boundary to resume from and is reported
/// as `ConnectionAborted`.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Packet> {
    let raw = reader.read_i32_le().await?;
    let len = match usize::try_from(raw) {
        Ok(len) if len <= MAX_PACKET_LEN => len,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("lost packet framing at length {raw}"),
            ))
        }
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Packet::decode(&payload)
}

/// Write one framed packet and flush it.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
