// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup-packet framing for the connection admitter.
//!
//! Wire format: 4-byte length prefix (big-endian) + 4-byte request code +
//! code-specific payload. The supervisor reads exactly one packet per
//! accepted socket to decide between session admission and cancel-request
//! handling; everything after that belongs to the session worker.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Request code: start a session.
pub const CODE_CONNECT_SESSION: u32 = 0x5245_4601;
/// Request code: bgworker-initiated attachment.
pub const CODE_CONNECT_BGWORKER: u32 = 0x5245_4602;
/// Request code: cancel a running query.
pub const CODE_CANCEL: u32 = 0x5245_46fe;

/// Largest accepted startup payload.
pub const MAX_STARTUP_PAYLOAD: usize = 64;

/// How long a client gets to present its startup packet.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before a complete startup packet")]
    ConnectionClosed,

    #[error("startup packet too large: {size} bytes (max {MAX_STARTUP_PAYLOAD})")]
    PacketTooLarge { size: usize },

    #[error("unrecognized startup request code {0:#010x}")]
    BadCode(u32),

    #[error("startup packet truncated")]
    Truncated,

    #[error("timeout reading startup packet")]
    Timeout,
}

/// Decoded startup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPacket {
    Connect { kind: ConnectKind },
    Cancel { pid: u32, token: u32 },
}

/// What the connecting process wants to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    Session,
    /// Background-worker attachment. Carries the pid of the registrant
    /// to notify when the worker is removed; zero on the wire means
    /// nobody asked.
    BgWorker { registrant: Option<u32> },
}

/// Read one startup packet with the admission timeout.
pub async fn read_startup_packet<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<StartupPacket, ProtocolError> {
    tokio::time::timeout(STARTUP_TIMEOUT, read_packet_inner(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

async fn read_packet_inner<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<StartupPacket, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_STARTUP_PAYLOAD {
        return Err(ProtocolError::PacketTooLarge { size: len });
    }
    if len < 4 {
        return Err(ProtocolError::Truncated);
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        })?;

    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match code {
        CODE_CONNECT_SESSION => Ok(StartupPacket::Connect {
            kind: ConnectKind::Session,
        }),
        CODE_CONNECT_BGWORKER => {
            if payload.len() < 8 {
                return Err(ProtocolError::Truncated);
            }
            let registrant = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Ok(StartupPacket::Connect {
                kind: ConnectKind::BgWorker {
                    registrant: (registrant != 0).then_some(registrant),
                },
            })
        }
        CODE_CANCEL => {
            if payload.len() < 12 {
                return Err(ProtocolError::Truncated);
            }
            let pid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            let token = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
            Ok(StartupPacket::Cancel { pid, token })
        }
        other => Err(ProtocolError::BadCode(other)),
    }
}

/// Encode a startup packet; the client side of the handshake.
pub fn encode_startup_packet(packet: StartupPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    match packet {
        StartupPacket::Connect { kind } => match kind {
            ConnectKind::Session => {
                payload.extend_from_slice(&CODE_CONNECT_SESSION.to_be_bytes());
            }
            ConnectKind::BgWorker { registrant } => {
                payload.extend_from_slice(&CODE_CONNECT_BGWORKER.to_be_bytes());
                payload.extend_from_slice(&registrant.unwrap_or(0).to_be_bytes());
            }
        },
        StartupPacket::Cancel { pid, token } => {
            payload.extend_from_slice(&CODE_CANCEL.to_be_bytes());
            payload.extend_from_slice(&pid.to_be_bytes());
            payload.extend_from_slice(&token.to_be_bytes());
        }
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Write the one-line rejection a dead-end worker delivers before exit.
pub async fn write_rejection<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &str,
) -> Result<(), ProtocolError> {
    writer.write_all(b"ERROR: ").await?;
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
