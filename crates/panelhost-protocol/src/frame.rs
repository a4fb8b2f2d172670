// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Stream framing for console RPC.
//!
//! Each QUIC stream carries one call. Every frame is a six-byte header
//! (payload length, then frame kind, big-endian) followed by a protobuf
//! payload. A unary call writes one `Rpc` frame and reads one `Reply`;
//! the long-lived request channel writes one `Rpc` frame and then reads
//! `Push` frames until the console closes the stream. The console may
//! answer any read with a `Fault` frame; the codec decodes faults itself
//! so callers always receive either their expected message, a
//! [`RtnStatus`], or a clean close.

use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{ErrorResponse, RtnStatus};

/// Header: 4 bytes payload length + 2 bytes frame kind.
pub const HEADER_LEN: usize = 6;

/// Payload cap (64 MB), sized so a full blob upload fits in one message.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Frame kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    /// Client call (request envelope).
    Rpc = 1,
    /// Console answer to a unary call.
    Reply = 2,
    /// One element pushed on the long-lived request channel.
    Push = 3,
    /// Call-level failure carrying a status record.
    Fault = 4,
}

impl FrameKind {
    fn from_wire(value: u16) -> Result<FrameKind, FrameError> {
        match value {
            1 => Ok(FrameKind::Rpc),
            2 => Ok(FrameKind::Reply),
            3 => Ok(FrameKind::Push),
            4 => Ok(FrameKind::Fault),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Errors from the framing layer
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload too large: {0} bytes (max: {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u16),

    #[error("unexpected frame kind: {0:?}")]
    UnexpectedKind(FrameKind),

    #[error("stream ended mid-frame")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Result<FrameHeader, FrameError> {
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let kind = FrameKind::from_wire(u16::from_be_bytes([bytes[4], bytes[5]]))?;
        if len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        Ok(FrameHeader { kind, len })
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&(self.len as u32).to_be_bytes());
        bytes[4..].copy_from_slice(&(self.kind as u16).to_be_bytes());
        bytes
    }
}

/// Outcome of one framed read, with console faults already decoded.
#[derive(Debug)]
pub enum Inbound<M> {
    /// The expected message.
    Message(M),
    /// The console reported a call-level failure.
    Fault(RtnStatus),
    /// The peer closed the stream before a header.
    Closed,
}

/// Writer half of a framed stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> FrameWriter<W> {
        FrameWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Encode `msg` and ship it as one frame of the given kind.
    pub async fn write<M: Message>(&mut self, kind: FrameKind, msg: &M) -> Result<(), FrameError> {
        let len = msg.encoded_len();
        if len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        let header = FrameHeader { kind, len };
        let mut buf = Vec::with_capacity(HEADER_LEN + len);
        buf.extend_from_slice(&header.encode());
        msg.encode(&mut buf)?;
        self.inner.write_all(&buf).await?;
        Ok(())
    }
}

/// Reader half of a framed stream. The payload buffer is reused across
/// reads, so a long-lived request channel does not reallocate per frame.
pub struct FrameReader<R> {
    inner: R,
    payload: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> FrameReader<R> {
        FrameReader {
            inner,
            payload: Vec::new(),
        }
    }

    async fn read_header(&mut self) -> Result<Option<FrameHeader>, FrameError> {
        let mut bytes = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut bytes).await {
            Ok(_) => Ok(Some(FrameHeader::parse(bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_payload(&mut self, len: usize) -> Result<&[u8], FrameError> {
        self.payload.resize(len, 0);
        match self.inner.read_exact(&mut self.payload[..len]).await {
            Ok(_) => Ok(&self.payload[..len]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the next frame, expecting `expect`. A `Fault` frame is decoded
    /// into its status record; a clean close before a header yields
    /// [`Inbound::Closed`]; any other kind is an error.
    pub async fn read<M: Message + Default>(
        &mut self,
        expect: FrameKind,
    ) -> Result<Inbound<M>, FrameError> {
        let header = match self.read_header().await? {
            Some(header) => header,
            None => return Ok(Inbound::Closed),
        };
        let payload = self.read_payload(header.len).await?;
        if header.kind == expect {
            return Ok(Inbound::Message(M::decode(payload)?));
        }
        if header.kind == FrameKind::Fault {
            let fault = ErrorResponse::decode(payload)?;
            return Ok(Inbound::Fault(fault.status.unwrap_or_default()));
        }
        Err(FrameError::UnexpectedKind(header.kind))
    }
}
