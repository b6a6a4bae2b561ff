// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Frame protocol spoken on the discovery socket.
//!
//! Every frame consists of:
//!
//! 1. An 8-byte little-endian length header
//! 2. The frame payload (JSON-encoded [`Frame`])
//!
//! # Wire Format
//!
//! ```text
//! +------------------+-------------------+
//! | Length (8 bytes) | Payload (N bytes) |
//! | little-endian    | JSON frame        |
//! +------------------+-------------------+
//! ```
//!
//! A client opens with a `headers` frame naming the method and carrying the
//! credential metadata, then sends `request` frames. The server answers with
//! `response` frames, or an `error` frame.
//!
//! # Size Limits
//!
//! Frames larger than [`MAX_MESSAGE_SIZE`] (10 MB) are rejected to prevent
//! memory exhaustion attacks.

use std::collections::BTreeMap;
use std::mem::size_of;

use anyhow::{Result, anyhow};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::models::{DiscoveryRequest, DiscoveryResponse};

/// RPC selected by the opening frame of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    StreamSecrets,
    FetchSecrets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    Unavailable,
    Internal,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Headers {
        method: Method,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    Request(DiscoveryRequest),
    Response(DiscoveryResponse),
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Sends a frame.
///
/// # Errors
///
/// Returns an error if the frame cannot be encoded, exceeds
/// [`MAX_MESSAGE_SIZE`], or writing to the stream fails.
pub async fn send_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(frame)
        .map_err(|err| anyhow!("failed to encode frame: {:?}", err))?;

    // Write 8-byte little-endian length header
    let payload_len: u64 = payload
        .len()
        .try_into()
        .map_err(|err| anyhow!("failed to compute frame length: {:?}", err))?;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "frame size {} exceeds maximum allowed size {}",
            payload_len,
            MAX_MESSAGE_SIZE
        ));
    }
    let mut header_buf = [0; size_of::<u64>()];
    LittleEndian::write_u64(&mut header_buf, payload_len);
    stream
        .write_all(&header_buf)
        .await
        .map_err(|err| anyhow!("failed to write frame header: {:?}", err))?;

    stream
        .write_all(&payload)
        .await
        .map_err(|err| anyhow!("failed to write frame body: {:?}", err))?;
    stream
        .flush()
        .await
        .map_err(|err| anyhow!("failed to flush frame: {:?}", err))?;

    Ok(())
}

/// Receives a frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// Returns an error if reading fails mid-frame, the announced size exceeds
/// [`MAX_MESSAGE_SIZE`], or the payload is not a valid frame.
pub async fn recv_frame<R>(stream: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // Read 8-byte little-endian length header
    let mut size_buf = [0; size_of::<u64>()];
    let mut filled = 0;
    while filled < size_buf.len() {
        let read = stream
            .read(&mut size_buf[filled..])
            .await
            .map_err(|err| anyhow!("failed to read frame header: {:?}", err))?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(anyhow!(
                "truncated frame header: {} of {} bytes",
                filled,
                size_buf.len()
            ));
        }
        filled += read;
    }

    // Validate frame size to prevent memory exhaustion
    let size = LittleEndian::read_u64(&size_buf);
    if size > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "frame size {} exceeds maximum allowed size {}",
            size,
            MAX_MESSAGE_SIZE
        ));
    }

    let size: usize = size
        .try_into()
        .map_err(|err| anyhow!("failed to compute frame length: {:?}", err))?;
    let mut payload_buffer = vec![0; size];
    stream
        .read_exact(&mut payload_buffer)
        .await
        .map_err(|err| anyhow!("failed to read frame body: {:?}", err))?;

    let frame = serde_json::from_slice(&payload_buffer)
        .map_err(|err| anyhow!("failed to decode frame: {:?}", err))?;

    Ok(Some(frame))
}
