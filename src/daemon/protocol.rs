//! Request/response wire format.
//!
//! A request body is `<Name>:<json payload>`, where `Name` is the
//! [`Request::NAME`] the daemon registered a handler under. A reply body is
//! `{"ok": <response>}` or `{"error": {"kind": ..., "message": ...}}`.
//! Fire-and-forget requests get no reply at all.
//!
//! On TCP every body travels in a frame: a 4-byte big-endian length followed
//! by that many bytes.

use crate::error::{AppResult, ErrorReply, LabError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Separates the request name from its payload.
pub const SEPARATOR: u8 = b':';

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A typed request understood by the daemon.
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    /// Tag the handler is registered under.
    const NAME: &'static str;

    /// `false` for requests the daemon never answers.
    const EXPECTS_REPLY: bool = true;

    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Outcome of one request as sent back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Error(ErrorReply),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> AppResult<T> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Error(err) => Err(err.into()),
        }
    }
}

impl<T> From<AppResult<T>> for Reply<T> {
    fn from(outcome: AppResult<T>) -> Self {
        match outcome {
            Ok(value) => Reply::Ok(value),
            Err(err) => Reply::Error(ErrorReply::from(&err)),
        }
    }
}

/// `<Name>:<json>`
pub fn encode_request<R: Request>(request: &R) -> AppResult<Vec<u8>> {
    let mut message = R::NAME.as_bytes().to_vec();
    message.push(SEPARATOR);
    serde_json::to_writer(&mut message, request)?;
    Ok(message)
}

/// Split a request body into its name and payload.
pub fn split_message(message: &[u8]) -> AppResult<(&str, &[u8])> {
    let position = message
        .iter()
        .position(|byte| *byte == SEPARATOR)
        .ok_or_else(|| LabError::UnknownRequestType("message has no request name".into()))?;
    let name = std::str::from_utf8(&message[..position])
        .map_err(|_| LabError::UnknownRequestType("request name is not UTF-8".into()))?;
    Ok((name, &message[position + 1..]))
}

/// Decode a request payload. An empty payload reads as JSON `null`.
pub fn decode_payload<R: Request>(payload: &[u8]) -> AppResult<R> {
    let payload = if payload.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        payload
    };
    serde_json::from_slice(payload).map_err(|e| {
        LabError::UnknownRequestType(format!("malformed {} payload: {}", R::NAME, e))
    })
}

/// Serialize a handler outcome; never fails.
pub fn encode_reply<T: Serialize>(outcome: AppResult<T>) -> Vec<u8> {
    let reply = Reply::from(outcome);
    serde_json::to_vec(&reply).unwrap_or_else(|e| {
        let fallback: Reply<()> =
            Reply::Error(ErrorReply::from(&LabError::Serialization(e)));
        serde_json::to_vec(&fallback).unwrap_or_default()
    })
}

pub fn decode_reply<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    let reply: Reply<T> = serde_json::from_slice(body)?;
    reply.into_result()
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// `None` when the peer closed the connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
