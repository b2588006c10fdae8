//! Frame protocol codec for the raw-frame transport
//!
//! Frames are newline-delimited JSON objects
//! (`{"command": ..., "headers": {...}, "body": ...}`) over a persistent
//! duplex byte stream. The codec is a [`tokio_util::codec`] pair:
//! `Ok(None)` from [`Decoder::decode`] means more bytes are needed, a
//! [`Error::Protocol`] means the line was malformed or missed a required
//! header. Neither outcome closes the connection; the caller replies with
//! an ERROR frame and keeps reading.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Header names used by the frame protocol
pub mod headers {
    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const VERSION: &str = "version";
    pub const MESSAGE: &str = "message";
}

/// Protocol version reported in CONNECTED replies
pub const PROTOCOL_VERSION: &str = "1.2";

/// Commands understood by the relay. CONNECTED, MESSAGE and ERROR are
/// server-generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Disconnect,
    Error,
}

impl FrameCommand {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Disconnect => "DISCONNECT",
            Self::Error => "ERROR",
        }
    }

    fn parse(command: &str) -> Option<Self> {
        match command {
            "CONNECT" => Some(Self::Connect),
            "CONNECTED" => Some(Self::Connected),
            "SUBSCRIBE" => Some(Self::Subscribe),
            "UNSUBSCRIBE" => Some(Self::Unsubscribe),
            "SEND" => Some(Self::Send),
            "MESSAGE" => Some(Self::Message),
            "DISCONNECT" => Some(Self::Disconnect),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Headers a frame of this command must carry
    const fn required_headers(self) -> &'static [&'static str] {
        match self {
            Self::Subscribe => &[headers::DESTINATION, headers::ID],
            Self::Unsubscribe => &[headers::ID],
            Self::Send => &[headers::DESTINATION],
            Self::Message => &[
                headers::DESTINATION,
                headers::SUBSCRIPTION,
                headers::CONTENT_TYPE,
            ],
            _ => &[],
        }
    }
}

impl std::fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON shape of a frame on the wire
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    command: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

/// One parsed protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl Frame {
    #[must_use]
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: HashMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn require_header(&self, name: &str) -> Result<&str> {
        self.header(name).ok_or_else(|| {
            Error::Protocol(format!("{} frame missing {name} header", self.command))
        })
    }

    /// CONNECTED reply to a successful CONNECT
    #[must_use]
    pub fn connected() -> Self {
        Self::new(FrameCommand::Connected).with_header(headers::VERSION, PROTOCOL_VERSION)
    }

    /// Server-generated MESSAGE frame addressed to one subscription
    #[must_use]
    pub fn message(
        destination: &str,
        subscription_id: &str,
        content_type: &str,
        body: String,
    ) -> Self {
        Self::new(FrameCommand::Message)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::SUBSCRIPTION, subscription_id)
            .with_header(headers::CONTENT_TYPE, content_type)
            .with_body(body)
    }

    /// ERROR reply carrying a human-readable message
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameCommand::Error).with_header(headers::MESSAGE, message.into())
    }

    fn from_wire(wire: WireFrame) -> Result<Self> {
        let command = FrameCommand::parse(&wire.command)
            .ok_or_else(|| Error::UnknownCommand(wire.command.clone()))?;

        let frame = Self {
            command,
            headers: wire.headers,
            body: wire.body,
        };

        for name in command.required_headers() {
            frame.require_header(name)?;
        }

        Ok(frame)
    }

    fn to_wire(&self) -> WireFrame {
        WireFrame {
            command: self.command.as_str().to_string(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Serialize to one newline-terminated wire line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(&self.to_wire())?;
        line.push('\n');
        Ok(line)
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.to_line()?.into_bytes()))
    }
}

/// Newline-delimited frame codec with a bounded decode buffer
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > self.max_frame_bytes {
                    src.clear();
                    return Err(Error::Protocol(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_bytes
                    )));
                }
                return Ok(None);
            };

            if newline > self.max_frame_bytes {
                let _ = src.split_to(newline + 1);
                return Err(Error::Protocol(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_bytes
                )));
            }

            let line = src.split_to(newline + 1);
            let line = &line[..newline];
            let trimmed = trim_ascii(line);
            if trimmed.is_empty() {
                // Bare keepalive newline between frames
                continue;
            }

            let wire: WireFrame = serde_json::from_slice(trimmed)
                .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))?;

            return Frame::from_wire(wire).map(Some);
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let bytes = frame.to_bytes()?;
        dst.reserve(bytes.len());
        dst.put(bytes);
        Ok(())
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
