//! Tunnel wire protocol.
//!
//! Every control connection starts with the [`MAGIC`] preamble, followed by framed messages:
//!
//! ```text
//! [len: u16 BE][type: u8][channel: u16 BE][payload: len bytes]
//! ```
//!
//! `len` counts the payload only. Channel 0 carries control traffic, channels 1..=65535
//! identify multiplexed client/target flows.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Preamble that must prefix every control connection.
pub const MAGIC: &[u8] = b"\r\n\r\nkTuNnEl\n";

pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

pub const CONTROL_CHANNEL: u16 = 0;

pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";
pub const HELO: &[u8] = b"helo";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("invalid message type {0}")]
    BadType(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Message types in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Login = 0,
    LoginTx = 1,
    Control = 2,
    Connect = 3,
    Data = 4,
    Disconnect = 5,
    /// In-memory "no message" marker. Never valid on the wire.
    None = 6,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Login => "Login",
            MessageType::LoginTx => "LoginTX",
            MessageType::Control => "Control",
            MessageType::Connect => "Connect",
            MessageType::Data => "Data",
            MessageType::Disconnect => "Disconnect",
            MessageType::None => "None",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::Login),
            1 => Ok(MessageType::LoginTx),
            2 => Ok(MessageType::Control),
            3 => Ok(MessageType::Connect),
            4 => Ok(MessageType::Data),
            5 => Ok(MessageType::Disconnect),
            other => Err(ProtocolError::BadType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub channel: u16,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    pub fn control(payload: &'static [u8]) -> Self {
        Self::new(
            MessageType::Control,
            CONTROL_CHANNEL,
            Bytes::from_static(payload),
        )
    }

    pub fn connect(channel: u16, target: &str) -> Self {
        Self::new(
            MessageType::Connect,
            channel,
            Bytes::copy_from_slice(target.as_bytes()),
        )
    }

    pub fn data(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Data, channel, payload)
    }

    pub fn disconnect(channel: u16) -> Self {
        Self::new(MessageType::Disconnect, channel, Bytes::new())
    }

    /// True for a `Control` message on channel 0 carrying exactly `literal`.
    pub fn is_control(&self, literal: &[u8]) -> bool {
        self.kind == MessageType::Control
            && self.channel == CONTROL_CHANNEL
            && self.payload.as_ref() == literal
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.kind as u8 > MessageType::Disconnect as u8 {
            return Err(ProtocolError::BadType(self.kind as u8));
        }
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(len));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Short description for debug logs. Data payloads are reduced to their length, other
    /// payloads are shown when they are printable.
    pub fn summary(&self) -> String {
        let shown = match self.kind {
            MessageType::Data => "",
            _ => std::str::from_utf8(&self.payload)
                .ok()
                .filter(|s| s.chars().all(|c| !c.is_control()))
                .unwrap_or(""),
        };
        format!(
            "[{}]: {} {} bytes {}",
            self.channel,
            self.kind,
            self.payload.len(),
            shown
        )
    }
}

pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let buf = msg.encode()?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<Message, ProtocolError> {
    let len = r.read_u16().await?;
    let kind = MessageType::try_from(r.read_u8().await?)?;
    let channel = r.read_u16().await?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok(Message {
        kind,
        channel,
        payload: Bytes::from(payload),
    })
}

pub async fn write_magic<W: AsyncWrite + Unpin + ?Sized>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(MAGIC).await?;
    w.flush().await?;
    Ok(())
}

/// Consumes the preamble, failing on the first byte that does not match.
pub async fn read_magic<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<(), ProtocolError> {
    for expected in MAGIC {
        if r.read_u8().await? != *expected {
            return Err(ProtocolError::BadMagic);
        }
    }
    Ok(())
}

/// Builds a `Login`/`LoginTX` payload (`name:secret`, or the bare secret without a name).
pub fn login_payload(name: &str, secret: &str) -> Bytes {
    if name.is_empty() {
        Bytes::copy_from_slice(secret.as_bytes())
    } else {
        Bytes::from(format!("{name}:{secret}"))
    }
}

/// Extracts the secret from a login payload.
pub fn login_secret(payload: &[u8]) -> String {
    let s = String::from_utf8_lossy(payload);
    match s.split_once(':') {
        Some((_, secret)) => secret.to_string(),
        None => s.into_owned(),
    }
}
