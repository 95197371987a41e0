//! Pieces shared by both control-session roles.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::{sync::watch, time};

use crate::ktunnel::tunnel::{
    link::ControlLink,
    protocol::{self, Message, MessageType, ProtocolError},
    registry::{Connections, RegistryError},
};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no tunnel established")]
    NoTunnel,
    #[error("control write timed out")]
    WriteTimeout,
    #[error("control stream dropped after a failed write")]
    LinkLost,
    #[error("timed out waiting for peer")]
    ReadTimeout,
    #[error("invalid secret")]
    Auth,
    #[error("unexpected {kind} message on channel {channel}")]
    Unexpected { kind: MessageType, channel: u16 },
    #[error("login not acknowledged: {0}")]
    NoHelo(String),
}

impl TunnelError {
    pub fn unexpected(msg: &Message) -> Self {
        TunnelError::Unexpected {
            kind: msg.kind,
            channel: msg.channel,
        }
    }

    /// Violations of the tunnel protocol by the peer, as opposed to transport failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TunnelError::Protocol(ProtocolError::BadMagic)
                | TunnelError::Protocol(ProtocolError::BadType(_))
                | TunnelError::Protocol(ProtocolError::PayloadTooLarge(_))
                | TunnelError::Auth
                | TunnelError::Unexpected { .. }
                | TunnelError::NoHelo(_)
        )
    }
}

/// Awaits `fut` for at most `timeout`; zero means no limit.
pub async fn deadline<T, E>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, TunnelError>
where
    TunnelError: From<E>,
{
    if timeout.is_zero() {
        return Ok(fut.await?);
    }
    match time::timeout(timeout, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TunnelError::ReadTimeout),
    }
}

/// Resolves once shutdown is requested. A dropped sender never requests it.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Handles a `Control` message: answers `ping`, ignores `pong` and other literals.
pub async fn route_control(link: &ControlLink, msg: &Message) -> Result<(), TunnelError> {
    if msg.channel != protocol::CONTROL_CHANNEL {
        return Err(TunnelError::unexpected(msg));
    }

    if msg.is_control(protocol::PING) {
        link.send(Message::control(protocol::PONG)).await?;
    } else if !msg.is_control(protocol::PONG) {
        tracing::debug!(msg = %msg.summary(), "tunnel: ignoring control message");
    }
    Ok(())
}

/// Queues a `Data` message on its Connection, or tells the peer the channel is gone.
pub async fn route_data(
    registry: &Connections,
    link: &ControlLink,
    msg: Message,
) -> Result<(), TunnelError> {
    match registry.get(msg.channel, false) {
        Some(conn) => {
            conn.send_data(msg);
            Ok(())
        }
        None => {
            tracing::debug!(channel = msg.channel, "tunnel: data for unknown channel");
            link.send(Message::disconnect(msg.channel)).await
        }
    }
}

/// Unregisters the addressed Connection and lets its drain loop close it in order.
pub fn route_disconnect(registry: &Connections, msg: Message) {
    if let Some(conn) = registry.get(msg.channel, true) {
        conn.send_data(msg);
    }
}
