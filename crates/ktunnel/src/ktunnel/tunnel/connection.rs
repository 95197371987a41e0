use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    time,
};

use crate::ktunnel::telemetry;
use crate::ktunnel::tunnel::{
    link::ControlLink,
    protocol::{Message, MessageType},
    session::TunnelError,
    transport::BoxedStream,
};

/// Read size for one `Data` message; leaves room below the 16-bit payload limit.
const READ_CHUNK: usize = 16 * 1024;

/// One multiplexed flow: a direct socket on this side, a channel id on the tunnel.
///
/// The control reader feeds [`Connection::send_data`]; [`Connection::run`] drives two pumps,
/// one copying the socket into the tunnel and one draining the queue into the socket.
pub struct Connection {
    id: u16,
    link: ControlLink,
    idle_timeout: Duration,
    queue_tx: mpsc::UnboundedSender<Message>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    quit: watch::Sender<bool>,
    started_at_unix_ms: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(id: u16, link: ControlLink, idle_timeout: Duration) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            id,
            link,
            idle_timeout,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            quit,
            started_at_unix_ms: telemetry::now_unix_ms(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn started_at_unix_ms(&self) -> u64 {
        self.started_at_unix_ms
    }

    pub fn is_closed(&self) -> bool {
        *self.quit.borrow()
    }

    /// Queues a message from the tunnel. The queue is unbounded; a slow socket on this
    /// channel grows it without affecting other channels.
    pub fn send_data(&self, msg: Message) {
        let _ = self.queue_tx.send(msg);
    }

    /// Stops both pumps and lets them drop the direct socket. Idempotent.
    pub fn disconnect(&self) {
        self.quit.send_replace(true);
    }

    /// Runs both pumps over `stream` until each has observed termination.
    /// Returns the bytes copied (to tunnel, from tunnel).
    pub async fn run(self: &Arc<Self>, stream: BoxedStream) -> (u64, u64) {
        let (rd, wr) = tokio::io::split(stream);

        let this = self.clone();
        let from_tunnel = tokio::spawn(async move { this.pump_from_tunnel(wr).await });
        let this = self.clone();
        let to_tunnel = tokio::spawn(async move { this.pump_to_tunnel(rd).await });

        let sent = to_tunnel.await.unwrap_or_default();
        let received = match from_tunnel.await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                tracing::debug!(channel = self.id, err = %err, "channel: write to socket failed");
                0
            }
            Err(_) => 0,
        };

        metrics::counter!("ktunnel_bytes_to_tunnel_total").increment(sent);
        metrics::counter!("ktunnel_bytes_from_tunnel_total").increment(received);
        (sent, received)
    }

    /// Copies the direct socket into `Data` messages until timeout, hangup, error or quit.
    /// Always finishes with one `Disconnect` for this channel.
    pub async fn pump_to_tunnel<R: AsyncRead + Unpin>(&self, mut rd: R) -> u64 {
        let mut quit = self.quit.subscribe();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;

        while !*quit.borrow() {
            let read = tokio::select! {
                _ = quit.changed() => break,
                r = read_with_timeout(&mut rd, &mut buf, self.idle_timeout) => r,
            };

            match read {
                Err(_) => {
                    tracing::debug!(channel = self.id, "channel: idle timeout");
                    break;
                }
                Ok(Ok(0)) => {
                    tracing::debug!(channel = self.id, "channel: socket closed");
                    break;
                }
                Ok(Ok(n)) => {
                    let payload = bytes::Bytes::copy_from_slice(&buf[..n]);
                    if let Err(err) = self.link.send(Message::data(self.id, payload)).await {
                        tracing::debug!(
                            channel = self.id,
                            err = %err,
                            "channel: tunnel send failed"
                        );
                        break;
                    }
                    total += n as u64;
                }
                Ok(Err(err)) => {
                    tracing::debug!(channel = self.id, err = %err, "channel: socket read failed");
                    break;
                }
            }
        }

        if let Err(err) = self.link.send(Message::disconnect(self.id)).await {
            // Nobody will tell the drain loop to stop; do it here.
            tracing::debug!(channel = self.id, err = %err, "channel: cannot send disconnect");
            self.disconnect();
        }
        total
    }

    /// Drains queued tunnel messages into the direct socket until quit.
    pub async fn pump_from_tunnel<W: AsyncWrite + Unpin>(
        &self,
        mut wr: W,
    ) -> Result<u64, TunnelError> {
        let queue = self
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut queue) = queue else {
            return Ok(0);
        };

        let mut quit = self.quit.subscribe();
        let mut total = 0u64;

        let res = loop {
            if *quit.borrow() {
                break Ok(total);
            }

            let msg = tokio::select! {
                biased;
                _ = quit.changed() => continue,
                msg = queue.recv() => msg,
            };
            let Some(msg) = msg else {
                break Ok(total);
            };

            match msg.kind {
                MessageType::Data => {
                    let written =
                        write_with_timeout(&mut wr, &msg.payload, self.idle_timeout).await;
                    if let Err(err) = written {
                        self.disconnect();
                        break Err(err);
                    }
                    total += msg.payload.len() as u64;
                }
                MessageType::Disconnect => {
                    tracing::debug!(channel = self.id, "channel: disconnect from tunnel");
                    self.disconnect();
                }
                _ => {
                    tracing::debug!(
                        channel = self.id,
                        msg = %msg.summary(),
                        "channel: ignoring queued message"
                    );
                }
            }
        };

        let _ = wr.shutdown().await;
        res
    }
}

async fn read_with_timeout<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<std::io::Result<usize>, time::error::Elapsed> {
    if timeout.is_zero() {
        Ok(rd.read(buf).await)
    } else {
        time::timeout(timeout, rd.read(buf)).await
    }
}

async fn write_with_timeout<W: AsyncWrite + Unpin>(
    wr: &mut W,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TunnelError> {
    let write = async {
        wr.write_all(data).await?;
        wr.flush().await
    };
    if timeout.is_zero() {
        write.await?;
    } else {
        time::timeout(timeout, write)
            .await
            .map_err(|_| TunnelError::WriteTimeout)??;
    }
    Ok(())
}
