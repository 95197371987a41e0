use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Mutex, watch},
    time,
};

use crate::ktunnel::tunnel::{
    protocol::{self, Message, ProtocolError},
    session::TunnelError,
    transport::BoxedWriter,
};

/// Handle to the control connection a role currently writes on.
///
/// Every Connection, the ping timer and the session loops share one link per role. Whole
/// frames are written under the link's mutex, so concurrent senders never interleave.
#[derive(Clone)]
pub struct ControlLink {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Mutex<Option<Attached>>,
    epoch: AtomicU64,
    write_timeout: Duration,
    // Epoch of the last stream dropped after a failed write.
    failed: watch::Sender<u64>,
}

struct Attached {
    epoch: u64,
    writer: BoxedWriter,
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink").finish_non_exhaustive()
    }
}

impl ControlLink {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(None),
                epoch: AtomicU64::new(0),
                write_timeout,
                failed: watch::channel(0).0,
            }),
        }
    }

    /// Installs `writer` as the active control stream, replacing any previous one.
    /// Returns the epoch to hand back to [`ControlLink::detach_if`].
    pub async fn attach(&self, writer: BoxedWriter) -> u64 {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.inner.writer.lock().await;
        if slot.is_some() {
            tracing::debug!(epoch, "tunnel: replacing control stream");
        }
        *slot = Some(Attached { epoch, writer });
        epoch
    }

    pub async fn detach(&self) {
        self.inner.writer.lock().await.take();
    }

    /// Drops the control stream only if it is still the one attached under `epoch`.
    pub async fn detach_if(&self, epoch: u64) -> bool {
        let mut slot = self.inner.writer.lock().await;
        if slot.as_ref().is_some_and(|a| a.epoch == epoch) {
            slot.take();
            return true;
        }
        false
    }

    /// Resolves once a write on the stream attached under `epoch` failed and the stream
    /// was dropped.
    pub async fn write_failed(&self, epoch: u64) {
        let mut failed = self.inner.failed.subscribe();
        let _ = failed.wait_for(|e| *e == epoch).await;
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.writer.lock().await.is_some()
    }

    /// Epoch of the attached control stream, if any.
    pub async fn current_epoch(&self) -> Option<u64> {
        self.inner.writer.lock().await.as_ref().map(|a| a.epoch)
    }

    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        let mut slot = self.inner.writer.lock().await;
        let Some(attached) = slot.as_mut() else {
            return Err(TunnelError::NoTunnel);
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(msg = %msg.summary(), "tunnel: send");
        }

        let write = protocol::write_message(&mut attached.writer, &msg);
        let res = if self.inner.write_timeout.is_zero() {
            write.await.map_err(TunnelError::from)
        } else {
            match time::timeout(self.inner.write_timeout, write).await {
                Ok(res) => res.map_err(TunnelError::from),
                Err(_) => Err(TunnelError::WriteTimeout),
            }
        };

        // A frame may be half written; nothing more can go on this stream.
        let broken = matches!(
            res,
            Err(TunnelError::WriteTimeout | TunnelError::Protocol(ProtocolError::Io(_)))
        );
        if broken {
            let epoch = attached.epoch;
            slot.take();
            self.inner.failed.send_replace(epoch);
            tracing::debug!(epoch, "tunnel: control stream dropped after failed write");
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::ktunnel::tunnel::protocol::{PING, read_message};

    #[tokio::test]
    async fn send_without_stream_fails() {
        let link = ControlLink::new(Duration::from_secs(1));
        assert!(!link.is_attached().await);
        assert!(matches!(
            link.send(Message::control(PING)).await,
            Err(TunnelError::NoTunnel)
        ));
    }

    #[tokio::test]
    async fn send_writes_whole_frames() {
        let link = ControlLink::new(Duration::from_secs(1));
        let (a, mut b) = tokio::io::duplex(1024);
        link.attach(Box::new(a)).await;

        link.send(Message::data(7, &b"hello"[..])).await.unwrap();
        link.send(Message::disconnect(7)).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), Message::data(7, &b"hello"[..]));
        assert_eq!(read_message(&mut b).await.unwrap(), Message::disconnect(7));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_drops_the_stream() {
        let link = ControlLink::new(Duration::from_millis(50));
        let (a, mut b) = tokio::io::duplex(8);
        link.attach(Box::new(a)).await;

        let err = link.send(Message::data(1, vec![b'A'; 10])).await.unwrap_err();
        assert!(matches!(err, TunnelError::WriteTimeout));
        assert!(!link.is_attached().await);
        assert!(matches!(
            link.send(Message::data(2, &b"for-channel-2"[..])).await,
            Err(TunnelError::NoTunnel)
        ));

        // Only the truncated first frame ever reached the peer.
        let mut seen = Vec::new();
        b.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen.len(), 8);
        assert_eq!(&seen[..5], &[0, 10, 4, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_reported_for_its_epoch() {
        let link = ControlLink::new(Duration::from_millis(50));
        let (a, _b) = tokio::io::duplex(8);
        let epoch = link.attach(Box::new(a)).await;

        let waiter = tokio::spawn({
            let link = link.clone();
            async move { link.write_failed(epoch).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(link.send(Message::data(3, vec![0u8; 64])).await.is_err());
        time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // A later stream is unaffected by the earlier failure.
        let (a2, _b2) = tokio::io::duplex(64);
        let next = link.attach(Box::new(a2)).await;
        assert!(time::timeout(Duration::from_secs(1), link.write_failed(next)).await.is_err());
    }

    #[tokio::test]
    async fn unencodable_message_keeps_the_stream() {
        let link = ControlLink::new(Duration::from_secs(1));
        let (a, mut b) = tokio::io::duplex(1024);
        link.attach(Box::new(a)).await;

        let oversized = Message::data(1, vec![0u8; protocol::MAX_PAYLOAD + 1]);
        assert!(link.send(oversized).await.is_err());
        assert!(link.is_attached().await);

        link.send(Message::control(PING)).await.unwrap();
        assert!(read_message(&mut b).await.unwrap().is_control(PING));
    }

    #[tokio::test]
    async fn stale_epoch_does_not_detach_successor() {
        let link = ControlLink::new(Duration::from_secs(1));
        let (a1, _b1) = tokio::io::duplex(64);
        let (a2, _b2) = tokio::io::duplex(64);

        let first = link.attach(Box::new(a1)).await;
        let second = link.attach(Box::new(a2)).await;
        assert_ne!(first, second);

        assert!(!link.detach_if(first).await);
        assert_eq!(link.current_epoch().await, Some(second));

        assert!(link.detach_if(second).await);
        assert!(!link.is_attached().await);
        assert_eq!(link.current_epoch().await, None);
    }
}
