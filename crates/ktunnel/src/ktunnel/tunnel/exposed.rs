use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::ktunnel::net;
use crate::ktunnel::tunnel::{
    link::ControlLink,
    protocol::{self, Message, MessageType},
    registry::Connections,
    session::{self, TunnelError},
    transport::BoxedStream,
};

#[derive(Debug, Clone)]
pub struct ExposedOptions {
    /// Control port the protected host logs in on (TLS).
    pub listen_addr: String,
    /// Raw TCP port for clients.
    pub forward_addr: String,
    /// `host:port` every forwarded client is connected to on the protected side.
    pub target: String,
    pub secrets: Vec<String>,
    pub max_tunnels: usize,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

/// The internet-facing end: accepts clients on the forward port and the protected
/// host's two control connections on the listen port.
pub struct ExposedServer {
    opts: ExposedOptions,
    link: ControlLink,
    registry: Arc<Connections>,
    // Epoch of the last `Login` stream whose paired `LoginTX` session ended.
    sessions: watch::Sender<u64>,
}

impl ExposedServer {
    pub fn new(opts: ExposedOptions) -> Self {
        let link = ControlLink::new(opts.connect_timeout);
        let registry = Arc::new(Connections::new(opts.max_tunnels, opts.timeout));
        let (sessions, _) = watch::channel(0);
        Self {
            opts,
            link,
            registry,
            sessions,
        }
    }

    pub fn registry(&self) -> Arc<Connections> {
        self.registry.clone()
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        acceptor: TlsAcceptor,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let control = TcpListener::bind(&*net::normalize_bind_addr(&self.opts.listen_addr)).await?;
        let forward = TcpListener::bind(&*net::normalize_bind_addr(&self.opts.forward_addr)).await?;
        self.serve(control, forward, acceptor, shutdown).await
    }

    /// Accept loops over already bound control and forward listeners.
    pub async fn serve(
        self: Arc<Self>,
        control: TcpListener,
        forward: TcpListener,
        acceptor: TlsAcceptor,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            control = %control.local_addr()?,
            forward = %forward.local_addr()?,
            target = %self.opts.target,
            max_tunnels = self.registry.max_size(),
            "exposed: listening"
        );

        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
                accepted = control.accept() => {
                    let (tcp, peer) = accepted?;
                    let _ = tcp.set_nodelay(true);
                    let this = self.clone();
                    let acceptor = acceptor.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        let timeout = this.opts.connect_timeout;
                        let tls = match session::deadline(timeout, acceptor.accept(tcp)).await {
                            Ok(tls) => tls,
                            Err(err) => {
                                tracing::debug!(
                                    peer = %peer,
                                    err = %err,
                                    "exposed: tls handshake failed"
                                );
                                return;
                            }
                        };
                        if let Err(err) = this.handle_control(tls, peer.clone(), shutdown).await {
                            if err.is_protocol_violation() {
                                tracing::warn!(
                                    peer = %peer,
                                    err = %err,
                                    "exposed: control session aborted"
                                );
                            } else {
                                tracing::info!(
                                    peer = %peer,
                                    err = %err,
                                    "exposed: control session ended"
                                );
                            }
                        }
                    });
                }
                accepted = forward.accept() => {
                    let (tcp, peer) = accepted?;
                    let _ = tcp.set_nodelay(true);
                    let this = self.clone();
                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        let target = this.opts.target.clone();
                        let res = this
                            .forward_stream(Box::new(tcp), &peer, &target, Bytes::new())
                            .await;
                        if let Err(err) = res {
                            tracing::debug!(
                                peer = %peer,
                                err = %err,
                                "exposed: client not forwarded"
                            );
                        }
                    });
                }
            }
        }

        self.link.detach().await;
        self.registry.disconnect_all();
        Ok(())
    }

    /// Runs one control connection from magic preamble to the end of its session.
    pub async fn handle_control<S>(
        self: Arc<Self>,
        mut stream: S,
        peer: String,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let login = session::deadline(self.opts.connect_timeout, async {
            protocol::read_magic(&mut stream).await?;
            protocol::read_message(&mut stream).await
        })
        .await?;

        if !matches!(login.kind, MessageType::Login | MessageType::LoginTx) {
            return Err(TunnelError::unexpected(&login));
        }
        let secret = protocol::login_secret(&login.payload);
        if !self.opts.secrets.iter().any(|s| *s == secret) {
            return Err(TunnelError::Auth);
        }
        metrics::counter!("ktunnel_control_sessions_total").increment(1);

        let (rd, wr) = tokio::io::split(stream);
        if login.kind == MessageType::Login {
            self.serve_login(rd, wr, &peer, shutdown).await
        } else {
            self.serve_login_tx(rd, wr, &peer, shutdown).await
        }
    }

    /// The stream this side writes on: attach it and hold it until the paired session ends.
    async fn serve_login<R, W>(
        &self,
        mut rd: R,
        wr: W,
        peer: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !self.registry.is_empty() {
            let stale = self.registry.disconnect_all();
            tracing::debug!(channels = stale, "exposed: dropping channels of previous session");
        }

        let mut ended = self.sessions.subscribe();
        let epoch = self.link.attach(Box::new(wr)).await;
        if let Err(err) = self.link.send(Message::control(protocol::HELO)).await {
            self.link.detach_if(epoch).await;
            return Err(err);
        }
        tracing::info!(peer = %peer, "exposed: protected host logged in");

        let lost = tokio::select! {
            _ = async { let _ = ended.wait_for(|e| *e == epoch).await; } => false,
            _ = wait_closed(&mut rd) => {
                tracing::debug!(peer = %peer, "exposed: login stream closed by peer");
                false
            }
            _ = self.link.write_failed(epoch) => true,
            _ = session::shutdown_requested(&mut shutdown) => false,
        };

        if lost {
            // Dropped after a failed write. Leave the channels alone if a new login took over.
            if self.link.current_epoch().await.is_none() {
                self.registry.disconnect_all();
            }
            return Err(TunnelError::LinkLost);
        }
        if self.link.detach_if(epoch).await {
            self.registry.disconnect_all();
        }
        Ok(())
    }

    /// The stream this side reads on: dispatch until error, then end the pair.
    async fn serve_login_tx<R, W>(
        &self,
        rd: R,
        mut wr: W,
        peer: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(paired) = self.link.current_epoch().await else {
            tracing::warn!(peer = %peer, "exposed: LoginTX without a login stream");
            return Err(TunnelError::NoTunnel);
        };

        protocol::write_message(&mut wr, &Message::control(protocol::HELO)).await?;
        tracing::info!(peer = %peer, "exposed: tunnel established");

        let res = self.read_loop(rd, shutdown).await;

        self.sessions.send_replace(paired);
        if self.link.detach_if(paired).await {
            let dropped = self.registry.disconnect_all();
            tracing::info!(peer = %peer, channels = dropped, "exposed: tunnel closed");
        }
        res
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        mut rd: R,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let timeout = if self.opts.ping_interval.is_zero() {
            Duration::ZERO
        } else {
            self.opts.ping_interval + self.opts.connect_timeout
        };

        loop {
            let msg = tokio::select! {
                _ = session::shutdown_requested(&mut shutdown) => return Ok(()),
                msg = session::deadline(timeout, protocol::read_message(&mut rd)) => msg?,
            };
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(msg = %msg.summary(), "exposed: recv");
            }
            self.dispatch(msg).await?;
        }
    }

    /// Routes one message read from the control stream.
    pub async fn dispatch(&self, msg: Message) -> Result<(), TunnelError> {
        match msg.kind {
            MessageType::Control => session::route_control(&self.link, &msg).await,
            MessageType::Data => session::route_data(&self.registry, &self.link, msg).await,
            MessageType::Disconnect => {
                session::route_disconnect(&self.registry, msg);
                Ok(())
            }
            // The protected side never opens channels towards this side.
            MessageType::Connect
            | MessageType::Login
            | MessageType::LoginTx
            | MessageType::None => Err(TunnelError::unexpected(&msg)),
        }
    }

    /// Tunnels one client socket to `target` on the protected host.
    ///
    /// `initial` holds bytes already read off the client; they follow the `Connect`
    /// before anything the pumps read.
    pub async fn forward_stream(
        &self,
        mut stream: BoxedStream,
        peer: &str,
        target: &str,
        initial: Bytes,
    ) -> Result<(), TunnelError> {
        let conn = self
            .registry
            .create(self.link.clone(), 0, Some(&mut stream))
            .await?;
        let id = conn.id();

        let opened = async {
            self.link.send(Message::connect(id, target)).await?;
            let mut off = 0;
            while off < initial.len() {
                let end = (off + protocol::MAX_PAYLOAD).min(initial.len());
                self.link.send(Message::data(id, initial.slice(off..end))).await?;
                off = end;
            }
            Ok::<(), TunnelError>(())
        }
        .await;
        if let Err(err) = opened {
            self.registry.release(&conn);
            return Err(err);
        }

        tracing::debug!(channel = id, peer = %peer, target = %target, "exposed: channel opened");
        let (sent, received) = conn.run(stream).await;
        self.registry.release(&conn);
        tracing::debug!(channel = id, peer = %peer, sent, received, "exposed: channel closed");
        Ok(())
    }
}

async fn wait_closed<R: AsyncRead + Unpin>(rd: &mut R) {
    let mut buf = [0u8; 512];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => tracing::debug!(bytes = n, "exposed: ignoring bytes on login stream"),
        }
    }
}
