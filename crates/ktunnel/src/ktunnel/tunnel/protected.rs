use std::{sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::ktunnel::net;
use crate::ktunnel::tunnel::{
    connection::Connection,
    link::ControlLink,
    protocol::{self, Message, MessageType},
    registry::Connections,
    session::{self, TunnelError},
    tls, transport,
};

#[derive(Debug, Clone)]
pub struct ProtectedOptions {
    /// `host:port` of the exposed host's control port.
    pub exposed_addr: String,
    /// TLS server name; defaults to the host part of `exposed_addr`.
    pub server_name: String,
    pub secret: String,
    pub max_tunnels: usize,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

/// The firewalled end: dials out to the exposed host and opens the real target
/// connections it is asked for.
pub struct ProtectedHost {
    opts: ProtectedOptions,
    server_name: ServerName<'static>,
    link: ControlLink,
    registry: Arc<Connections>,
}

impl ProtectedHost {
    pub fn new(opts: ProtectedOptions) -> anyhow::Result<Self> {
        if opts.exposed_addr.trim().is_empty() {
            anyhow::bail!("protected: exposed host address is required");
        }
        let host = net::split_host_port(&opts.exposed_addr)
            .map(|(host, _)| host)
            .unwrap_or(opts.exposed_addr.as_str());
        let server_name = tls::server_name(&opts.server_name, host)?;

        Ok(Self {
            link: ControlLink::new(opts.connect_timeout),
            registry: Arc::new(Connections::new(opts.max_tunnels, opts.timeout)),
            server_name,
            opts,
        })
    }

    pub fn registry(&self) -> Arc<Connections> {
        self.registry.clone()
    }

    /// Keeps a tunnel to the exposed host up until shutdown, retrying every
    /// `connect_timeout` after a failure.
    pub async fn run(
        self: Arc<Self>,
        connector: TlsConnector,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let pinger = tokio::spawn(ping_loop(self.link.clone(), self.opts.ping_interval));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let res = tokio::select! {
                _ = session::shutdown_requested(&mut shutdown) => break,
                res = self.run_once(&connector) => res,
            };

            self.link.detach().await;
            let dropped = self.registry.disconnect_all();
            match res {
                Ok(()) => tracing::info!(channels = dropped, "protected: tunnel closed"),
                Err(err) => tracing::warn!(
                    exposed = %self.opts.exposed_addr,
                    err = %err,
                    channels = dropped,
                    retry_in = %humantime::format_duration(self.opts.connect_timeout),
                    "protected: disconnected; retrying"
                ),
            }

            tokio::select! {
                _ = session::shutdown_requested(&mut shutdown) => break,
                _ = time::sleep(self.opts.connect_timeout) => {}
            }
        }

        pinger.abort();
        self.link.detach().await;
        self.registry.disconnect_all();
        Ok(())
    }

    async fn run_once(&self, connector: &TlsConnector) -> Result<(), TunnelError> {
        let rx = self.login(connector, MessageType::Login).await?;
        let tx = self.login(connector, MessageType::LoginTx).await?;
        let epoch = self.link.attach(Box::new(tx)).await;
        metrics::counter!("ktunnel_control_sessions_total").increment(1);
        tracing::info!(exposed = %self.opts.exposed_addr, "protected: tunnel established");

        tokio::select! {
            res = self.serve(rx) => res,
            _ = self.link.write_failed(epoch) => Err(TunnelError::LinkLost),
        }
    }

    async fn login(
        &self,
        connector: &TlsConnector,
        kind: MessageType,
    ) -> Result<TlsStream<TcpStream>, TunnelError> {
        let tcp = transport::dial_tcp(&self.opts.exposed_addr, self.opts.connect_timeout).await?;
        let connect = connector.connect(self.server_name.clone(), tcp);
        let mut stream = session::deadline(self.opts.connect_timeout, connect).await?;
        handshake(&mut stream, kind, &self.opts.secret, self.opts.connect_timeout).await?;
        Ok(stream)
    }

    /// Reads the inbound control stream until it fails.
    pub async fn serve<R: AsyncRead + Unpin>(&self, mut rx: R) -> Result<(), TunnelError> {
        let timeout = if self.opts.ping_interval.is_zero() {
            Duration::ZERO
        } else {
            self.opts.ping_interval + self.opts.connect_timeout
        };

        loop {
            let msg = session::deadline(timeout, protocol::read_message(&mut rx)).await?;
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(msg = %msg.summary(), "protected: recv");
            }
            self.dispatch(msg).await?;
        }
    }

    pub async fn dispatch(&self, msg: Message) -> Result<(), TunnelError> {
        match msg.kind {
            MessageType::Control => session::route_control(&self.link, &msg).await,
            MessageType::Connect => self.open_channel(msg).await,
            MessageType::Data => session::route_data(&self.registry, &self.link, msg).await,
            MessageType::Disconnect => {
                session::route_disconnect(&self.registry, msg);
                Ok(())
            }
            MessageType::Login | MessageType::LoginTx | MessageType::None => {
                Err(TunnelError::unexpected(&msg))
            }
        }
    }

    async fn open_channel(&self, msg: Message) -> Result<(), TunnelError> {
        if msg.channel == protocol::CONTROL_CHANNEL {
            return Err(TunnelError::unexpected(&msg));
        }
        let target = String::from_utf8_lossy(&msg.payload).into_owned();

        let conn = match self.registry.create(self.link.clone(), msg.channel, None).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(channel = msg.channel, err = %err, "protected: rejecting channel");
                return self.link.send(Message::disconnect(msg.channel)).await;
            }
        };

        tokio::spawn(connect_to_target(
            self.registry.clone(),
            self.link.clone(),
            conn,
            target,
            self.opts.connect_timeout,
        ));
        Ok(())
    }
}

/// Writes the preamble and a login, then requires `helo` back.
pub async fn handshake<S>(
    stream: &mut S,
    kind: MessageType,
    secret: &str,
    timeout: Duration,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_magic(stream).await?;
    let payload = protocol::login_payload("ktunnel", secret);
    let login = Message::new(kind, protocol::CONTROL_CHANNEL, payload);
    protocol::write_message(stream, &login).await?;

    let reply = session::deadline(timeout, protocol::read_message(stream)).await?;
    if reply.channel != protocol::CONTROL_CHANNEL || !reply.is_control(protocol::HELO) {
        return Err(TunnelError::NoHelo(reply.summary()));
    }
    Ok(())
}

async fn connect_to_target(
    registry: Arc<Connections>,
    link: ControlLink,
    conn: Arc<Connection>,
    target: String,
    timeout: Duration,
) {
    let id = conn.id();
    match transport::dial_tcp(&target, timeout).await {
        Ok(stream) => {
            tracing::debug!(channel = id, target = %target, "protected: channel opened");
            let (sent, received) = conn.run(Box::new(stream)).await;
            tracing::debug!(
                channel = id,
                target = %target,
                sent,
                received,
                "protected: channel closed"
            );
        }
        Err(err) => {
            tracing::warn!(
                channel = id,
                target = %target,
                err = %err,
                "protected: cannot connect to target"
            );
            conn.disconnect();
            let _ = link.send(Message::disconnect(id)).await;
        }
    }
    registry.release(&conn);
}

/// Sends `ping` on `link` once per `period` while a stream is attached.
pub async fn ping_loop(link: ControlLink, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut tick = time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if !link.is_attached().await {
            continue;
        }
        if let Err(err) = link.send(Message::control(protocol::PING)).await {
            tracing::trace!(err = %err, "protected: ping skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::ktunnel::tunnel::exposed::{ExposedOptions, ExposedServer};
    use crate::ktunnel::tunnel::protocol::{read_magic, read_message, write_message};

    fn opts() -> ProtectedOptions {
        ProtectedOptions {
            exposed_addr: "tunnel.example.com:443".into(),
            server_name: String::new(),
            secret: "s3cret".into(),
            max_tunnels: 4,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
        }
    }

    async fn host_with_link(o: ProtectedOptions) -> (ProtectedHost, tokio::io::DuplexStream) {
        let host = ProtectedHost::new(o).unwrap();
        let (a, b) = tokio::io::duplex(64 * 1024);
        host.link.attach(Box::new(a)).await;
        (host, b)
    }

    async fn echo_target() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (rd, mut wr) = sock.into_split();
                    let mut lines = BufReader::new(rd).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if wr.write_all(format!("echo:{line}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    struct Exposed {
        forward_addr: String,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn start_exposed(control: tokio::net::TcpListener, target: &str) -> Exposed {
        let forward = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forward_addr = forward.local_addr().unwrap().to_string();
        let server = Arc::new(ExposedServer::new(ExposedOptions {
            listen_addr: control.local_addr().unwrap().to_string(),
            forward_addr: forward_addr.clone(),
            target: target.to_string(),
            secrets: vec!["s3cret".into()],
            max_tunnels: 4,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
        }));
        let acceptor = tls::acceptor("", "").unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(control, forward, acceptor, stop_rx));
        Exposed {
            forward_addr,
            stop,
            task,
        }
    }

    async fn wait_attached(link: &ControlLink, attached: bool) {
        time::timeout(Duration::from_secs(10), async {
            while link.is_attached().await != attached {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn roundtrip(forward_addr: &str, line: &str) -> String {
        let mut client = TcpStream::connect(forward_addr).await.unwrap();
        client.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut reply = String::new();
        let mut rd = BufReader::new(client);
        time::timeout(Duration::from_secs(10), rd.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    #[tokio::test]
    async fn run_logs_in_forwards_and_reconnects() {
        let target = echo_target().await;
        let control = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control.local_addr().unwrap();
        let exposed = start_exposed(control, &target).await;

        let mut o = opts();
        o.exposed_addr = control_addr.to_string();
        o.connect_timeout = Duration::from_millis(500);
        let host = Arc::new(ProtectedHost::new(o).unwrap());
        let connector = tls::connector(true, "").unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let runner = tokio::spawn(host.clone().run(connector, stop_rx));

        wait_attached(&host.link, true).await;
        assert_eq!(roundtrip(&exposed.forward_addr, "hi").await, "echo:hi\n");

        // The exposed side goes away: the tunnel drops and the host keeps retrying.
        exposed.stop.send(true).unwrap();
        exposed.task.await.unwrap().unwrap();
        wait_attached(&host.link, false).await;

        let control = tokio::net::TcpListener::bind(control_addr).await.unwrap();
        let exposed = start_exposed(control, &target).await;
        wait_attached(&host.link, true).await;
        assert_eq!(roundtrip(&exposed.forward_addr, "late").await, "echo:late\n");

        stop.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert!(!host.link.is_attached().await);
        exposed.stop.send(true).unwrap();
    }

    #[test]
    fn requires_exposed_addr() {
        let mut o = opts();
        o.exposed_addr = " ".into();
        assert!(ProtectedHost::new(o).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_ping_per_interval() {
        let link = ControlLink::new(Duration::from_secs(1));
        let (a, mut b) = tokio::io::duplex(1024);
        link.attach(Box::new(a)).await;
        let pinger = tokio::spawn(ping_loop(link.clone(), Duration::from_secs(60)));

        time::sleep(Duration::from_secs(150)).await;
        assert!(read_message(&mut b).await.unwrap().is_control(protocol::PING));
        assert!(read_message(&mut b).await.unwrap().is_control(protocol::PING));
        assert!(time::timeout(Duration::from_secs(1), read_message(&mut b)).await.is_err());

        pinger.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ping_without_tunnel_is_silent() {
        let link = ControlLink::new(Duration::from_secs(1));
        let pinger = tokio::spawn(ping_loop(link, Duration::from_secs(10)));

        time::sleep(Duration::from_secs(35)).await;
        assert!(!pinger.is_finished());
        pinger.abort();
    }

    #[tokio::test]
    async fn handshake_writes_login_and_expects_helo() {
        let (mut local, mut remote) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            read_magic(&mut remote).await.unwrap();
            let login = read_message(&mut remote).await.unwrap();
            write_message(&mut remote, &Message::control(protocol::HELO)).await.unwrap();
            login
        });

        handshake(&mut local, MessageType::LoginTx, "s3cret", Duration::from_secs(1))
            .await
            .unwrap();
        let login = peer.await.unwrap();
        assert_eq!(login.kind, MessageType::LoginTx);
        assert_eq!(&login.payload[..], b"ktunnel:s3cret");
    }

    #[tokio::test]
    async fn handshake_rejects_other_greeting() {
        let (mut local, mut remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            read_magic(&mut remote).await.unwrap();
            read_message(&mut remote).await.unwrap();
            write_message(&mut remote, &Message::control(protocol::PONG)).await.unwrap();
            // Keep the stream open until the client is done.
            let _ = remote.read_u8().await;
        });

        let err = handshake(&mut local, MessageType::Login, "s3cret", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoHelo(_)));
    }

    #[tokio::test]
    async fn serve_answers_ping_and_ends_on_eof() {
        let (host, mut link_end) = host_with_link(opts()).await;
        let (mut exposed, rx) = tokio::io::duplex(1024);

        write_message(&mut exposed, &Message::control(protocol::PING)).await.unwrap();
        drop(exposed);

        assert!(host.serve(rx).await.is_err());
        assert!(read_message(&mut link_end).await.unwrap().is_control(protocol::PONG));
    }

    #[tokio::test]
    async fn connect_opens_target_and_relays_both_ways() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap().to_string();
        let (host, mut link_end) = host_with_link(opts()).await;

        host.dispatch(Message::connect(7, &addr)).await.unwrap();
        host.dispatch(Message::data(7, &b"hello"[..])).await.unwrap();

        let (mut sock, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        sock.write_all(b"world").await.unwrap();
        assert_eq!(read_message(&mut link_end).await.unwrap(), Message::data(7, &b"world"[..]));

        drop(sock);
        assert_eq!(read_message(&mut link_end).await.unwrap(), Message::disconnect(7));

        host.dispatch(Message::disconnect(7)).await.unwrap();
        assert!(host.registry.get(7, false).is_none());
    }

    #[tokio::test]
    async fn unreachable_target_reports_disconnect() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap().to_string();
        drop(target);
        let (host, mut link_end) = host_with_link(opts()).await;

        host.dispatch(Message::connect(9, &addr)).await.unwrap();
        assert_eq!(read_message(&mut link_end).await.unwrap(), Message::disconnect(9));
    }

    #[tokio::test]
    async fn connect_beyond_capacity_is_refused() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap().to_string();
        let mut o = opts();
        o.max_tunnels = 1;
        let (host, mut link_end) = host_with_link(o).await;

        host.dispatch(Message::connect(1, &addr)).await.unwrap();
        host.dispatch(Message::connect(2, &addr)).await.unwrap();

        assert_eq!(read_message(&mut link_end).await.unwrap(), Message::disconnect(2));
        assert_eq!(host.registry.len(), 1);
    }

    #[tokio::test]
    async fn connect_on_control_channel_is_a_violation() {
        let (host, _link_end) = host_with_link(opts()).await;
        let err = host.dispatch(Message::connect(0, "x:1")).await.unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(host.registry.is_empty());
    }
}
