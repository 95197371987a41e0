use std::time::Duration;

use tokio::{net::TcpStream, time};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// A client socket, a target socket or a TLS control connection.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// The outbound half of a control connection.
pub type BoxedWriter = Box<dyn tokio::io::AsyncWrite + Unpin + Send>;

/// Dials a plain TCP endpoint (`host:port` or `[ipv6]:port`), bounded by `timeout`
/// unless it is zero.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let conn = if timeout.is_zero() {
        TcpStream::connect(addr).await?
    } else {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timeout {addr}"),
                )
            })??
    };
    let _ = conn.set_nodelay(true);
    Ok(conn)
}
