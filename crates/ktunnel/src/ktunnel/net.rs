use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all interfaces".
/// Tokio's bind APIs do not accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Splits `host:port` or `[v6]:port`. The host keeps its brackets; the port must be numeric.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = if addr.starts_with('[') {
        let end = addr.find(']')?;
        let port = addr[end + 1..].strip_prefix(':')?;
        (&addr[..=end], port)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    let port = port.parse().ok()?;
    Some((host, port))
}

/// Port of a listen address such as `":443"` or `"0.0.0.0:443"`.
pub fn port_of(addr: &str) -> Option<u16> {
    split_host_port(&normalize_bind_addr(addr)).map(|(_, port)| port)
}

/// `host:port` to dial: `host` as given when it already names a port, else `host:default_port`.
pub fn with_default_port(host: &str, default_port: u16) -> String {
    let host = host.trim();
    if split_host_port(host).is_some() {
        host.to_string()
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    }
}
