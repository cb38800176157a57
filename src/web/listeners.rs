use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;

const BACKLOG: i32 = 1024;

/// Binds the HTTP listener. `*` binds every interface, preferring an IPv6
/// dual-stack socket and falling back to IPv4 only.
pub async fn create_listener(host: &str, port: u16) -> std::io::Result<(SocketAddr, TcpListener)> {
    if host == "*" {
        return bind_wildcard(port);
    }

    tracing::info!("Attempting to bind server to {}:{}...", host, port);
    let listener = TcpListener::bind((host, port)).await?;
    Ok((listener.local_addr()?, listener))
}

fn bind_wildcard(port: u16) -> std::io::Result<(SocketAddr, TcpListener)> {
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    match bind_socket(v6, Domain::IPV6) {
        Ok(listener) => Ok((v6, listener)),
        Err(e) => {
            tracing::warn!("Failed to bind {} ({}). Falling back to IPv4 only.", v6, e);
            let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            Ok((v4, bind_socket(v4, Domain::IPV4)?))
        }
    }
}

fn bind_socket(addr: SocketAddr, domain: Domain) -> std::io::Result<TcpListener> {
    tracing::info!("Attempting to bind server to {}...", addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if domain == Domain::IPV6 {
        // Dual-stack is best effort; some systems refuse to clear IPV6_V6ONLY.
        if let Err(e) = socket.set_only_v6(false) {
            tracing::warn!("Could not enable dual-stack mode on {}: {}", addr, e);
        }
    }

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}
