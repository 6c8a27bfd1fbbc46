//! Socket construction with the session layer's kernel options applied.

use std::net::SocketAddr;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::config::{
    TCP_RECV_BUFFER_BYTES, TCP_SEND_BUFFER_BYTES, UDP_RECV_BUFFER_BYTES, UDP_SEND_BUFFER_BYTES,
};

pub fn bind_tcp_listener(port: u16) -> anyhow::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.set_send_buffer_size(TCP_SEND_BUFFER_BYTES as u32)?;
    socket.set_recv_buffer_size(TCP_RECV_BUFFER_BYTES as u32)?;
    socket
        .bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .with_context(|| format!("binding TCP port {}", port))?;
    Ok(socket.listen(1024)?)
}

/// No-delay on, linger off. Applied to both accepted and dialed streams.
pub fn configure_tcp_stream(stream: &TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_linger(None)?;
    Ok(())
}

pub async fn connect_tcp(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_send_buffer_size(TCP_SEND_BUFFER_BYTES as u32)?;
    socket.set_recv_buffer_size(TCP_RECV_BUFFER_BYTES as u32)?;
    let stream = socket.connect(addr).await?;
    configure_tcp_stream(&stream)?;
    Ok(stream)
}

fn new_udp_socket(bind: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(UDP_SEND_BUFFER_BYTES)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER_BYTES)?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&bind.into())
        .with_context(|| format!("binding UDP socket on {}", bind))?;
    socket.set_nonblocking(true)?;

    let socket: std::net::UdpSocket = socket.into();
    dont_fragment(&socket);
    ignore_icmp_unreachable(&socket);
    Ok(UdpSocket::from_std(socket)?)
}

pub fn bind_server_udp(port: u16) -> anyhow::Result<UdpSocket> {
    new_udp_socket(SocketAddr::from(([0, 0, 0, 0], port)))
}

/// Ephemeral local port for the client's UDP flow.
pub fn bind_client_udp() -> anyhow::Result<UdpSocket> {
    new_udp_socket(SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Sets the IP don't-fragment flag. Only Windows exposes a portable knob for
/// this on UDP sockets; elsewhere the kernel's path-MTU default applies.
fn dont_fragment(_socket: &std::net::UdpSocket) {}

/// Suppresses recv errors caused by ICMP unreachable replies, which
/// otherwise allow spoofed ICMP to break an established flow. Windows-only
/// behavior (`SIO_UDP_CONNRESET`); a no-op elsewhere.
fn ignore_icmp_unreachable(_socket: &std::net::UdpSocket) {}
