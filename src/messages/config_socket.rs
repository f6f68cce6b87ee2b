//! Applies the configured TCP/unix socket tuning to a connected stream
//! (keepalives, `TCP_NODELAY`, linger, buffer sizes).

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpStream, UnixStream};

use crate::config::get_config;

/// Tunes a TCP connection (client- or server-facing) per the `general`
/// section of the configuration: keepalive interval/count, `TCP_NODELAY`
/// and linger.
pub fn configure_tcp_socket(stream: &TcpStream) {
    let config = get_config().general;
    let sock_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.tcp_keepalives_idle))
        .with_interval(Duration::from_secs(config.tcp_keepalives_interval));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(config.tcp_keepalives_count);

    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        log::warn!("Failed to set TCP keepalive: {err}");
    }

    if let Err(err) = sock_ref.set_nodelay(config.tcp_no_delay) {
        log::warn!("Failed to set TCP_NODELAY: {err}");
    }

    if let Err(err) = sock_ref.set_linger(Some(Duration::from_secs(config.tcp_so_linger))) {
        log::warn!("Failed to set SO_LINGER: {err}");
    }
}

/// Tunes a unix-domain socket connection to a server: send/receive buffer sizes.
pub fn configure_unix_socket(stream: &UnixStream) {
    let config = get_config().general;
    let sock_ref = SockRef::from(stream);

    if let Err(err) = sock_ref.set_send_buffer_size(config.unix_socket_buffer_size) {
        log::warn!("Failed to set unix socket send buffer size: {err}");
    }
    if let Err(err) = sock_ref.set_recv_buffer_size(config.unix_socket_buffer_size) {
        log::warn!("Failed to set unix socket receive buffer size: {err}");
    }
}

/// Tunes the TCP connection for a `CancelRequest`, which is short-lived and
/// never reused, so only `TCP_NODELAY` is worth setting.
pub fn configure_tcp_socket_for_cancel(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(err) = sock_ref.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY for cancel connection: {err}");
    }
}
