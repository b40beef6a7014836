//! Non-blocking UDP receive sockets

use std::net::{IpAddr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Bind a non-blocking UDP socket on `bind_ip:port`.
///
/// Port 0 lets the OS pick a free port; read it back with `local_addr`.
/// A receive buffer the OS refuses is logged and otherwise ignored.
pub fn create_udp_socket(
    bind_ip: &str,
    port: u16,
    recv_buffer_size: usize,
) -> Result<UdpSocket, NetworkError> {
    let ip: IpAddr = bind_ip
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(bind_ip.to_string()))?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if recv_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
            warn!("Failed to set receive buffer to {} bytes: {}", recv_buffer_size, e);
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let socket: UdpSocket = socket.into();
    debug!("UDP socket bound to {:?}", socket.local_addr().ok());
    Ok(socket)
}
