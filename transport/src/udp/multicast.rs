use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;

use crate::config::UdpSampleConfig;

/// Creates the receiving end of the sample multicast group: a reusable,
///  non-blocking socket bound to the group port that has joined the group on
///  all interfaces.
pub fn receive_socket(config: &UdpSampleConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // several processes on one host all listen on the group port
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.multicast_port));
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;

    info!("joined multicast group {}:{}", config.multicast_group, config.multicast_port);

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Creates the sending socket for the sample multicast group.
pub fn send_socket(config: &UdpSampleConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind_addr.into())?;

    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(config.multicast_loopback)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// target address for [crate::udp::send::TargetedSender]
pub fn group_address(config: &UdpSampleConfig) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(config.multicast_group, config.multicast_port))
}
