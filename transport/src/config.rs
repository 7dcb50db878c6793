use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::bail;

use crate::udp::frame::FrameHeader;

pub struct UdpSampleConfig {
    /// This is the maximum size of a single datagram including the frame
    ///  header. The hard upper bound is what fits a UDP payload at all
    ///  (65507 bytes); deployments with known smaller MTUs along all routes
    ///  can reduce it to avoid IP-level fragmentation.
    pub max_datagram_size: usize,

    /// Timeout for a single blocking receive call. Chosen small so the
    ///  receive loop can re-check its cancel flag and run the slot sweep
    ///  even when no traffic arrives.
    pub receive_poll_timeout: Duration,

    /// A reassembly slot that has not seen a fragment for this long is
    ///  evicted - the sender is slow, dead, or the rest of the message was
    ///  lost. Whatever arrived is discarded.
    pub slot_timeout: Duration,

    /// The slot sweep runs at most once per this interval, not on every
    ///  datagram.
    pub cleanup_interval: Duration,

    /// Upper bound for the sustained send rate. Fragments of one message are
    ///  delayed against each other so that this rate is not exceeded.
    ///  `None` sends as fast as the socket accepts.
    pub bandwidth_bytes_per_sec: Option<u64>,

    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub multicast_loopback: bool,
}

impl UdpSampleConfig {
    pub fn default_local() -> UdpSampleConfig {
        UdpSampleConfig {
            max_datagram_size: 65507,
            receive_poll_timeout: Duration::from_millis(10),
            slot_timeout: Duration::from_millis(1000),
            cleanup_interval: Duration::from_millis(10),
            bandwidth_bytes_per_sec: None,
            multicast_group: Ipv4Addr::new(239, 0, 0, 1),
            multicast_port: 14000,
            multicast_ttl: 3,
            multicast_loopback: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= FrameHeader::SERIALIZED_LEN {
            bail!("max datagram size {} does not even fit the frame header", self.max_datagram_size);
        }
        if self.max_datagram_size > 65507 {
            bail!("max datagram size {} exceeds what a UDP payload can carry", self.max_datagram_size);
        }
        if self.bandwidth_bytes_per_sec == Some(0) {
            bail!("a bandwidth limit of 0 bytes/sec can never send anything");
        }
        if !self.multicast_group.is_multicast() {
            bail!("{} is not a multicast address", self.multicast_group);
        }
        Ok(())
    }

    /// payload bytes available per fragment once the frame header is accounted for
    pub fn max_fragment_payload(&self) -> usize {
        self.max_datagram_size - FrameHeader::SERIALIZED_LEN
    }
}


pub struct TcpTransportConfig {
    /// `-1` retries forever, `0` gives up after the first failure, `N` allows
    ///  N reconnection attempts. A successfully received payload resets the
    ///  budget to this value.
    pub max_reconnection_attempts: i32,
    pub retry_delay: Duration,

    /// Frames declaring a larger payload are treated as a protocol violation
    ///  and close the connection.
    pub max_message_size: u64,

    /// Capacity hint for the recycled receive buffers.
    pub receive_buffer_capacity: usize,
    pub receive_buffer_pool_size: usize,
}

impl TcpTransportConfig {
    pub fn default_local() -> TcpTransportConfig {
        TcpTransportConfig {
            max_reconnection_attempts: -1,
            retry_delay: Duration::from_secs(1),
            max_message_size: 16 * 1024 * 1024,
            receive_buffer_capacity: 64 * 1024,
            receive_buffer_pool_size: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_reconnection_attempts < -1 {
            bail!("max reconnection attempts must be -1 (unlimited), 0 (none) or positive");
        }
        if self.max_message_size == 0 {
            bail!("max message size of 0 cannot carry any payload");
        }
        Ok(())
    }
}
