use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{trace, warn};

use crate::config::UdpSampleConfig;
use crate::safe_converter::PrecheckedCast;
use crate::stats::TrafficStats;
use crate::udp::frame::{put_sample_name, sample_name_prefix_len, FrameHeader, FrameKind};

/// This is an abstraction for transmitting a single raw datagram, introduced
///  to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RawSender: Send + Sync + 'static {
    /// transmit one datagram, returning the number of bytes actually sent
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<usize>;
}

/// sends every datagram to a fixed target address, typically a multicast group
pub struct TargetedSender {
    socket: UdpSocket,
    target: SocketAddr,
}
impl TargetedSender {
    pub fn new(socket: UdpSocket, target: SocketAddr) -> TargetedSender {
        TargetedSender { socket, target }
    }
}
#[async_trait]
impl RawSender for TargetedSender {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<usize> {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), self.target);
        let num_sent = self.socket.send_to(datagram, self.target).await?;
        Ok(num_sent)
    }
}


/// The send side of the fragmentation engine: a named sample of arbitrary
///  size goes in, bounded-size datagrams come out.
///
/// A sample that fits a single fragment is sent as one self-contained
///  `header_with_content` datagram. Anything bigger is announced by a
///  payload-less `header` datagram carrying a fresh random message id and
///  the fragment count, followed by the `content` fragments in order.
pub struct UdpSampleSender {
    raw: Arc<dyn RawSender>,
    config: Arc<UdpSampleConfig>,
    stats: Arc<TrafficStats>,
}

impl UdpSampleSender {
    pub fn new(raw: Arc<dyn RawSender>, config: Arc<UdpSampleConfig>, stats: Arc<TrafficStats>) -> UdpSampleSender {
        UdpSampleSender { raw, config, stats }
    }

    /// Sends a named sample, fragmenting as necessary. Returns the total
    ///  number of bytes transmitted, or 0 if any datagram could not be sent
    ///  completely - there is no retry at this layer, delivery of the whole
    ///  message is best-effort and the caller's cyclic re-publish is the
    ///  only recovery mechanism.
    pub async fn send_sample(&self, name: &str, sample: &[u8]) -> usize {
        let mut message = BytesMut::with_capacity(sample_name_prefix_len(name) + sample.len());
        put_sample_name(&mut message, name);
        message.put_slice(sample);

        let max_fragment_payload = self.config.max_fragment_payload();

        if message.len() <= max_fragment_payload {
            let mut datagram = BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN + message.len());
            FrameHeader {
                kind: FrameKind::HeaderWithContent,
                id: rand::random(),
                sequence_number: 0,
                length: message.len().prechecked_cast(),
            }.ser(&mut datagram);
            datagram.put_slice(&message);

            return self.transmit(&datagram).await;
        }

        let message_id: i32 = rand::random();
        let fragment_count = message.len().div_ceil(max_fragment_payload);
        trace!("sending sample '{}' as {} fragments, message id {}", name, fragment_count, message_id);

        let mut datagram = BytesMut::with_capacity(self.config.max_datagram_size);
        FrameHeader {
            kind: FrameKind::Header,
            id: message_id,
            sequence_number: fragment_count.prechecked_cast(),
            length: message.len().prechecked_cast(),
        }.ser(&mut datagram);

        let mut sent_total = self.transmit(&datagram).await;
        if sent_total == 0 {
            return 0;
        }

        for (sequence_number, fragment) in message.chunks(max_fragment_payload).enumerate() {
            datagram.clear();
            FrameHeader {
                kind: FrameKind::Content,
                id: message_id,
                sequence_number: sequence_number.prechecked_cast(),
                length: fragment.len().prechecked_cast(),
            }.ser(&mut datagram);
            datagram.put_slice(fragment);

            let num_sent = self.transmit(&datagram).await;
            if num_sent == 0 {
                return 0;
            }
            sent_total += num_sent;

            if let Some(bandwidth) = self.config.bandwidth_bytes_per_sec {
                sleep(throttle_delay(datagram.len(), bandwidth)).await;
            }
        }

        sent_total
    }

    async fn transmit(&self, datagram: &[u8]) -> usize {
        match self.raw.send(datagram).await {
            Ok(num_sent) if num_sent == datagram.len() => {
                self.stats.add_write_bytes(num_sent as u64);
                num_sent
            }
            Ok(num_sent) => {
                warn!("partial datagram send: {} of {} bytes", num_sent, datagram.len());
                0
            }
            Err(e) => {
                warn!("error sending datagram: {}", e);
                0
            }
        }
    }
}

/// delay after one datagram so that the sustained rate stays below the ceiling
fn throttle_delay(datagram_len: usize, bandwidth_bytes_per_sec: u64) -> Duration {
    Duration::from_secs_f64(datagram_len as f64 / bandwidth_bytes_per_sec as f64)
}
