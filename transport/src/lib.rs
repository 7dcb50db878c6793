//! Wire-level transport for a brokerless pub/sub middleware: samples (named,
//!  serialized chunks of data) are exchanged between processes either as UDP
//!  multicast datagrams or over plain TCP connections. This crate implements
//!  the framing shared by both paths - it does not interpret sample contents.
//!
//! ## Design goals
//!
//! * No central broker: every process sends to a well-known multicast group
//!   and/or accepts direct TCP connections, discovery happens at a layer
//!   above this crate
//! * The abstraction is sending / receiving *samples* (defined-length chunks
//!   of data addressed by name) rather than streams of bytes
//! * Samples can exceed a single datagram: the UDP path takes care of
//!   fragmenting and re-assembling, assuming in-order arrival of the
//!   fragments of one message (which holds on a single link but not across
//!   routed hops - out-of-order fragments are treated as loss, not buffered)
//! * Delivery is best-effort on the UDP path: a corrupted or incomplete
//!   message is dropped, the receiver relies on the sender re-publishing
//! * The TCP path favors freshness over completeness: a publisher session
//!   keeps at most one write in flight plus one pending buffer, and a burst
//!   of sends overwrites the pending buffer rather than queueing
//! * No blocking calls on the send path; minimal copies
//!
//! ## UDP wire format
//!
//! Each datagram starts with a fixed 24-byte header, all numbers little-endian:
//!
//! ```ascii
//!  0: magic (4 bytes)          'E','C','A','L'
//!  4: protocol version (i32)
//!  8: frame kind (i32)         1=header, 2=content, 3=header_with_content
//! 12: message id (i32)         random correlation id per logical message
//! 16: sequence number (i32)    header frame: total fragment count
//!                              content frame: 0-based fragment index
//! 20: length (i32)             header frame: total message length
//!                              content frame: length of this fragment's payload
//! 24: payload
//! ```
//!
//! A message that fits a single fragment is sent as one `header_with_content`
//!  datagram. Larger messages are announced by a payload-less `header` frame
//!  followed by `content` frames with increasing sequence numbers.
//!
//! The first payload bytes of a message carry the sample name:
//!  `name_len (u16) | name (name_len bytes, NUL-terminated) | sample bytes`,
//!  so a receiver can decide whether it is interested before buffering or
//!  deserializing anything else.
//!
//! ## TCP wire format
//!
//! A connection starts with a handshake exchange (the connecting side sends
//!  first), after that each message is one frame:
//!
//! ```ascii
//!  0: header size (u16 LE)     allows header evolution: a reader skips
//!                              trailing header bytes it does not know about
//!  2: frame kind (u8)          0=regular payload, 1=protocol handshake
//!  3: reserved (u8)
//!  4: payload size (u64 LE)
//! 12: payload
//! ```

pub mod buffer_pool;
pub mod config;
pub mod safe_converter;
pub mod stats;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
