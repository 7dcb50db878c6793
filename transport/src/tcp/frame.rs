use std::cmp::min;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const TCP_PROTOCOL_VERSION: u8 = 0;

const SIZE_FIELD_LEN: usize = 2;
/// header bytes after the size field in this build's header definition
const BODY_LEN: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TcpFrameKind {
    RegularPayload = 0,
    ProtocolHandshake = 1,
}

/// The per-message frame header of the TCP path. The wire layout starts
///  with its own length so the header can grow in future protocol versions
///  without breaking older readers - see [TcpFrameHeader::read].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpFrameHeader {
    pub kind: TcpFrameKind,
    pub data_size: u64,
}

impl TcpFrameHeader {
    pub const SERIALIZED_LEN: usize = SIZE_FIELD_LEN + BODY_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::SERIALIZED_LEN as u16);
        buf.put_u8(self.kind.into());
        buf.put_u8(0); // reserved
        buf.put_u64_le(self.data_size);
    }

    /// Reads one frame header from the stream.
    ///
    /// The peer's header may be larger than this build's (a newer protocol
    ///  revision): the unknown trailing bytes are read and discarded, so the
    ///  payload still starts at the right stream position. It may also be
    ///  smaller (an older revision): the fields it did not send read as zero.
    pub async fn read(reader: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<TcpFrameHeader> {
        let mut size_buf = [0u8; SIZE_FIELD_LEN];
        reader.read_exact(&mut size_buf).await?;

        let remote_header_len = u16::from_le_bytes(size_buf) as usize;
        if remote_header_len < SIZE_FIELD_LEN {
            bail!("peer declares a header of {} bytes, less than the size field itself", remote_header_len);
        }

        let mut body = [0u8; BODY_LEN];
        let body_bytes = min(remote_header_len - SIZE_FIELD_LEN, BODY_LEN);
        reader.read_exact(&mut body[..body_bytes]).await?;

        let to_discard = remote_header_len.saturating_sub(Self::SERIALIZED_LEN);
        if to_discard > 0 {
            let mut scratch = vec![0u8; to_discard];
            reader.read_exact(&mut scratch).await?;
        }

        let kind = TcpFrameKind::try_from(body[0])?;
        let data_size = u64::from_le_bytes(body[2..10].try_into().expect("slice of fixed length"));

        Ok(TcpFrameHeader { kind, data_size })
    }
}


pub struct HandshakeMessage {
    pub protocol_version: u8,
}

impl HandshakeMessage {
    pub const SERIALIZED_LEN: usize = 1;

    /// Tolerates payloads longer than this build's handshake message - like
    ///  the frame header, the handshake may grow in future revisions.
    pub fn try_deser(payload: &[u8]) -> anyhow::Result<HandshakeMessage> {
        match payload.first() {
            Some(&protocol_version) => Ok(HandshakeMessage { protocol_version }),
            None => bail!("empty handshake payload"),
        }
    }
}


/// frames a payload for the wire in a single allocation
pub fn regular_payload_frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(TcpFrameHeader::SERIALIZED_LEN + payload.len());
    TcpFrameHeader {
        kind: TcpFrameKind::RegularPayload,
        data_size: payload.len() as u64,
    }.ser(&mut buf);
    buf.put_slice(payload);
    buf
}

pub fn handshake_frame() -> BytesMut {
    let mut buf = BytesMut::with_capacity(TcpFrameHeader::SERIALIZED_LEN + HandshakeMessage::SERIALIZED_LEN);
    TcpFrameHeader {
        kind: TcpFrameKind::ProtocolHandshake,
        data_size: HandshakeMessage::SERIALIZED_LEN as u64,
    }.ser(&mut buf);
    buf.put_u8(TCP_PROTOCOL_VERSION);
    buf
}
