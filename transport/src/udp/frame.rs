use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const SAMPLE_MAGIC: [u8; 4] = *b"ECAL";
/// magic tag of the previous, incompatible protocol generation - recognized
///  so it can be reported distinctly instead of as random garbage
pub const LEGACY_SAMPLE_MAGIC: [u8; 4] = *b"eCAL";

pub const UDP_PROTOCOL_VERSION: i32 = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum FrameKind {
    /// announces a multi-fragment message: no payload, `sequence_number` is
    ///  the total fragment count and `length` the total message length
    Header = 1,
    /// one fragment of a multi-fragment message
    Content = 2,
    /// a complete message in a single datagram
    HeaderWithContent = 3,
}

/// classification of a datagram by its leading magic bytes, before any
///  parsing is attempted
#[derive(Debug, Eq, PartialEq)]
pub enum MagicClass {
    Current,
    Legacy,
    Foreign,
}

pub fn classify_magic(datagram: &[u8]) -> MagicClass {
    if datagram.len() < SAMPLE_MAGIC.len() {
        return MagicClass::Foreign;
    }
    if datagram[..4] == SAMPLE_MAGIC {
        return MagicClass::Current;
    }
    if datagram[..4] == LEGACY_SAMPLE_MAGIC {
        return MagicClass::Legacy;
    }
    MagicClass::Foreign
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub id: i32,
    pub sequence_number: i32,
    pub length: i32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&SAMPLE_MAGIC);
        buf.put_i32_le(UDP_PROTOCOL_VERSION);
        buf.put_i32_le(self.kind.into());
        buf.put_i32_le(self.id);
        buf.put_i32_le(self.sequence_number);
        buf.put_i32_le(self.length);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("not enough bytes for a frame header: {}", buf.remaining());
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SAMPLE_MAGIC {
            bail!("invalid magic bytes {:?}", magic);
        }

        let version = buf.get_i32_le();
        if version != UDP_PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let kind = FrameKind::try_from(buf.get_i32_le())?;

        Ok(FrameHeader {
            kind,
            id: buf.get_i32_le(),
            sequence_number: buf.get_i32_le(),
            length: buf.get_i32_le(),
        })
    }
}


/// Prepends the sample name to a message's payload:
///  `name_len (u16 LE) | name bytes | NUL`. The terminating NUL is included
///  in `name_len`.
pub fn put_sample_name(buf: &mut impl BufMut, name: &str) {
    let name_len: u16 = (name.len() + 1).prechecked_cast();
    buf.put_u16_le(name_len);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
}

/// Splits a message payload into its sample name and the sample bytes
///  following it. This only looks at the name prefix, so a receiver can
///  decide whether it is interested without touching the rest.
pub fn parse_sample_name(payload: &[u8]) -> anyhow::Result<(&str, &[u8])> {
    if payload.len() < 2 {
        bail!("payload too short for a sample name prefix");
    }
    let name_len: usize = u16::from_le_bytes([payload[0], payload[1]]).safe_cast();
    if payload.len() < 2 + name_len {
        bail!("sample name length {} exceeds the payload", name_len);
    }

    let mut name_bytes = &payload[2..2 + name_len];
    if let [head @ .., 0] = name_bytes {
        name_bytes = head;
    }
    let name = std::str::from_utf8(name_bytes)?;

    Ok((name, &payload[2 + name_len..]))
}

/// serialized size of the name prefix written by [put_sample_name]
pub fn sample_name_prefix_len(name: &str) -> usize {
    2 + name.len() + 1
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::header(FrameHeader { kind: FrameKind::Header, id: 0x12345678, sequence_number: 3, length: 100 },
        vec![b'E',b'C',b'A',b'L', 5,0,0,0, 1,0,0,0, 0x78,0x56,0x34,0x12, 3,0,0,0, 100,0,0,0])]
    #[case::content(FrameHeader { kind: FrameKind::Content, id: -1, sequence_number: 0, length: 65000 },
        vec![b'E',b'C',b'A',b'L', 5,0,0,0, 2,0,0,0, 0xff,0xff,0xff,0xff, 0,0,0,0, 0xe8,0xfd,0,0])]
    #[case::header_with_content(FrameHeader { kind: FrameKind::HeaderWithContent, id: 1, sequence_number: 0, length: 7 },
        vec![b'E',b'C',b'A',b'L', 5,0,0,0, 3,0,0,0, 1,0,0,0, 0,0,0,0, 7,0,0,0])]
    fn test_frame_header_ser(#[case] header: FrameHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut read_buf: &[u8] = &buf;
        let deserialized = FrameHeader::try_deser(&mut read_buf).unwrap();
        assert!(read_buf.is_empty());
        assert_eq!(deserialized, header);
    }

    #[rstest]
    #[case::too_short(vec![b'E',b'C',b'A',b'L', 5,0,0,0, 1,0,0,0])]
    #[case::wrong_magic(vec![b'X',b'C',b'A',b'L', 5,0,0,0, 1,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::wrong_version(vec![b'E',b'C',b'A',b'L', 4,0,0,0, 1,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::unknown_kind(vec![b'E',b'C',b'A',b'L', 5,0,0,0, 9,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    fn test_frame_header_deser_rejects(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(FrameHeader::try_deser(&mut buf).is_err());
    }

    #[rstest]
    #[case::current(vec![b'E',b'C',b'A',b'L', 1, 2, 3], MagicClass::Current)]
    #[case::legacy(vec![b'e',b'C',b'A',b'L', 1, 2, 3], MagicClass::Legacy)]
    #[case::foreign(vec![b'S',b'S',b'D',b'P'], MagicClass::Foreign)]
    #[case::undersized(vec![b'E',b'C'], MagicClass::Foreign)]
    fn test_classify_magic(#[case] datagram: Vec<u8>, #[case] expected: MagicClass) {
        assert_eq!(classify_magic(&datagram), expected);
    }

    #[rstest]
    #[case::simple("topic_a", b"payload")]
    #[case::empty_name("", b"payload")]
    #[case::empty_payload("t", b"")]
    fn test_sample_name_roundtrip(#[case] name: &str, #[case] sample: &[u8]) {
        let mut buf = BytesMut::new();
        put_sample_name(&mut buf, name);
        buf.put_slice(sample);

        assert_eq!(buf.len(), sample_name_prefix_len(name) + sample.len());

        let (parsed_name, parsed_sample) = parse_sample_name(&buf).unwrap();
        assert_eq!(parsed_name, name);
        assert_eq!(parsed_sample, sample);
    }

    #[rstest]
    #[case::too_short_for_prefix(vec![2])]
    #[case::name_exceeds_payload(vec![200, 0, b'a', b'b'])]
    #[case::invalid_utf8(vec![3, 0, 0xff, 0xfe, 0])]
    fn test_parse_sample_name_rejects(#[case] payload: Vec<u8>) {
        assert!(parse_sample_name(&payload).is_err());
    }
}
