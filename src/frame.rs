use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::config::MAX_NAME_LEN;
use crate::sequence::SeqNo;

/// length of the leading checksum field
pub const CRC_LEN: usize = 4;

/// High bit of the type byte: the frame is a slice of a chunked message. Only
///  valid on the reliable data kinds, and on ACK where it signals that a
///  slice index follows the sequence number.
const CHUNKED_FLAG: u8 = 0x80;

const TYPE_CONNECTION_REQUEST: u8 = 1;
const TYPE_CONNECTION_CHALLENGE: u8 = 2;
const TYPE_CHALLENGE_ANSWER: u8 = 3;
const TYPE_CONNECTION_ACCEPTED: u8 = 4;
const TYPE_CONNECTION_DENIED: u8 = 5;
const TYPE_CONNECTION_CLOSED: u8 = 6;
const TYPE_CLIENT_DISCONNECTED: u8 = 7;
const TYPE_SERVER_INFORMATION: u8 = 8;
const TYPE_ACK: u8 = 9;
const TYPE_RELIABLE_DATA: u8 = 10;
const TYPE_RELIABLE_UNORDERED_DATA: u8 = 11;
const TYPE_UNRELIABLE_DATA: u8 = 12;
const TYPE_UNRELIABLE_UNORDERED_DATA: u8 = 13;
const TYPE_CLIENT_INFO: u8 = 14;

fn crc32(buf: &[u8]) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    hasher.checksum(buf)
}

/// The four delivery disciplines of data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl DataKind {
    pub fn is_reliable(self) -> bool {
        matches!(self, DataKind::ReliableOrdered | DataKind::ReliableUnordered)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, DataKind::ReliableOrdered | DataKind::UnreliableOrdered)
    }

    fn type_byte(self) -> u8 {
        match self {
            DataKind::ReliableOrdered => TYPE_RELIABLE_DATA,
            DataKind::ReliableUnordered => TYPE_RELIABLE_UNORDERED_DATA,
            DataKind::UnreliableOrdered => TYPE_UNRELIABLE_DATA,
            DataKind::UnreliableUnordered => TYPE_UNRELIABLE_UNORDERED_DATA,
        }
    }
}

/// slice position of a chunked data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub slice_index: u16,
    pub slice_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub kind: DataKind,
    pub seq: SeqNo,
    pub chunk: Option<ChunkInfo>,
    pub sender_id: u8,
    pub dest_id: u8,
    pub module_id: Bytes,
    pub payload: Bytes,
}

/// A wire frame. Layout on the wire (all integers big-endian):
/// ```ascii
/// 0: CRC32 (ISO-HDLC) over everything that follows (u32)
/// 4: type byte - low 7 bits select the kind, the high bit marks a chunked
///     variant (data kinds and ACK only)
/// 5: kind-specific body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectionRequest,
    ConnectionChallenge { nonce: u64 },
    ChallengeAnswer { proof: [u8; 32], color: u32, username: String },
    ConnectionAccepted { peer_id: u8 },
    ConnectionDenied,
    ConnectionClosed { peer_id: u8 },
    ClientDisconnected { peer_id: u8 },
    ServerInformation { max_clients: u8, client_count: u8, servername: String },
    Ack { seq: SeqNo, slice_index: Option<u16> },
    Data(DataFrame),
    ClientInfo { seq: SeqNo, peer_id: u8, color: u32, username: String },
}

impl Frame {
    /// Serialize into `buf`, starting with a zeroed checksum field. The
    ///  checksum is patched in by [Frame::finalize_checksum] just before the
    ///  buffer goes out on a socket.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(0);
        match self {
            Frame::ConnectionRequest => {
                buf.put_u8(TYPE_CONNECTION_REQUEST);
            }
            Frame::ConnectionChallenge { nonce } => {
                buf.put_u8(TYPE_CONNECTION_CHALLENGE);
                buf.put_u64(*nonce);
            }
            Frame::ChallengeAnswer { proof, color, username } => {
                buf.put_u8(TYPE_CHALLENGE_ANSWER);
                buf.put_slice(proof);
                buf.put_u32(*color);
                Self::ser_name(username, buf);
            }
            Frame::ConnectionAccepted { peer_id } => {
                buf.put_u8(TYPE_CONNECTION_ACCEPTED);
                buf.put_u8(*peer_id);
            }
            Frame::ConnectionDenied => {
                buf.put_u8(TYPE_CONNECTION_DENIED);
            }
            Frame::ConnectionClosed { peer_id } => {
                buf.put_u8(TYPE_CONNECTION_CLOSED);
                buf.put_u8(*peer_id);
            }
            Frame::ClientDisconnected { peer_id } => {
                buf.put_u8(TYPE_CLIENT_DISCONNECTED);
                buf.put_u8(*peer_id);
            }
            Frame::ServerInformation { max_clients, client_count, servername } => {
                buf.put_u8(TYPE_SERVER_INFORMATION);
                buf.put_u8(*max_clients);
                buf.put_u8(*client_count);
                Self::ser_name(servername, buf);
            }
            Frame::Ack { seq, slice_index } => {
                match slice_index {
                    None => {
                        buf.put_u8(TYPE_ACK);
                        buf.put_u16(seq.to_raw());
                    }
                    Some(slice_index) => {
                        buf.put_u8(TYPE_ACK | CHUNKED_FLAG);
                        buf.put_u16(seq.to_raw());
                        buf.put_u16(*slice_index);
                    }
                }
            }
            Frame::Data(data) => {
                let mut type_byte = data.kind.type_byte();
                if data.chunk.is_some() {
                    type_byte |= CHUNKED_FLAG;
                }
                buf.put_u8(type_byte);
                buf.put_u16(data.seq.to_raw());
                if let Some(chunk) = &data.chunk {
                    buf.put_u16(chunk.slice_index);
                    buf.put_u16(chunk.slice_count);
                }
                buf.put_u8(data.sender_id);
                buf.put_u8(data.dest_id);
                buf.put_u8(data.module_id.len() as u8);
                buf.put_slice(&data.module_id);
                buf.put_u16(data.payload.len() as u16);
                buf.put_slice(&data.payload);
            }
            Frame::ClientInfo { seq, peer_id, color, username } => {
                buf.put_u8(TYPE_CLIENT_INFO);
                buf.put_u16(seq.to_raw());
                buf.put_u8(*peer_id);
                buf.put_u32(*color);
                Self::ser_name(username, buf);
            }
        }
    }

    fn ser_name(name: &str, buf: &mut BytesMut) {
        debug_assert!(name.len() <= MAX_NAME_LEN && name.is_ascii());
        buf.put_u8(name.len() as u8);
        buf.put_slice(name.as_bytes());
    }

    /// Compute the checksum over everything after the checksum field and
    ///  patch it into the first four bytes.
    pub fn finalize_checksum(buf: &mut [u8]) {
        debug_assert!(buf.len() > CRC_LEN);
        let checksum = crc32(&buf[CRC_LEN..]);
        buf[..CRC_LEN].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parse a raw datagram. Checksum mismatches, unknown kinds, truncated
    ///  bodies and trailing garbage are all rejected - callers drop such
    ///  frames silently, counting them in [FrameStats].
    pub fn parse(raw: &[u8]) -> anyhow::Result<Frame> {
        if raw.len() <= CRC_LEN {
            bail!("frame of {} bytes is too short", raw.len());
        }
        let declared = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let actual = crc32(&raw[CRC_LEN..]);
        if declared != actual {
            bail!("checksum mismatch: declared {:08x}, actual {:08x}", declared, actual);
        }

        let buf = &mut &raw[CRC_LEN..];
        let type_byte = buf.try_get_u8()?;
        let chunked = type_byte & CHUNKED_FLAG != 0;
        let kind = type_byte & !CHUNKED_FLAG;

        if chunked && !matches!(kind, TYPE_ACK | TYPE_RELIABLE_DATA | TYPE_RELIABLE_UNORDERED_DATA) {
            bail!("chunked flag on frame kind {} which cannot be chunked", kind);
        }

        let frame = match kind {
            TYPE_CONNECTION_REQUEST => Frame::ConnectionRequest,
            TYPE_CONNECTION_CHALLENGE => Frame::ConnectionChallenge {
                nonce: buf.try_get_u64()?,
            },
            TYPE_CHALLENGE_ANSWER => {
                if buf.remaining() < 32 {
                    bail!("challenge answer truncated");
                }
                let mut proof = [0u8; 32];
                buf.copy_to_slice(&mut proof);
                let color = buf.try_get_u32()?;
                let username = Self::deser_name(buf)?;
                Frame::ChallengeAnswer { proof, color, username }
            }
            TYPE_CONNECTION_ACCEPTED => Frame::ConnectionAccepted {
                peer_id: buf.try_get_u8()?,
            },
            TYPE_CONNECTION_DENIED => Frame::ConnectionDenied,
            TYPE_CONNECTION_CLOSED => Frame::ConnectionClosed {
                peer_id: buf.try_get_u8()?,
            },
            TYPE_CLIENT_DISCONNECTED => Frame::ClientDisconnected {
                peer_id: buf.try_get_u8()?,
            },
            TYPE_SERVER_INFORMATION => {
                let max_clients = buf.try_get_u8()?;
                let client_count = buf.try_get_u8()?;
                let servername = Self::deser_name(buf)?;
                Frame::ServerInformation { max_clients, client_count, servername }
            }
            TYPE_ACK => {
                let seq = SeqNo::from_raw(buf.try_get_u16()?);
                let slice_index = if chunked { Some(buf.try_get_u16()?) } else { None };
                Frame::Ack { seq, slice_index }
            }
            TYPE_RELIABLE_DATA | TYPE_RELIABLE_UNORDERED_DATA
            | TYPE_UNRELIABLE_DATA | TYPE_UNRELIABLE_UNORDERED_DATA => {
                let data_kind = match kind {
                    TYPE_RELIABLE_DATA => DataKind::ReliableOrdered,
                    TYPE_RELIABLE_UNORDERED_DATA => DataKind::ReliableUnordered,
                    TYPE_UNRELIABLE_DATA => DataKind::UnreliableOrdered,
                    _ => DataKind::UnreliableUnordered,
                };
                let seq = SeqNo::from_raw(buf.try_get_u16()?);
                let chunk = if chunked {
                    let slice_index = buf.try_get_u16()?;
                    let slice_count = buf.try_get_u16()?;
                    if slice_count == 0 || slice_index >= slice_count {
                        bail!("slice index {} out of range for {} slices", slice_index, slice_count);
                    }
                    Some(ChunkInfo { slice_index, slice_count })
                } else {
                    None
                };
                let sender_id = buf.try_get_u8()?;
                let dest_id = buf.try_get_u8()?;
                let module_id_len = buf.try_get_u8()? as usize;
                if buf.remaining() < module_id_len {
                    bail!("module id truncated");
                }
                let module_id = buf.copy_to_bytes(module_id_len);
                let payload_len = buf.try_get_u16()? as usize;
                if buf.remaining() < payload_len {
                    bail!("payload truncated: declared {}, remaining {}", payload_len, buf.remaining());
                }
                let payload = buf.copy_to_bytes(payload_len);
                Frame::Data(DataFrame {
                    kind: data_kind,
                    seq,
                    chunk,
                    sender_id,
                    dest_id,
                    module_id,
                    payload,
                })
            }
            TYPE_CLIENT_INFO => {
                let seq = SeqNo::from_raw(buf.try_get_u16()?);
                let peer_id = buf.try_get_u8()?;
                let color = buf.try_get_u32()?;
                let username = Self::deser_name(buf)?;
                Frame::ClientInfo { seq, peer_id, color, username }
            }
            _ => bail!("unknown frame kind {}", kind),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after frame body", buf.remaining());
        }
        Ok(frame)
    }

    fn deser_name(buf: &mut impl Buf) -> anyhow::Result<String> {
        let len = buf.try_get_u8()? as usize;
        if len > MAX_NAME_LEN {
            bail!("name of {} bytes exceeds the limit of {}", len, MAX_NAME_LEN);
        }
        if buf.remaining() < len {
            bail!("name truncated");
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        if !raw.is_ascii() {
            bail!("name is not pure ASCII");
        }
        // checked: pure ASCII is valid UTF-8
        Ok(String::from_utf8(raw)?)
    }
}

/// per-frame overhead of a data frame, checksum and type byte included
pub fn data_frame_overhead(chunked: bool, module_id_len: usize) -> usize {
    CRC_LEN + 1 + 2 + if chunked { 4 } else { 0 } + 1 + 1 + 1 + module_id_len + 2
}

/// Malformed frames are dropped without any visible reaction, but they are
///  counted so operators can notice noise on the port.
#[derive(Default)]
pub struct FrameStats {
    malformed: AtomicU64,
}

impl FrameStats {
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// prepend the checksum a well-formed sender would compute
    fn sealed(body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; CRC_LEN];
        raw.extend_from_slice(body);
        Frame::finalize_checksum(&mut raw);
        raw
    }

    fn ser_finalized(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        let mut raw = buf.to_vec();
        Frame::finalize_checksum(&mut raw);
        raw
    }

    #[rstest]
    #[case::request(Frame::ConnectionRequest, vec![1])]
    #[case::challenge(Frame::ConnectionChallenge { nonce: 0x0102030405060708 }, vec![2, 1,2,3,4,5,6,7,8])]
    #[case::accepted(Frame::ConnectionAccepted { peer_id: 2 }, vec![4, 2])]
    #[case::denied(Frame::ConnectionDenied, vec![5])]
    #[case::closed(Frame::ConnectionClosed { peer_id: 3 }, vec![6, 3])]
    #[case::client_disconnected(Frame::ClientDisconnected { peer_id: 2 }, vec![7, 2])]
    #[case::server_information(
        Frame::ServerInformation { max_clients: 4, client_count: 2, servername: "srv".to_string() },
        vec![8, 4, 2, 3, b's', b'r', b'v'])]
    #[case::ack(Frame::Ack { seq: SeqNo::from_raw(0x1234), slice_index: None }, vec![9, 0x12, 0x34])]
    #[case::ack_slice(Frame::Ack { seq: SeqNo::from_raw(0x1234), slice_index: Some(7) }, vec![9 | 0x80, 0x12, 0x34, 0, 7])]
    #[case::reliable_data(
        Frame::Data(DataFrame {
            kind: DataKind::ReliableOrdered,
            seq: SeqNo::from_raw(5),
            chunk: None,
            sender_id: 2,
            dest_id: 0,
            module_id: Bytes::from_static(&[0x01]),
            payload: Bytes::from_static(&[0xde, 0xad]),
        }),
        vec![10, 0,5, 2, 0, 1, 0x01, 0,2, 0xde, 0xad])]
    #[case::chunked_data(
        Frame::Data(DataFrame {
            kind: DataKind::ReliableOrdered,
            seq: SeqNo::from_raw(9),
            chunk: Some(ChunkInfo { slice_index: 1, slice_count: 3 }),
            sender_id: 3,
            dest_id: 1,
            module_id: Bytes::from_static(b"mod"),
            payload: Bytes::from_static(&[7]),
        }),
        vec![10 | 0x80, 0,9, 0,1, 0,3, 3, 1, 3, b'm', b'o', b'd', 0,1, 7])]
    #[case::unreliable_unordered(
        Frame::Data(DataFrame {
            kind: DataKind::UnreliableUnordered,
            seq: SeqNo::from_raw(1),
            chunk: None,
            sender_id: 4,
            dest_id: 1,
            module_id: Bytes::new(),
            payload: Bytes::new(),
        }),
        vec![13, 0,1, 4, 1, 0, 0,0])]
    #[case::client_info(
        Frame::ClientInfo { seq: SeqNo::from_raw(2), peer_id: 3, color: 0x11223344, username: "a".to_string() },
        vec![14, 0,2, 3, 0x11, 0x22, 0x33, 0x44, 1, b'a'])]
    fn test_ser_layout_and_parse(#[case] frame: Frame, #[case] expected_body: Vec<u8>) {
        let raw = ser_finalized(&frame);
        assert_eq!(&raw[CRC_LEN..], expected_body.as_slice());
        assert_eq!(Frame::parse(&raw).unwrap(), frame);
    }

    #[test]
    fn test_parse_challenge_answer() {
        let frame = Frame::ChallengeAnswer {
            proof: [0xab; 32],
            color: 0xff000088,
            username: "ab".to_string(),
        };
        let raw = ser_finalized(&frame);

        let mut expected_body = vec![3];
        expected_body.extend_from_slice(&[0xab; 32]);
        expected_body.extend_from_slice(&[0xff, 0, 0, 0x88, 2, b'a', b'b']);
        assert_eq!(&raw[CRC_LEN..], expected_body.as_slice());

        assert_eq!(Frame::parse(&raw).unwrap(), frame);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::just_crc(vec![0, 0, 0, 0])]
    #[case::corrupted(
        { let mut raw = ser_finalized(&Frame::ConnectionAccepted { peer_id: 2 }); raw[5] ^= 0xff; raw })]
    #[case::unknown_kind(sealed(&[99]))]
    #[case::truncated_challenge(sealed(&[2, 1, 2, 3]))]
    #[case::truncated_data(sealed(&[10, 0, 5, 2, 0, 1, 0x01, 0, 9, 0xde]))]
    #[case::trailing_garbage(sealed(&[4, 2, 77]))]
    #[case::chunked_handshake(sealed(&[1 | 0x80]))]
    #[case::chunked_unreliable(sealed(&[12 | 0x80, 0,1, 0,0, 0,2, 4, 1, 0, 0,0]))]
    #[case::slice_index_out_of_range(sealed(&[10 | 0x80, 0,9, 0,3, 0,3, 3, 1, 0, 0,0]))]
    #[case::non_ascii_name(sealed(&[14, 0,2, 3, 0,0,0,0, 1, 0xc3]))]
    fn test_parse_rejects(#[case] raw: Vec<u8>) {
        assert!(Frame::parse(&raw).is_err());
    }

    #[rstest]
    #[case::plain(false, 0, 11)]
    #[case::plain_module(false, 8, 19)]
    #[case::chunked(true, 1, 16)]
    fn test_data_frame_overhead(#[case] chunked: bool, #[case] module_id_len: usize, #[case] expected: usize) {
        assert_eq!(data_frame_overhead(chunked, module_id_len), expected);
    }

    #[test]
    fn test_frame_stats() {
        let stats = FrameStats::default();
        assert_eq!(stats.malformed(), 0);
        stats.record_malformed();
        stats.record_malformed();
        assert_eq!(stats.malformed(), 2);
    }
}
