use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

use crate::reassembly::ChunkAssembler;
use crate::sequence::SeqNo;
use crate::sequencer::ReceiveSequencer;

/// the server's own identity in sender / destination fields
pub const SERVER_PEER_ID: u8 = 1;
/// destination id addressing every connected peer
pub const BROADCAST_PEER_ID: u8 = 0;

/// receive-side state, touched only by the listener task
pub struct PeerReceiver {
    pub sequencer: ReceiveSequencer,
    pub assembler: ChunkAssembler,
}

/// A remote endpoint with an established session. The server holds one per
///  connected client; a client holds exactly one, for the server.
///
/// The outgoing counters are written only by the sender task and the
///  receive-side state only by the listener task, so each piece of state has
///  a single writer. The send buffers are shared with the retransmit tasks,
///  which is why they live in concurrent maps: an ACK removes an entry while
///  a retransmit task may be probing a different one.
pub struct Peer {
    pub id: u8,
    pub addr: SocketAddr,
    pub username: String,
    pub color: u32,

    last_heard: Mutex<Instant>,

    reliable_local_out: AtomicU16,
    unreliable_local_out: AtomicU16,

    /// reliable outgoing sequence -> finalized frame awaiting ACK
    pub send_packets: DashMap<SeqNo, Bytes>,
    /// (reliable outgoing sequence, slice index) -> finalized frame
    pub send_chunks: DashMap<(SeqNo, u16), Bytes>,

    pub receiver: Mutex<PeerReceiver>,
}

impl Peer {
    pub fn new(id: u8, addr: SocketAddr, username: String, color: u32) -> Peer {
        Peer {
            id,
            addr,
            username,
            color,
            last_heard: Mutex::new(Instant::now()),
            reliable_local_out: AtomicU16::new(0),
            unreliable_local_out: AtomicU16::new(0),
            send_packets: DashMap::new(),
            send_chunks: DashMap::new(),
            receiver: Mutex::new(PeerReceiver {
                sequencer: ReceiveSequencer::new(),
                assembler: ChunkAssembler::new(),
            }),
        }
    }

    /// note an inbound frame from this peer's address
    pub fn touch(&self) {
        *self.last_heard.lock().unwrap() = Instant::now();
    }

    pub fn last_heard_elapsed(&self) -> Duration {
        self.last_heard.lock().unwrap().elapsed()
    }

    /// next outgoing reliable sequence; the first frame gets sequence 1
    pub fn next_reliable_seq(&self) -> SeqNo {
        SeqNo::from_raw(self.reliable_local_out.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// next outgoing unreliable sequence
    pub fn next_unreliable_seq(&self) -> SeqNo {
        SeqNo::from_raw(self.unreliable_local_out.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// ACK processing: drop the referenced frame from the send buffer. The
    ///  retransmit task armed for it observes the absence and exits.
    pub fn on_ack(&self, seq: SeqNo, slice_index: Option<u16>) -> bool {
        match slice_index {
            None => self.send_packets.remove(&seq).is_some(),
            Some(slice_index) => self.send_chunks.remove(&(seq, slice_index)).is_some(),
        }
    }

    /// frames still awaiting an ACK
    pub fn unacked_len(&self) -> usize {
        self.send_packets.len() + self.send_chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(2, SocketAddr::from(([127, 0, 0, 1], 4567)), "a".to_string(), 0xffffffff)
    }

    #[test]
    fn test_sequence_assignment_starts_at_one() {
        let peer = peer();
        assert_eq!(peer.next_reliable_seq(), SeqNo::from_raw(1));
        assert_eq!(peer.next_reliable_seq(), SeqNo::from_raw(2));
        // the two channels count independently
        assert_eq!(peer.next_unreliable_seq(), SeqNo::from_raw(1));
    }

    #[test]
    fn test_sequence_assignment_wraps() {
        let peer = peer();
        peer.reliable_local_out.store(0xfffe, Ordering::Relaxed);
        assert_eq!(peer.next_reliable_seq(), SeqNo::from_raw(0xffff));
        assert_eq!(peer.next_reliable_seq(), SeqNo::from_raw(0));
        assert_eq!(peer.next_reliable_seq(), SeqNo::from_raw(1));
    }

    #[test]
    fn test_ack_removes_buffered_frame() {
        let peer = peer();
        peer.send_packets.insert(SeqNo::from_raw(3), Bytes::from_static(&[1, 2]));
        peer.send_chunks.insert((SeqNo::from_raw(4), 1), Bytes::from_static(&[3]));
        assert_eq!(peer.unacked_len(), 2);

        assert!(peer.on_ack(SeqNo::from_raw(3), None));
        assert!(!peer.on_ack(SeqNo::from_raw(3), None));

        assert!(peer.on_ack(SeqNo::from_raw(4), Some(1)));
        assert!(!peer.on_ack(SeqNo::from_raw(4), Some(2)));
        assert_eq!(peer.unacked_len(), 0);
    }
}
