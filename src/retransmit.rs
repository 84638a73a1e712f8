use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::peer::Peer;
use crate::send_pipeline::SendPipeline;
use crate::sequence::SeqNo;
use crate::session::SessionManager;

/// a peer that has to be removed, with the reason for the log upcall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub peer_id: u8,
    pub reason: &'static str,
}

/// which send buffer entry a retransmit task watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSlot {
    Packet(SeqNo),
    Chunk(SeqNo, u16),
}

impl SendSlot {
    fn load(&self, peer: &Peer) -> Option<Bytes> {
        match *self {
            SendSlot::Packet(seq) => peer.send_packets.get(&seq).map(|e| e.value().clone()),
            SendSlot::Chunk(seq, slice_index) => {
                peer.send_chunks.get(&(seq, slice_index)).map(|e| e.value().clone())
            }
        }
    }
}

/// Arm the delayed re-send task for one reliable frame. Every `delay` the
///  task probes the peer's send buffer: an ACK has removed the entry by
///  then, or the frame goes out again. After `max_retries` re-sends the peer
///  is reported for eviction as unreachable.
///
/// The task ends on its own when the entry disappears (ACK) or the peer is
///  no longer registered (eviction, shutdown) - nothing has to cancel it.
pub fn arm_retransmit(
    pipeline: Arc<SendPipeline>,
    sessions: Arc<SessionManager>,
    peer_id: u8,
    slot: SendSlot,
    delay: Duration,
    max_retries: u32,
    evictions: mpsc::UnboundedSender<Eviction>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut retries = 0;
        loop {
            time::sleep(delay).await;

            let peer = match sessions.get(peer_id) {
                Some(peer) => peer,
                None => return,
            };
            let packet_buf = match slot.load(&peer) {
                Some(buf) => buf,
                None => return, // ACKed in the meantime
            };

            if retries >= max_retries {
                debug!("peer {} did not acknowledge {:?} after {} re-sends - reporting as unreachable", peer_id, slot, retries);
                let _ = evictions.send(Eviction { peer_id, reason: "unreachable" });
                return;
            }

            retries += 1;
            debug!("re-sending {:?} to peer {} (attempt {})", slot, peer_id, retries);
            pipeline.do_send_packet(peer.addr, &packet_buf).await;
        }
    })
}
