use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{EventQueue, Severity};
use crate::frame::{data_frame_overhead, ChunkInfo, DataFrame, DataKind, Frame};
use crate::peer::Peer;
use crate::retransmit::{arm_retransmit, Eviction, SendSlot};
use crate::send_pipeline::SendPipeline;
use crate::session::SessionManager;

/// Invoked exactly once per send. `true` means the frame(s) reached the
///  socket - not that anything was acknowledged; `false` means the send was
///  ineligible (disconnected, unknown receiver, oversized unreliable
///  payload) and nothing was transmitted.
pub type SendCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Work items for the sender task. Everything that leaves the endpoint goes
///  through this queue, so outbound sequence assignment is serialized.
pub enum SendCommand {
    /// an application-level send via one of the four entry points
    Data {
        kind: DataKind,
        module_id: Bytes,
        payload: Bytes,
        receiver: Option<u8>,
        completion: SendCallback,
    },
    /// server only: re-emission of a relayed frame with the original
    ///  sender's id stamped in
    Relay {
        to_peer: u8,
        kind: DataKind,
        module_id: Bytes,
        payload: Bytes,
        sender_id: u8,
    },
    /// a ClientInfo announcement on the reliable ordered channel
    ClientInfo {
        to_peer: u8,
        peer_id: u8,
        color: u32,
        username: String,
    },
    /// connection-level frames and ACKs: serialized and emitted as-is
    Stateless {
        to: SocketAddr,
        frame: Frame,
    },
}

/// Everything the sender side needs: the socket pipeline plus the knobs and
///  registries that buffered reliable sends touch.
pub struct OutboundContext {
    pub pipeline: Arc<SendPipeline>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<EventQueue>,
    pub evictions: mpsc::UnboundedSender<Eviction>,
    pub mtu: usize,
    pub retransmit_delay: Duration,
    pub max_retries: u32,
}

impl OutboundContext {
    pub async fn send_stateless(&self, to: SocketAddr, frame: &Frame) {
        self.pipeline.send_frame(to, frame).await;
    }

    /// Send application data to one peer, chunking reliable payloads that
    ///  exceed the configured MTU. Returns `false` without transmitting
    ///  anything when the payload cannot be sent (oversized unreliable).
    pub async fn send_data(
        &self,
        peer: &Arc<Peer>,
        kind: DataKind,
        sender_id: u8,
        dest_id: u8,
        module_id: &Bytes,
        payload: &Bytes,
    ) -> bool {
        if module_id.len() > u8::MAX as usize {
            debug!("module id of {} bytes exceeds the one-byte length field", module_id.len());
            return false;
        }

        if data_frame_overhead(false, module_id.len()) + payload.len() <= self.mtu {
            let seq = if kind.is_reliable() {
                peer.next_reliable_seq()
            }
            else {
                peer.next_unreliable_seq()
            };

            let frame = Frame::Data(DataFrame {
                kind,
                seq,
                chunk: None,
                sender_id,
                dest_id,
                module_id: module_id.clone(),
                payload: payload.clone(),
            });

            let packet_buf = Self::serialize_finalized(&frame);
            if kind.is_reliable() {
                peer.send_packets.insert(seq, packet_buf.clone());
                self.arm(peer.id, SendSlot::Packet(seq));
            }
            self.pipeline.do_send_packet(peer.addr, &packet_buf).await;
            return true;
        }

        if !kind.is_reliable() {
            self.events.log(
                Severity::Warning,
                format!("unreliable payload of {} bytes exceeds the mtu of {} - rejected, only reliable sends are chunked", payload.len(), self.mtu),
            );
            return false;
        }

        self.send_chunked(peer, kind, sender_id, dest_id, module_id, payload).await
    }

    async fn send_chunked(
        &self,
        peer: &Arc<Peer>,
        kind: DataKind,
        sender_id: u8,
        dest_id: u8,
        module_id: &Bytes,
        payload: &Bytes,
    ) -> bool {
        let slice_capacity = self.mtu.saturating_sub(data_frame_overhead(true, module_id.len()));
        if slice_capacity == 0 {
            debug!("mtu of {} leaves no room for slice payloads", self.mtu);
            return false;
        }
        let slice_count = payload.len().div_ceil(slice_capacity);
        if slice_count > u16::MAX as usize {
            debug!("payload of {} bytes needs {} slices which exceeds the slice index range", payload.len(), slice_count);
            return false;
        }

        // one logical sequence for the whole message, one slice per frame
        let seq = peer.next_reliable_seq();
        debug!("chunking {} bytes into {} slices as sequence {}", payload.len(), slice_count, seq);

        for slice_index in 0..slice_count {
            let start = slice_index * slice_capacity;
            let end = (start + slice_capacity).min(payload.len());

            let frame = Frame::Data(DataFrame {
                kind,
                seq,
                chunk: Some(ChunkInfo {
                    slice_index: slice_index as u16,
                    slice_count: slice_count as u16,
                }),
                sender_id,
                dest_id,
                module_id: module_id.clone(),
                payload: payload.slice(start..end),
            });

            let packet_buf = Self::serialize_finalized(&frame);
            peer.send_chunks.insert((seq, slice_index as u16), packet_buf.clone());
            self.arm(peer.id, SendSlot::Chunk(seq, slice_index as u16));
            self.pipeline.do_send_packet(peer.addr, &packet_buf).await;
        }
        true
    }

    /// a ClientInfo rides the reliable ordered channel like any data frame
    pub async fn send_client_info(&self, to: &Arc<Peer>, peer_id: u8, color: u32, username: &str) {
        let seq = to.next_reliable_seq();
        let frame = Frame::ClientInfo {
            seq,
            peer_id,
            color,
            username: username.to_string(),
        };

        let packet_buf = Self::serialize_finalized(&frame);
        to.send_packets.insert(seq, packet_buf.clone());
        self.arm(to.id, SendSlot::Packet(seq));
        self.pipeline.do_send_packet(to.addr, &packet_buf).await;
    }

    fn serialize_finalized(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        Frame::finalize_checksum(buf.as_mut());
        buf.freeze()
    }

    fn arm(&self, peer_id: u8, slot: SendSlot) {
        arm_retransmit(
            self.pipeline.clone(),
            self.sessions.clone(),
            peer_id,
            slot,
            self.retransmit_delay,
            self.max_retries,
            self.evictions.clone(),
        );
    }
}
