use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::frame::{DataFrame, DataKind};
use crate::sequence::SeqNo;

/// bookkeeping for one logical chunked message
struct SliceSet {
    kind: DataKind,
    sender_id: u8,
    dest_id: u8,
    module_id: Bytes,
    slice_count: u16,
    slices: BTreeMap<u16, Bytes>,
}

/// Per-peer reassembly of chunked messages. Slices are recorded under
///  (sequence, slice index); once all declared slices of a sequence are
///  present, they are concatenated in ascending index order and handed back
///  as a single ordinary data frame.
///
/// Partially collected sequences persist until completion or session end -
///  the retransmission of missing slices is the sender's job, so a partial
///  set either completes or dies with the peer.
#[derive(Default)]
pub struct ChunkAssembler {
    in_progress: BTreeMap<SeqNo, SliceSet>,
}

impl ChunkAssembler {
    pub fn new() -> ChunkAssembler {
        ChunkAssembler::default()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    /// Record one slice. Returns the completed message once the last missing
    ///  slice arrives, with `chunk` cleared and the payload reassembled.
    pub fn on_slice(&mut self, frame: DataFrame) -> Option<DataFrame> {
        let chunk = match frame.chunk {
            Some(chunk) => chunk,
            None => {
                debug!("unchunked frame handed to the assembler - passing through");
                return Some(frame);
            }
        };

        let set = self.in_progress.entry(frame.seq)
            .or_insert_with(|| SliceSet {
                kind: frame.kind,
                sender_id: frame.sender_id,
                dest_id: frame.dest_id,
                module_id: frame.module_id.clone(),
                slice_count: chunk.slice_count,
                slices: BTreeMap::default(),
            });

        if set.slice_count != chunk.slice_count {
            warn!("slice {} of sequence {} declares {} slices, first slice declared {} - dropping",
                chunk.slice_index, frame.seq, chunk.slice_count, set.slice_count);
            return None;
        }

        // a re-sent slice replaces its previous copy, the count is unaffected
        set.slices.insert(chunk.slice_index, frame.payload);

        if set.slices.len() < set.slice_count as usize {
            return None;
        }

        let set = self.in_progress.remove(&frame.seq)
            .expect("slice set was present a moment ago");

        let total_len: usize = set.slices.values().map(|s| s.len()).sum();
        let mut payload = BytesMut::with_capacity(total_len);
        for slice in set.slices.values() {
            payload.extend_from_slice(slice);
        }

        Some(DataFrame {
            kind: set.kind,
            seq: frame.seq,
            chunk: None,
            sender_id: set.sender_id,
            dest_id: set.dest_id,
            module_id: set.module_id,
            payload: payload.freeze(),
        })
    }
}
