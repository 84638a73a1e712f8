use std::collections::BTreeMap;

use crate::frame::{DataFrame, DataKind};
use crate::sequence::SeqNo;

/// Everything that travels on the sequenced channels: application data and
///  ClientInfo announcements (which ride the reliable ordered channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencedInbound {
    Data(DataFrame),
    ClientInfo { peer_id: u8, color: u32, username: String },
}

/// Per-peer receive pipeline implementing the four delivery disciplines:
///
/// | kind                | dedupe old | buffer out-of-order | ACK |
/// |---------------------|------------|---------------------|-----|
/// | reliable ordered    | yes        | yes                 | yes |
/// | reliable unordered  | no         | no                  | yes |
/// | unreliable ordered  | yes        | no                  | no  |
/// | unreliable unordered| no         | no                  | no  |
///
/// ACK emission is the caller's job (an ACK goes out for every arriving
///  reliable frame, duplicates included, so the sender stops re-sending);
///  this type decides what is delivered, and in which order.
pub struct ReceiveSequencer {
    /// highest reliable sequence delivered so far; advances without gaps
    reliable_remote_in: SeqNo,
    /// most recent unreliable sequence observed
    unreliable_remote_in: SeqNo,
    /// reliable ordered frames that arrived ahead of a gap
    pending: BTreeMap<SeqNo, SequencedInbound>,
}

impl Default for ReceiveSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveSequencer {
    pub fn new() -> ReceiveSequencer {
        ReceiveSequencer {
            reliable_remote_in: SeqNo::ZERO,
            unreliable_remote_in: SeqNo::ZERO,
            pending: BTreeMap::default(),
        }
    }

    pub fn reliable_remote_in(&self) -> SeqNo {
        self.reliable_remote_in
    }

    pub fn unreliable_remote_in(&self) -> SeqNo {
        self.unreliable_remote_in
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one sequenced item through its discipline. Returns the items to
    ///  deliver to the application, in delivery order - empty for duplicates
    ///  and for frames buffered against a gap.
    pub fn on_item(&mut self, kind: DataKind, seq: SeqNo, item: SequencedInbound) -> Vec<SequencedInbound> {
        match kind {
            DataKind::ReliableOrdered => self.on_reliable_ordered(seq, item),
            DataKind::ReliableUnordered => vec![item],
            DataKind::UnreliableOrdered => {
                if seq.is_newer_than(self.unreliable_remote_in) {
                    self.unreliable_remote_in = seq;
                    vec![item]
                }
                else {
                    vec![]
                }
            }
            DataKind::UnreliableUnordered => vec![item],
        }
    }

    fn on_reliable_ordered(&mut self, seq: SeqNo, item: SequencedInbound) -> Vec<SequencedInbound> {
        if !seq.is_newer_than(self.reliable_remote_in) {
            // duplicate of something already delivered - the caller has
            //  ACKed it again, nothing to deliver
            return vec![];
        }

        if !seq.is_next_after(self.reliable_remote_in) {
            // ahead of a gap: hold it back until the gap closes
            self.pending.insert(seq, item);
            return vec![];
        }

        let mut delivered = vec![item];
        self.reliable_remote_in = seq;

        // the new frame may have closed the gap in front of buffered ones
        loop {
            let next = self.reliable_remote_in.next();
            match self.pending.remove(&next) {
                Some(buffered) => {
                    delivered.push(buffered);
                    self.reliable_remote_in = next;
                }
                None => break,
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn data_item(seq: u16) -> SequencedInbound {
        SequencedInbound::Data(DataFrame {
            kind: DataKind::ReliableOrdered,
            seq: SeqNo::from_raw(seq),
            chunk: None,
            sender_id: 2,
            dest_id: 1,
            module_id: Bytes::from_static(&[1]),
            payload: Bytes::copy_from_slice(&seq.to_be_bytes()),
        })
    }

    fn seq_of(item: &SequencedInbound) -> u16 {
        match item {
            SequencedInbound::Data(data) => data.seq.to_raw(),
            SequencedInbound::ClientInfo { .. } => panic!("not a data item"),
        }
    }

    fn run(kind: DataKind, arrivals: &[u16]) -> (ReceiveSequencer, Vec<u16>) {
        let mut sequencer = ReceiveSequencer::new();
        let mut delivered = Vec::new();
        for &seq in arrivals {
            for item in sequencer.on_item(kind, SeqNo::from_raw(seq), data_item(seq)) {
                delivered.push(seq_of(&item));
            }
        }
        (sequencer, delivered)
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![1, 2, 3], 3, 0)]
    #[case::reordered(vec![3, 1, 4, 2, 5], vec![1, 2, 3, 4, 5], 5, 0)]
    #[case::gap_stays_open(vec![2, 3, 5], vec![], 0, 3)]
    #[case::gap_closes_late(vec![2, 3, 1], vec![1, 2, 3], 3, 0)]
    #[case::duplicate_suppressed(vec![1, 2, 1, 2, 3], vec![1, 2, 3], 3, 0)]
    #[case::duplicate_of_buffered(vec![3, 3, 1, 2], vec![1, 2, 3], 3, 0)]
    #[case::old_after_delivery(vec![1, 2, 3, 2], vec![1, 2, 3], 3, 0)]
    fn test_reliable_ordered(
        #[case] arrivals: Vec<u16>,
        #[case] expected_delivered: Vec<u16>,
        #[case] expected_remote_in: u16,
        #[case] expected_pending: usize,
    ) {
        let (sequencer, delivered) = run(DataKind::ReliableOrdered, &arrivals);
        assert_eq!(delivered, expected_delivered);
        assert_eq!(sequencer.reliable_remote_in(), SeqNo::from_raw(expected_remote_in));
        assert_eq!(sequencer.pending_len(), expected_pending);
    }

    #[test]
    fn test_reliable_ordered_across_wrap() {
        let mut sequencer = ReceiveSequencer {
            reliable_remote_in: SeqNo::from_raw(0xfffe),
            unreliable_remote_in: SeqNo::ZERO,
            pending: BTreeMap::default(),
        };

        let mut delivered = Vec::new();
        for raw in [1u16, 0xffff, 0] {
            for item in sequencer.on_item(DataKind::ReliableOrdered, SeqNo::from_raw(raw), data_item(raw)) {
                delivered.push(seq_of(&item));
            }
        }

        assert_eq!(delivered, vec![0xffff, 0, 1]);
        assert_eq!(sequencer.reliable_remote_in(), SeqNo::from_raw(1));
        assert_eq!(sequencer.pending_len(), 0);
    }

    #[rstest]
    #[case::arrival_order(vec![5, 2, 9, 2], vec![5, 2, 9, 2])]
    #[case::duplicates_pass(vec![7, 7, 7], vec![7, 7, 7])]
    fn test_reliable_unordered(#[case] arrivals: Vec<u16>, #[case] expected: Vec<u16>) {
        let (sequencer, delivered) = run(DataKind::ReliableUnordered, &arrivals);
        assert_eq!(delivered, expected);
        // the unordered channel does not move the ordered counter
        assert_eq!(sequencer.reliable_remote_in(), SeqNo::ZERO);
    }

    #[rstest]
    #[case::newest_wins(vec![1, 2, 3], vec![1, 2, 3], 3)]
    #[case::old_dropped(vec![3, 1, 2], vec![3], 3)]
    #[case::duplicate_dropped(vec![4, 4], vec![4], 4)]
    #[case::jump_then_old(vec![10, 5, 11], vec![10, 11], 11)]
    fn test_unreliable_ordered(
        #[case] arrivals: Vec<u16>,
        #[case] expected: Vec<u16>,
        #[case] expected_remote_in: u16,
    ) {
        let (sequencer, delivered) = run(DataKind::UnreliableOrdered, &arrivals);
        assert_eq!(delivered, expected);
        assert_eq!(sequencer.unreliable_remote_in(), SeqNo::from_raw(expected_remote_in));
    }

    #[test]
    fn test_unreliable_unordered_delivers_everything() {
        let (_, delivered) = run(DataKind::UnreliableUnordered, &[9, 1, 9, 4]);
        assert_eq!(delivered, vec![9, 1, 9, 4]);
    }

    #[test]
    fn test_client_info_rides_reliable_ordered() {
        let mut sequencer = ReceiveSequencer::new();
        let info = SequencedInbound::ClientInfo {
            peer_id: 3,
            color: 0xff00ff00,
            username: "b".to_string(),
        };

        // out of order: held back behind the missing data frame 1
        let delivered = sequencer.on_item(DataKind::ReliableOrdered, SeqNo::from_raw(2), info.clone());
        assert!(delivered.is_empty());

        let delivered = sequencer.on_item(DataKind::ReliableOrdered, SeqNo::from_raw(1), data_item(1));
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1], info);
        assert_eq!(sequencer.reliable_remote_in(), SeqNo::from_raw(2));
    }
}
