use std::net::SocketAddr;

use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// The liveness proof both sides compute over a challenge nonce. This is
///  *not* authentication: anyone who observes the nonce on the wire can
///  produce the proof. It only establishes that the requester receives
///  traffic at its claimed address.
pub fn challenge_proof(nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());

    let mut proof = [0u8; 32];
    proof.copy_from_slice(&hasher.finalize());
    proof
}

/// Server-side table of outstanding challenges. An address is a key here iff
///  a challenge was issued to it and neither accepted nor denied yet; a
///  repeated ConnectionRequest replaces the outstanding record.
#[derive(Default)]
pub struct HandshakeTable {
    pending: DashMap<SocketAddr, [u8; 32]>,
}

impl HandshakeTable {
    pub fn new() -> HandshakeTable {
        HandshakeTable::default()
    }

    /// Generate a fresh nonce for the address, remember the proof it must
    ///  come back with, and return the nonce for the challenge frame.
    pub fn issue_challenge(&self, addr: SocketAddr) -> u64 {
        let nonce = rand::thread_rng().next_u64();
        self.pending.insert(addr, challenge_proof(nonce));
        nonce
    }

    /// Take the outstanding record for the address, if any. The record is
    ///  removed either way - acceptance and denial both close the exchange.
    pub fn take(&self, addr: &SocketAddr) -> Option<[u8; 32]> {
        self.pending.remove(addr).map(|(_, proof)| proof)
    }

    pub fn has_pending(&self, addr: &SocketAddr) -> bool {
        self.pending.contains_key(addr)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
