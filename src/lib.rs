//! UDP transport engine for small LAN applications: one endpoint is the
//!  SERVER (accepts peers, relays traffic, announces itself), every other
//!  endpoint is a CLIENT (discovers servers, performs the handshake,
//!  exchanges data). Both roles share the same transport primitives, only
//!  the session bookkeeping differs.
//!
//! ## Design goals
//!
//! * Four delivery disciplines per peer, selected per send:
//!   * *reliable ordered*: acknowledged, re-sent until acknowledged,
//!     delivered to the application in sequence order without gaps
//!   * *reliable unordered*: acknowledged and re-sent, delivered in arrival
//!     order (duplicates may reach the application; deduplication is the
//!     application's business)
//!   * *unreliable ordered*: fire-and-forget, frames older than the newest
//!     delivered one are dropped
//!   * *unreliable unordered*: fire-and-forget, everything that arrives is
//!     delivered
//! * Reliable messages larger than the configured MTU are chunked into
//!   slices and reassembled on the receiving side; unreliable messages are
//!   capped at the MTU
//! * The server relays between clients, so clients never talk to each other
//!   directly: a destination id selects the server itself (1), one peer
//!   (its id), or everybody (0)
//! * Server discovery by broadcast beacons on a dedicated port
//! * The handshake proves liveness of the requester's address with a hashed
//!   challenge - it does *not* authenticate anyone: an observer of the nonce
//!   can complete it. Payloads are not encrypted.
//! * All application-visible callbacks are queued and delivered on the host
//!   thread via [events::EventQueue::tick], never on a network task
//!
//! ## Wire format
//!
//! Every frame starts with a CRC32 (ISO-HDLC) over the remainder, followed
//!  by a type byte whose high bit marks the chunked variant of the reliable
//!  data kinds (and, on ACK, the presence of a slice index):
//!
//! ```ascii
//! 0: checksum (u32 BE) over everything that follows
//! 4: type byte
//! 5: kind-specific body, all integers in network byte order:
//!    * ConnectionRequest:    -
//!    * ConnectionChallenge:  nonce (u64)
//!    * ChallengeAnswer:      sha256 of the nonce (32 bytes),
//!                            color (u32), username (u8 length + ASCII)
//!    * ConnectionAccepted:   peer id (u8)
//!    * ConnectionDenied:     -
//!    * ConnectionClosed:     peer id (u8)
//!    * ClientDisconnected:   peer id (u8)
//!    * ServerInformation:    cap (u8), client count (u8),
//!                            servername (u8 length + ASCII)
//!    * Ack:                  sequence (u16) [, slice index (u16)]
//!    * data kinds:           sequence (u16)
//!                            [, slice index (u16), slice count (u16)],
//!                            sender id (u8), destination id (u8),
//!                            module id (u8 length + bytes),
//!                            payload (u16 length + bytes)
//!    * ClientInfo:           sequence (u16), peer id (u8), color (u32),
//!                            username (u8 length + ASCII)
//! ```
//!
//! Sequence numbers are 16 bits per peer and direction, with wrap-around
//!  ('newer' is decided within the forward half-circle, see
//!  [sequence::SeqNo]). Reliable and unreliable traffic count separately.
//!
//! ## Concurrency
//!
//! Per endpoint there is a listener task (blocking on the socket), a sender
//!  task (draining the outbound queue, which serializes outgoing sequence
//!  assignment), a heartbeat/discovery task, and one short-lived timer task
//!  per unacknowledged reliable frame. Per-peer send buffers are concurrent
//!  maps because ACK processing and retransmit timers touch them from
//!  different tasks; everything else has a single writer. Teardown is
//!  cooperative: a shutdown flag plus task aborts, no forceful termination.

pub mod client;
pub mod config;
pub mod discovery;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod peer;
pub mod reassembly;
pub mod send_pipeline;
pub mod sequence;
pub mod sequencer;
pub mod server;
pub mod session;

mod netutil;
mod outbound;
mod retransmit;

pub use client::Client;
pub use config::NetConfig;
pub use events::{EventQueue, Severity, TransportEvent, TransportEventListener};
pub use outbound::SendCallback;
pub use server::Server;
