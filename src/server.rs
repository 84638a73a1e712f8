use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Level};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::discovery;
use crate::events::{EventQueue, Severity, TransportEvent};
use crate::frame::{DataFrame, Frame, FrameStats};
use crate::handshake::HandshakeTable;
use crate::outbound::{OutboundContext, SendCallback, SendCommand};
use crate::peer::{Peer, SERVER_PEER_ID};
use crate::retransmit::Eviction;
use crate::send_pipeline::SendPipeline;
use crate::sequencer::SequencedInbound;
use crate::session::{RelayDecision, SessionManager};

/// everything the server's tasks share
struct ServerShared {
    config: Arc<NetConfig>,
    events: Arc<EventQueue>,
    sessions: Arc<SessionManager>,
    handshakes: Arc<HandshakeTable>,
    send_queue: mpsc::UnboundedSender<SendCommand>,
    evictions: mpsc::UnboundedSender<Eviction>,
    stats: Arc<FrameStats>,
}

impl ServerShared {
    fn enqueue(&self, command: SendCommand) {
        // the queue only closes on shutdown, when nothing has to go out
        let _ = self.send_queue.send(command);
    }

    fn on_connection_request(&self, from: SocketAddr) {
        if let Some(peer) = self.sessions.get_by_addr(&from) {
            // the original accept may have been lost - resending it is safe
            debug!("repeated connection request from connected peer {} - resending accept", peer.id);
            self.enqueue(SendCommand::Stateless {
                to: from,
                frame: Frame::ConnectionAccepted { peer_id: peer.id },
            });
            return;
        }

        if self.sessions.is_full() {
            self.events.log(Severity::Warning, format!("denying connection request from {}: server is full", from));
            self.enqueue(SendCommand::Stateless { to: from, frame: Frame::ConnectionDenied });
            return;
        }

        let nonce = self.handshakes.issue_challenge(from);
        debug!("challenging connection request from {:?}", from);
        self.enqueue(SendCommand::Stateless {
            to: from,
            frame: Frame::ConnectionChallenge { nonce },
        });
    }

    fn on_challenge_answer(&self, from: SocketAddr, proof: [u8; 32], color: u32, username: String) {
        let expected = match self.handshakes.take(&from) {
            Some(expected) => expected,
            None => {
                debug!("challenge answer from {:?} without an outstanding challenge - ignoring", from);
                return;
            }
        };

        if proof != expected {
            self.events.log(Severity::Warning, format!("challenge mismatch from {} - denying", from));
            self.enqueue(SendCommand::Stateless { to: from, frame: Frame::ConnectionDenied });
            return;
        }

        let peer = match self.sessions.add(from, username, color) {
            Some(peer) => peer,
            None => {
                self.events.log(Severity::Warning, format!("denying {}: server filled up during the handshake", from));
                self.enqueue(SendCommand::Stateless { to: from, frame: Frame::ConnectionDenied });
                return;
            }
        };

        self.enqueue(SendCommand::Stateless {
            to: from,
            frame: Frame::ConnectionAccepted { peer_id: peer.id },
        });

        // the server introduces itself on the fresh reliable channel, then
        //  the new peer and the existing ones learn about each other
        self.enqueue(SendCommand::ClientInfo {
            to_peer: peer.id,
            peer_id: SERVER_PEER_ID,
            color: self.config.color,
            username: self.config.username.clone(),
        });
        for other in self.sessions.all_except(peer.id) {
            self.enqueue(SendCommand::ClientInfo {
                to_peer: peer.id,
                peer_id: other.id,
                color: other.color,
                username: other.username.clone(),
            });
            self.enqueue(SendCommand::ClientInfo {
                to_peer: other.id,
                peer_id: peer.id,
                color: peer.color,
                username: peer.username.clone(),
            });
        }

        self.events.push(TransportEvent::PeerConnected(peer.id));
        self.events.push(TransportEvent::PeerListChanged);
    }

    fn on_data(&self, from: SocketAddr, data: DataFrame) {
        let peer = match self.sessions.get_by_addr(&from) {
            Some(peer) => peer,
            None => {
                debug!("data frame from unknown address {:?} - ignoring", from);
                return;
            }
        };

        // every arriving reliable frame is acknowledged, duplicates
        //  included, so the sender stops re-sending
        if data.kind.is_reliable() {
            self.enqueue(SendCommand::Stateless {
                to: from,
                frame: Frame::Ack {
                    seq: data.seq,
                    slice_index: data.chunk.map(|c| c.slice_index),
                },
            });
        }

        let delivered = self.sequence_inbound(&peer, data);
        for item in delivered {
            if let SequencedInbound::Data(data) = item {
                self.dispatch_delivered(peer.id, from, data);
            }
        }
    }

    /// run a frame through reassembly and the sequencer, returning what
    ///  became deliverable
    fn sequence_inbound(&self, peer: &Arc<Peer>, data: DataFrame) -> Vec<SequencedInbound> {
        let mut receiver = peer.receiver.lock().unwrap();

        let kind = data.kind;
        let seq = data.seq;

        let data = if data.chunk.is_some() {
            if kind.is_ordered() && !seq.is_newer_than(receiver.sequencer.reliable_remote_in()) {
                trace!("stale slice of already delivered sequence {} - dropping", seq);
                return vec![];
            }
            match receiver.assembler.on_slice(data) {
                Some(complete) => complete,
                None => return vec![], // waiting for more slices
            }
        }
        else {
            data
        };

        receiver.sequencer.on_item(kind, seq, SequencedInbound::Data(data))
    }

    /// relay rules: destination 1 is the server itself, 0 fans out to every
    ///  other peer, anything else forwards to exactly that peer
    fn dispatch_delivered(&self, sender_peer_id: u8, from: SocketAddr, data: DataFrame) {
        match self.sessions.route(data.dest_id) {
            RelayDecision::DeliverLocally => {
                self.events.push(TransportEvent::DataReceived {
                    module_id: data.module_id,
                    sender_id: sender_peer_id,
                    payload: data.payload,
                });
            }
            RelayDecision::Broadcast => {
                self.events.push(TransportEvent::DataReceived {
                    module_id: data.module_id.clone(),
                    sender_id: sender_peer_id,
                    payload: data.payload.clone(),
                });
                for other in self.sessions.all_except(sender_peer_id) {
                    self.enqueue(SendCommand::Relay {
                        to_peer: other.id,
                        kind: data.kind,
                        module_id: data.module_id.clone(),
                        payload: data.payload.clone(),
                        sender_id: sender_peer_id,
                    });
                }
            }
            RelayDecision::Forward(target) => {
                self.enqueue(SendCommand::Relay {
                    to_peer: target.id,
                    kind: data.kind,
                    module_id: data.module_id,
                    payload: data.payload,
                    sender_id: sender_peer_id,
                });
            }
            RelayDecision::UnknownDestination(dest_id) => {
                debug!("peer {} addressed unknown peer {} - telling it to prune", sender_peer_id, dest_id);
                self.enqueue(SendCommand::Stateless {
                    to: from,
                    frame: Frame::ClientDisconnected { peer_id: dest_id },
                });
            }
        }
    }

    fn on_frame(&self, from: SocketAddr, frame: Frame) {
        if let Some(peer) = self.sessions.get_by_addr(&from) {
            peer.touch();
        }

        match frame {
            Frame::ConnectionRequest => self.on_connection_request(from),
            Frame::ChallengeAnswer { proof, color, username } => {
                self.on_challenge_answer(from, proof, color, username)
            }
            Frame::ConnectionClosed { .. } => {
                if let Some(peer) = self.sessions.get_by_addr(&from) {
                    let _ = self.evictions.send(Eviction {
                        peer_id: peer.id,
                        reason: "connection closed by peer",
                    });
                }
            }
            Frame::Ack { seq, slice_index } => {
                if let Some(peer) = self.sessions.get_by_addr(&from) {
                    peer.on_ack(seq, slice_index);
                }
            }
            Frame::Data(data) => self.on_data(from, data),
            other => {
                debug!("ignoring {:?} frame at the server", frame_name(&other));
            }
        }
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::ConnectionRequest => "ConnectionRequest",
        Frame::ConnectionChallenge { .. } => "ConnectionChallenge",
        Frame::ChallengeAnswer { .. } => "ChallengeAnswer",
        Frame::ConnectionAccepted { .. } => "ConnectionAccepted",
        Frame::ConnectionDenied => "ConnectionDenied",
        Frame::ConnectionClosed { .. } => "ConnectionClosed",
        Frame::ClientDisconnected { .. } => "ClientDisconnected",
        Frame::ServerInformation { .. } => "ServerInformation",
        Frame::Ack { .. } => "Ack",
        Frame::Data(_) => "Data",
        Frame::ClientInfo { .. } => "ClientInfo",
    }
}

/// The server endpoint: accepts handshakes, sequences and relays traffic,
///  and announces itself on the discovery port.
pub struct Server {
    shared: Arc<ServerShared>,
    pipeline: Arc<SendPipeline>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub async fn start(config: NetConfig) -> anyhow::Result<Server> {
        config.validate()?;
        let config = Arc::new(config);

        let local_ip = crate::netutil::resolve_local_ip(config.allow_virtual_ips)?;

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?);
        let local_addr = socket.local_addr()?;
        info!("server listening on {:?}", local_addr);

        let pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone()), config.debug));
        let events = Arc::new(EventQueue::new());
        let sessions = Arc::new(SessionManager::new(config.max_clients));
        let handshakes = Arc::new(HandshakeTable::new());
        let stats = Arc::new(FrameStats::default());

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ServerShared {
            config: config.clone(),
            events: events.clone(),
            sessions: sessions.clone(),
            handshakes,
            send_queue: send_tx,
            evictions: evict_tx.clone(),
            stats,
        });

        let outbound = Arc::new(OutboundContext {
            pipeline: pipeline.clone(),
            sessions: sessions.clone(),
            events: events.clone(),
            evictions: evict_tx,
            mtu: config.mtu,
            retransmit_delay: config.retransmit_delay(),
            max_retries: config.max_resend_reliable_packets,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut task_handles = Vec::new();

        task_handles.push(tokio::spawn(run_listener(
            socket,
            local_ip,
            shared.clone(),
            shutdown.clone(),
        )));
        task_handles.push(tokio::spawn(run_sender(outbound, send_rx)));
        task_handles.push(tokio::spawn(run_evictions(shared.clone(), evict_rx)));

        let beacon_socket = Arc::new(discovery::bind_beacon_socket(config.discovery_port)?);
        let beacon_pipeline = Arc::new(SendPipeline::new(Arc::new(beacon_socket), config.debug));
        let beacon_target = SocketAddr::from((Ipv4Addr::BROADCAST, config.discovery_port));
        task_handles.push(tokio::spawn(discovery::run_beacon_loop(
            beacon_pipeline,
            beacon_target,
            config.clone(),
            sessions,
        )));

        Ok(Server {
            shared,
            pipeline,
            local_addr,
            shutdown,
            task_handles: Mutex::new(task_handles),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn event_queue(&self) -> Arc<EventQueue> {
        self.shared.events.clone()
    }

    pub fn connected_peer_ids(&self) -> Vec<u8> {
        let mut ids = self.shared.sessions.all().iter().map(|p| p.id).collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn malformed_frames(&self) -> u64 {
        self.shared.stats.malformed()
    }

    pub fn send_reliable(&self, module_id: &[u8], payload: &[u8], completion: SendCallback, receiver: Option<u8>) {
        self.enqueue_data(crate::frame::DataKind::ReliableOrdered, module_id, payload, completion, receiver);
    }

    pub fn send_reliable_unordered(&self, module_id: &[u8], payload: &[u8], completion: SendCallback, receiver: Option<u8>) {
        self.enqueue_data(crate::frame::DataKind::ReliableUnordered, module_id, payload, completion, receiver);
    }

    pub fn send_unreliable(&self, module_id: &[u8], payload: &[u8], completion: SendCallback, receiver: Option<u8>) {
        self.enqueue_data(crate::frame::DataKind::UnreliableOrdered, module_id, payload, completion, receiver);
    }

    pub fn send_unreliable_unordered(&self, module_id: &[u8], payload: &[u8], completion: SendCallback, receiver: Option<u8>) {
        self.enqueue_data(crate::frame::DataKind::UnreliableUnordered, module_id, payload, completion, receiver);
    }

    fn enqueue_data(&self, kind: crate::frame::DataKind, module_id: &[u8], payload: &[u8], completion: SendCallback, receiver: Option<u8>) {
        let command = SendCommand::Data {
            kind,
            module_id: Bytes::copy_from_slice(module_id),
            payload: Bytes::copy_from_slice(payload),
            receiver,
            completion,
        };
        if let Err(mpsc::error::SendError(command)) = self.shared.send_queue.send(command) {
            if let SendCommand::Data { completion, .. } = command {
                completion(false);
            }
        }
    }

    /// Cooperative teardown: notify the peers, then stop all tasks. The
    ///  socket closes when the last task holding it is gone.
    pub async fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down server");

        for peer in self.shared.sessions.all() {
            self.pipeline.send_frame(peer.addr, &Frame::ConnectionClosed { peer_id: SERVER_PEER_ID }).await;
        }
        self.shared.sessions.clear();

        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

async fn run_listener(
    socket: Arc<UdpSocket>,
    local_ip: IpAddr,
    shared: Arc<ServerShared>,
    shutdown: Arc<AtomicBool>,
) {
    info!("starting receive loop");
    let mut receive_buffer = vec![0u8; 65536];
    let mut consecutive_errors = 0u32;

    loop {
        let (num_read, from) = match socket.recv_from(&mut receive_buffer).await {
            Ok(x) => {
                consecutive_errors = 0;
                x
            }
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                // a transient error is logged and skipped; a socket that
                //  only produces errors is dead
                consecutive_errors += 1;
                if consecutive_errors > 3 {
                    shared.events.log(Severity::Error, format!("receive socket failed: {}", e));
                    shared.events.push(TransportEvent::Disconnected);
                    break;
                }
                error!("socket error: {}", e);
                continue;
            }
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        let _entered = span.enter();

        if crate::netutil::is_local_echo(&from, &local_ip) {
            trace!("dropping frame echoed back from the local address");
            continue;
        }

        if shared.config.debug {
            trace!("<- {:?}: {:02x?}", from, &receive_buffer[..num_read]);
        }

        match Frame::parse(&receive_buffer[..num_read]) {
            Ok(frame) => shared.on_frame(from, frame),
            Err(e) => {
                debug!("dropping malformed frame from {:?}: {}", from, e);
                shared.stats.record_malformed();
            }
        }
    }
    info!("receive loop stopped");
}

async fn run_sender(outbound: Arc<OutboundContext>, mut send_rx: mpsc::UnboundedReceiver<SendCommand>) {
    while let Some(command) = send_rx.recv().await {
        match command {
            SendCommand::Stateless { to, frame } => {
                outbound.send_stateless(to, &frame).await;
            }
            SendCommand::ClientInfo { to_peer, peer_id, color, username } => {
                if let Some(to) = outbound.sessions.get(to_peer) {
                    outbound.send_client_info(&to, peer_id, color, &username).await;
                }
            }
            SendCommand::Relay { to_peer, kind, module_id, payload, sender_id } => {
                // a peer that left after the relay decision is a no-op
                if let Some(to) = outbound.sessions.get(to_peer) {
                    outbound.send_data(&to, kind, sender_id, to_peer, &module_id, &payload).await;
                }
            }
            SendCommand::Data { kind, module_id, payload, receiver, completion } => {
                let ok = match receiver {
                    Some(peer_id) => match outbound.sessions.get(peer_id) {
                        Some(peer) => {
                            outbound.send_data(&peer, kind, SERVER_PEER_ID, peer_id, &module_id, &payload).await
                        }
                        None => false,
                    },
                    None => {
                        let mut ok = true;
                        for peer in outbound.sessions.all() {
                            ok &= outbound
                                .send_data(&peer, kind, SERVER_PEER_ID, peer.id, &module_id, &payload)
                                .await;
                        }
                        ok
                    }
                };
                completion(ok);
            }
        }
    }
}

/// Eviction is the single place peers are removed outside shutdown, so
///  removal, the broadcast to the remaining peers and the upcalls cannot
///  race each other.
async fn run_evictions(shared: Arc<ServerShared>, mut evict_rx: mpsc::UnboundedReceiver<Eviction>) {
    while let Some(eviction) = evict_rx.recv().await {
        let peer = match shared.sessions.remove(eviction.peer_id) {
            Some(peer) => peer,
            None => continue, // several notices for the same peer
        };

        shared.events.log(
            Severity::Info,
            format!("peer {} ({:?}) disconnected: {}", peer.id, peer.username, eviction.reason),
        );

        for other in shared.sessions.all() {
            shared.enqueue(SendCommand::Stateless {
                to: other.addr,
                frame: Frame::ClientDisconnected { peer_id: peer.id },
            });
        }

        shared.events.push(TransportEvent::PeerDisconnected(peer.id));
        shared.events.push(TransportEvent::PeerListChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChunkInfo, DataKind};
    use crate::handshake::challenge_proof;
    use crate::sequence::SeqNo;

    fn shared_with_queues() -> (
        Arc<ServerShared>,
        mpsc::UnboundedReceiver<SendCommand>,
        mpsc::UnboundedReceiver<Eviction>,
    ) {
        let mut config = NetConfig::default_lan();
        config.max_clients = 4;
        config.username = "host".to_string();

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ServerShared {
            config: Arc::new(config),
            events: Arc::new(EventQueue::new()),
            sessions: Arc::new(SessionManager::new(4)),
            handshakes: Arc::new(HandshakeTable::new()),
            send_queue: send_tx,
            evictions: evict_tx,
            stats: Arc::new(FrameStats::default()),
        });
        (shared, send_rx, evict_rx)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 2, 3], port))
    }

    fn expect_stateless(send_rx: &mut mpsc::UnboundedReceiver<SendCommand>) -> (SocketAddr, Frame) {
        match send_rx.try_recv().expect("expected a queued command") {
            SendCommand::Stateless { to, frame } => (to, frame),
            _ => panic!("expected a stateless command"),
        }
    }

    fn connect_peer(shared: &Arc<ServerShared>, send_rx: &mut mpsc::UnboundedReceiver<SendCommand>, port: u16, name: &str) -> u8 {
        shared.on_connection_request(addr(port));
        let (_, frame) = expect_stateless(send_rx);
        let nonce = match frame {
            Frame::ConnectionChallenge { nonce } => nonce,
            other => panic!("expected a challenge, got {:?}", other),
        };

        shared.on_challenge_answer(addr(port), challenge_proof(nonce), 0xabcd, name.to_string());
        let (to, frame) = expect_stateless(send_rx);
        assert_eq!(to, addr(port));
        let peer_id = match frame {
            Frame::ConnectionAccepted { peer_id } => peer_id,
            other => panic!("expected an accept, got {:?}", other),
        };

        // drain the ClientInfo fan-out
        while let Ok(command) = send_rx.try_recv() {
            assert!(matches!(command, SendCommand::ClientInfo { .. }));
        }
        peer_id
    }

    #[test]
    fn test_handshake_happy_path() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();

        let peer_id = connect_peer(&shared, &mut send_rx, 1000, "a");
        assert_eq!(peer_id, 2);
        assert_eq!(shared.sessions.len(), 1);
        assert!(!shared.handshakes.has_pending(&addr(1000)));

        // a second client gets the next id, and both sides learn about
        //  each other
        shared.on_connection_request(addr(1001));
        let nonce = match expect_stateless(&mut send_rx).1 {
            Frame::ConnectionChallenge { nonce } => nonce,
            other => panic!("expected a challenge, got {:?}", other),
        };
        shared.on_challenge_answer(addr(1001), challenge_proof(nonce), 1, "b".to_string());

        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::ConnectionAccepted { peer_id: 3 }));

        let mut infos = Vec::new();
        while let Ok(command) = send_rx.try_recv() {
            match command {
                SendCommand::ClientInfo { to_peer, peer_id, .. } => infos.push((to_peer, peer_id)),
                _ => panic!("expected only ClientInfo commands"),
            }
        }
        // the new peer hears about the server and peer 2, peer 2 hears
        //  about the new peer
        assert!(infos.contains(&(3, SERVER_PEER_ID)));
        assert!(infos.contains(&(3, 2)));
        assert!(infos.contains(&(2, 3)));
    }

    #[test]
    fn test_handshake_mismatch_is_denied() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();

        shared.on_connection_request(addr(1000));
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::ConnectionChallenge { .. }));

        shared.on_challenge_answer(addr(1000), [0u8; 32], 0, "a".to_string());
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::ConnectionDenied));
        assert_eq!(shared.sessions.len(), 0);
        assert!(!shared.handshakes.has_pending(&addr(1000)));
    }

    #[test]
    fn test_handshake_denied_at_capacity_without_challenge() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();

        // cap is 4 endpoints: server + 3 clients
        for port in 1000..1003 {
            connect_peer(&shared, &mut send_rx, port, "x");
        }
        assert_eq!(shared.sessions.len(), 3);

        shared.on_connection_request(addr(2000));
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::ConnectionDenied));
        assert!(!shared.handshakes.has_pending(&addr(2000)));
    }

    #[test]
    fn test_repeated_request_from_connected_peer_resends_accept() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        let peer_id = connect_peer(&shared, &mut send_rx, 1000, "a");

        shared.on_connection_request(addr(1000));
        match expect_stateless(&mut send_rx) {
            (to, Frame::ConnectionAccepted { peer_id: accepted }) => {
                assert_eq!(to, addr(1000));
                assert_eq!(accepted, peer_id);
            }
            other => panic!("expected a re-sent accept, got {:?}", other.1),
        }
        assert_eq!(shared.sessions.len(), 1);
    }

    fn data_frame(seq: u16, dest_id: u8) -> DataFrame {
        DataFrame {
            kind: DataKind::ReliableOrdered,
            seq: SeqNo::from_raw(seq),
            chunk: None,
            sender_id: 2,
            dest_id,
            module_id: Bytes::from_static(&[0x01]),
            payload: Bytes::from_static(&[0xde, 0xad]),
        }
    }

    #[test]
    fn test_data_to_server_is_delivered_and_acked() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        let peer_id = connect_peer(&shared, &mut send_rx, 1000, "a");

        shared.on_data(addr(1000), data_frame(1, SERVER_PEER_ID));

        assert!(matches!(
            expect_stateless(&mut send_rx).1,
            Frame::Ack { seq, slice_index: None } if seq == SeqNo::from_raw(1)
        ));

        shared.events.tick(); // no listener registered; just drain
        assert_eq!(shared.events.pending(), 0);

        // replay of the same sequence: ACKed again, not re-delivered
        shared.on_data(addr(1000), data_frame(1, SERVER_PEER_ID));
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));
        assert!(send_rx.try_recv().is_err());

        let _ = peer_id;
    }

    #[test]
    fn test_broadcast_is_relayed_to_all_other_peers() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        let sender = connect_peer(&shared, &mut send_rx, 1000, "a");
        let other = connect_peer(&shared, &mut send_rx, 1001, "b");

        shared.on_data(addr(1000), data_frame(1, 0));

        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));
        match send_rx.try_recv().unwrap() {
            SendCommand::Relay { to_peer, sender_id, payload, .. } => {
                assert_eq!(to_peer, other);
                assert_eq!(sender_id, sender);
                assert_eq!(payload.as_ref(), &[0xde, 0xad]);
            }
            _ => panic!("expected a relay command"),
        }
        assert!(send_rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_to_unknown_peer_reports_back() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        connect_peer(&shared, &mut send_rx, 1000, "a");

        shared.on_data(addr(1000), data_frame(1, 7));

        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));
        match expect_stateless(&mut send_rx) {
            (to, Frame::ClientDisconnected { peer_id }) => {
                assert_eq!(to, addr(1000));
                assert_eq!(peer_id, 7);
            }
            other => panic!("expected ClientDisconnected, got {:?}", other.1),
        }
    }

    #[test]
    fn test_chunked_data_is_slice_acked_and_assembled() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        connect_peer(&shared, &mut send_rx, 1000, "a");

        let slices = [(0u16, &b"he"[..]), (2, b"o!"), (1, b"ll")];
        for (slice_index, payload) in slices {
            shared.on_data(addr(1000), DataFrame {
                kind: DataKind::ReliableOrdered,
                seq: SeqNo::from_raw(1),
                chunk: Some(ChunkInfo { slice_index, slice_count: 3 }),
                sender_id: 2,
                dest_id: SERVER_PEER_ID,
                module_id: Bytes::from_static(&[0x01]),
                payload: Bytes::from_static(payload),
            });

            match expect_stateless(&mut send_rx).1 {
                Frame::Ack { seq, slice_index: acked } => {
                    assert_eq!(seq, SeqNo::from_raw(1));
                    assert_eq!(acked, Some(slice_index));
                }
                other => panic!("expected a slice ACK, got {:?}", other),
            }
        }

        // exactly one DataReceived event, with the reassembled payload
        struct Check;
        impl crate::events::TransportEventListener for Check {
            fn on_transport_event(&self, event: TransportEvent) {
                match event {
                    TransportEvent::DataReceived { payload, sender_id, .. } => {
                        assert_eq!(payload.as_ref(), b"hello!");
                        assert_eq!(sender_id, 2);
                    }
                    TransportEvent::LogMessage { .. } => {}
                    other => panic!("unexpected event {:?}", other),
                }
            }
        }
        shared.events.add_listener(Arc::new(Check));
        shared.events.tick();
    }

    #[test]
    fn test_connection_closed_triggers_eviction() {
        let (shared, mut send_rx, mut evict_rx) = shared_with_queues();
        let peer_id = connect_peer(&shared, &mut send_rx, 1000, "a");

        shared.on_frame(addr(1000), Frame::ConnectionClosed { peer_id });
        let eviction = evict_rx.try_recv().unwrap();
        assert_eq!(eviction.peer_id, peer_id);
        assert_eq!(eviction.reason, "connection closed by peer");
    }

    #[test]
    fn test_ack_clears_send_buffer() {
        let (shared, mut send_rx, _evict_rx) = shared_with_queues();
        let peer_id = connect_peer(&shared, &mut send_rx, 1000, "a");
        let peer = shared.sessions.get(peer_id).unwrap();

        peer.send_packets.insert(SeqNo::from_raw(5), Bytes::from_static(&[1]));
        shared.on_frame(addr(1000), Frame::Ack { seq: SeqNo::from_raw(5), slice_index: None });
        assert_eq!(peer.unacked_len(), 0);
    }
}
