use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, span, trace, Level};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::discovery::{self, ServerDirectory};
use crate::events::{EventQueue, Severity, TransportEvent};
use crate::frame::{DataFrame, Frame, FrameStats};
use crate::handshake::challenge_proof;
use crate::outbound::{OutboundContext, SendCallback, SendCommand};
use crate::peer::{BROADCAST_PEER_ID, SERVER_PEER_ID};
use crate::retransmit::Eviction;
use crate::send_pipeline::SendPipeline;
use crate::sequencer::SequencedInbound;
use crate::session::SessionManager;

/// a fellow client, known from the server's ClientInfo announcements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub username: String,
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting { server: SocketAddr, since: Instant },
    Connected { server: SocketAddr },
}

/// everything the client's tasks share
struct ClientShared {
    config: Arc<NetConfig>,
    events: Arc<EventQueue>,
    /// holds at most one peer: the server, under id 1
    sessions: Arc<SessionManager>,
    directory: Arc<ServerDirectory>,
    roster: DashMap<u8, RemotePeer>,
    state: Mutex<ClientState>,
    my_id: AtomicU8,
    send_queue: mpsc::UnboundedSender<SendCommand>,
    evictions: mpsc::UnboundedSender<Eviction>,
    stats: Arc<FrameStats>,
}

impl ClientShared {
    fn enqueue(&self, command: SendCommand) {
        let _ = self.send_queue.send(command);
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    fn connected_server(&self) -> Option<SocketAddr> {
        match self.state() {
            ClientState::Connected { server } => Some(server),
            _ => None,
        }
    }

    fn begin_connect(&self, server: SocketAddr) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ClientState::Idle {
                debug!("connect requested while {:?} - ignoring", *state);
                return;
            }
            *state = ClientState::Connecting { server, since: Instant::now() };
        }

        info!("connecting to {:?}", server);
        self.events.push(TransportEvent::Connecting);
        self.enqueue(SendCommand::Stateless { to: server, frame: Frame::ConnectionRequest });
    }

    /// Close the local session state and tell the application. `reconnect`
    ///  distinguishes an unexpected end from a user-requested one.
    fn teardown_session(self: &Arc<Self>, reason: &str, reconnect: bool) {
        let server = {
            let mut state = self.state.lock().unwrap();
            let server = match *state {
                ClientState::Connected { server } => server,
                ClientState::Connecting { server, .. } => server,
                ClientState::Idle => return,
            };
            *state = ClientState::Idle;
            server
        };

        self.sessions.clear();
        self.roster.clear();
        self.my_id.store(0, Ordering::SeqCst);

        self.events.log(Severity::Info, format!("disconnected from {}: {}", server, reason));
        self.events.push(TransportEvent::Disconnected);
        self.events.push(TransportEvent::PeerListChanged);

        if reconnect && self.config.reconnect_after_recompile {
            info!("session ended unexpectedly - attempting to reconnect to {:?}", server);
            let shared = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(shared.config.rtt * 4).await;
                shared.begin_connect(server);
            });
        }
    }

    fn on_connection_challenge(&self, from: SocketAddr, nonce: u64) {
        match self.state() {
            ClientState::Connecting { server, .. } if server == from => {}
            other => {
                debug!("unexpected challenge from {:?} while {:?} - ignoring", from, other);
                return;
            }
        }

        self.enqueue(SendCommand::Stateless {
            to: from,
            frame: Frame::ChallengeAnswer {
                proof: challenge_proof(nonce),
                color: self.config.color,
                username: self.config.username.clone(),
            },
        });
    }

    fn on_connection_accepted(&self, from: SocketAddr, peer_id: u8) {
        match self.state() {
            ClientState::Connecting { server, .. } if server == from => {}
            ClientState::Connected { server } if server == from => {
                // the server re-sent the accept because our first request
                //  was duplicated - nothing to do
                return;
            }
            other => {
                debug!("unexpected accept from {:?} while {:?} - ignoring", from, other);
                return;
            }
        }

        // the server's display attributes arrive with its ClientInfo
        self.sessions.add_with_id(SERVER_PEER_ID, from, String::new(), 0);
        self.my_id.store(peer_id, Ordering::SeqCst);
        *self.state.lock().unwrap() = ClientState::Connected { server: from };

        info!("connected to {:?} as peer {}", from, peer_id);
        self.events.push(TransportEvent::Connected);
    }

    fn on_connection_denied(self: &Arc<Self>, from: SocketAddr) {
        if matches!(self.state(), ClientState::Connecting { server, .. } if server == from) {
            self.teardown_session("connection denied by server", false);
        }
    }

    fn on_data(&self, from: SocketAddr, data: DataFrame) {
        let Some(peer) = self.server_peer_for(from) else { return };

        if data.kind.is_reliable() {
            self.enqueue(SendCommand::Stateless {
                to: from,
                frame: Frame::Ack {
                    seq: data.seq,
                    slice_index: data.chunk.map(|c| c.slice_index),
                },
            });
        }

        let delivered = {
            let mut receiver = peer.receiver.lock().unwrap();
            let kind = data.kind;
            let seq = data.seq;

            let data = if data.chunk.is_some() {
                if kind.is_ordered() && !seq.is_newer_than(receiver.sequencer.reliable_remote_in()) {
                    trace!("stale slice of already delivered sequence {} - dropping", seq);
                    return;
                }
                match receiver.assembler.on_slice(data) {
                    Some(complete) => complete,
                    None => return,
                }
            }
            else {
                data
            };

            receiver.sequencer.on_item(kind, seq, SequencedInbound::Data(data))
        };

        let my_id = self.my_id.load(Ordering::SeqCst);
        for item in delivered {
            match item {
                SequencedInbound::Data(data) => {
                    if data.dest_id != my_id && data.dest_id != BROADCAST_PEER_ID {
                        debug!("data addressed to {} delivered to peer {} - dropping", data.dest_id, my_id);
                        continue;
                    }
                    self.events.push(TransportEvent::DataReceived {
                        module_id: data.module_id,
                        sender_id: data.sender_id,
                        payload: data.payload,
                    });
                }
                SequencedInbound::ClientInfo { peer_id, color, username } => {
                    self.on_client_info(peer_id, color, username);
                }
            }
        }
    }

    fn on_client_info_frame(&self, from: SocketAddr, seq: crate::sequence::SeqNo, peer_id: u8, color: u32, username: String) {
        let Some(peer) = self.server_peer_for(from) else { return };

        // ClientInfo rides the reliable ordered channel
        self.enqueue(SendCommand::Stateless {
            to: from,
            frame: Frame::Ack { seq, slice_index: None },
        });

        let delivered = {
            let mut receiver = peer.receiver.lock().unwrap();
            receiver.sequencer.on_item(
                crate::frame::DataKind::ReliableOrdered,
                seq,
                SequencedInbound::ClientInfo { peer_id, color, username },
            )
        };

        for item in delivered {
            match item {
                SequencedInbound::ClientInfo { peer_id, color, username } => {
                    self.on_client_info(peer_id, color, username);
                }
                SequencedInbound::Data(data) => {
                    // a buffered data frame became deliverable behind this one
                    self.events.push(TransportEvent::DataReceived {
                        module_id: data.module_id,
                        sender_id: data.sender_id,
                        payload: data.payload,
                    });
                }
            }
        }
    }

    fn on_client_info(&self, peer_id: u8, color: u32, username: String) {
        let is_new = self.roster.insert(peer_id, RemotePeer { username, color }).is_none();

        let my_id = self.my_id.load(Ordering::SeqCst);
        if is_new && peer_id != SERVER_PEER_ID && peer_id != my_id {
            self.events.push(TransportEvent::PeerConnected(peer_id));
        }
        self.events.push(TransportEvent::PeerListChanged);
    }

    fn on_client_disconnected(&self, peer_id: u8) {
        if self.roster.remove(&peer_id).is_some() {
            self.events.push(TransportEvent::PeerDisconnected(peer_id));
            self.events.push(TransportEvent::PeerListChanged);
        }
    }

    fn server_peer_for(&self, from: SocketAddr) -> Option<Arc<crate::peer::Peer>> {
        match self.sessions.get_by_addr(&from) {
            Some(peer) => Some(peer),
            None => {
                debug!("sequenced frame from {:?} which is not our server - ignoring", from);
                None
            }
        }
    }

    fn on_frame(self: &Arc<Self>, from: SocketAddr, frame: Frame) {
        if let Some(peer) = self.sessions.get_by_addr(&from) {
            peer.touch();
        }

        match frame {
            Frame::ConnectionChallenge { nonce } => self.on_connection_challenge(from, nonce),
            Frame::ConnectionAccepted { peer_id } => self.on_connection_accepted(from, peer_id),
            Frame::ConnectionDenied => self.on_connection_denied(from),
            Frame::ConnectionClosed { .. } => {
                if self.connected_server() == Some(from) {
                    self.teardown_session("connection closed by server", true);
                }
            }
            Frame::ClientDisconnected { peer_id } => self.on_client_disconnected(peer_id),
            Frame::Ack { seq, slice_index } => {
                if let Some(peer) = self.sessions.get_by_addr(&from) {
                    peer.on_ack(seq, slice_index);
                }
            }
            Frame::Data(data) => self.on_data(from, data),
            Frame::ClientInfo { seq, peer_id, color, username } => {
                self.on_client_info_frame(from, seq, peer_id, color, username)
            }
            Frame::ConnectionRequest | Frame::ChallengeAnswer { .. } | Frame::ServerInformation { .. } => {
                debug!("ignoring server-bound frame at the client");
            }
        }
    }
}

/// The client endpoint: discovers servers on the LAN, connects to one, and
///  exchanges data with it (and through it, with the other clients).
pub struct Client {
    shared: Arc<ClientShared>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub async fn start(config: NetConfig) -> anyhow::Result<Client> {
        config.validate()?;
        let config = Arc::new(config);

        let local_ip = crate::netutil::resolve_local_ip(config.allow_virtual_ips)?;

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let local_addr = socket.local_addr()?;
        info!("client bound to {:?}", local_addr);

        let pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone()), config.debug));
        let sessions = Arc::new(SessionManager::new(2));

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ClientShared {
            config: config.clone(),
            events: Arc::new(EventQueue::new()),
            sessions: sessions.clone(),
            directory: Arc::new(ServerDirectory::new(config.server_discovery_timeout)),
            roster: DashMap::new(),
            state: Mutex::new(ClientState::Idle),
            my_id: AtomicU8::new(0),
            send_queue: send_tx,
            evictions: evict_tx.clone(),
            stats: Arc::new(FrameStats::default()),
        });

        let outbound = Arc::new(OutboundContext {
            pipeline,
            sessions,
            events: shared.events.clone(),
            evictions: evict_tx,
            mtu: config.mtu,
            retransmit_delay: config.retransmit_delay(),
            max_retries: config.max_resend_reliable_packets,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut task_handles = Vec::new();

        task_handles.push(tokio::spawn(run_listener(socket, local_ip, shared.clone(), shutdown.clone())));
        task_handles.push(tokio::spawn(run_sender(shared.clone(), outbound, send_rx)));
        task_handles.push(tokio::spawn(run_evictions(shared.clone(), evict_rx)));
        task_handles.push(tokio::spawn(run_timeouts(shared.clone())));

        let discovery_socket = Arc::new(discovery::bind_discovery_socket(config.discovery_port)?);
        task_handles.push(tokio::spawn(run_discovery_listener(discovery_socket, shared.clone())));

        Ok(Client {
            shared,
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

    /// the id the server assigned to this endpoint, 0 while disconnected
    pub fn my_id(&self) -> u8 {
        self.shared.my_id.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected_server().is_some()
    }

    /// the fellow clients announced by the server, plus the server itself
    pub fn peers(&self) -> Vec<(u8, RemotePeer)> {
        let mut peers = self.shared.roster.iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect::<Vec<_>>();
        peers.sort_by_key(|(id, _)| *id);
        peers
    }

    pub fn discovered_servers(&self) -> Vec<(SocketAddr, discovery::DiscoveredServer)> {
        self.shared.directory.servers()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.shared.stats.malformed()
    }

    /// start the handshake with a server, typically one from
    ///  [Client::discovered_servers]
    pub fn connect(&self, server: SocketAddr) {
        self.shared.begin_connect(server);
    }

    /// tell the server we are leaving, then drop the session state
    pub fn disconnect(&self) {
        if let Some(server) = self.shared.connected_server() {
            self.shared.enqueue(SendCommand::Stateless {
                to: server,
                frame: Frame::ConnectionClosed { peer_id: self.my_id() },
            });
            self.shared.teardown_session("disconnect requested", false);
        }
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

    pub async fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down client");
        self.disconnect();
        // give the ConnectionClosed frame a chance to leave the queue
        tokio::task::yield_now().await;

        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Client {
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
    shared: Arc<ClientShared>,
    shutdown: Arc<AtomicBool>,
) {
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
                consecutive_errors += 1;
                if consecutive_errors > 3 {
                    shared.events.log(Severity::Error, format!("receive socket failed: {}", e));
                    shared.teardown_session("socket failure", false);
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
}

async fn run_sender(
    shared: Arc<ClientShared>,
    outbound: Arc<OutboundContext>,
    mut send_rx: mpsc::UnboundedReceiver<SendCommand>,
) {
    while let Some(command) = send_rx.recv().await {
        match command {
            SendCommand::Stateless { to, frame } => {
                outbound.send_stateless(to, &frame).await;
            }
            SendCommand::Data { kind, module_id, payload, receiver, completion } => {
                let server_peer = shared.connected_server()
                    .and_then(|_| outbound.sessions.get(SERVER_PEER_ID));

                let ok = match server_peer {
                    Some(peer) => {
                        let my_id = shared.my_id.load(Ordering::SeqCst);
                        let dest_id = receiver.unwrap_or(BROADCAST_PEER_ID);
                        outbound.send_data(&peer, kind, my_id, dest_id, &module_id, &payload).await
                    }
                    None => false,
                };
                completion(ok);
            }
            SendCommand::Relay { .. } | SendCommand::ClientInfo { .. } => {
                debug!("server-role send command at the client - dropping");
            }
        }
    }
}

async fn run_evictions(shared: Arc<ClientShared>, mut evict_rx: mpsc::UnboundedReceiver<Eviction>) {
    while let Some(eviction) = evict_rx.recv().await {
        if eviction.peer_id == SERVER_PEER_ID {
            shared.teardown_session(eviction.reason, true);
        }
    }
}

/// watches the handshake and the server's liveness; beacons refresh the
///  server's last-heard stamp via the discovery listener
async fn run_timeouts(shared: Arc<ClientShared>) {
    let timeout = shared.config.server_connection_timeout;
    let mut check_interval = interval(timeout / 4);

    loop {
        check_interval.tick().await;

        match shared.state() {
            ClientState::Connecting { since, .. } => {
                if since.elapsed() > timeout {
                    shared.teardown_session("server did not answer the handshake", false);
                }
            }
            ClientState::Connected { .. } => {
                if let Some(peer) = shared.sessions.get(SERVER_PEER_ID) {
                    if peer.last_heard_elapsed() > timeout {
                        shared.teardown_session("server stopped responding", true);
                    }
                }
            }
            ClientState::Idle => {}
        }
    }
}

async fn run_discovery_listener(socket: Arc<UdpSocket>, shared: Arc<ClientShared>) {
    let mut receive_buffer = vec![0u8; 2048];
    let mut expiry_interval = interval(shared.config.server_discovery_timeout / 2);

    loop {
        tokio::select! {
            recv_result = socket.recv_from(&mut receive_buffer) => {
                let (num_read, from) = match recv_result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("discovery socket error: {}", e);
                        continue;
                    }
                };

                match Frame::parse(&receive_buffer[..num_read]) {
                    Ok(Frame::ServerInformation { max_clients, client_count, servername }) => {
                        // a beacon from our server also proves it is alive
                        if let Some(server) = shared.connected_server() {
                            if server.ip() == from.ip() {
                                if let Some(peer) = shared.sessions.get(SERVER_PEER_ID) {
                                    peer.touch();
                                }
                            }
                        }

                        if shared.directory.on_beacon(from, servername, max_clients, client_count) {
                            shared.events.push(TransportEvent::ServerListChanged);
                        }
                    }
                    Ok(_) => {
                        trace!("non-beacon frame on the discovery port - ignoring");
                    }
                    Err(e) => {
                        debug!("dropping malformed beacon from {:?}: {}", from, e);
                        shared.stats.record_malformed();
                    }
                }
            }
            _ = expiry_interval.tick() => {
                if shared.directory.expire() {
                    shared.events.push(TransportEvent::ServerListChanged);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DataKind;
    use crate::sequence::SeqNo;
    use std::time::Duration;

    fn shared_with_queue() -> (Arc<ClientShared>, mpsc::UnboundedReceiver<SendCommand>) {
        let mut config = NetConfig::default_lan();
        config.username = "a".to_string();
        config.color = 0x12345678;

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        std::mem::forget(evict_rx);

        let shared = Arc::new(ClientShared {
            config: Arc::new(config),
            events: Arc::new(EventQueue::new()),
            sessions: Arc::new(SessionManager::new(2)),
            directory: Arc::new(ServerDirectory::new(Duration::from_secs(5))),
            roster: DashMap::new(),
            state: Mutex::new(ClientState::Idle),
            my_id: AtomicU8::new(0),
            send_queue: send_tx,
            evictions: evict_tx,
            stats: Arc::new(FrameStats::default()),
        });
        (shared, send_rx)
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 24816))
    }

    fn expect_stateless(send_rx: &mut mpsc::UnboundedReceiver<SendCommand>) -> (SocketAddr, Frame) {
        match send_rx.try_recv().expect("expected a queued command") {
            SendCommand::Stateless { to, frame } => (to, frame),
            _ => panic!("expected a stateless command"),
        }
    }

    fn connect(shared: &Arc<ClientShared>, send_rx: &mut mpsc::UnboundedReceiver<SendCommand>) {
        shared.begin_connect(server_addr());
        assert!(matches!(expect_stateless(send_rx).1, Frame::ConnectionRequest));

        shared.on_frame(server_addr(), Frame::ConnectionChallenge { nonce: 77 });
        match expect_stateless(send_rx).1 {
            Frame::ChallengeAnswer { proof, color, username } => {
                assert_eq!(proof, challenge_proof(77));
                assert_eq!(color, 0x12345678);
                assert_eq!(username, "a");
            }
            other => panic!("expected an answer, got {:?}", other),
        }

        shared.on_frame(server_addr(), Frame::ConnectionAccepted { peer_id: 2 });
        assert_eq!(shared.my_id.load(Ordering::SeqCst), 2);
        assert!(matches!(shared.state(), ClientState::Connected { .. }));
    }

    #[tokio::test]
    async fn test_handshake_happy_path() {
        let (shared, mut send_rx) = shared_with_queue();
        connect(&shared, &mut send_rx);
        assert!(shared.sessions.get(SERVER_PEER_ID).is_some());
    }

    #[tokio::test]
    async fn test_denied_ends_the_attempt() {
        let (shared, mut send_rx) = shared_with_queue();
        shared.begin_connect(server_addr());
        let _ = expect_stateless(&mut send_rx);

        shared.on_frame(server_addr(), Frame::ConnectionDenied);
        assert_eq!(shared.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn test_challenge_from_stranger_is_ignored() {
        let (shared, mut send_rx) = shared_with_queue();
        shared.begin_connect(server_addr());
        let _ = expect_stateless(&mut send_rx);

        shared.on_frame(SocketAddr::from(([10, 9, 9, 9], 1)), Frame::ConnectionChallenge { nonce: 1 });
        assert!(send_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_info_builds_roster() {
        let (shared, mut send_rx) = shared_with_queue();
        connect(&shared, &mut send_rx);

        shared.on_frame(server_addr(), Frame::ClientInfo {
            seq: SeqNo::from_raw(1),
            peer_id: SERVER_PEER_ID,
            color: 1,
            username: "host".to_string(),
        });
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));

        shared.on_frame(server_addr(), Frame::ClientInfo {
            seq: SeqNo::from_raw(2),
            peer_id: 3,
            color: 2,
            username: "b".to_string(),
        });
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));

        assert_eq!(shared.roster.len(), 2);
        assert_eq!(shared.roster.get(&3).unwrap().username, "b");
    }

    #[tokio::test]
    async fn test_data_delivery_and_peer_prune() {
        let (shared, mut send_rx) = shared_with_queue();
        connect(&shared, &mut send_rx);
        shared.on_frame(server_addr(), Frame::ClientInfo {
            seq: SeqNo::from_raw(1),
            peer_id: 3,
            color: 2,
            username: "b".to_string(),
        });
        let _ = expect_stateless(&mut send_rx);

        shared.on_frame(server_addr(), Frame::Data(DataFrame {
            kind: DataKind::ReliableOrdered,
            seq: SeqNo::from_raw(2),
            chunk: None,
            sender_id: 3,
            dest_id: 2,
            module_id: Bytes::from_static(&[0x01]),
            payload: Bytes::from_static(&[0xde, 0xad]),
        }));
        assert!(matches!(expect_stateless(&mut send_rx).1, Frame::Ack { .. }));

        shared.on_frame(server_addr(), Frame::ClientDisconnected { peer_id: 3 });
        assert_eq!(shared.roster.len(), 0);
    }

    #[tokio::test]
    async fn test_connection_closed_tears_down() {
        let (shared, mut send_rx) = shared_with_queue();
        connect(&shared, &mut send_rx);

        shared.on_frame(server_addr(), Frame::ConnectionClosed { peer_id: SERVER_PEER_ID });
        assert_eq!(shared.state(), ClientState::Idle);
        assert!(shared.sessions.get(SERVER_PEER_ID).is_none());
        assert_eq!(shared.my_id.load(Ordering::SeqCst), 0);
    }
}
