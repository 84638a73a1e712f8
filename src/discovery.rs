use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use dashmap::DashMap;
use tokio::time::interval;
use tracing::{debug, info};

use crate::config::NetConfig;
use crate::frame::Frame;
use crate::send_pipeline::SendPipeline;
use crate::session::SessionManager;

/// Bind a UDP socket with SO_REUSEADDR so several endpoints on one host can
///  share the discovery port. The option must be set before bind, which the
///  std socket API cannot do, hence the raw socket on unix.
#[cfg(unix)]
pub fn bind_reusable(port: u16) -> anyhow::Result<std::net::UdpSocket> {
    use std::os::unix::io::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("creating discovery socket");
        }

        let reuse: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("setting SO_REUSEADDR");
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;

        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context(format!("binding discovery socket to port {}", port));
        }

        Ok(std::net::UdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
pub fn bind_reusable(port: u16) -> anyhow::Result<std::net::UdpSocket> {
    Ok(std::net::UdpSocket::bind(("0.0.0.0", port))?)
}

/// the socket the server sends its beacons from
pub fn bind_beacon_socket(port: u16) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = bind_reusable(port)?;
    socket.set_broadcast(true).context("enabling broadcast")?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::UdpSocket::from_std(socket)?)
}

/// the socket a client listens for beacons on
pub fn bind_discovery_socket(port: u16) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = bind_reusable(port)?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::UdpSocket::from_std(socket)?)
}

/// Server side: announce this endpoint to the subnet at the configured
///  interval. The advertised count includes the server's own identity.
pub async fn run_beacon_loop(
    pipeline: Arc<SendPipeline>,
    target: SocketAddr,
    config: Arc<NetConfig>,
    sessions: Arc<SessionManager>,
) {
    info!("announcing {:?} to {:?} every {:?}", config.servername, target, config.server_heartbeat_delay);

    let mut beacon_interval = interval(config.server_heartbeat_delay);
    loop {
        beacon_interval.tick().await;

        let frame = Frame::ServerInformation {
            max_clients: config.max_clients,
            client_count: sessions.len() as u8 + 1,
            servername: config.servername.clone(),
        };
        pipeline.send_frame(target, &frame).await;
    }
}

/// a server known from its beacons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub servername: String,
    pub max_clients: u8,
    pub client_count: u8,
    pub last_seen: Instant,
}

/// Client side: the rolling set of servers seen on the discovery port,
///  keyed by beacon source address. Entries decay when beacons stop.
pub struct ServerDirectory {
    entries: DashMap<SocketAddr, DiscoveredServer>,
    timeout: Duration,
}

impl ServerDirectory {
    pub fn new(timeout: Duration) -> ServerDirectory {
        ServerDirectory {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// returns true iff the visible server list changed (a new server, or
    ///  one announcing different data)
    pub fn on_beacon(&self, from: SocketAddr, servername: String, max_clients: u8, client_count: u8) -> bool {
        let entry = DiscoveredServer {
            servername,
            max_clients,
            client_count,
            last_seen: Instant::now(),
        };

        match self.entries.insert(from, entry.clone()) {
            None => {
                debug!("discovered server {:?} at {:?}", entry.servername, from);
                true
            }
            Some(prev) => {
                prev.servername != entry.servername
                    || prev.max_clients != entry.max_clients
                    || prev.client_count != entry.client_count
            }
        }
    }

    /// drop servers whose beacons stopped; returns true iff any were dropped
    pub fn expire(&self) -> bool {
        let before = self.entries.len();
        self.entries.retain(|addr, server| {
            let keep = server.last_seen.elapsed() < self.timeout;
            if !keep {
                debug!("server at {:?} stopped sending beacons - dropping", addr);
            }
            keep
        });
        self.entries.len() != before
    }

    pub fn servers(&self) -> Vec<(SocketAddr, DiscoveredServer)> {
        self.entries.iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
