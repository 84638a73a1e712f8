use std::time::Duration;
use anyhow::bail;

/// upper bound for usernames and server names, in bytes
pub const MAX_NAME_LEN: usize = 100;

/// Configuration shared by both endpoint roles. The server additionally uses
///  `servername`, `max_clients` and `server_heartbeat_delay`; the client uses
///  `server_discovery_timeout` and `reconnect_after_recompile`.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// display name announced during the handshake, ASCII, at most
    ///  [MAX_NAME_LEN] bytes
    pub username: String,
    /// display color announced during the handshake (RGBA, one byte each)
    pub color: u32,
    /// client only: re-establish the previous session automatically after the
    ///  host application was restarted underneath us
    pub reconnect_after_recompile: bool,

    /// UDP data port
    pub port: u16,
    /// UDP port for ServerInformation beacons - must differ from `port`
    pub discovery_port: u16,

    /// a peer that stayed silent for this long is considered gone
    pub server_connection_timeout: Duration,
    /// interval between ServerInformation beacons (server role)
    pub server_heartbeat_delay: Duration,
    /// a discovered server is dropped from the directory when no beacon
    ///  arrived for this long (client role)
    pub server_discovery_timeout: Duration,

    /// how often an unacknowledged reliable frame is re-sent before the peer
    ///  is evicted as unreachable
    pub max_resend_reliable_packets: u32,
    /// assumed round-trip time; the retransmit delay is derived from this
    pub rtt: Duration,

    /// Single-frame ceiling in bytes, headers included. Reliable payloads
    ///  above this are chunked; unreliable payloads above this are rejected.
    ///
    /// The protocol makes no attempt to discover the path MTU - choosing this
    ///  value too big silently drops frames on constrained segments, choosing
    ///  it too small wastes bandwidth on per-slice headers.
    pub mtu: usize,

    /// server only: total endpoint cap, the server's own identity included -
    ///  a cap of 4 admits 3 clients, with peer ids 2 through `max_clients`
    pub max_clients: u8,
    /// server only: name announced in discovery beacons, same constraints as
    ///  `username`
    pub servername: String,

    /// accept a bind address on an interface without a default route (VPN
    ///  adapters, containers)
    pub allow_virtual_ips: bool,
    /// hex-dump every raw frame at trace level
    pub debug: bool,
}

impl NetConfig {
    pub fn default_lan() -> NetConfig {
        NetConfig {
            username: "player".to_string(),
            color: 0xff_ff_ff_ff,
            reconnect_after_recompile: false,
            port: 24816,
            discovery_port: 24817,
            server_connection_timeout: Duration::from_secs(10),
            server_heartbeat_delay: Duration::from_secs(1),
            server_discovery_timeout: Duration::from_secs(5),
            max_resend_reliable_packets: 10,
            rtt: Duration::from_millis(200),
            mtu: 1024,
            max_clients: 16,
            servername: "server".to_string(),
            allow_virtual_ips: false,
            debug: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        Self::validate_name("username", &self.username)?;
        Self::validate_name("servername", &self.servername)?;

        if self.port == self.discovery_port {
            bail!("data port and discovery port must differ");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if self.max_resend_reliable_packets == 0 {
            bail!("max_resend_reliable_packets must be at least 1");
        }
        // enough room for the data frame headers plus one payload byte
        if self.mtu < 64 {
            bail!("mtu of {} is too small to carry a data frame", self.mtu);
        }
        // a single frame must fit into one UDP datagram
        if self.mtu > 65507 {
            bail!("mtu of {} exceeds the maximum UDP payload", self.mtu);
        }
        if self.rtt.is_zero() {
            bail!("rtt must be positive");
        }
        Ok(())
    }

    fn validate_name(what: &str, name: &str) -> anyhow::Result<()> {
        if name.len() > MAX_NAME_LEN {
            bail!("{} exceeds {} bytes", what, MAX_NAME_LEN);
        }
        if !name.is_ascii() {
            bail!("{} must be pure ASCII", what);
        }
        Ok(())
    }

    /// delay before an unacknowledged reliable frame is re-sent: 1.25 x RTT
    pub fn retransmit_delay(&self) -> Duration {
        self.rtt + self.rtt / 4
    }
}
