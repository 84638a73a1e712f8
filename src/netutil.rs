use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Context};
use tracing::info;

/// Determine the address this host uses for LAN traffic, and with it whether
///  the host is usable for a session at all.
///
/// The probe connects a throw-away UDP socket towards a routable address -
///  nothing is transmitted, the OS merely selects the egress interface. That
///  selection fails on hosts without a default route, which is exactly the
///  situation `allow_virtual_ips` exists for: with the flag set, such hosts
///  are accepted and the loopback-echo guard is disabled (we cannot know the
///  egress address, so we return the unspecified address which never matches
///  an inbound source).
pub fn resolve_local_ip(allow_virtual_ips: bool) -> anyhow::Result<IpAddr> {
    match probe_default_route() {
        Ok(ip) => {
            info!("local address is {:?}", ip);
            Ok(ip)
        }
        Err(e) if allow_virtual_ips => {
            info!("no default route ({}) - accepting because allow_virtual_ips is set", e);
            Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }
        Err(e) => Err(e).context(
            "no usable local address - the host needs a default route, or set allow_virtual_ips",
        ),
    }
}

/// The loopback-echo guard: broadcast frames come back to their sender, and
///  an endpoint never talks to itself. With the unspecified fallback address
///  (no default route) the guard matches nothing and is effectively off.
pub fn is_local_echo(source: &std::net::SocketAddr, local_ip: &IpAddr) -> bool {
    source.ip() == *local_ip
}

fn probe_default_route() -> anyhow::Result<IpAddr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("binding probe socket")?;

    // TEST-NET-3, guaranteed not to be local; connect() only selects a route
    probe.connect(("203.0.113.1", 9))
        .context("no route towards the LAN")?;

    let ip = probe.local_addr()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        bail!("egress address {:?} is not a LAN address", ip);
    }
    Ok(ip)
}
