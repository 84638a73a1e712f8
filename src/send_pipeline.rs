use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::frame::Frame;

/// The last hop before the wire. Every outgoing frame - first sends,
///  retransmissions, beacons - funnels through this trait, which lets the
///  tests replace the UDP socket with a recording mock and assert on the
///  finished bytes of each datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// hand one finished frame to the OS, reporting the write result so the
    ///  pipeline decides how loudly to complain
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<usize>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<usize> {
        self.send_to(datagram, to).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("a bound UDP socket has a local address")
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    trace_frames: bool,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, trace_frames: bool) -> SendPipeline {
        SendPipeline { socket, trace_frames }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Patch the checksum into a fully serialized frame and send it. The
    ///  finalized buffer can be retained for checksum-correct re-sends via
    ///  [SendPipeline::do_send_packet].
    pub async fn finalize_and_send_packet(&self, to: SocketAddr, packet_buf: &mut [u8]) {
        Frame::finalize_checksum(packet_buf);
        self.do_send_packet(to, packet_buf).await;
    }

    /// Write a finalized frame to the socket. A failed write is logged and
    ///  otherwise treated like a lost datagram - reliable traffic recovers
    ///  through retransmission, everything else is fire-and-forget anyway.
    pub async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        if self.trace_frames {
            trace!("-> {:?}: {:02x?}", to, packet_buf);
        }
        if let Err(e) = self.socket.send_datagram(to, packet_buf).await {
            error!("sending {} bytes to {:?} failed: {}", packet_buf.len(), to, e);
        }
    }

    /// serialize, finalize and send a frame in one go - for stateless frames
    ///  that are not buffered for retransmission
    pub async fn send_frame(&self, to: SocketAddr, frame: &Frame) {
        let mut buf = bytes::BytesMut::new();
        frame.ser(&mut buf);
        self.finalize_and_send_packet(to, &mut buf).await;
    }
}
