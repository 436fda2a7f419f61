//! UDP multicast transport.
//!
//! Every node on the link joins one IPv4 multicast group. A publication is a
//! single datagram framed as `[u16 BE topic length][topic][payload]`; the
//! receive loop unframes each datagram and hands it to every local
//! subscriber whose key expression matches the topic. Multicast loopback is
//! left on so co-located processes hear each other; a node recognises its
//! own echoes by topic.
//!
//! Publishing only queues the frame. A `SendWorker` drains the queue and
//! awaits the socket, so a full socket buffer delays replies instead of
//! losing them. Only a full queue refuses a publication.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use cnode_core::config::TransportConfig;
use cnode_core::wire::MAX_COMMAND_LEN;
use cnode_services::transport::{
    valid_topic, MessageCallback, SubscriberSet, SubscriptionId, Transport, TransportError,
};

/// Longest topic accepted in a frame.
pub const MAX_TOPIC_LEN: usize = 256;

/// Largest datagram we send or accept.
pub const MAX_FRAME_LEN: usize = 2 + MAX_TOPIC_LEN + MAX_COMMAND_LEN;

/// Frames waiting for the socket.
pub const SEND_QUEUE_LEN: usize = 256;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    outbound: mpsc::Sender<Bytes>,
    subscribers: SubscriberSet,
}

impl UdpTransport {
    /// Bind the group port and join the multicast group named in `config`.
    /// The returned worker must be run for publications to leave the node.
    pub fn bind(config: &TransportConfig) -> Result<(Self, SendWorker)> {
        let group: SocketAddrV4 = config
            .multicast_addr
            .parse()
            .with_context(|| format!("invalid multicast address {}", config.multicast_addr))?;
        if !group.ip().is_multicast() {
            anyhow::bail!("{} is not a multicast address", group.ip());
        }
        let interface = if config.interface.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            config
                .interface
                .parse()
                .with_context(|| format!("invalid interface address {}", config.interface))?
        };

        let socket = make_multicast_socket(group, interface)
            .context("failed to create multicast socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

        tracing::info!(group = %group, interface = %interface, "udp transport bound");
        Ok(Self::from_socket(socket, group))
    }

    fn from_socket(socket: UdpSocket, group: SocketAddrV4) -> (Self, SendWorker) {
        let socket = Arc::new(socket);
        let (outbound, frame_rx) = mpsc::channel(SEND_QUEUE_LEN);
        let worker = SendWorker {
            socket: socket.clone(),
            group,
            frame_rx,
        };
        let transport = Self {
            socket,
            outbound,
            subscribers: SubscriberSet::new(),
        };
        (transport, worker)
    }

    /// Receive datagrams until shutdown, delivering them to subscribers.
    pub async fn recv_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_FRAME_LEN + 1];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("udp receive loop shutting down");
                    return Ok(());
                }

                r = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match r {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], from);
                }
            }
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() > MAX_FRAME_LEN {
            tracing::warn!(from = %from, len = datagram.len(), "oversized datagram, dropping");
            return;
        }
        match decode_frame(datagram) {
            Some((topic, payload)) => {
                let delivered = self.subscribers.deliver(topic, payload);
                tracing::trace!(from = %from, topic, len = payload.len(), delivered, "datagram received");
            }
            None => tracing::debug!(from = %from, len = datagram.len(), "unframeable datagram, dropping"),
        }
    }
}

impl Transport for UdpTransport {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !valid_topic(topic) {
            return Err(TransportError::InvalidKey(topic.to_string()));
        }
        let frame = encode_frame(topic, &payload)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(SEND_QUEUE_LEN),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;
        tracing::trace!(topic, len = payload.len(), "datagram queued");
        Ok(())
    }

    fn subscribe(
        &self,
        key_expr: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId, TransportError> {
        self.subscribers.insert(key_expr, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}

// ── Send worker ───────────────────────────────────────────────────────────────

/// Sends queued frames to the group in publication order.
pub struct SendWorker {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    frame_rx: mpsc::Receiver<Bytes>,
}

impl SendWorker {
    /// Runs until every `UdpTransport` handle is gone and the queue is empty,
    /// so replies published during shutdown still go out.
    pub async fn run(mut self) -> Result<()> {
        while let Some(frame) = self.frame_rx.recv().await {
            match self.socket.send_to(&frame, SocketAddr::V4(self.group)).await {
                Ok(sent) => tracing::trace!(bytes = sent, "datagram sent"),
                Err(e) => tracing::warn!(error = %e, len = frame.len(), "send_to failed"),
            }
        }
        tracing::info!("send queue closed, send worker exiting");
        Ok(())
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

pub fn encode_frame(topic: &str, payload: &[u8]) -> Result<Bytes, TransportError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TransportError::InvalidKey(topic.to_string()));
    }
    if payload.len() > MAX_COMMAND_LEN {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_COMMAND_LEN,
        });
    }
    let mut frame = BytesMut::with_capacity(2 + topic.len() + payload.len());
    frame.put_u16(topic.len() as u16);
    frame.put_slice(topic.as_bytes());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Split a datagram into `(topic, payload)`. `None` if the header is
/// truncated or the topic is not UTF-8.
pub fn decode_frame(datagram: &[u8]) -> Option<(&str, &[u8])> {
    let header: [u8; 2] = datagram.get(..2)?.try_into().ok()?;
    let topic_len = u16::from_be_bytes(header) as usize;
    if topic_len == 0 || topic_len > MAX_TOPIC_LEN {
        return None;
    }
    let topic = datagram.get(2..2 + topic_len)?;
    let topic = std::str::from_utf8(topic).ok()?;
    Some((topic, &datagram[2 + topic_len..]))
}

// ── Socket setup ──────────────────────────────────────────────────────────────

/// UDP socket bound to the group port and joined to the group.
fn make_multicast_socket(group: SocketAddrV4, interface: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v4(group.ip(), &interface)
        .context("IP_ADD_MEMBERSHIP")?;
    socket.set_multicast_if_v4(&interface).context("IP_MULTICAST_IF")?;
    // Link-local only.
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;

    Ok(socket.into())
}
