use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use enr::{CombinedKey, Enr, NodeId};
use tracing::info;

use crate::config::{SessionConfig, SharedSocketConfig, UtpConfig};
use crate::session::Session;
use crate::session_store::SessionStore;
use crate::shared_socket::{OutletSocket, SharedUdpSocket};
use crate::talk::{TalkHub, TalkService};
use crate::utp::PacketSink;

/// What a [`TalkFactory`] gets to work with: the default outlet of the shared socket
///  (where the discovery substrate reads its packets) and the local identity.
pub struct TalkWiring {
    pub outlet: Arc<OutletSocket>,
    pub local_enr: Enr<CombinedKey>,
    pub node_id: NodeId,
    pub local_addr: SocketAddr,
}

/// Builds the TALK binding for a host. Production bindings wrap a discv5 stack running
///  on the outlet; tests wire hosts together through a [`TalkHub`].
pub type TalkFactory = Box<dyn FnOnce(TalkWiring) -> anyhow::Result<Arc<dyn TalkService>> + Send>;

pub struct HostConfig {
    pub bind_addr: SocketAddr,
    /// The node's long-lived identity key; generated if absent.
    pub key: Option<CombinedKey>,
    pub socket: SharedSocketConfig,
    pub session: SessionConfig,
    pub utp: UtpConfig,
    pub talk: TalkFactory,
}

impl HostConfig {
    pub fn new(talk: TalkFactory) -> HostConfig {
        HostConfig {
            bind_addr: "0.0.0.0:0".parse().expect("valid literal"),
            key: None,
            socket: SharedSocketConfig::default(),
            session: SessionConfig::default(),
            utp: UtpConfig::default(),
            talk,
        }
    }

    /// A loopback host wired to the given in-memory TALK hub.
    pub fn for_testing(hub: &Arc<TalkHub>) -> HostConfig {
        let hub = hub.clone();
        let mut config = HostConfig::new(Box::new(move |wiring: TalkWiring| {
            let node: Arc<dyn TalkService> = hub.join(wiring.node_id, wiring.local_addr);
            Ok(node)
        }));
        config.bind_addr = "127.0.0.1:0".parse().expect("valid literal");
        config
    }
}

/// Ties the shared socket, the node identity, the discovery binding and the session
///  store together. Everything else in the crate reaches these through a `Host`.
pub struct Host {
    socket: Arc<SharedUdpSocket>,
    session_store: Arc<SessionStore>,
    talk: Arc<dyn TalkService>,
    local_enr: Enr<CombinedKey>,
    key: CombinedKey,
    utp: UtpConfig,
}

impl Host {
    pub async fn listen(config: HostConfig) -> anyhow::Result<Arc<Host>> {
        let socket = SharedUdpSocket::bind(config.bind_addr, config.socket).await?;
        let local_addr = socket.local_addr();

        let key = config.key.unwrap_or_else(CombinedKey::generate_secp256k1);
        let local_enr = build_enr(&key, local_addr)?;
        let node_id = local_enr.node_id();

        // The discovery substrate reads from the default outlet, which the receive pump
        //  consults only after the registered handlers - so it is wired up first and the
        //  session store handler second, keeping discovery control traffic visible.
        let outlet = socket.default_outlet();
        let talk = (config.talk)(TalkWiring {
            outlet,
            local_enr: local_enr.clone(),
            node_id,
            local_addr,
        })?;

        let session_store = SessionStore::new(config.session);
        socket.add_handler(session_store.clone());

        info!("host listening on {:?} as {}", local_addr, node_id);
        Ok(Arc::new(Host {
            socket,
            session_store,
            talk,
            local_enr,
            key,
            utp: config.utp,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn local_enr(&self) -> &Enr<CombinedKey> {
        &self.local_enr
    }

    pub fn node_id(&self) -> NodeId {
        self.local_enr.node_id()
    }

    pub fn key(&self) -> &CombinedKey {
        &self.key
    }

    pub fn socket(&self) -> &Arc<SharedUdpSocket> {
        &self.socket
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.session_store
    }

    pub fn talk(&self) -> &Arc<dyn TalkService> {
        &self.talk
    }

    pub fn utp_config(&self) -> UtpConfig {
        self.utp.clone()
    }

    pub fn close(&self) {
        self.socket.close();
    }
}

fn build_enr(key: &CombinedKey, addr: SocketAddr) -> anyhow::Result<Enr<CombinedKey>> {
    let mut builder = Enr::builder();
    match addr {
        SocketAddr::V4(v4) => {
            builder.ip4(*v4.ip()).udp4(v4.port());
        }
        SocketAddr::V6(v6) => {
            builder.ip6(*v6.ip()).udp6(v6.port());
        }
    }
    builder
        .build(key)
        .map_err(|e| anyhow!("can't build local node record: {:?}", e))
}

/// Adapts a session to the stream transport's packet-out seam: stream packets are
///  encrypted by the session and leave through the shared socket.
pub struct SessionPacketSink {
    session: Arc<Session>,
    socket: Arc<SharedUdpSocket>,
}

impl SessionPacketSink {
    pub fn new(session: Arc<Session>, socket: Arc<SharedUdpSocket>) -> SessionPacketSink {
        SessionPacketSink { session, socket }
    }
}

#[async_trait]
impl PacketSink for SessionPacketSink {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        let encoded = self.session.encode(packet)?;
        self.socket.send_to(&encoded, to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_builds_identity() {
        let hub = TalkHub::new();
        let host = Host::listen(HostConfig::for_testing(&hub)).await.unwrap();

        let enr = host.local_enr();
        assert_eq!(enr.udp4(), Some(host.local_addr().port()));
        assert_eq!(enr.ip4(), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(enr.node_id(), host.node_id());
        host.close();
    }

    #[tokio::test]
    async fn test_session_packets_claimed_over_loopback() {
        let hub = TalkHub::new();
        let host1 = Host::listen(HostConfig::for_testing(&hub)).await.unwrap();
        let host2 = Host::listen(HostConfig::for_testing(&hub)).await.unwrap();

        // establish a session pair between the two hosts by hand
        let initiator = host1.session_store().initiator("proto").unwrap();
        let recipient = host2
            .session_store()
            .recipient(
                "proto",
                host1.local_addr().ip().to_canonical(),
                initiator.secret(),
            )
            .unwrap();
        let session1 =
            initiator.establish(host2.local_addr().ip().to_canonical(), recipient.secret());
        let session2 = recipient.establish();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        struct Forwarder(tokio::sync::mpsc::UnboundedSender<Vec<u8>>);
        #[async_trait]
        impl crate::session::SessionConsumer for Forwarder {
            async fn on_payload(&self, payload: Vec<u8>, _from: SocketAddr) {
                self.0.send(payload).unwrap();
            }
        }
        session2.activate(Arc::new(Forwarder(tx))).await;

        let packet = session1.encode(b"across the wire").unwrap();
        host1
            .socket()
            .send_to(&packet, host2.local_addr())
            .await
            .unwrap();

        let payload = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"across the wire");

        host1.close();
        host2.close();
    }
}
