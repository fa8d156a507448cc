use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;
use async_trait::async_trait;
use enr::NodeId;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;

/// The discovery substrate's TALK request/response primitive, as seen from this crate.
///
/// The substrate authenticates and encrypts these exchanges itself; this crate only
///  relies on requests being attributable to a node id and a UDP return address. A
///  production binding adapts a discv5 implementation running on the shared socket's
///  default outlet; [`TalkHub`] is the in-memory binding used by tests and local
///  tooling.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TalkService: Send + Sync + 'static {
    /// Sends a request to `node` at `addr` for the given protocol and returns the
    ///  response payload.
    async fn talk_request(
        &self,
        node: NodeId,
        addr: SocketAddr,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>>;

    /// Registers the handler answering requests for `protocol`. A later registration for
    ///  the same protocol replaces the earlier one.
    fn register_handler(&self, protocol: &str, handler: Arc<dyn TalkHandler>);
}

/// Answers TALK requests for one protocol.
#[async_trait]
pub trait TalkHandler: Send + Sync + 'static {
    async fn handle_talk(&self, from: NodeId, from_addr: SocketAddr, payload: &[u8]) -> Vec<u8>;
}

/// An in-memory TALK router connecting any number of nodes inside one process. Each
///  participant joins with its node id and UDP address and gets a [`TalkService`] whose
///  requests are answered directly by the target node's registered handlers.
#[derive(Default)]
pub struct TalkHub {
    nodes: Mutex<FxHashMap<NodeId, Arc<HubNode>>>,
}

impl TalkHub {
    pub fn new() -> Arc<TalkHub> {
        Arc::new(TalkHub::default())
    }

    pub fn join(self: &Arc<Self>, node_id: NodeId, addr: SocketAddr) -> Arc<HubNode> {
        let node = Arc::new(HubNode {
            hub: Arc::downgrade(self),
            node_id,
            addr,
            handlers: Mutex::new(FxHashMap::default()),
        });
        self.nodes.lock().unwrap().insert(node_id, node.clone());
        node
    }

    fn lookup(&self, node_id: &NodeId) -> Option<Arc<HubNode>> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }
}

/// One participant of a [`TalkHub`].
pub struct HubNode {
    hub: Weak<TalkHub>,
    node_id: NodeId,
    addr: SocketAddr,
    handlers: Mutex<FxHashMap<String, Arc<dyn TalkHandler>>>,
}

#[async_trait]
impl TalkService for HubNode {
    async fn talk_request(
        &self,
        node: NodeId,
        _addr: SocketAddr,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>> {
        let hub = match self.hub.upgrade() {
            Some(hub) => hub,
            None => bail!("talk hub is gone"),
        };
        let target = match hub.lookup(&node) {
            Some(target) => target,
            None => bail!("unknown node {}", node),
        };
        let handler = target.handlers.lock().unwrap().get(protocol).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => bail!("node {} does not answer protocol {:?}", node, protocol),
        };
        Ok(handler.handle_talk(self.node_id, self.addr, &payload).await)
    }

    fn register_handler(&self, protocol: &str, handler: Arc<dyn TalkHandler>) {
        if self
            .handlers
            .lock()
            .unwrap()
            .insert(protocol.to_string(), handler)
            .is_some()
        {
            debug!("replacing talk handler for {:?}", protocol);
        }
    }
}
