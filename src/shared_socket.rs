use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::atomic_cell::AtomicCell;
use crate::config::SharedSocketConfig;

/// A packet handler registered with a [`SharedUdpSocket`]. `try_accept` returns `true` if
///  the handler claims the packet; a claimed packet is not offered to handlers further
///  down the list or to the default outlet.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn try_accept(&self, packet: &[u8], from: SocketAddr) -> bool;
}

#[derive(Clone, Default)]
struct HandlerList {
    handlers: Vec<Arc<dyn PacketHandler>>,
    outlet: Option<Arc<OutletSocket>>,
}

/// A UDP socket that several protocols share. Incoming datagrams are offered to the
///  registered handlers in registration order; the first handler to claim a packet
///  consumes it. Unclaimed packets go to the default outlet if one exists, and are
///  dropped otherwise.
///
/// The handler list is copy-on-write: registration takes a mutex, but the receive pump
///  reads the list with a single atomic load per datagram, so handlers can come and go
///  without stalling reception.
pub struct SharedUdpSocket {
    socket: Arc<UdpSocket>,
    config: Arc<SharedSocketConfig>,
    /// protects writes to the handler list
    registration: Mutex<()>,
    handlers: AtomicCell<HandlerList>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SharedUdpSocket {
    /// Binds a UDP socket and starts the receive pump.
    pub async fn bind(
        bind_addr: SocketAddr,
        config: SharedSocketConfig,
    ) -> anyhow::Result<Arc<SharedUdpSocket>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound shared socket to {:?}", socket.local_addr()?);

        let shared = Arc::new(SharedUdpSocket {
            socket,
            config: Arc::new(config),
            registration: Mutex::new(()),
            handlers: AtomicCell::new(HandlerList::default()),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(shared.clone().recv_loop());
        *shared.pump.lock().unwrap() = Some(pump);
        Ok(shared)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// Sends a datagram directly on the underlying socket.
    pub async fn send_to(&self, packet: &[u8], to: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.send_to(packet, to).await
    }

    /// Registers a handler for incoming packets. Handlers are consulted in the order they
    ///  were added.
    pub fn add_handler(&self, handler: Arc<dyn PacketHandler>) {
        let _reg = self.registration.lock().unwrap();
        self.handlers.update(|l| l.handlers.push(handler.clone()));
    }

    /// Removes a previously registered handler. Identity is by pointer, so the same `Arc`
    ///  that was added must be passed.
    pub fn remove_handler(&self, handler: &Arc<dyn PacketHandler>) {
        let _reg = self.registration.lock().unwrap();
        self.handlers.update(|l| {
            l.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        });
    }

    /// Creates or retrieves the default outlet, a pseudo-socket receiving every packet no
    ///  handler claims. Only one default outlet exists at a time: repeated calls return
    ///  the same object until it is closed, after which a fresh one is created.
    pub fn default_outlet(self: &Arc<Self>) -> Arc<OutletSocket> {
        let _reg = self.registration.lock().unwrap();

        if let Some(outlet) = &self.handlers.load().outlet {
            if !outlet.is_closed() {
                return outlet.clone();
            }
        }

        let outlet = Arc::new(OutletSocket::new(
            Arc::downgrade(self),
            self.config.outlet_queue_len,
        ));
        self.handlers.update(|l| l.outlet = Some(outlet.clone()));
        outlet
    }

    fn unset_default_outlet(&self, who: &OutletSocket) {
        let _reg = self.registration.lock().unwrap();
        let current = self.handlers.load();
        if let Some(outlet) = &current.outlet {
            if std::ptr::eq(Arc::as_ptr(outlet), who) {
                self.handlers.update(|l| l.outlet = None);
            }
        }
    }

    /// Stops the receive pump and closes the default outlet. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(outlet) = &self.handlers.load().outlet {
            outlet.close();
        }
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.recv_buf_len];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    // Nothing can be done about errors here; sleep a little to avoid a
                    //  busy loop on a persistent error condition.
                    error!("socket read error: {}", e);
                    tokio::time::sleep(self.config.read_error_backoff).await;
                    continue;
                }
            };
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.dispatch(&buf[..num_read], from).instrument(span).await;
        }
    }

    async fn dispatch(&self, packet: &[u8], from: SocketAddr) {
        trace!("received {} byte packet from {:?}", packet.len(), from);

        let list = self.handlers.load();
        for handler in &list.handlers {
            if handler.try_accept(packet, from).await {
                return;
            }
        }
        if let Some(outlet) = &list.outlet {
            outlet.deliver(packet.to_vec(), from).await;
        } else {
            trace!("no handler claimed packet from {:?} and no default outlet - dropping", from);
        }
    }
}

/// The pseudo-socket receiving packets no handler claimed, typically handed to the
///  discovery substrate. Reads are served from a bounded queue; writes delegate to the
///  parent socket. Closing the outlet unregisters it from the parent.
pub struct OutletSocket {
    parent: Weak<SharedUdpSocket>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl OutletSocket {
    fn new(parent: Weak<SharedUdpSocket>, queue_len: usize) -> OutletSocket {
        let (tx, rx) = mpsc::channel(queue_len);
        OutletSocket {
            parent,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.parent.upgrade().map(|p| p.local_addr())
    }

    /// Receives the next unclaimed packet. Returns an error when the outlet is closed.
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        if self.is_closed() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            packet = rx.recv() => {
                packet.ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
            }
            _ = self.closed_notify.notified() => {
                Err(io::ErrorKind::UnexpectedEof.into())
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `deadline` has elapsed.
    pub async fn recv_timeout(
        &self,
        deadline: std::time::Duration,
    ) -> io::Result<(Vec<u8>, SocketAddr)> {
        match tokio::time::timeout(deadline, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Sends a datagram through the parent socket.
    pub async fn send_to(&self, packet: &[u8], to: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.parent.upgrade() {
            Some(parent) => parent.send_to(packet, to).await,
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Closes the outlet and unregisters it from the parent socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_notify.notify_waiters();
        if let Some(parent) = self.parent.upgrade() {
            parent.unset_default_outlet(self);
        }
    }

    async fn deliver(&self, packet: Vec<u8>, from: SocketAddr) {
        if self.is_closed() {
            return;
        }
        // NB: a full queue back-pressures the receive pump rather than dropping, so a slow
        //  outlet consumer throttles the whole socket. The closed notification breaks the
        //  wait so close() cannot leave the pump stuck.
        tokio::select! {
            result = self.tx.send((packet, from)) => {
                if result.is_err() {
                    debug!("default outlet gone - dropping packet");
                }
            }
            _ = self.closed_notify.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bind_test_socket() -> Arc<SharedUdpSocket> {
        SharedUdpSocket::bind(
            "127.0.0.1:0".parse().unwrap(),
            SharedSocketConfig::default(),
        )
        .await
        .unwrap()
    }

    /// A handler claiming exactly the packets whose payload matches a fixed tag, and
    ///  recording everything it was offered.
    struct TagHandler {
        tag: &'static [u8],
        offered: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl PacketHandler for TagHandler {
        async fn try_accept(&self, packet: &[u8], _from: SocketAddr) -> bool {
            let _ = self.offered.send(packet.to_vec());
            packet == self.tag
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_handler() {
        let shared = bind_test_socket().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        shared.add_handler(Arc::new(TagHandler {
            tag: b"h1",
            offered: tx,
        }));

        sender.send_to(b"h1", shared.local_addr()).await.unwrap();

        let offered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offered, b"h1");
        shared.close();
    }

    #[tokio::test]
    async fn test_handler_order_and_claim() {
        let shared = bind_test_socket().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        let (tx3, mut rx3) = tokio::sync::mpsc::unbounded_channel();
        shared.add_handler(Arc::new(TagHandler { tag: b"h1", offered: tx1 }));
        shared.add_handler(Arc::new(TagHandler { tag: b"h2", offered: tx2 }));
        shared.add_handler(Arc::new(TagHandler { tag: b"h3", offered: tx3 }));

        // claimed by h2: h1 sees it first, h3 must never see it
        sender.send_to(b"h2", shared.local_addr()).await.unwrap();

        let offered1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offered1, b"h2");
        let offered2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offered2, b"h2");
        assert!(rx3.try_recv().is_err());
        shared.close();
    }

    #[tokio::test]
    async fn test_default_outlet_receives_unclaimed() {
        let shared = bind_test_socket().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        shared.add_handler(Arc::new(TagHandler { tag: b"h1", offered: tx }));
        let outlet = shared.default_outlet();

        sender.send_to(b"other", shared.local_addr()).await.unwrap();

        let (packet, from) = outlet.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet, b"other");
        assert_eq!(from, sender.local_addr().unwrap());
        shared.close();
    }

    #[tokio::test]
    async fn test_default_outlet_close_creates_fresh() {
        let shared = bind_test_socket().await;

        let outlet1 = shared.default_outlet();
        let outlet1_again = shared.default_outlet();
        assert!(Arc::ptr_eq(&outlet1, &outlet1_again));

        outlet1.close();
        outlet1.close(); // idempotent

        let outlet2 = shared.default_outlet();
        assert!(!Arc::ptr_eq(&outlet1, &outlet2));
        shared.close();
    }

    #[tokio::test]
    async fn test_outlet_recv_timeout() {
        let shared = bind_test_socket().await;
        let outlet = shared.default_outlet();

        let err = outlet
            .recv_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        shared.close();
    }

    #[tokio::test]
    async fn test_close_closes_outlet() {
        let shared = bind_test_socket().await;
        let outlet = shared.default_outlet();

        shared.close();
        shared.close(); // idempotent

        assert!(outlet.is_closed());
        let err = outlet.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let shared = bind_test_socket().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: Arc<dyn PacketHandler> = Arc::new(TagHandler { tag: b"h1", offered: tx });
        shared.add_handler(handler.clone());
        shared.remove_handler(&handler);

        let outlet = shared.default_outlet();
        sender.send_to(b"h1", shared.local_addr()).await.unwrap();

        // the removed handler is not consulted, so the packet falls through
        let (packet, _) = outlet.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet, b"h1");
        assert!(rx.try_recv().is_err());
        shared.close();
    }
}
