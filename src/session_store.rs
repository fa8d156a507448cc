use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::config::SessionConfig;
use crate::session::{generate_secret, Role, Session, PACKET_OVERHEAD};
use crate::shared_socket::PacketHandler;

/// Keeps the active sessions, keyed by `(peer ip, ingress id)`. Sessions expire a fixed
///  interval after their last use; every successful lookup refreshes the deadline.
///  Expired entries are evicted lazily whenever the store is consulted.
pub struct SessionStore {
    config: SessionConfig,
    inner: Mutex<StoreInner>,
}

type SessionKey = (IpAddr, u64);

struct StoreInner {
    sessions: FxHashMap<SessionKey, StoredSession>,
    /// deadlines, lazily pruned: an entry counts only while it matches the deadline
    ///  recorded in the map, otherwise it is a leftover from a refresh
    expiry: BinaryHeap<Reverse<(Instant, IpAddr, u64)>>,
}

struct StoredSession {
    session: Arc<Session>,
    expires_at: Instant,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Arc<SessionStore> {
        Arc::new(SessionStore {
            config,
            inner: Mutex::new(StoreInner {
                sessions: FxHashMap::default(),
                expiry: BinaryHeap::new(),
            }),
        })
    }

    /// Starts key agreement as the initiator. The returned handle's secret must be sent
    ///  to the recipient; once the recipient's secret comes back, `establish` creates the
    ///  session.
    pub fn initiator(self: &Arc<Self>, protocol: &str) -> anyhow::Result<InitiatorHandle> {
        Ok(InitiatorHandle {
            store: self.clone(),
            protocol: protocol.to_string(),
            secret: generate_secret()?,
        })
    }

    /// Runs key agreement as the recipient, from the initiator's secret. The returned
    ///  handle's secret must be sent back to the initiator; `establish` inserts the
    ///  session into the store.
    pub fn recipient(
        self: &Arc<Self>,
        protocol: &str,
        peer_ip: IpAddr,
        initiator_secret: [u8; 16],
    ) -> anyhow::Result<RecipientHandle> {
        let initiator_secret = Zeroizing::new(initiator_secret);
        let secret = generate_secret()?;
        let session = Session::derive(
            peer_ip,
            protocol,
            &initiator_secret,
            &secret,
            Role::Recipient,
            self.config.max_pending_payloads,
        );
        Ok(RecipientHandle {
            store: self.clone(),
            session: Arc::new(session),
            secret,
        })
    }

    /// Looks up a session by peer IP and ingress id, refreshing its expiry.
    pub fn get(&self, peer_ip: IpAddr, ingress_id: u64) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.expire(now);

        let key = (peer_ip, ingress_id);
        let expires_at = now + self.config.session_timeout;
        let stored = inner.sessions.get_mut(&key)?;
        stored.expires_at = expires_at;
        let session = stored.session.clone();
        inner.expiry.push(Reverse((expires_at, peer_ip, ingress_id)));
        Some(session)
    }

    fn insert(&self, session: Arc<Session>) {
        let key = (session.peer_ip(), session.ingress_id());
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.expire(now);

        let expires_at = now + self.config.session_timeout;
        // A key collision is astronomically unlikely with 64-bit HKDF-drawn ids; the last
        //  writer wins and the previous session is evicted.
        if inner
            .sessions
            .insert(key, StoredSession { session, expires_at })
            .is_some()
        {
            debug!("replacing existing session for {:?}", key);
        }
        inner.expiry.push(Reverse((expires_at, key.0, key.1)));
    }
}

impl StoreInner {
    fn expire(&mut self, now: Instant) {
        while let Some(Reverse((deadline, ip, id))) = self.expiry.peek().cloned() {
            if deadline > now {
                break;
            }
            self.expiry.pop();

            let key = (ip, id);
            let stale = match self.sessions.get(&key) {
                // refreshed since this heap entry was pushed
                Some(stored) => stored.expires_at <= now,
                None => false,
            };
            if stale {
                trace!("removing expired session {:?}", key);
                self.sessions.remove(&key);
            }
        }
    }
}

#[async_trait]
impl PacketHandler for SessionStore {
    async fn try_accept(&self, packet: &[u8], from: SocketAddr) -> bool {
        if packet.len() < PACKET_OVERHEAD {
            return false;
        }
        let id = u64::from_be_bytes(packet[..8].try_into().expect("8 byte slice"));
        let peer_ip = from.ip().to_canonical();

        let session = match self.get(peer_ip, id) {
            Some(session) => session,
            None => return false,
        };
        session.handle_packet(packet, from).await;
        true
    }
}

/// The initiator's session establishment state.
pub struct InitiatorHandle {
    store: Arc<SessionStore>,
    protocol: String,
    secret: Zeroizing<[u8; 16]>,
}

impl InitiatorHandle {
    /// The initiator secret to transport to the recipient.
    pub fn secret(&self) -> [u8; 16] {
        *self.secret
    }

    /// Derives the session from the recipient's answer and inserts it into the store in
    ///  the prepared state. The handle's secret is zeroed on drop.
    pub fn establish(self, peer_ip: IpAddr, recipient_secret: [u8; 16]) -> Arc<Session> {
        let recipient_secret = Zeroizing::new(recipient_secret);
        let session = Arc::new(Session::derive(
            peer_ip,
            &self.protocol,
            &self.secret,
            &recipient_secret,
            Role::Initiator,
            self.store.config.max_pending_payloads,
        ));
        self.store.insert(session.clone());
        session
    }
}

/// The recipient's session establishment state.
pub struct RecipientHandle {
    store: Arc<SessionStore>,
    session: Arc<Session>,
    secret: Zeroizing<[u8; 16]>,
}

impl RecipientHandle {
    /// The recipient secret to transport back to the initiator.
    pub fn secret(&self) -> [u8; 16] {
        *self.secret
    }

    /// Inserts the session into the store in the prepared state.
    pub fn establish(self) -> Arc<Session> {
        self.store.insert(self.session.clone());
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSessionConsumer;
    use std::time::Duration;

    fn test_store() -> Arc<SessionStore> {
        SessionStore::new(SessionConfig::default())
    }

    #[tokio::test]
    async fn test_roundtrip_via_handles() {
        let st1 = test_store();
        let st2 = test_store();
        let ip1: IpAddr = "127.0.0.1".parse().unwrap();
        let ip2: IpAddr = "127.0.0.2".parse().unwrap();

        let initiator = st1.initiator("proto").unwrap();
        let recipient = st2
            .recipient("proto", ip1, initiator.secret())
            .unwrap();
        let initiator_session = initiator.establish(ip2, recipient.secret());
        let recipient_session = recipient.establish();

        let packet = initiator_session.encode(b"test message").unwrap();
        assert_eq!(recipient_session.decode(&packet).unwrap(), b"test message");
        let reply = recipient_session.encode(b"reply").unwrap();
        assert_eq!(initiator_session.decode(&reply).unwrap(), b"reply");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_ip_binding() {
        let store = test_store();
        let ip1: IpAddr = "127.0.0.1".parse().unwrap();
        let ip2: IpAddr = "127.0.0.2".parse().unwrap();

        let recipient = store.recipient("proto", ip1, [0u8; 16]).unwrap();
        let session = recipient.establish();
        let id = session.ingress_id();

        // found under the right ip, not under any other
        assert!(store.get(ip1, id).is_some());
        assert!(store.get(ip2, id).is_none());

        // a lookup before the timeout refreshes the deadline
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get(ip1, id).is_some());

        // 10s after the refresh the session is gone
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.get(ip1, id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_without_refresh() {
        let store = test_store();
        let ip1: IpAddr = "127.0.0.1".parse().unwrap();

        let recipient = store.recipient("proto", ip1, [0u8; 16]).unwrap();
        let session = recipient.establish();
        let id = session.ingress_id();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get(ip1, id).is_none());
    }

    #[tokio::test]
    async fn test_handler_claims_known_session() {
        let st1 = test_store();
        let st2 = test_store();
        let ip1: IpAddr = "127.0.0.1".parse().unwrap();
        let ip2: IpAddr = "127.0.0.2".parse().unwrap();

        let initiator = st1.initiator("proto").unwrap();
        let recipient = st2.recipient("proto", ip1, initiator.secret()).unwrap();
        let initiator_session = initiator.establish(ip2, recipient.secret());
        let recipient_session = recipient.establish();

        let mut consumer = MockSessionConsumer::new();
        consumer
            .expect_on_payload()
            .withf(|payload, _| payload == b"hello")
            .times(1)
            .returning(|_, _| ());
        recipient_session.activate(Arc::new(consumer)).await;

        let packet = initiator_session.encode(b"hello").unwrap();
        let from: SocketAddr = "127.0.0.1:30303".parse().unwrap();
        assert!(st2.try_accept(&packet, from).await);
    }

    #[tokio::test]
    async fn test_handler_ignores_unknown() {
        let store = test_store();
        let from: SocketAddr = "127.0.0.1:30303".parse().unwrap();

        // too short
        assert!(!store.try_accept(&[0u8; 8], from).await);
        // long enough, but no such session
        assert!(!store.try_accept(&[0u8; 64], from).await);
    }
}
