use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use aead::{Aead, Nonce, Payload};
use aes_gcm::{Aes128Gcm, KeyInit};
use anyhow::anyhow;
use async_trait::async_trait;
use hkdf::Hkdf;
#[cfg(test)]
use mockall::automock;
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::Sha256;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Bytes a session packet adds around its payload: 8 bytes id, 12 bytes nonce and the
///  16-byte GCM tag. It is also the minimum length of a well-formed packet.
pub const PACKET_OVERHEAD: usize = 36;

const AES_KEY_SIZE: usize = 16;
const GCM_NONCE_SIZE: usize = 12;
const HKDF_INFO_PREFIX: &[u8] = b"discv5 sub-protocol session";

/// The single consumer bound to a session. Every successfully authenticated payload is
///  handed to it together with the sender address.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionConsumer: Send + Sync + 'static {
    async fn on_payload(&self, payload: Vec<u8>, from: SocketAddr);
}

/// Payloads that arrive between `establish` and `activate` are parked here so activation
///  cannot lose them.
enum ConsumerSlot {
    Prepared(Vec<(Vec<u8>, SocketAddr)>),
    Active(Arc<dyn SessionConsumer>),
}

/// An established AEAD session with one peer.
///
/// A session is created in a *prepared* state: inbound packets decode and queue, but
///  nothing is delivered until [`activate`](Session::activate) binds the consumer. This
///  two-step construction lets the caller wire up the consumer without racing the
///  receive pump.
pub struct Session {
    peer_ip: IpAddr,
    ingress_id: u64,
    egress_id: u64,
    #[cfg(test)]
    pub(crate) ingress_key: [u8; AES_KEY_SIZE],
    #[cfg(test)]
    pub(crate) egress_key: [u8; AES_KEY_SIZE],
    ingress_cipher: Aes128Gcm,
    egress_cipher: Aes128Gcm,
    nonce_counter: AtomicU32,
    max_pending_payloads: usize,
    consumer: tokio::sync::Mutex<ConsumerSlot>,
}

pub(crate) enum Role {
    Initiator,
    Recipient,
}

impl Session {
    pub(crate) fn derive(
        peer_ip: IpAddr,
        protocol: &str,
        initiator_secret: &[u8; 16],
        recipient_secret: &[u8; 16],
        role: Role,
        max_pending_payloads: usize,
    ) -> Session {
        let mut ikm = Zeroizing::new([0u8; 32]);
        ikm[..16].copy_from_slice(initiator_secret);
        ikm[16..].copy_from_slice(recipient_secret);

        let mut info = Vec::with_capacity(HKDF_INFO_PREFIX.len() + protocol.len());
        info.extend_from_slice(HKDF_INFO_PREFIX);
        info.extend_from_slice(protocol.as_bytes());

        let kdf = Hkdf::<Sha256>::new(None, &ikm[..]);
        let mut kdata = Zeroizing::new([0u8; 48]);
        kdf.expand(&info, &mut kdata[..])
            .expect("48 bytes is a valid HKDF-SHA256 output length");

        let mut key1 = [0u8; AES_KEY_SIZE];
        let mut key2 = [0u8; AES_KEY_SIZE];
        key1.copy_from_slice(&kdata[0..16]);
        key2.copy_from_slice(&kdata[16..32]);
        let id1 = u64::from_be_bytes(kdata[32..40].try_into().expect("8 byte slice"));
        let id2 = u64::from_be_bytes(kdata[40..48].try_into().expect("8 byte slice"));

        let ((ingress_key, ingress_id), (egress_key, egress_id)) = match role {
            Role::Initiator => ((key1, id1), (key2, id2)),
            Role::Recipient => ((key2, id2), (key1, id1)),
        };

        Session {
            peer_ip,
            ingress_id,
            egress_id,
            ingress_cipher: Aes128Gcm::new_from_slice(&ingress_key)
                .expect("16 bytes is a valid AES-128 key length"),
            egress_cipher: Aes128Gcm::new_from_slice(&egress_key)
                .expect("16 bytes is a valid AES-128 key length"),
            #[cfg(test)]
            ingress_key,
            #[cfg(test)]
            egress_key,
            nonce_counter: AtomicU32::new(0),
            max_pending_payloads,
            consumer: tokio::sync::Mutex::new(ConsumerSlot::Prepared(Vec::new())),
        }
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    /// The session id found on the wire in packets we receive.
    pub fn ingress_id(&self) -> u64 {
        self.ingress_id
    }

    /// The session id we put on the wire in packets we send.
    pub fn egress_id(&self) -> u64 {
        self.egress_id
    }

    /// Binds the consumer and flushes any payloads that arrived while the session was
    ///  prepared, in arrival order.
    pub async fn activate(&self, consumer: Arc<dyn SessionConsumer>) {
        let mut slot = self.consumer.lock().await;
        let queued = match &mut *slot {
            ConsumerSlot::Prepared(queued) => std::mem::take(queued),
            ConsumerSlot::Active(_) => Vec::new(),
        };
        for (payload, from) in queued {
            consumer.on_payload(payload, from).await;
        }
        *slot = ConsumerSlot::Active(consumer);
    }

    /// Encrypts `msg` into a full session packet.
    ///
    /// The nonce is a monotonic 4-byte counter followed by 8 random bytes: the counter
    ///  guarantees uniqueness, the random tail masks predictability. A random generator
    ///  failure is an error - a nonce must never be reused.
    pub fn encode(&self, msg: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce_value = self.nonce_counter.fetch_add(1, Ordering::AcqRel);
        let mut nonce_data = [0u8; GCM_NONCE_SIZE];
        nonce_data[..4].copy_from_slice(&nonce_value.to_be_bytes());
        OsRng
            .try_fill_bytes(&mut nonce_data[4..])
            .map_err(|_| anyhow!("can't generate nonce"))?;

        let id_data = self.egress_id.to_be_bytes();
        let ciphertext = self
            .egress_cipher
            .encrypt(
                Nonce::<Aes128Gcm>::from_slice(&nonce_data),
                Payload {
                    msg,
                    aad: &id_data,
                },
            )
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut packet = Vec::with_capacity(8 + GCM_NONCE_SIZE + ciphertext.len());
        packet.extend_from_slice(&id_data);
        packet.extend_from_slice(&nonce_data);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Decrypts and authenticates a full session packet, returning the payload.
    pub fn decode(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        if packet.len() < PACKET_OVERHEAD {
            anyhow::bail!("packet too short");
        }
        let id_data = &packet[..8];
        let nonce_data = &packet[8..8 + GCM_NONCE_SIZE];
        let ciphertext = &packet[8 + GCM_NONCE_SIZE..];

        self.ingress_cipher
            .decrypt(
                Nonce::<Aes128Gcm>::from_slice(nonce_data),
                Payload {
                    msg: ciphertext,
                    aad: id_data,
                },
            )
            .map_err(|_| anyhow!("authentication failed"))
    }

    /// Decodes an inbound packet and dispatches the payload to the bound consumer, or
    ///  parks it if the session is not activated yet. Authentication failures are
    ///  discarded silently.
    pub(crate) async fn handle_packet(&self, packet: &[u8], from: SocketAddr) {
        let payload = match self.decode(packet) {
            Ok(payload) => payload,
            Err(e) => {
                trace!("dropping undecodable packet from {:?}: {}", from, e);
                return;
            }
        };

        // NB: the lock is held across the dispatch so a queued payload can never be
        //  overtaken by one arriving during activation.
        let mut slot = self.consumer.lock().await;
        match &mut *slot {
            ConsumerSlot::Active(consumer) => {
                let consumer = consumer.clone();
                consumer.on_payload(payload, from).await;
            }
            ConsumerSlot::Prepared(queued) => {
                if queued.len() < self.max_pending_payloads {
                    trace!("session not activated yet - queueing payload from {:?}", from);
                    queued.push((payload, from));
                } else {
                    debug!("pending payload queue full - dropping packet from {:?}", from);
                }
            }
        }
    }
}

/// Generates a fresh 16-byte session secret.
pub(crate) fn generate_secret() -> anyhow::Result<Zeroizing<[u8; 16]>> {
    let mut secret = Zeroizing::new([0u8; 16]);
    OsRng
        .try_fill_bytes(&mut secret[..])
        .map_err(|_| anyhow!("can't generate session secret"))?;
    Ok(secret)
}
