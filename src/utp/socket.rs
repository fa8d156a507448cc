use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::buffer_pool::SegmentPool;
use super::conn::{Conn, ConnState, UtpStream};
use super::errors::UtpError;
use super::header::{Header, PacketType};
use super::{micros_now, MIN_MTU};
use crate::config::UtpConfig;
use crate::session::SessionConsumer;

/// Where outbound stream packets go. In production this is the session encoder feeding
///  the shared socket; tests substitute in-memory links.
///
/// Implementations must not call back into [`UtpSocket::packet_in`] synchronously from
///  `send_packet` - the connection's lock is held across the call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()>;
}

struct IncomingSyn {
    conn_id: u16,
    seq_nr: u16,
    wnd_size: u32,
    from: SocketAddr,
}

/// Dispatches stream packets to connections by connection id, and hands incoming SYNs to
///  [`accept`](UtpSocket::accept). One `UtpSocket` serves one remote session; it is
///  installed as the session's consumer.
pub struct UtpSocket {
    config: Arc<UtpConfig>,
    sink: Arc<dyn PacketSink>,
    pool: Arc<SegmentPool>,
    conns: Mutex<FxHashMap<u16, Arc<Conn>>>,
    backlog_tx: mpsc::Sender<IncomingSyn>,
    backlog_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingSyn>>,
    closed: AtomicBool,
}

impl UtpSocket {
    pub fn new(sink: Arc<dyn PacketSink>, config: UtpConfig) -> Arc<UtpSocket> {
        let config = Arc::new(config);
        let (backlog_tx, backlog_rx) = mpsc::channel(config.backlog_len);
        Arc::new(UtpSocket {
            pool: Arc::new(SegmentPool::new(MIN_MTU, config.buffer_pool_size)),
            config,
            sink,
            conns: Mutex::new(FxHashMap::default()),
            backlog_tx,
            backlog_rx: tokio::sync::Mutex::new(backlog_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a connection to `remote` and completes the SYN handshake.
    pub async fn connect(&self, remote: SocketAddr) -> Result<UtpStream, UtpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UtpError::Closed);
        }

        let conn = {
            let mut conns = self.conns.lock().unwrap();
            let recv_id = loop {
                let candidate: u16 = rand::rng().random();
                // the peer answers on recv_id, and its own stream arrives on recv_id + 1
                if !conns.contains_key(&candidate) {
                    break candidate;
                }
            };
            let conn = Conn::new(
                self.config.clone(),
                self.sink.clone(),
                self.pool.clone(),
                remote,
                recv_id.wrapping_add(1),
                recv_id,
                1,
                0,
                MIN_MTU as u32,
                ConnState::SynSent,
            );
            conns.insert(recv_id, conn.clone());
            conn
        };

        conn.start().await;
        conn.send_syn().await;

        match conn.wait_connected().await {
            Ok(()) => Ok(UtpStream::new(conn)),
            Err(e) => {
                self.conns.lock().unwrap().remove(&conn.recv_id());
                Err(e)
            }
        }
    }

    /// Waits for an incoming connection and answers its SYN.
    pub async fn accept(&self) -> Result<UtpStream, UtpError> {
        let syn = {
            let mut backlog = self.backlog_rx.lock().await;
            match backlog.recv().await {
                Some(syn) => syn,
                None => return Err(UtpError::Closed),
            }
        };

        let recv_id = syn.conn_id.wrapping_add(1);
        let conn = Conn::new(
            self.config.clone(),
            self.sink.clone(),
            self.pool.clone(),
            syn.from,
            syn.conn_id,
            recv_id,
            rand::rng().random(),
            syn.seq_nr,
            syn.wnd_size,
            ConnState::Connected,
        );

        let stale = self.conns.lock().unwrap().insert(recv_id, conn.clone());
        if let Some(stale) = stale {
            debug!("accept: replacing stale connection {}", recv_id);
            stale.destroy(Some(UtpError::Closed)).await;
        }

        conn.start().await;
        conn.send_initial_state().await;
        Ok(UtpStream::new(conn))
    }

    /// Entry point for decoded session payloads.
    pub async fn packet_in(&self, payload: &[u8], from: SocketAddr) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut buf = payload;
        let header = match Header::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                trace!("undecodable stream packet from {:?}: {} - dropping", from, e);
                return;
            }
        };

        if header.packet_type == PacketType::Syn {
            self.on_syn(header, from).await;
            return;
        }

        let conn = self.conns.lock().unwrap().get(&header.conn_id).cloned();
        match conn {
            Some(conn) => {
                conn.on_packet(header, buf).await;
                if conn.is_destroyed().await {
                    self.conns.lock().unwrap().remove(&conn.recv_id());
                }
            }
            None => {
                if header.packet_type != PacketType::Reset {
                    trace!(
                        "packet for unknown connection {} from {:?} - resetting",
                        header.conn_id, from
                    );
                    self.send_reset(header.conn_id, header.seq_nr, from).await;
                }
            }
        }
    }

    async fn on_syn(&self, header: Header, from: SocketAddr) {
        // a resent SYN for a connection that is already up is answered by the connection
        let existing = self
            .conns
            .lock()
            .unwrap()
            .get(&header.conn_id.wrapping_add(1))
            .cloned();
        if let Some(conn) = existing {
            conn.on_packet(header, &[]).await;
            return;
        }

        let syn = IncomingSyn {
            conn_id: header.conn_id,
            seq_nr: header.seq_nr,
            wnd_size: header.wnd_size,
            from,
        };
        if let Err(e) = self.backlog_tx.try_send(syn) {
            debug!("SYN backlog full or closed - resetting connection from {:?}", from);
            if let mpsc::error::TrySendError::Full(syn) | mpsc::error::TrySendError::Closed(syn) =
                e
            {
                self.send_reset(syn.conn_id, syn.seq_nr, syn.from).await;
            }
        }
    }

    async fn send_reset(&self, conn_id: u16, their_seq: u16, to: SocketAddr) {
        let header = Header {
            packet_type: PacketType::Reset,
            conn_id,
            timestamp_us: micros_now(),
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr: rand::rng().random(),
            ack_nr: their_seq,
            selective_ack: None,
        };
        let mut buf = BytesMut::with_capacity(super::header::HEADER_SIZE);
        header.ser(&mut buf);
        if let Err(e) = self.sink.send_packet(to, &buf).await {
            debug!("failed to send reset to {:?}: {}", to, e);
        }
    }

    /// Destroys every connection and stops accepting. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backlog_rx.lock().await.close();
        let conns: Vec<_> = {
            let mut map = self.conns.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.destroy(Some(UtpError::Closed)).await;
        }
    }
}

#[async_trait]
impl SessionConsumer for UtpSocket {
    async fn on_payload(&self, payload: Vec<u8>, from: SocketAddr) {
        self.packet_in(&payload, from).await;
    }
}
