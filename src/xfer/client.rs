use std::cmp::min;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use enr::{CombinedKey, Enr, NodeId};
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::messages::{XferInitRequest, XferInitResponse, XferStartRequest, XferStartResponse};
use super::TransferError;
use crate::config::TransferConfig;
use crate::host::{Host, SessionPacketSink};
use crate::talk::TalkHandler;
use crate::utp::{UtpSocket, UtpStream};

type TransferKey = (NodeId, u16);

/// What the start handler hands to the waiting `request` call once the session is up.
struct Started {
    socket: Arc<UtpSocket>,
    size: u64,
}

type StartedSender = oneshot::Sender<Result<Started, TransferError>>;

/// Events of the client's transfer loop. The loop owns the transfer table; everything
///  else talks to it through these messages, which makes the unsynchronized arrival
///  order of init responses and start requests a non-issue.
enum ClientEvent {
    Create { key: TransferKey, started: StartedSender },
    Cancel { key: TransferKey },
    Init { key: TransferKey, ok: bool },
    Start { key: TransferKey, reply: oneshot::Sender<Option<StartedSender>> },
}

struct PendingTransfer {
    created: Instant,
    started: Option<StartedSender>,
}

/// The file transfer client.
pub struct FileClient {
    inner: Arc<ClientInner>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    host: Arc<Host>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl FileClient {
    pub fn new(host: Arc<Host>, config: TransferConfig) -> anyhow::Result<FileClient> {
        config.validate()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            host: host.clone(),
            config,
            events,
        });

        let loop_task = tokio::spawn(transfer_loop(events_rx, inner.config.start_timeout));
        host.talk().register_handler(
            &inner.config.start_protocol(),
            Arc::new(StartTalkHandler {
                inner: inner.clone(),
            }),
        );
        info!("file client registered for {:?}", inner.config.start_protocol());

        Ok(FileClient {
            inner,
            loop_task: Mutex::new(Some(loop_task)),
        })
    }

    /// Fetches a file from the given node. Cancellation-safe: dropping the returned
    ///  future removes the transfer, and a start request arriving afterwards is answered
    ///  negatively.
    pub async fn request(
        &self,
        node: &Enr<CombinedKey>,
        file: &str,
    ) -> Result<FileReader, TransferError> {
        let node_id = node.node_id();
        let addr = node_udp_addr(node)
            .ok_or_else(|| anyhow!("node record has no UDP endpoint"))?;

        let id: u16 = rand::rng().random();
        let key = (node_id, id);
        let (started_tx, started_rx) = oneshot::channel();
        self.inner
            .events
            .send(ClientEvent::Create {
                key,
                started: started_tx,
            })
            .map_err(|_| TransferError::ClientClosed)?;
        let mut guard = CancelGuard {
            events: self.inner.events.clone(),
            key: Some(key),
        };

        let init = XferInitRequest {
            id,
            filename: file.to_string(),
        };
        let response_bytes = self
            .inner
            .host
            .talk()
            .talk_request(node_id, addr, &self.inner.config.init_protocol(), init.ser())
            .await
            .map_err(TransferError::Other)?;
        let response = XferInitResponse::deser(&response_bytes)
            .map_err(|e| anyhow!("invalid init response: {}", e))?;
        let _ = self.inner.events.send(ClientEvent::Init {
            key,
            ok: response.ok,
        });
        if !response.ok {
            return Err(TransferError::Rejected);
        }

        // wait for the server's start request; the loop times the entry out
        let started = started_rx
            .await
            .map_err(|_| TransferError::ClientClosed)??;

        // the server opens the stream as soon as it has our start response
        let stream = match tokio::time::timeout(
            self.inner.config.start_timeout,
            started.socket.accept(),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransferError::HandshakeTimeout),
        };
        guard.disarm();

        Ok(FileReader {
            stream,
            socket: started.socket,
            size: started.size,
            remaining: started.size,
        })
    }

    /// Stops the transfer loop. Outstanding requests fail with `ClientClosed`.
    pub fn close(&self) {
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for FileClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn node_udp_addr(node: &Enr<CombinedKey>) -> Option<SocketAddr> {
    node.udp4_socket()
        .map(SocketAddr::V4)
        .or_else(|| node.udp6_socket().map(SocketAddr::V6))
}

async fn transfer_loop(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    start_timeout: Duration,
) {
    let mut transfers: FxHashMap<TransferKey, PendingTransfer> = FxHashMap::default();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => return,
                };
                match event {
                    ClientEvent::Create { key, started } => {
                        trace!("transfer {:?}: created", key.1);
                        transfers.insert(key, PendingTransfer {
                            created: Instant::now(),
                            started: Some(started),
                        });
                    }
                    ClientEvent::Cancel { key } => {
                        // dropping the sender fails the waiter, if any is left
                        transfers.remove(&key);
                    }
                    ClientEvent::Init { key, ok } => {
                        if !ok {
                            if let Some(mut transfer) = transfers.remove(&key) {
                                if let Some(tx) = transfer.started.take() {
                                    let _ = tx.send(Err(TransferError::Rejected));
                                }
                            }
                        }
                        // a positive init needs no action: the entry waits for the start
                        //  request, which may even have arrived already
                    }
                    ClientEvent::Start { key, reply } => {
                        match transfers.remove(&key) {
                            Some(mut transfer) => {
                                let _ = reply.send(transfer.started.take());
                            }
                            None => {
                                let _ = reply.send(None);
                            }
                        }
                    }
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                transfers.retain(|key, transfer| {
                    if now.duration_since(transfer.created) >= start_timeout {
                        debug!("transfer {:?}: handshake timeout", key.1);
                        if let Some(tx) = transfer.started.take() {
                            let _ = tx.send(Err(TransferError::HandshakeTimeout));
                        }
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

struct CancelGuard {
    events: mpsc::UnboundedSender<ClientEvent>,
    key: Option<TransferKey>,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.events.send(ClientEvent::Cancel { key });
        }
    }
}

/// Answers the server's `<prefix>-start` requests: matches them against the transfer
///  table, establishes the session as recipient and surfaces the stream socket to the
///  waiting request.
struct StartTalkHandler {
    inner: Arc<ClientInner>,
}

#[async_trait]
impl TalkHandler for StartTalkHandler {
    async fn handle_talk(&self, from: NodeId, from_addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let reject = XferStartResponse {
            ok: false,
            recipient_secret: [0u8; 16],
        }
        .ser();

        let request = match XferStartRequest::deser(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("invalid start request from {}: {}", from, e);
                return reject;
            }
        };

        let key = (from, request.id);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(ClientEvent::Start {
                key,
                reply: reply_tx,
            })
            .is_err()
        {
            return reject;
        }
        let started_tx =
            match tokio::time::timeout(self.inner.config.accept_timeout, reply_rx).await {
                Ok(Ok(Some(started_tx))) => started_tx,
                _ => {
                    debug!("no matching transfer for start request {} from {}", request.id, from);
                    return reject;
                }
            };

        let host = &self.inner.host;
        let recipient = match host.session_store().recipient(
            &self.inner.config.prefix,
            from_addr.ip().to_canonical(),
            request.initiator_secret,
        ) {
            Ok(recipient) => recipient,
            Err(e) => {
                let _ = started_tx.send(Err(TransferError::Other(
                    anyhow!("session establishment failed: {}", e),
                )));
                return reject;
            }
        };
        let recipient_secret = recipient.secret();
        let session = recipient.establish();

        let utp = UtpSocket::new(
            Arc::new(SessionPacketSink::new(session.clone(), host.socket().clone())),
            host.utp_config(),
        );
        session.activate(utp.clone()).await;

        let _ = started_tx.send(Ok(Started {
            socket: utp,
            size: request.file_size,
        }));
        XferStartResponse {
            ok: true,
            recipient_secret,
        }
        .ser()
    }
}

/// Reads the transferred file body. The announced size bounds the read; EOF is reported
///  once it is consumed.
pub struct FileReader {
    stream: UtpStream,
    socket: Arc<UtpSocket>,
    size: u64,
    remaining: u64,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("size", &self.size)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl FileReader {
    /// The file size the server announced.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = min(buf.len() as u64, self.remaining) as usize;
        let n = self.stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(anyhow!("stream ended {} bytes short of the announced size", self.remaining).into());
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TransferError> {
        let mut content = Vec::with_capacity(self.remaining as usize);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(content);
            }
            content.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn close(&self) {
        // the peer has already closed its sending half; there is nothing left to flush,
        //  so the connection is torn down without a FIN handshake of its own
        self.stream.abort().await;
        self.socket.close().await;
    }
}
