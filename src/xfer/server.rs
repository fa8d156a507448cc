use std::cmp::min;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use enr::NodeId;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::messages::{XferInitRequest, XferInitResponse, XferStartRequest, XferStartResponse};
use super::TransferError;
use crate::config::TransferConfig;
use crate::host::{Host, SessionPacketSink};
use crate::talk::TalkHandler;
use crate::utp::{UtpSocket, UtpStream};

/// Decides whether to serve an incoming transfer request, and serves it. Implementations
///  call [`TransferRequest::accept`] and then [`TransferRequest::send_file`]; returning
///  without accepting rejects the request.
#[async_trait]
pub trait TransferHandler: Send + Sync + 'static {
    async fn serve(&self, request: TransferRequest) -> anyhow::Result<()>;
}

/// The file transfer server: answers `<prefix>-init` requests by dispatching them to the
///  configured handler.
pub struct FileServer {
    #[allow(dead_code)]
    inner: Arc<ServerInner>,
}

struct ServerInner {
    host: Arc<Host>,
    config: TransferConfig,
    handler: Arc<dyn TransferHandler>,
}

impl FileServer {
    pub fn new(
        host: Arc<Host>,
        config: TransferConfig,
        handler: Arc<dyn TransferHandler>,
    ) -> anyhow::Result<FileServer> {
        config.validate()?;
        let inner = Arc::new(ServerInner {
            host: host.clone(),
            config,
            handler,
        });
        host.talk().register_handler(
            &inner.config.init_protocol(),
            Arc::new(InitTalkHandler {
                inner: inner.clone(),
            }),
        );
        info!("file server registered for {:?}", inner.config.init_protocol());
        Ok(FileServer { inner })
    }
}

struct InitTalkHandler {
    inner: Arc<ServerInner>,
}

#[async_trait]
impl TalkHandler for InitTalkHandler {
    async fn handle_talk(&self, from: NodeId, from_addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let request = match XferInitRequest::deser(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("invalid init request from {}: {}", from, e);
                return Vec::new();
            }
        };
        debug!(
            "transfer request from {} for {:?} (id {})",
            from, request.filename, request.id
        );

        let (accept_tx, accept_rx) = oneshot::channel();
        let transfer_request = TransferRequest {
            node: from,
            addr: from_addr,
            filename: request.filename,
            xfer_id: request.id,
            server: self.inner.clone(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accepted: AtomicBool::new(false),
        };

        let handler = self.inner.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.serve(transfer_request).await {
                debug!("transfer handler failed: {}", e);
            }
        });

        // An un-accepted request is rejected when the acceptance window closes, not
        //  before: a handler that bailed out without deciding gets the same treatment as
        //  one that never answered.
        let window = tokio::time::sleep(self.inner.config.accept_timeout);
        tokio::pin!(window);
        let ok = tokio::select! {
            result = accept_rx => match result {
                Ok(true) => true,
                _ => {
                    window.await;
                    false
                }
            },
            _ = &mut window => false,
        };
        XferInitResponse { ok }.ser()
    }
}

/// One incoming transfer request, handed to the [`TransferHandler`].
pub struct TransferRequest {
    pub node: NodeId,
    pub addr: SocketAddr,
    pub filename: String,
    xfer_id: u16,
    server: Arc<ServerInner>,
    accept_tx: Mutex<Option<oneshot::Sender<bool>>>,
    accepted: AtomicBool,
}

impl TransferRequest {
    /// Accepts the request, releasing the positive init response to the client. Must be
    ///  called exactly once, before [`send_file`](Self::send_file).
    pub fn accept(&self) -> Result<(), TransferError> {
        match self.accept_tx.lock().unwrap().take() {
            Some(tx) => {
                self.accepted.store(true, Ordering::Release);
                let _ = tx.send(true);
                Ok(())
            }
            None => Err(TransferError::AlreadyAccepted),
        }
    }

    /// Establishes the encrypted session, opens the stream and copies `size` bytes from
    ///  `reader` into it.
    pub async fn send_file<R>(&self, size: u64, reader: R) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.accepted.load(Ordering::Acquire) {
            return Err(TransferError::NotAccepted);
        }

        let host = &self.server.host;
        let initiator = host.session_store().initiator(&self.server.config.prefix)?;
        let start = XferStartRequest {
            id: self.xfer_id,
            initiator_secret: initiator.secret(),
            file_size: size,
        };

        let response_bytes = self.send_xfer_start(start.ser()).await?;
        let response = XferStartResponse::deser(&response_bytes)
            .map_err(|e| anyhow!("invalid start response: {}", e))?;
        if !response.ok {
            return Err(TransferError::Rejected);
        }

        let session = initiator.establish(self.addr.ip().to_canonical(), response.recipient_secret);
        let utp = UtpSocket::new(
            Arc::new(SessionPacketSink::new(session.clone(), host.socket().clone())),
            host.utp_config(),
        );
        session.activate(utp.clone()).await;

        let stream = match utp.connect(self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                utp.close().await;
                return Err(e.into());
            }
        };

        let result = copy_sized(reader, &stream, size).await;
        let close_result = stream.close().await;
        utp.close().await;
        result?;
        close_result?;
        Ok(())
    }

    async fn send_xfer_start(&self, payload: Vec<u8>) -> Result<Vec<u8>, TransferError> {
        let talk = self.server.host.talk();
        let protocol = self.server.config.start_protocol();

        // TALK is request/response over datagrams - the response can get lost on some
        //  paths. A silent first attempt gets one retry; the original stays in flight
        //  and whichever answer lands first wins.
        let first = talk.talk_request(self.node, self.addr, &protocol, payload.clone());
        tokio::pin!(first);
        let result = tokio::select! {
            result = &mut first => result,
            _ = tokio::time::sleep(self.server.config.start_retry_delay) => {
                debug!("start request to {} got no answer yet - retrying once", self.node);
                let retry = talk.talk_request(self.node, self.addr, &protocol, payload);
                tokio::pin!(retry);
                tokio::select! {
                    result = &mut first => result,
                    result = &mut retry => result,
                }
            }
        };
        result.map_err(TransferError::Other)
    }
}

async fn copy_sized<R>(mut reader: R, stream: &UtpStream, size: u64) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut remaining = size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = min(buf.len() as u64, remaining) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| anyhow!("read error: {}", e))?;
        if n == 0 {
            return Err(anyhow!("file ended {} bytes short of the announced size", remaining).into());
        }
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Serves transfer requests from a directory tree. Requested names are interpreted
///  relative to the root; anything that climbs out of it is rejected before the
///  filesystem is consulted.
pub struct ServeDir {
    root: PathBuf,
}

impl ServeDir {
    pub fn new(root: impl Into<PathBuf>) -> Arc<ServeDir> {
        Arc::new(ServeDir { root: root.into() })
    }
}

#[async_trait]
impl TransferHandler for ServeDir {
    async fn serve(&self, request: TransferRequest) -> anyhow::Result<()> {
        let relative = sanitize_filename(&request.filename)?;
        let path = self.root.join(relative);

        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();

        request.accept()?;
        request.send_file(size, &mut file).await?;
        Ok(())
    }
}

fn sanitize_filename(name: &str) -> anyhow::Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => bail!("invalid file name {:?}", name),
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("invalid file name {:?}", name);
    }
    Ok(clean)
}
