use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::buffer_pool::SegmentPool;
use super::errors::UtpError;
use super::header::{Header, PacketType, SelectiveAck, HEADER_SIZE};
use super::socket::PacketSink;
use super::{
    micros_now, seq_less, seq_less_eq, MAX_PAYLOAD_SIZE, MAX_UNACKED_INBOUND, MAX_UNACKED_SENDS,
    PENDING_SEND_STATE_DELAY, READ_BUFFER_LEN,
};
use crate::config::UtpConfig;

const CWND_INITIAL: u32 = 4 * MAX_PAYLOAD_SIZE as u32;
const CWND_MAX: u32 = READ_BUFFER_LEN as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    SynSent,
    Connected,
    FinReceived,
    FinSent,
    Closed,
    Destroyed,
}

/// A sent-but-unacknowledged segment. The resend machinery works on sequence numbers, not
///  on references back into the connection, so segments stay plain data.
struct SendRecord {
    seq_nr: u16,
    packet_type: PacketType,
    payload: Option<BytesMut>,
    payload_size: usize,
    first_sent: Instant,
    resend_deadline: Instant,
    num_resends: u32,
    acks_skipped: u32,
    acked: bool,
}

struct InboundSeg {
    packet_type: PacketType,
    payload: Vec<u8>,
}

pub(crate) struct ConnInner {
    config: Arc<UtpConfig>,
    sink: Arc<dyn PacketSink>,
    pool: Arc<SegmentPool>,
    remote: SocketAddr,
    send_id: u16,
    recv_id: u16,
    state: ConnState,
    /// next sequence number to send
    seq_nr: u16,
    /// highest contiguously received sequence number
    ack_nr: u16,
    peer_wnd: u32,
    cwnd: u32,
    /// unacknowledged payload bytes in flight
    inflight: usize,
    rtt_us: u64,
    rtt_var_us: u64,
    /// delay measurement echoed in outgoing headers
    reply_micro: u32,
    unacked: VecDeque<SendRecord>,
    /// sliding out-of-order window; slot 0 is sequence number `ack_nr + 1`
    inbound: VecDeque<Option<InboundSeg>>,
    read_buf: BytesMut,
    reached_eof: bool,
    err: Option<UtpError>,
    pending_state: Option<JoinHandle<()>>,
    linger_deadline: Option<Instant>,
    timer_task: Option<JoinHandle<()>>,

    readable: Arc<Notify>,
    writable: Arc<Notify>,
    state_change: Arc<Notify>,
    timer_kick: Arc<Notify>,
}

pub(crate) struct Conn {
    pub(crate) inner: Mutex<ConnInner>,
    recv_id: u16,
    readable: Arc<Notify>,
    writable: Arc<Notify>,
    state_change: Arc<Notify>,
    timer_kick: Arc<Notify>,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<UtpConfig>,
        sink: Arc<dyn PacketSink>,
        pool: Arc<SegmentPool>,
        remote: SocketAddr,
        send_id: u16,
        recv_id: u16,
        seq_nr: u16,
        ack_nr: u16,
        peer_wnd: u32,
        state: ConnState,
    ) -> Arc<Conn> {
        let readable = Arc::new(Notify::new());
        let writable = Arc::new(Notify::new());
        let state_change = Arc::new(Notify::new());
        let timer_kick = Arc::new(Notify::new());

        let inner = ConnInner {
            config,
            sink,
            pool,
            remote,
            send_id,
            recv_id,
            state,
            seq_nr,
            ack_nr,
            peer_wnd,
            cwnd: CWND_INITIAL,
            inflight: 0,
            rtt_us: 0,
            rtt_var_us: 0,
            reply_micro: 0,
            unacked: VecDeque::new(),
            inbound: VecDeque::new(),
            read_buf: BytesMut::new(),
            reached_eof: false,
            err: None,
            pending_state: None,
            linger_deadline: None,
            timer_task: None,
            readable: readable.clone(),
            writable: writable.clone(),
            state_change: state_change.clone(),
            timer_kick: timer_kick.clone(),
        };

        Arc::new(Conn {
            inner: Mutex::new(inner),
            recv_id,
            readable,
            writable,
            state_change,
            timer_kick,
        })
    }

    pub(crate) fn recv_id(&self) -> u16 {
        self.recv_id
    }

    /// Spawns the per-connection maintenance task driving resends, the write timeout and
    ///  the close linger.
    pub(crate) async fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(self.clone().timer_loop());
        self.inner.lock().await.timer_task = Some(handle);
    }

    pub(crate) async fn is_destroyed(&self) -> bool {
        self.inner.lock().await.state == ConnState::Destroyed
    }

    pub(crate) async fn send_syn(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        debug_assert_eq!(inner.state, ConnState::SynSent);
        inner.send_tracked(PacketType::Syn, None).await;
    }

    pub(crate) async fn send_initial_state(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        let seq = inner.seq_nr;
        inner.send_packet_raw(PacketType::State, seq, None).await;
    }

    pub(crate) async fn wait_connected(self: &Arc<Self>) -> Result<(), UtpError> {
        loop {
            let inner = self.inner.lock().await;
            match inner.state {
                ConnState::Connected | ConnState::FinReceived => return Ok(()),
                ConnState::Destroyed => {
                    return Err(inner.err.clone().unwrap_or(UtpError::Closed))
                }
                ConnState::Closed | ConnState::FinSent => return Err(UtpError::Closed),
                ConnState::SynSent => {}
            }
            let notified = self.state_change.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    /// Feeds one decoded packet into the connection state machine.
    pub(crate) async fn on_packet(self: &Arc<Self>, header: Header, payload: &[u8]) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnState::Destroyed {
            return;
        }

        trace!(
            "conn {}: received {:?} seq={} ack={} from {:?}",
            inner.recv_id, header.packet_type, header.seq_nr, header.ack_nr, inner.remote
        );

        inner.reply_micro = micros_now().wrapping_sub(header.timestamp_us);
        inner.peer_wnd = header.wnd_size;

        match header.packet_type {
            PacketType::State => {
                if inner.state == ConnState::SynSent {
                    // the SYN is acknowledged: adopt the peer's sequence position
                    inner.ack_nr = header.seq_nr.wrapping_sub(1);
                    inner
                        .process_acks(header.ack_nr, header.selective_ack.as_ref())
                        .await;
                    inner.state = ConnState::Connected;
                    debug!("conn {}: connected to {:?}", inner.recv_id, inner.remote);
                    inner.state_change.notify_waiters();
                } else {
                    inner
                        .process_acks(header.ack_nr, header.selective_ack.as_ref())
                        .await;
                }
            }
            PacketType::Data | PacketType::Fin => {
                if inner.state == ConnState::SynSent {
                    // data before the handshake STATE: the STATE was lost, the peer is
                    //  already connected
                    inner.ack_nr = header.seq_nr.wrapping_sub(1);
                    inner.state = ConnState::Connected;
                    inner.state_change.notify_waiters();
                }
                if header.packet_type == PacketType::Fin && inner.state == ConnState::Connected {
                    inner.state = ConnState::FinReceived;
                    inner.state_change.notify_waiters();
                }
                inner
                    .process_acks(header.ack_nr, header.selective_ack.as_ref())
                    .await;
                inner
                    .on_sequenced(self, header.seq_nr, header.packet_type, payload)
                    .await;
            }
            PacketType::Reset => {
                inner.destroy(Some(UtpError::Reset));
                return;
            }
            PacketType::Syn => {
                // duplicate SYN: our handshake STATE got lost, answer again
                inner.schedule_state(self);
            }
        }

        if inner.state == ConnState::FinSent && inner.unacked.is_empty() {
            debug!("conn {}: FIN acknowledged - closed", inner.recv_id);
            inner.enter_closed();
        }

        inner.writable.notify_waiters();
    }

    pub(crate) async fn read(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize, UtpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut inner = self.inner.lock().await;
            if !inner.read_buf.is_empty() {
                let was_buffered = inner.read_buf.len();
                let n = min(buf.len(), was_buffered);
                inner.read_buf.copy_to_slice(&mut buf[..n]);

                // announce the window again once a read frees substantial room
                if was_buffered >= READ_BUFFER_LEN / 2 && inner.read_buf.len() < READ_BUFFER_LEN / 2
                {
                    inner.schedule_state(self);
                }
                return Ok(n);
            }
            if inner.reached_eof {
                if inner.state == ConnState::FinReceived {
                    debug!("conn {}: EOF drained - closed", inner.recv_id);
                    inner.enter_closed();
                }
                return Ok(0);
            }
            if inner.state == ConnState::Destroyed {
                return Err(inner.err.clone().unwrap_or(UtpError::Closed));
            }

            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    pub(crate) async fn write(self: &Arc<Self>, buf: &[u8]) -> Result<usize, UtpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnState::Destroyed => {
                    return Err(inner.err.clone().unwrap_or(UtpError::Closed))
                }
                ConnState::FinSent | ConnState::Closed => return Err(UtpError::Closed),
                ConnState::SynSent => {} // wait for the handshake
                ConnState::Connected | ConnState::FinReceived => {
                    if inner.unacked.len() < MAX_UNACKED_SENDS {
                        let window = min(inner.cwnd, inner.peer_wnd) as usize;
                        if inner.inflight < window {
                            let n = min(min(buf.len(), MAX_PAYLOAD_SIZE), window - inner.inflight);
                            let mut payload = inner.pool.checkout();
                            payload.extend_from_slice(&buf[..n]);
                            inner.send_tracked(PacketType::Data, Some(payload)).await;
                            return Ok(n);
                        }
                    }
                }
            }

            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    /// Sends a FIN and waits until everything outstanding - the FIN included - has been
    ///  acknowledged.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<(), UtpError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnState::Destroyed => {
                    return match &inner.err {
                        None => Ok(()),
                        Some(e) => Err(e.clone()),
                    }
                }
                ConnState::Closed | ConnState::FinSent => {}
                ConnState::SynSent => {
                    // never connected, nothing to flush
                    inner.destroy(None);
                    return Ok(());
                }
                ConnState::Connected | ConnState::FinReceived => {
                    inner.send_tracked(PacketType::Fin, None).await;
                    inner.state = ConnState::FinSent;
                    inner.state_change.notify_waiters();
                }
            }
        }

        loop {
            let inner = self.inner.lock().await;
            match inner.state {
                ConnState::Closed => return Ok(()),
                ConnState::Destroyed => {
                    return match &inner.err {
                        None => Ok(()),
                        Some(e) => Err(e.clone()),
                    }
                }
                _ => {}
            }
            let notified = self.state_change.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    pub(crate) async fn destroy(&self, err: Option<UtpError>) {
        self.inner.lock().await.destroy(err);
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            let deadline = {
                let inner = self.inner.lock().await;
                if inner.state == ConnState::Destroyed {
                    return;
                }
                let mut deadline = inner.linger_deadline;
                for rec in &inner.unacked {
                    if !rec.acked {
                        deadline = Some(match deadline {
                            Some(d) => d.min(rec.resend_deadline),
                            None => rec.resend_deadline,
                        });
                    }
                }
                deadline
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.timer_kick.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => self.on_timer_due().await,
                    }
                }
                None => self.timer_kick.notified().await,
            }
        }
    }

    async fn on_timer_due(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if inner.state == ConnState::Destroyed {
            return;
        }
        if let Some(linger) = inner.linger_deadline {
            if inner.state == ConnState::Closed && now >= linger {
                trace!("conn {}: linger elapsed", inner.recv_id);
                inner.destroy(None);
                return;
            }
        }

        let mut due = Vec::new();
        let mut timed_out = None;
        for rec in &inner.unacked {
            if !rec.acked && rec.resend_deadline <= now {
                if now.duration_since(rec.first_sent) >= inner.config.write_timeout {
                    timed_out = Some(rec.seq_nr);
                    break;
                }
                due.push(rec.seq_nr);
            }
        }
        if let Some(seq) = timed_out {
            debug!(
                "conn {}: segment {} unacknowledged past the write timeout",
                inner.recv_id, seq
            );
            inner.destroy(Some(UtpError::AckTimeout));
            return;
        }

        if !due.is_empty() {
            // a pure timeout halves the congestion window
            inner.cwnd = (inner.cwnd / 2).max(MAX_PAYLOAD_SIZE as u32);
            for seq in due {
                inner.resend_segment(seq).await;
            }
        }
    }
}

impl ConnInner {
    fn recv_window(&self) -> u32 {
        READ_BUFFER_LEN.saturating_sub(self.read_buf.len()) as u32
    }

    fn resend_timeout(&self) -> Duration {
        let rto = Duration::from_micros(self.rtt_us + 4 * self.rtt_var_us);
        rto.max(self.config.initial_latency)
    }

    fn update_rtt(&mut self, sample: Duration) {
        let sample_us = sample.as_micros() as i64;
        if self.rtt_us == 0 {
            self.rtt_us = sample_us as u64;
            self.rtt_var_us = (sample_us / 2) as u64;
        } else {
            let delta = (sample_us - self.rtt_us as i64).abs();
            let rtt_var = self.rtt_var_us as i64 + (delta - self.rtt_var_us as i64) / 4;
            self.rtt_var_us = rtt_var.max(0) as u64;
            let rtt = self.rtt_us as i64 + (sample_us - self.rtt_us as i64) / 8;
            self.rtt_us = rtt.max(0) as u64;
        }
    }

    fn build_selective_ack(&self) -> Option<SelectiveAck> {
        let mut sack = SelectiveAck::new();
        let mut any = false;
        for (offset, seg) in self.inbound.iter().enumerate().skip(1) {
            if seg.is_some() {
                sack.set_bit(offset - 1);
                any = true;
            }
        }
        if any {
            Some(sack)
        } else {
            None
        }
    }

    async fn send_packet_raw(&mut self, ty: PacketType, seq: u16, payload: Option<&[u8]>) {
        let header = Header {
            packet_type: ty,
            // by uTP tradition the SYN carries the receive id, everything else the send id
            conn_id: if ty == PacketType::Syn {
                self.recv_id
            } else {
                self.send_id
            },
            timestamp_us: micros_now(),
            timestamp_diff_us: self.reply_micro,
            wnd_size: self.recv_window(),
            seq_nr: seq,
            ack_nr: self.ack_nr,
            selective_ack: if ty == PacketType::State {
                self.build_selective_ack()
            } else {
                None
            },
        };

        let mut buf =
            BytesMut::with_capacity(HEADER_SIZE + 34 + payload.map(<[u8]>::len).unwrap_or(0));
        header.ser(&mut buf);
        if let Some(payload) = payload {
            buf.extend_from_slice(payload);
        }

        trace!(
            "conn {}: sending {:?} seq={} ack={} len={} to {:?}",
            self.recv_id, ty, seq, self.ack_nr, buf.len(), self.remote
        );
        if let Err(e) = self.sink.send_packet(self.remote, &buf).await {
            debug!("conn {}: packet send failed: {}", self.recv_id, e);
            self.destroy(Some(UtpError::Transport(e.to_string())));
        }
    }

    /// Sends a sequenced packet and registers it for retransmission.
    async fn send_tracked(&mut self, ty: PacketType, payload: Option<BytesMut>) {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        let payload_size = payload.as_ref().map(BytesMut::len).unwrap_or(0);

        if ty == PacketType::Data {
            // outbound data carries the ack, no separate state packet needed
            if let Some(handle) = self.pending_state.take() {
                handle.abort();
            }
        }

        let now = Instant::now();
        let rto = self.resend_timeout();
        self.send_packet_raw(ty, seq, payload.as_deref()).await;

        if self.state == ConnState::Destroyed {
            if let Some(payload) = payload {
                self.pool.release(payload);
            }
            return;
        }

        self.inflight += payload_size;
        self.unacked.push_back(SendRecord {
            seq_nr: seq,
            packet_type: ty,
            payload,
            payload_size,
            first_sent: now,
            resend_deadline: now + rto,
            num_resends: 0,
            acks_skipped: 0,
            acked: false,
        });
        self.timer_kick.notify_one();
    }

    async fn resend_segment(&mut self, seq: u16) {
        let now = Instant::now();
        let rto = self.resend_timeout();
        let (ty, payload) = match self.unacked.iter_mut().find(|r| r.seq_nr == seq) {
            Some(rec) if !rec.acked => {
                rec.num_resends += 1;
                rec.resend_deadline = now + rto * rec.num_resends;
                trace!("resending segment {} ({}th resend)", seq, rec.num_resends);
                (rec.packet_type, rec.payload.clone())
            }
            _ => return,
        };
        self.send_packet_raw(ty, seq, payload.as_deref()).await;
    }

    /// Retransmits without touching the timeout backoff or the congestion window.
    async fn fast_resend(&mut self, seq: u16) {
        let (ty, payload) = match self.unacked.iter().find(|r| r.seq_nr == seq) {
            Some(rec) if !rec.acked => {
                trace!("fast retransmit of segment {}", seq);
                (rec.packet_type, rec.payload.clone())
            }
            _ => return,
        };
        self.send_packet_raw(ty, seq, payload.as_deref()).await;
    }

    async fn process_acks(&mut self, ack_nr: u16, sack: Option<&SelectiveAck>) {
        let mut bytes_acked = 0usize;
        let mut latency_sample = None;

        for rec in self.unacked.iter_mut() {
            if !rec.acked && seq_less_eq(rec.seq_nr, ack_nr) {
                rec.acked = true;
                bytes_acked += rec.payload_size;
                self.inflight -= rec.payload_size;
                // Karn: only segments acked on their first transmission give samples
                if rec.num_resends == 0 {
                    latency_sample = Some(rec.first_sent.elapsed());
                }
                if let Some(payload) = rec.payload.take() {
                    self.pool.release(payload);
                }
            }
        }

        let mut max_sacked: Option<u16> = None;
        if let Some(sack) = sack {
            for bit in sack.iter_set() {
                let seq = ack_nr.wrapping_add(2).wrapping_add(bit as u16);
                for rec in self
                    .unacked
                    .iter_mut()
                    .filter(|r| r.seq_nr == seq && !r.acked)
                {
                    rec.acked = true;
                    bytes_acked += rec.payload_size;
                    self.inflight -= rec.payload_size;
                    if let Some(payload) = rec.payload.take() {
                        self.pool.release(payload);
                    }
                }
                max_sacked = Some(seq);
            }
        }

        // a segment repeatedly skipped by selective acks is presumed lost
        let mut fast = Vec::new();
        if let Some(max_sacked) = max_sacked {
            for rec in self.unacked.iter_mut() {
                if !rec.acked && seq_less(rec.seq_nr, max_sacked) {
                    rec.acks_skipped += 1;
                    if rec.acks_skipped >= 3 {
                        rec.acks_skipped = 0;
                        fast.push(rec.seq_nr);
                    }
                }
            }
        }

        if let Some(sample) = latency_sample {
            self.update_rtt(sample);
        }

        while matches!(self.unacked.front(), Some(rec) if rec.acked) {
            self.unacked.pop_front();
        }

        if bytes_acked > 0 && self.cwnd < CWND_MAX {
            // additive increase, at most one MSS per acked round
            let growth = min(
                MAX_PAYLOAD_SIZE,
                MAX_PAYLOAD_SIZE * bytes_acked / (self.cwnd as usize).max(1),
            );
            self.cwnd = min(self.cwnd + growth as u32, CWND_MAX);
        }

        for seq in fast {
            self.fast_resend(seq).await;
        }

        self.writable.notify_waiters();
    }

    /// Handles a DATA or FIN packet's position in the sequence space.
    async fn on_sequenced(
        &mut self,
        conn: &Arc<Conn>,
        seq: u16,
        ty: PacketType,
        payload: &[u8],
    ) {
        if seq_less(seq, self.ack_nr.wrapping_add(1)) {
            // duplicate of something already delivered; re-ack so the sender learns our
            //  progress
            trace!("duplicate segment {} (ack_nr {})", seq, self.ack_nr);
            self.schedule_state(conn);
            return;
        }

        let offset = seq.wrapping_sub(self.ack_nr.wrapping_add(1)) as usize;
        if offset >= MAX_UNACKED_INBOUND {
            debug!(
                "segment {} exceeds the inbound window (ack_nr {}) - dropping",
                seq, self.ack_nr
            );
            return;
        }
        if self.inbound.len() <= offset {
            self.inbound.resize_with(offset + 1, || None);
        }
        if self.inbound[offset].is_some() {
            self.schedule_state(conn);
            return;
        }
        self.inbound[offset] = Some(InboundSeg {
            packet_type: ty,
            payload: payload.to_vec(),
        });

        let mut delivered = false;
        while matches!(self.inbound.front(), Some(Some(_))) {
            let seg = self.inbound.pop_front().flatten().expect("checked above");
            self.ack_nr = self.ack_nr.wrapping_add(1);
            match seg.packet_type {
                PacketType::Data => {
                    self.read_buf.extend_from_slice(&seg.payload);
                    delivered = true;
                }
                PacketType::Fin => {
                    trace!("conn {}: EOF at {}", self.recv_id, self.ack_nr);
                    self.reached_eof = true;
                    delivered = true;
                }
                _ => {}
            }
        }
        if delivered {
            self.readable.notify_waiters();
        }

        self.schedule_state(conn);
    }

    /// Arms the delayed state packet. Outbound data within the delay elides it.
    fn schedule_state(&mut self, conn: &Arc<Conn>) {
        if self.pending_state.is_some() || self.state == ConnState::Destroyed {
            return;
        }
        let conn = conn.clone();
        self.pending_state = Some(tokio::spawn(async move {
            tokio::time::sleep(PENDING_SEND_STATE_DELAY).await;
            let mut inner = conn.inner.lock().await;
            inner.pending_state = None;
            if inner.state != ConnState::Destroyed {
                let seq = inner.seq_nr;
                inner.send_packet_raw(PacketType::State, seq, None).await;
            }
        }));
    }

    fn enter_closed(&mut self) {
        self.state = ConnState::Closed;
        self.linger_deadline = Some(Instant::now() + self.config.fin_linger);
        self.state_change.notify_waiters();
        self.timer_kick.notify_one();
    }

    fn destroy(&mut self, err: Option<UtpError>) {
        if self.state == ConnState::Destroyed {
            return;
        }
        debug!("conn {}: destroyed ({:?})", self.recv_id, err);
        self.state = ConnState::Destroyed;
        if self.err.is_none() {
            self.err = err;
        }
        if let Some(handle) = self.pending_state.take() {
            handle.abort();
        }
        while let Some(mut rec) = self.unacked.pop_front() {
            if let Some(payload) = rec.payload.take() {
                self.pool.release(payload);
            }
        }
        self.inflight = 0;
        self.inbound.clear();

        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.state_change.notify_waiters();
        self.timer_kick.notify_one();
    }
}

/// The application-facing handle of one stream connection. Cloneable; reads and writes on
///  the two halves are independent.
#[derive(Clone)]
pub struct UtpStream {
    conn: Arc<Conn>,
}

impl std::fmt::Debug for UtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpStream").finish_non_exhaustive()
    }
}

impl UtpStream {
    pub(crate) fn new(conn: Arc<Conn>) -> UtpStream {
        UtpStream { conn }
    }

    /// Reads available bytes into `buf`, waiting for data if none is buffered. Returns
    ///  `Ok(0)` at EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, UtpError> {
        self.conn.read(buf).await
    }

    /// Writes up to a segment's worth of `buf`, waiting while the send window is full.
    ///  Partial writes are normal; see [`write_all`](Self::write_all).
    pub async fn write(&self, buf: &[u8]) -> Result<usize, UtpError> {
        self.conn.write(buf).await
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), UtpError> {
        while !buf.is_empty() {
            let n = self.conn.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Sends a FIN and waits for everything outstanding to be acknowledged.
    pub async fn close(&self) -> Result<(), UtpError> {
        self.conn.close().await
    }

    /// Tears the connection down without the FIN handshake.
    pub async fn abort(&self) {
        self.conn.destroy(Some(UtpError::Closed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::MIN_MTU;
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl PacketSink for RecordingSink {
        async fn send_packet(&self, _to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(packet.to_vec());
            Ok(())
        }
    }

    /// A connection with `ack_nr = 7` (next expected segment is 8) over a sink that
    ///  records every outbound packet. The maintenance task is not started, so tests see
    ///  exactly the packets their inputs cause.
    fn test_conn(state: ConnState) -> (Arc<Conn>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            sent: StdMutex::new(Vec::new()),
        });
        let conn = Conn::new(
            Arc::new(UtpConfig::default()),
            sink.clone(),
            Arc::new(SegmentPool::new(MIN_MTU, 16)),
            "127.0.0.1:9000".parse().unwrap(),
            101,
            100,
            1,
            7,
            1 << 20,
            state,
        );
        (conn, sink)
    }

    fn data_header(seq: u16, ack: u16) -> Header {
        Header {
            packet_type: PacketType::Data,
            conn_id: 100,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 1 << 20,
            seq_nr: seq,
            ack_nr: ack,
            selective_ack: None,
        }
    }

    fn state_header(ack: u16, sack: Option<SelectiveAck>) -> Header {
        Header {
            packet_type: PacketType::State,
            selective_ack: sack,
            ..data_header(0, ack)
        }
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        conn.on_packet(data_header(8, 0), b"abc").await;
        conn.on_packet(data_header(9, 0), b"def").await;

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcdef");
        assert_eq!(conn.inner.lock().await.ack_nr, 9);
    }

    #[tokio::test]
    async fn test_reordered_delivery() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        // 9 arrives before 8; nothing is readable until the gap closes
        conn.on_packet(data_header(9, 0), b"def").await;
        assert!(conn.inner.lock().await.read_buf.is_empty());

        conn.on_packet(data_header(8, 0), b"abc").await;
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcdef");
    }

    #[tokio::test]
    async fn test_duplicate_not_redelivered() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        conn.on_packet(data_header(8, 0), b"abc").await;
        conn.on_packet(data_header(8, 0), b"abc").await;

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert!(conn.inner.lock().await.read_buf.is_empty());
    }

    #[tokio::test]
    async fn test_gap_builds_selective_ack() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        // 8 is missing: 9 and 11 are out of order
        conn.on_packet(data_header(9, 0), b"x").await;
        conn.on_packet(data_header(11, 0), b"y").await;

        let inner = conn.inner.lock().await;
        let sack = inner.build_selective_ack().expect("gaps present");
        // bit 0 covers seq 9, bit 2 covers seq 11
        assert!(sack.bit_set(0));
        assert!(!sack.bit_set(1));
        assert!(sack.bit_set(2));
    }

    #[tokio::test]
    async fn test_fin_yields_eof_after_drain() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        conn.on_packet(data_header(8, 0), b"tail").await;
        let mut fin = data_header(9, 0);
        fin.packet_type = PacketType::Fin;
        conn.on_packet(fin, &[]).await;

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(conn.inner.lock().await.state, ConnState::Closed);
    }

    #[tokio::test]
    async fn test_reset_destroys() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        let mut reset = data_header(0, 0);
        reset.packet_type = PacketType::Reset;
        conn.on_packet(reset, &[]).await;

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap_err(), UtpError::Reset);
        assert_eq!(conn.write(b"x").await.unwrap_err(), UtpError::Reset);
    }

    #[tokio::test]
    async fn test_ack_clears_send_buffer() {
        let (conn, _sink) = test_conn(ConnState::Connected);

        assert_eq!(conn.write(b"hello").await.unwrap(), 5);
        assert_eq!(conn.inner.lock().await.unacked.len(), 1);
        assert_eq!(conn.inner.lock().await.inflight, 5);

        conn.on_packet(state_header(1, None), &[]).await;

        let inner = conn.inner.lock().await;
        assert!(inner.unacked.is_empty());
        assert_eq!(inner.inflight, 0);
    }

    #[tokio::test]
    async fn test_fast_retransmit_after_three_skipped_acks() {
        let (conn, sink) = test_conn(ConnState::Connected);

        for payload in [b"a", b"b", b"c", b"d", b"e"] {
            conn.write(payload).await.unwrap(); // seq 1..=5
        }
        assert_eq!(sink.sent.lock().unwrap().len(), 5);

        // selective acks for 3, 4 and 5 while 1 and 2 stay missing
        let mut sack = SelectiveAck::new();
        for bit in [1usize, 2, 3] {
            sack.set_bit(bit);
        }
        for _ in 0..3 {
            conn.on_packet(state_header(0, Some(sack.clone())), &[]).await;
        }

        // segments 1 and 2 went out a second time
        assert_eq!(sink.sent.lock().unwrap().len(), 7);
        let inner = conn.inner.lock().await;
        assert_eq!(inner.unacked.front().map(|r| r.seq_nr), Some(1));
        assert_eq!(inner.unacked.iter().filter(|r| !r.acked).count(), 2);
    }

    #[rstest]
    #[case::first_sample(0, 0, 10_000, 10_000, 5_000)]
    #[case::steady(10_000, 5_000, 10_000, 10_000, 3_750)]
    #[case::rising(10_000, 5_000, 18_000, 11_000, 5_750)]
    fn test_update_rtt(
        #[case] rtt: u64,
        #[case] rtt_var: u64,
        #[case] sample_us: u64,
        #[case] expected_rtt: u64,
        #[case] expected_var: u64,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (conn, _sink) = test_conn(ConnState::Connected);
            let mut inner = conn.inner.lock().await;
            inner.rtt_us = rtt;
            inner.rtt_var_us = rtt_var;
            inner.update_rtt(Duration::from_micros(sample_us));
            assert_eq!(inner.rtt_us, expected_rtt);
            assert_eq!(inner.rtt_var_us, expected_var);
        });
    }

    #[tokio::test]
    async fn test_window_caps_writes() {
        let (conn, _sink) = test_conn(ConnState::Connected);
        {
            let mut inner = conn.inner.lock().await;
            inner.peer_wnd = 10;
        }

        // only the window's worth is accepted, the rest must wait
        let n = conn.write(&[0u8; 100]).await.unwrap();
        assert_eq!(n, 10);
    }
}
