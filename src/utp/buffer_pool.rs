use std::sync::Mutex;

use bytes::BytesMut;
use tracing::{debug, warn};

use super::MAX_UNACKED_SENDS;

/// Recycles the payload buffers of outbound segments.
///
/// A buffer is checked out when the write path cuts a segment from the stream, lives
///  inside the segment's send record for as long as retransmission may need it, and is
///  released when the segment is acknowledged or the connection is torn down. Each
///  connection keeps at most [`MAX_UNACKED_SENDS`] segments un-acknowledged, so the
///  number of buffers in circulation is bounded and a warm window runs without
///  allocating per packet.
pub(crate) struct SegmentPool {
    buf_size: usize,
    /// released buffers retained beyond this are dropped instead of pooled
    max_pooled: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<BytesMut>,
    /// buffers currently inside send records
    in_circulation: usize,
}

impl SegmentPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> SegmentPool {
        SegmentPool {
            buf_size,
            max_pooled,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_circulation: 0,
            }),
        }
    }

    /// Takes a buffer for a new segment, reusing a released one when possible.
    pub fn checkout(&self) -> BytesMut {
        let mut state = self.state.lock().unwrap();
        state.in_circulation += 1;
        if let Some(buffer) = state.free.pop() {
            return buffer;
        }

        if state.in_circulation > self.max_pooled.max(MAX_UNACKED_SENDS) {
            // more segments in flight than one saturated connection can account for
            debug!(
                "{} segment buffers in circulation (pool retains {})",
                state.in_circulation, self.max_pooled
            );
        }
        BytesMut::with_capacity(self.buf_size)
    }

    /// Returns a segment's buffer once no retransmission can need it again.
    pub fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            // a segment payload must never outgrow its buffer; don't let a strayed
            //  allocation poison the pool
            warn!(
                "released segment buffer has capacity {} instead of {} - discarding",
                buffer.capacity(),
                self.buf_size
            );
            let mut state = self.state.lock().unwrap();
            state.in_circulation = state.in_circulation.saturating_sub(1);
            return;
        }

        buffer.clear();

        let mut state = self.state.lock().unwrap();
        state.in_circulation = state.in_circulation.saturating_sub(1);
        if state.free.len() < self.max_pooled {
            state.free.push(buffer);
        }
    }
}
