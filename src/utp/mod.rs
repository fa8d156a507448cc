//! A uTP-flavoured reliable stream transport, run over a packet-in/packet-out seam
//! instead of a raw socket so it can live inside an encrypted session.
//!
//! [`UtpSocket`] dispatches packets to its connections by connection id and accepts
//! incoming SYNs; [`UtpStream`] is the per-connection reader/writer handle. Outbound
//! packets leave through the [`PacketSink`] trait, inbound packets enter through
//! [`UtpSocket::packet_in`].

mod buffer_pool;
mod conn;
mod errors;
mod header;
mod socket;

pub use conn::UtpStream;
pub use errors::UtpError;
pub use header::{Header, PacketType, SelectiveAck};
pub use socket::{PacketSink, UtpSocket};

use std::time::{Duration, SystemTime};

/// The IPv6 minimum MTU is 1280; this follows the BitTorrent implementations in assuming
///  slightly more headroom on real paths.
pub const MIN_MTU: usize = 1438;

/// uTP header of 20 bytes, +2 for the extension entry, and a worst-case selective ACK
///  covering the whole out-of-order receive window.
pub const MAX_HEADER_SIZE: usize = 20 + 2 + (((MAX_UNACKED_INBOUND + 7) / 8) + 3) / 4 * 4;

pub const MAX_PAYLOAD_SIZE: usize = MIN_MTU - MAX_HEADER_SIZE;

/// Maximum out-of-order packets buffered on the receive side.
pub const MAX_UNACKED_INBOUND: usize = 256;

/// Maximum sent-but-unacknowledged segments.
pub const MAX_UNACKED_SENDS: usize = 256;

/// Capacity of the reassembled read buffer; its free space is the advertised window.
pub const READ_BUFFER_LEN: usize = 1 << 20;

pub(crate) const PENDING_SEND_STATE_DELAY: Duration = Duration::from_micros(500);

/// 16-bit wrap-around sequence comparison: `a` is less than `b` iff `a` lies in the
///  32767-wide window before `b`. The exact antipode is not ordered either way.
pub fn seq_less(a: u16, b: u16) -> bool {
    let distance = b.wrapping_sub(a);
    distance != 0 && distance < 0x8000
}

pub(crate) fn seq_less_eq(a: u16, b: u16) -> bool {
    a == b || seq_less(a, b)
}

/// Microsecond timestamp for uTP headers, truncated to 32 bits like every other
///  implementation of the protocol.
pub(crate) fn micros_now() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}
