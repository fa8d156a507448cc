//! Authenticated, reliable, bidirectional byte streams between discv5 nodes,
//! multiplexed over a single UDP socket.
//!
//! The crate combines three cooperating subsystems:
//!
//! * A **session layer** that derives AEAD keys from a pair of 16-byte secrets
//!   exchanged out-of-band (through the discovery substrate's encrypted TALK
//!   request/response), identifies packets by an 8-byte opaque session id, and
//!   encrypts every packet with AES-128-GCM.
//! * A **shared UDP socket** that multiplexes one kernel socket among several
//!   packet handlers plus a fallback "default outlet" pseudo-socket, so a
//!   single port can host the discovery protocol and any number of
//!   sub-protocols side by side.
//! * A **uTP-style stream transport** that runs inside the encrypted session:
//!   sequence numbers with 16-bit wrap-around ordering, selective
//!   acknowledgements, per-segment retransmission with backoff, LEDBAT-flavour
//!   window control and a FIN shutdown handshake.
//!
//! On top of those, the [`xfer`] module implements a small file transfer
//! protocol: the downloader asks for a file via a TALK request, the server
//! initiates the encrypted session and announces the size, and the file body
//! travels over a uTP stream inside that session.
//!
//! ## Session packet format
//!
//! ```ascii
//!  0: session id (8 bytes, BE) - chosen by HKDF during key agreement
//!  8: nonce (12 bytes) - 4-byte BE counter followed by 8 random bytes
//! 20: AES-128-GCM ciphertext of the stream-protocol payload, with the
//!     session id bytes as associated data (includes the 16-byte tag)
//! ```
//!
//! The session envelope adds a total of 8 + 12 + 16 = 36 bytes to the payload.
//!
//! ## Stream packet format (inside the session payload)
//!
//! Classical uTP v1 header, all numbers in network byte order:
//!
//! ```ascii
//!  0: type (high nibble) and version (low nibble, always 1)
//!  1: extension id of the first extension, or 0
//!  2: connection id (u16)
//!  4: timestamp of the sender (u32, microseconds)
//!  8: timestamp difference (u32, microseconds)
//! 12: advertised receive window (u32, bytes)
//! 16: sequence number (u16)
//! 18: acknowledged sequence number (u16)
//! 20: extension chain, then payload
//! ```
//!
//! The only extension in use is the selective-ACK bitmask (id 1), covering the
//! sequence numbers after `ack_nr + 1`.
//!
//! ## Composition
//!
//! [`host::Host`] owns the shared socket, the node identity and the session
//! store, and is the only piece applications need to construct directly. The
//! discovery substrate itself is *not* part of this crate; it is attached
//! through the [`talk::TalkService`] seam and the shared socket's default
//! outlet.

pub mod atomic_cell;
pub mod config;
pub mod host;
pub mod session;
pub mod session_store;
pub mod shared_socket;
pub mod talk;
pub mod utp;
pub mod xfer;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
