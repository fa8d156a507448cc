//! The file transfer protocol: a downloader asks for a file with an `<prefix>-init` TALK
//! request, the server establishes an encrypted session through an `<prefix>-start`
//! exchange and streams the file body over a uTP connection inside that session.
//!
//! The TALK records are tag/length encoded; see [`messages`]. Transfer state on the
//! client side lives in a single event loop with an explicit transfer table, so the
//! init-response and start-request may arrive in either order.

pub mod client;
pub mod messages;
pub mod server;
pub mod url;

pub use client::{FileClient, FileReader};
pub use server::{FileServer, ServeDir, TransferHandler, TransferRequest};
pub use url::TransferRef;

use thiserror::Error;

use crate::utp::UtpError;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The remote answered `ok = false`, to either the init or the start request.
    #[error("server rejected transfer")]
    Rejected,
    /// No start request arrived within the handshake window.
    #[error("transfer handshake timeout")]
    HandshakeTimeout,
    #[error("client closed")]
    ClientClosed,
    /// `send_file` was called on a request that was never accepted.
    #[error("request was not accepted")]
    NotAccepted,
    #[error("request already accepted")]
    AlreadyAccepted,
    #[error("stream error: {0}")]
    Stream(#[from] UtpError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
