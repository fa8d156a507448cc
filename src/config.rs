use std::time::Duration;

use anyhow::bail;

/// Configuration of the shared UDP socket.
#[derive(Clone)]
pub struct SharedSocketConfig {
    /// Size of the receive buffer handed to the kernel per datagram. Datagrams larger than
    ///  this are truncated by the OS, so it must exceed the largest packet any hosted
    ///  protocol sends. Session packets are bounded by the stream transport's MTU plus the
    ///  36-byte session envelope.
    pub recv_buf_len: usize,

    /// Number of unclaimed packets buffered in the default outlet before the receive pump
    ///  is back-pressured.
    pub outlet_queue_len: usize,

    /// How long the receive pump sleeps after a socket error other than "closed", to avoid
    ///  busy-looping on a persistent error condition.
    pub read_error_backoff: Duration,
}

impl Default for SharedSocketConfig {
    fn default() -> Self {
        SharedSocketConfig {
            recv_buf_len: 2048,
            outlet_queue_len: 100,
            read_error_backoff: Duration::from_millis(100),
        }
    }
}

impl SharedSocketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_buf_len < crate::utp::MIN_MTU + crate::session::PACKET_OVERHEAD {
            bail!("receive buffer is smaller than a full session packet");
        }
        if self.outlet_queue_len == 0 {
            bail!("outlet queue must hold at least one packet");
        }
        Ok(())
    }
}

/// Configuration of the session store.
#[derive(Clone)]
pub struct SessionConfig {
    /// Sessions are evicted this long after their last use. Every successful lookup
    ///  refreshes the deadline.
    pub session_timeout: Duration,

    /// Number of decoded payloads buffered for a session that has been established but
    ///  whose consumer is not yet activated. Payloads beyond this are dropped.
    pub max_pending_payloads: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_timeout: Duration::from_secs(10),
            max_pending_payloads: 64,
        }
    }
}

/// Configuration of the stream transport.
#[derive(Clone)]
pub struct UtpConfig {
    /// If a sent segment is not acknowledged within this period from its first
    ///  transmission, the connection is destroyed with an ack-timeout error.
    pub write_timeout: Duration,

    /// The latency assumed for new connections, and the lower bound of the resend timeout.
    ///  It should be higher than the latency expected on most connections, to prevent
    ///  excessive resending to peers that take a long time to respond before there is a
    ///  real estimate of their latency.
    pub initial_latency: Duration,

    /// Maximum received SYNs that have not been accepted yet. Further SYNs are answered
    ///  with a reset to make room.
    pub backlog_len: usize,

    /// How long to wait before sending a state packet after one is required. This prevents
    ///  spamming a state packet for every packet received - outbound data packets sent
    ///  within the window fill the role instead.
    pub pending_send_state_delay: Duration,

    /// How long a cleanly closed connection lingers before its resources are torn down.
    ///  The linger period lets late retransmissions of the peer's final packets be
    ///  acknowledged instead of triggering resets.
    pub fin_linger: Duration,

    /// Number of MTU-sized segment buffers retained in the send pool.
    pub buffer_pool_size: usize,
}

impl Default for UtpConfig {
    fn default() -> Self {
        UtpConfig {
            write_timeout: Duration::from_secs(15),
            initial_latency: Duration::from_millis(400),
            backlog_len: 50,
            pending_send_state_delay: Duration::from_micros(500),
            fin_linger: Duration::from_secs(1),
            buffer_pool_size: 256,
        }
    }
}

impl UtpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.write_timeout <= self.initial_latency {
            bail!("write timeout must exceed the initial latency, or every connection times out on its first resend");
        }
        if self.backlog_len == 0 {
            bail!("backlog must hold at least one connection");
        }
        Ok(())
    }
}

/// Configuration shared by the file transfer client and server.
#[derive(Clone)]
pub struct TransferConfig {
    /// Protocol name prefix. The TALK protocols are `<prefix>-init` and `<prefix>-start`,
    ///  and `<prefix>` is the session-derivation protocol tag.
    pub prefix: String,

    /// How long the client waits for the server's start request after a successful init.
    pub start_timeout: Duration,

    /// How long an incoming request may stay un-accepted before it is rejected. Applies to
    ///  the server's init handler waiting for the application and to the client's start
    ///  handler waiting for the transfer table.
    pub accept_timeout: Duration,

    /// How long the server waits for the start response before retrying once. TALK is
    ///  request/response over datagrams, so a lost response is possible on some paths.
    pub start_retry_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            prefix: "xfer".to_string(),
            start_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_millis(500),
            start_retry_delay: Duration::from_millis(20),
        }
    }
}

impl TransferConfig {
    pub fn init_protocol(&self) -> String {
        format!("{}-init", self.prefix)
    }

    pub fn start_protocol(&self) -> String {
        format!("{}-start", self.prefix)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prefix.is_empty() {
            bail!("protocol prefix must not be empty");
        }
        if !self.prefix.is_ascii() {
            bail!("protocol prefix must be ASCII");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        SharedSocketConfig::default().validate().unwrap();
        UtpConfig::default().validate().unwrap();
        TransferConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_prefix() {
        let cfg = TransferConfig {
            prefix: "".to_string(),
            ..TransferConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_write_timeout() {
        let cfg = UtpConfig {
            write_timeout: Duration::from_millis(100),
            ..UtpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
