use anyhow::bail;
use std::time::Duration;

/// Tuning knobs of a session. All values have defaults; `validate` is called when a session is
///  created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Message-boundary mode: when true, each `write` becomes exactly one packet and each `read`
    ///  returns exactly one packet's payload. When false (the default), the session is a byte
    ///  stream and writes are coalesced into MTU-sized packets.
    pub non_stream: bool,

    /// Size in *bytes* of the session-wide send and receive windows. This bounds
    ///  `total_bytes_written - remote_bytes_read` on the sender and the buffered backlog on the
    ///  receiver. Advertised to the peer in the handshake; both sides use the minimum of the two
    ///  advertised values for the direction they send in.
    pub session_window_size: u32,

    /// Maximum payload bytes per data packet. The overlay decides what a deliverable packet size
    ///  is, so this is configured rather than discovered. Advertised in the handshake and clamped
    ///  to the peer's value if that is smaller.
    pub mtu: u32,

    /// Initial per-path congestion window in *packets*.
    pub initial_connection_window_size: u32,
    /// Upper bound of the per-path congestion window.
    pub max_connection_window_size: u32,
    /// Lower bound of the per-path congestion window (floor when halving on loss).
    pub min_connection_window_size: u32,

    /// Maximum number of run-length-encoded ack runs per ack packet.
    pub max_ack_seq_list_size: usize,

    /// How often a non-empty write buffer is flushed into a packet even though it has not
    ///  reached MTU size.
    pub flush_interval: Duration,

    /// Grace period on close for buffered data to drain before the close packet is sent.
    ///  Zero skips the drain entirely. Adjustable per session via `set_linger`.
    pub linger: Duration,

    /// Starting value of the per-path adaptive retransmission timeout.
    pub initial_retransmission_timeout: Duration,
    /// Cap of the per-path adaptive retransmission timeout.
    pub max_retransmission_timeout: Duration,

    /// Interval of the per-path ack aggregation loop.
    pub send_ack_interval: Duration,
    /// Interval of the per-path retransmission scan.
    pub check_timeout_interval: Duration,

    /// Interval of the session-wide loop that pushes the cumulative read count to the peer.
    pub check_bytes_read_interval: Duration,
    /// Minimum time since the last transmitted read count before a standalone update is sent.
    pub send_bytes_read_threshold: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            non_stream: false,
            session_window_size: 4 << 20,
            mtu: 1024,
            initial_connection_window_size: 16,
            max_connection_window_size: 256,
            min_connection_window_size: 1,
            max_ack_seq_list_size: 32,
            flush_interval: Duration::from_millis(10),
            linger: Duration::from_millis(1000),
            initial_retransmission_timeout: Duration::from_millis(5000),
            max_retransmission_timeout: Duration::from_millis(10000),
            send_ack_interval: Duration::from_millis(50),
            check_timeout_interval: Duration::from_millis(50),
            check_bytes_read_interval: Duration::from_millis(50),
            send_bytes_read_threshold: Duration::from_millis(10),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu == 0 {
            bail!("mtu must not be zero");
        }
        if self.session_window_size < self.mtu {
            bail!("session window must hold at least one mtu-sized packet");
        }
        if self.min_connection_window_size == 0 {
            bail!("minimum connection window must not be zero");
        }
        if self.min_connection_window_size > self.initial_connection_window_size
            || self.initial_connection_window_size > self.max_connection_window_size
        {
            bail!("connection window bounds must satisfy min <= initial <= max");
        }
        if self.max_ack_seq_list_size == 0 {
            bail!("ack run list size must not be zero");
        }
        Ok(())
    }

    /// Slot count of the sequence-indexed ring buffers. Sized for a window full of MTU packets
    ///  with generous slack for sub-MTU flushes; running out of slots is handled as backpressure,
    ///  not an error.
    pub fn window_packet_capacity(&self) -> usize {
        ((self.session_window_size / self.mtu) as usize * 4).max(1024)
    }
}
