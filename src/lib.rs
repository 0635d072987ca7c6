//! A reliable, ordered, bidirectional session protocol on top of an unreliable packet overlay.
//!
//! The overlay is not part of this crate: the application supplies a [transport::PacketSender]
//!  that can hand a packet to some delivery mechanism (a UDP socket, an overlay network, a relay
//!  chain, ...) for best-effort delivery, and it feeds every packet that arrives into
//!  [session::Session::receive_with_client]. Everything else - retransmission, ordering, flow
//!  control - happens here.
//!
//! ## Design goals
//!
//! * TCP-like semantics over a lossy, reordering packet service: data handed to `write` comes
//!   out of the peer's `read` completely, in order and without duplication
//! * Multi-path: a session is multiplexed over one or more (local, remote) client id pairs.
//!   Every path carries any packet of the session, and each path runs its own congestion
//!   window and retransmission timer so a slow path does not dictate the pace of a fast one
//! * A single session-wide sequence space: paths are interchangeable carriers, not channels.
//!   Receipt is acked on the path a packet arrived on; the ack repairs the send window no
//!   matter which path originally carried the packet
//! * Two delivery modes, chosen at session creation:
//!   * stream (default): writes are coalesced into MTU-sized packets, reads drain whatever
//!     contiguous bytes are buffered
//!   * message (`non_stream`): one write is one packet is one read, with boundaries preserved
//! * Backpressure instead of unbounded buffering: a session-wide byte budget, agreed in the
//!   handshake, bounds the data in flight; writers block (with bounded polling) when it is
//!   exhausted
//! * No unbounded blocking anywhere: every wait is a loop of small, cancellable steps, so
//!   deadlines and close take effect promptly
//!
//! ## Wire format
//!
//! A single packet type carries everything; see [packet::Packet] for the exact layout. In short:
//!  a flags byte, a varint sequence id (0 for packets without sequenced payload), then only the
//!  field groups the flags announce - payload, run-length-encoded ack runs, the cumulative read
//!  count, or the handshake advertisement (window size, MTU, client ids).
//!
//! ## Establishment and teardown
//!
//! The dialer sends a handshake advertising its receive window, MTU and client ids on every
//!  configured path; the acceptor replies in kind. Both sides clamp their *send* parameters to
//!  the peer's advertisement and pair paths by index, up to the smaller id count. Close drains
//!  in-flight data for a configurable linger, then sends one best-effort close packet; the
//!  receiving side tears down immediately.
//!
//! ## Loss handling
//!
//! Each path keeps an adaptive retransmission timeout fed by RTT samples of its own acks. A
//!  sequence id that stays unacked past the timeout is scheduled for retransmission - on any
//!  path - and halves the congestion window of the path that carried it, once per loss event.

pub mod config;
mod connection;
pub mod context;
pub mod error;
pub mod packet;
mod seq;
pub mod session;
pub mod transport;
mod wakeup;
mod window;
