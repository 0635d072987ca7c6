use crate::context::CancelReason;
use thiserror::Error;

/// Public error taxonomy of the session API.
///
/// Internal cancellation reasons never cross the API boundary - they are translated to the
///  deadline / lifecycle variants below before a call returns.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("data size exceeds the session mtu or send window")]
    DataSizeTooLarge,
    #[error("receive window has no room for the packet")]
    ReceiveWindowFull,
    #[error("buffer is too small for the next message")]
    BufferSizeTooSmall,
    #[error("session is already established")]
    SessionEstablished,
    #[error("session is not established yet")]
    SessionNotEstablished,
    #[error("session is closed")]
    SessionClosed,
    #[error("no handshake packet received")]
    MissingHandshake,
    #[error("dial timed out")]
    DialTimeout,
    #[error("read deadline exceeded")]
    ReadDeadlineExceeded,
    #[error("write deadline exceeded")]
    WriteDeadlineExceeded,
}

impl SessionError {
    /// translation for waits bounded by the read context
    pub fn from_read_cancel(reason: CancelReason) -> SessionError {
        match reason {
            CancelReason::Expired => SessionError::ReadDeadlineExceeded,
            CancelReason::Canceled => SessionError::SessionClosed,
        }
    }

    /// translation for waits bounded by the write context
    pub fn from_write_cancel(reason: CancelReason) -> SessionError {
        match reason {
            CancelReason::Expired => SessionError::WriteDeadlineExceeded,
            CancelReason::Canceled => SessionError::SessionClosed,
        }
    }
}
