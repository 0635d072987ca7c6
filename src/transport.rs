use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// This is the seam to the externally-supplied packet delivery primitive: hand one serialized
///  packet to the overlay for best-effort delivery on the given path pair. Introduced as a trait
///  to facilitate mocking the I/O part away for testing.
///
/// `Err` means the packet was not handed off; callers retry with backoff. Successful handoff does
///  *not* imply delivery - loss is handled by the protocol's retransmission machinery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSender: Send + Sync + 'static {
    async fn send_data(&self, local_id: &str, remote_id: &str, data: &[u8]) -> anyhow::Result<()>;
}
