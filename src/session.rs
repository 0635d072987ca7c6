use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::SessionError;
use crate::packet::Packet;
use crate::seq::Seq;
use crate::transport::PacketSender;
use crate::wakeup::{bounded_wait, Wakeup};
use crate::window::SeqBuffer;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, interval, Instant, MissedTickBehavior};
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// step size of the bounded waits in the blocking operations
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// time bound on the best-effort close packet, independent of linger
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// A reliable, ordered, bidirectional byte stream (or message pipe, see
///  [SessionConfig::non_stream]) between two endpoints of an unreliable packet overlay,
///  multiplexed over one or more (local, remote) client id path pairs.
///
/// Sessions must be created and used inside a tokio runtime. Dropping the last handle cancels
///  all internal loops.
pub struct Session {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    pub(crate) config: Arc<SessionConfig>,
    local_addr: String,
    remote_addr: String,
    local_client_ids: Vec<String>,
    pub(crate) sender: Arc<dyn PacketSender>,
    /// root context, resolves when the session unwinds
    pub(crate) ctx: Context,
    /// raised when the handshake completes
    accept_wakeup: Wakeup,
    /// raised when the peer freed send budget (read-count updates, acked ring slots)
    send_window_wakeup: Wakeup,
    /// raised when the head of the receive window becomes available
    recv_wakeup: Wakeup,
    /// raised when a sequence id is queued for (re)transmission
    pub(crate) send_queue_wakeup: Wakeup,
    pub(crate) inner: RwLock<SessionInner>,
}

pub(crate) struct SessionInner {
    remote_client_ids: Vec<String>,
    /// send-side byte budget: MIN(local config, peer's handshake advertisement)
    send_window_size: u32,
    /// send-side packet payload bound: MIN(local config, peer's handshake advertisement)
    send_mtu: u32,

    send_window_start_seq: Seq,
    send_window_end_seq: Seq,
    /// serialized, sequenced packets awaiting acknowledgement, indexed by sequence id
    pub(crate) send_window_data: SeqBuffer<Bytes>,
    /// pending sub-MTU write coalescing buffer (stream mode)
    send_buffer: Vec<u8>,
    pub(crate) send_queue: VecDeque<Seq>,
    pub(crate) resend_queue: VecDeque<Seq>,

    receive_window_start_seq: Seq,
    receive_window_data: SeqBuffer<Vec<u8>>,
    /// bytes currently buffered in the receive window
    receive_window_used: u64,

    total_bytes_written: u64,
    pub(crate) total_bytes_read: u64,
    /// peer's cumulative read count - the other half of the send-side byte budget
    remote_bytes_read: u64,
    /// when the local read count last grew
    bytes_read_update_time: Instant,
    /// when the local read count was last transmitted (piggy-backed or standalone)
    pub(crate) bytes_read_sent_time: Instant,

    is_established: bool,
    pub(crate) is_closed: bool,
    loops_started: bool,
    linger: Duration,

    /// bounds blocking reads; replaced by `set_read_deadline`
    read_ctx: Context,
    /// bounds blocking writes; replaced by `set_write_deadline`
    write_ctx: Context,

    connections: FxHashMap<(String, String), Arc<Connection>>,
    loop_handles: Vec<JoinHandle<()>>,
}

impl SessionInner {
    /// Turns the pending write buffer (if any) into the next sequenced packet. Returns false
    ///  when the ring slot for the next sequence id is still occupied by an unacked packet -
    ///  that is backpressure, the caller retries after acks arrive.
    fn try_flush(&mut self) -> bool {
        if self.send_buffer.is_empty() {
            return true;
        }
        let seq = self.send_window_end_seq;
        if self.send_window_data.is_blocked(seq) {
            return false;
        }

        let payload = std::mem::take(&mut self.send_buffer);
        trace!("flushing packet #{} ({} bytes)", seq, payload.len());
        let packet = Packet {
            sequence_id: seq.to_raw(),
            data: payload,
            ..Packet::default()
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        let _ = self.send_window_data.insert(seq, buf.freeze());
        self.send_window_end_seq = seq.next();
        self.send_queue.push_back(seq);
        true
    }

    /// available send budget in bytes
    fn send_window_available(&self) -> u64 {
        (self.send_window_size as u64).saturating_sub(
            self.total_bytes_written.saturating_sub(self.remote_bytes_read))
    }
}

impl Session {
    /// Creates a session over `sender`. The acceptor side may pass an empty `remote_client_ids`
    ///  list - it learns the peer's client ids from the handshake.
    pub fn new(
        config: SessionConfig,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        local_client_ids: Vec<String>,
        remote_client_ids: Vec<String>,
        sender: Arc<dyn PacketSender>,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        if local_client_ids.is_empty() {
            bail!("at least one local client id is required");
        }

        let config = Arc::new(config);
        let capacity = config.window_packet_capacity();
        let ctx = Context::background();
        let now = Instant::now();

        let inner = SessionInner {
            remote_client_ids,
            send_window_size: config.session_window_size,
            send_mtu: config.mtu,
            send_window_start_seq: Seq::MIN,
            send_window_end_seq: Seq::MIN,
            send_window_data: SeqBuffer::new(capacity),
            send_buffer: Vec::new(),
            send_queue: VecDeque::new(),
            resend_queue: VecDeque::new(),
            receive_window_start_seq: Seq::MIN,
            receive_window_data: SeqBuffer::new(capacity),
            receive_window_used: 0,
            total_bytes_written: 0,
            total_bytes_read: 0,
            remote_bytes_read: 0,
            bytes_read_update_time: now,
            bytes_read_sent_time: now,
            is_established: false,
            is_closed: false,
            loops_started: false,
            linger: config.linger,
            read_ctx: ctx.child(),
            write_ctx: ctx.child(),
            connections: FxHashMap::default(),
            loop_handles: Vec::new(),
        };

        Ok(Session {
            shared: Arc::new(SessionShared {
                config,
                local_addr: local_addr.into(),
                remote_addr: remote_addr.into(),
                local_client_ids,
                sender,
                ctx,
                accept_wakeup: Wakeup::new(),
                send_window_wakeup: Wakeup::new(),
                recv_wakeup: Wakeup::new(),
                send_queue_wakeup: Wakeup::new(),
                inner: RwLock::new(inner),
            }),
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.shared.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    pub async fn is_established(&self) -> bool {
        self.shared.inner.read().await.is_established
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.inner.read().await.is_closed
    }

    pub async fn set_linger(&self, linger: Duration) {
        self.shared.inner.write().await.linger = linger;
    }

    /// Bounds all *subsequent* blocking reads. Readers already blocked pick the new deadline up
    ///  on their next poll step.
    pub async fn set_read_deadline(&self, deadline: Duration) {
        let ctx = self.shared.ctx.child_with_timeout(deadline);
        self.shared.inner.write().await.read_ctx = ctx;
    }

    pub async fn set_write_deadline(&self, deadline: Duration) {
        let ctx = self.shared.ctx.child_with_timeout(deadline);
        self.shared.inner.write().await.write_ctx = ctx;
    }

    /// Active-side establishment: sends a handshake on all configured paths and waits (up to
    ///  `timeout`) for the peer's handshake to arrive via [Session::receive_with_client].
    pub async fn dial(&self, timeout: Duration) -> anyhow::Result<()> {
        {
            let inner = self.shared.inner.read().await;
            if inner.is_closed {
                return Err(SessionError::SessionClosed.into());
            }
            if inner.is_established {
                return Err(SessionError::SessionEstablished.into());
            }
            if inner.remote_client_ids.is_empty() {
                bail!("dialing requires at least one remote client id");
            }
        }

        self.send_handshake().await?;

        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.inner.read().await.is_established {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::DialTimeout.into());
            }
            let step = WAIT_POLL_INTERVAL.min(deadline - now);
            if bounded_wait(&self.shared.ctx, &self.shared.accept_wakeup, step).await.is_err() {
                return Err(SessionError::SessionClosed.into());
            }
        }

        self.start_loops().await;
        debug!("session {} -> {} established (dialer)", self.shared.local_addr, self.shared.remote_addr);
        Ok(())
    }

    /// Passive-side establishment: waits for the peer's handshake, then replies with our own.
    ///  Fails with [SessionError::MissingHandshake] when the session unwinds first.
    pub async fn accept(&self) -> anyhow::Result<()> {
        loop {
            {
                let inner = self.shared.inner.read().await;
                if inner.is_established {
                    break;
                }
                if inner.is_closed {
                    return Err(SessionError::MissingHandshake.into());
                }
            }
            if bounded_wait(&self.shared.ctx, &self.shared.accept_wakeup, WAIT_POLL_INTERVAL).await.is_err() {
                return Err(SessionError::MissingHandshake.into());
            }
        }

        self.start_loops().await;
        self.send_handshake().await?;
        debug!("session {} -> {} established (acceptor)", self.shared.local_addr, self.shared.remote_addr);
        Ok(())
    }

    /// Sends our handshake over all paired paths. Succeeds if at least one path accepted the
    ///  handoff.
    async fn send_handshake(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        let packet = Packet {
            is_handshake: true,
            client_ids: shared.local_client_ids.clone(),
            window_size: shared.config.session_window_size,
            mtu: shared.config.mtu,
            ..Packet::default()
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        let remote_ids = shared.inner.read().await.remote_client_ids.clone();
        let num_paths = shared.local_client_ids.len().min(remote_ids.len());

        let mut delivered = false;
        let mut last_err = None;
        for i in 0..num_paths {
            match shared.sender.send_data(&shared.local_client_ids[i], &remote_ids[i], &buf).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    debug!("handshake handoff on ({}, {}) failed: {}",
                        shared.local_client_ids[i], remote_ids[i], e);
                    last_err = Some(e);
                }
            }
        }
        if delivered {
            Ok(())
        }
        else {
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no usable path")))
        }
    }

    /// Spawns the per-path loops and the session-wide flush / read-count loops. Idempotent.
    async fn start_loops(&self) {
        let mut inner = self.shared.inner.write().await;
        if inner.loops_started {
            return;
        }
        inner.loops_started = true;

        let mut handles = Vec::new();
        for conn in inner.connections.values() {
            handles.push(tokio::spawn(Connection::send_loop(self.shared.clone(), conn.clone())));
            handles.push(tokio::spawn(Connection::ack_loop(self.shared.clone(), conn.clone())));
            handles.push(tokio::spawn(Connection::timeout_loop(self.shared.clone(), conn.clone())));
        }
        handles.push(tokio::spawn(Self::flush_loop(self.shared.clone())));
        handles.push(tokio::spawn(Self::bytes_read_loop(self.shared.clone())));
        inner.loop_handles.extend(handles);
    }

    /// Writes `data` to the session, blocking (with bounded polling) while the send window or
    ///  the sequence ring is exhausted. Stream mode accepts any size and returns only once all
    ///  of it is buffered; message mode sends exactly one packet.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<usize> {
        {
            let inner = self.shared.inner.read().await;
            if inner.is_closed {
                return Err(SessionError::SessionClosed.into());
            }
            if !inner.is_established {
                return Err(SessionError::SessionNotEstablished.into());
            }
        }
        if data.is_empty() {
            return Ok(0);
        }

        if self.shared.config.non_stream {
            self.write_message(data).await
        }
        else {
            self.write_stream(data).await
        }
    }

    async fn write_message(&self, data: &[u8]) -> anyhow::Result<usize> {
        let shared = &self.shared;
        {
            let inner = shared.inner.read().await;
            if data.len() as u64 > inner.send_mtu as u64
                || data.len() as u64 > inner.send_window_size as u64
            {
                return Err(SessionError::DataSizeTooLarge.into());
            }
        }

        self.wait_for_send_window(data.len() as u64).await?;

        loop {
            {
                let mut inner = shared.inner.write().await;
                if inner.is_closed {
                    return Err(SessionError::SessionClosed.into());
                }
                let seq = inner.send_window_end_seq;
                if !inner.send_window_data.is_blocked(seq) {
                    let packet = Packet {
                        sequence_id: seq.to_raw(),
                        data: data.to_vec(),
                        ..Packet::default()
                    };
                    let mut buf = BytesMut::new();
                    packet.ser(&mut buf);

                    let _ = inner.send_window_data.insert(seq, buf.freeze());
                    inner.send_window_end_seq = seq.next();
                    inner.send_queue.push_back(seq);
                    inner.total_bytes_written += data.len() as u64;
                    drop(inner);

                    shared.send_queue_wakeup.raise();
                    return Ok(data.len());
                }
            }
            self.wait_for_ring_slot().await?;
        }
    }

    async fn write_stream(&self, mut data: &[u8]) -> anyhow::Result<usize> {
        let shared = &self.shared;
        let total = data.len();

        while !data.is_empty() {
            let available = self.wait_for_send_window(1).await?;
            let n = (data.len() as u64).min(available) as usize;
            // when this chunk exhausts the window, flush immediately so the peer can ack
            // and reopen it; otherwise the flush loop picks the buffer up
            let flush_now = n as u64 == available;

            let mut chunk = &data[..n];
            while !chunk.is_empty() {
                let buffer_full = {
                    let mut inner = shared.inner.write().await;
                    if inner.is_closed {
                        return Err(SessionError::SessionClosed.into());
                    }
                    let room = (inner.send_mtu as usize).saturating_sub(inner.send_buffer.len());
                    let take = room.min(chunk.len());
                    inner.send_buffer.extend_from_slice(&chunk[..take]);
                    inner.total_bytes_written += take as u64;
                    chunk = &chunk[take..];
                    inner.send_buffer.len() >= inner.send_mtu as usize
                };
                if buffer_full {
                    self.flush_send_buffer().await?;
                }
            }
            if flush_now {
                self.flush_send_buffer().await?;
            }
            data = &data[n..];
        }
        Ok(total)
    }

    /// Blocks until at least `min_bytes` of send budget are available, returning the available
    ///  amount.
    async fn wait_for_send_window(&self, min_bytes: u64) -> anyhow::Result<u64> {
        let shared = &self.shared;
        loop {
            let (available, ctx) = {
                let inner = shared.inner.read().await;
                if inner.is_closed {
                    return Err(SessionError::SessionClosed.into());
                }
                (inner.send_window_available(), inner.write_ctx.clone())
            };
            if available >= min_bytes {
                return Ok(available);
            }
            if let Err(reason) = bounded_wait(&ctx, &shared.send_window_wakeup, WAIT_POLL_INTERVAL).await {
                return Err(SessionError::from_write_cancel(reason).into());
            }
        }
    }

    /// One bounded wait for acks to free up ring slots.
    async fn wait_for_ring_slot(&self) -> anyhow::Result<()> {
        let ctx = self.shared.inner.read().await.write_ctx.clone();
        if let Err(reason) = bounded_wait(&ctx, &self.shared.send_window_wakeup, WAIT_POLL_INTERVAL).await {
            return Err(SessionError::from_write_cancel(reason).into());
        }
        Ok(())
    }

    /// Flushes the pending write buffer, blocking while the next ring slot is occupied.
    async fn flush_send_buffer(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        loop {
            {
                let mut inner = shared.inner.write().await;
                if inner.send_buffer.is_empty() {
                    return Ok(());
                }
                if inner.is_closed {
                    return Err(SessionError::SessionClosed.into());
                }
                if inner.try_flush() {
                    drop(inner);
                    shared.send_queue_wakeup.raise();
                    return Ok(());
                }
            }
            self.wait_for_ring_slot().await?;
        }
    }

    /// Reads received data in order, blocking (with bounded polling) until at least one byte -
    ///  in message mode, one whole message - is available. Stream mode fills `buf` from as many
    ///  contiguous chunks as are buffered; a chunk larger than the remaining space is split and
    ///  its tail stays at the head of the window.
    pub async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;

        loop {
            {
                let inner = shared.inner.read().await;
                if inner.is_closed {
                    return Err(SessionError::SessionClosed.into());
                }
                if !inner.is_established {
                    return Err(SessionError::SessionNotEstablished.into());
                }
            }

            if let Some(n) = self.try_consume(buf).await? {
                return Ok(n);
            }

            let ctx = shared.inner.read().await.read_ctx.clone();
            if let Err(reason) = bounded_wait(&ctx, &shared.recv_wakeup, WAIT_POLL_INTERVAL).await {
                return Err(SessionError::from_read_cancel(reason).into());
            }
        }
    }

    /// One consumption attempt under a single critical section. `None` means nothing is buffered
    ///  at the head of the receive window yet.
    async fn try_consume(&self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let mut inner = self.shared.inner.write().await;

        if self.shared.config.non_stream {
            let head = inner.receive_window_start_seq;
            let chunk_len = match inner.receive_window_data.get(head) {
                Some(chunk) => chunk.len(),
                None => return Ok(None),
            };
            if buf.len() < chunk_len {
                return Err(SessionError::BufferSizeTooSmall.into());
            }

            let chunk = inner.receive_window_data.remove(head).unwrap();
            buf[..chunk_len].copy_from_slice(&chunk);
            inner.receive_window_start_seq = head.next();
            inner.receive_window_used -= chunk_len as u64;
            inner.total_bytes_read += chunk_len as u64;
            inner.bytes_read_update_time = Instant::now();
            return Ok(Some(chunk_len));
        }

        let mut n = 0;
        loop {
            let head = inner.receive_window_start_seq;
            let chunk_len = match inner.receive_window_data.get(head) {
                Some(chunk) => chunk.len(),
                None => break,
            };
            let room = buf.len() - n;
            if room == 0 {
                break;
            }

            if chunk_len <= room {
                let chunk = inner.receive_window_data.remove(head).unwrap();
                buf[n..n + chunk_len].copy_from_slice(&chunk);
                inner.receive_window_start_seq = head.next();
                n += chunk_len;
            }
            else {
                // split the chunk: consume `room` bytes, the tail stays at the same seq
                let mut chunk = inner.receive_window_data.remove(head).unwrap();
                buf[n..].copy_from_slice(&chunk[..room]);
                let tail = chunk.split_off(room);
                let _ = inner.receive_window_data.insert(head, tail);
                n += room;
                break;
            }
        }

        if n == 0 {
            return Ok(None);
        }
        inner.receive_window_used -= n as u64;
        inner.total_bytes_read += n as u64;
        inner.bytes_read_update_time = Instant::now();
        Ok(Some(n))
    }

    /// Entry point for inbound packets: the overlay calls this with every packet addressed to
    ///  this session, along with the (local, remote) client id pair it arrived on.
    pub async fn receive_with_client(&self, local_id: &str, remote_id: &str, raw: &[u8]) -> anyhow::Result<()> {
        let correlation_id = Uuid::new_v4();
        self.do_receive(local_id, remote_id, raw)
            .instrument(span!(Level::TRACE, "session_receive", ?correlation_id))
            .await
    }

    async fn do_receive(&self, local_id: &str, remote_id: &str, raw: &[u8]) -> anyhow::Result<()> {
        let packet = match Packet::deser(&mut &raw[..]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("unparseable packet on ({}, {}): {}", local_id, remote_id, e);
                return Err(SessionError::InvalidPacket("unparseable packet").into());
            }
        };
        trace!("received packet #{} on ({}, {})", packet.sequence_id, local_id, remote_id);

        if packet.is_close {
            self.handle_close().await;
            return Ok(());
        }

        {
            let inner = self.shared.inner.read().await;
            if inner.is_closed {
                return Err(SessionError::SessionClosed.into());
            }
            if !inner.is_established {
                if packet.is_handshake {
                    drop(inner);
                    return self.handle_handshake(packet).await;
                }
                debug!("dropping packet on ({}, {}): session not established", local_id, remote_id);
                return Err(SessionError::SessionNotEstablished.into());
            }
        }
        if packet.is_handshake {
            // duplicate handshake, e.g. a retried dial - only this frame is rejected
            return Err(SessionError::SessionEstablished.into());
        }

        if !packet.ack_start_seqs.is_empty() {
            self.handle_acks(&packet, local_id, remote_id).await?;
        }

        if packet.bytes_read > 0 {
            let updated = {
                let mut inner = self.shared.inner.write().await;
                if packet.bytes_read > inner.remote_bytes_read {
                    inner.remote_bytes_read = packet.bytes_read;
                    true
                }
                else {
                    false
                }
            };
            if updated {
                self.shared.send_window_wakeup.raise();
            }
        }

        if let Some(seq) = Seq::from_raw(packet.sequence_id) {
            self.handle_data(seq, packet.data, local_id, remote_id).await?;
        }
        Ok(())
    }

    async fn handle_handshake(&self, packet: Packet) -> anyhow::Result<()> {
        if packet.window_size == 0 || packet.mtu == 0 || packet.client_ids.is_empty() {
            return Err(SessionError::InvalidPacket("handshake without window, mtu or client ids").into());
        }

        let shared = &self.shared;
        {
            let mut inner = shared.inner.write().await;
            if inner.is_established {
                return Ok(());
            }

            inner.send_window_size = inner.send_window_size.min(packet.window_size);
            inner.send_mtu = inner.send_mtu.min(packet.mtu);
            inner.remote_client_ids = packet.client_ids;

            let num_paths = shared.local_client_ids.len().min(inner.remote_client_ids.len());
            for i in 0..num_paths {
                let local = shared.local_client_ids[i].clone();
                let remote = inner.remote_client_ids[i].clone();
                debug!("pairing path ({}, {})", local, remote);
                let conn = Arc::new(Connection::new(shared.config.clone(), local.clone(), remote.clone()));
                inner.connections.insert((local, remote), conn);
            }
            inner.is_established = true;
        }
        shared.accept_wakeup.raise();
        Ok(())
    }

    /// Applies run-length-encoded acks to the send window and feeds every acked sequence id to
    ///  all connections - only the path the ack arrived on takes an RTT sample.
    async fn handle_acks(&self, packet: &Packet, local_id: &str, remote_id: &str) -> anyhow::Result<()> {
        if !packet.ack_seq_counts.is_empty()
            && packet.ack_seq_counts.len() != packet.ack_start_seqs.len()
        {
            return Err(SessionError::InvalidPacket("ack starts and counts disagree").into());
        }

        let shared = &self.shared;
        let mut acked: Vec<Seq> = Vec::new();
        {
            let mut inner = shared.inner.write().await;
            for (i, &start) in packet.ack_start_seqs.iter().enumerate() {
                let count = packet.ack_seq_counts.get(i).copied().unwrap_or(1);
                let mut seq = match Seq::from_raw(start) {
                    Some(seq) => seq,
                    None => return Err(SessionError::InvalidPacket("ack run starting at reserved id 0").into()),
                };
                for _ in 0..count {
                    if Seq::is_between(inner.send_window_start_seq, inner.send_window_end_seq, seq) {
                        inner.send_window_data.remove(seq);
                        acked.push(seq);
                    }
                    seq = seq.next();
                }
            }

            // slide the window start over everything acked at the front
            while inner.send_window_start_seq != inner.send_window_end_seq
                && !inner.send_window_data.contains(inner.send_window_start_seq)
            {
                inner.send_window_start_seq = inner.send_window_start_seq.next();
            }
        }
        shared.send_window_wakeup.raise();

        let connections: Vec<(bool, Arc<Connection>)> = {
            let inner = shared.inner.read().await;
            inner.connections.iter()
                .map(|((local, remote), conn)| {
                    (local == local_id && remote == remote_id, conn.clone())
                })
                .collect()
        };
        for &seq in &acked {
            for (is_sent_by_me, conn) in &connections {
                conn.receive_ack(seq, *is_sent_by_me).await;
            }
        }
        Ok(())
    }

    async fn handle_data(&self, seq: Seq, data: Vec<u8>, local_id: &str, remote_id: &str) -> anyhow::Result<()> {
        let shared = &self.shared;
        if data.len() as u64 > shared.config.mtu as u64 {
            return Err(SessionError::InvalidPacket("payload exceeds the receive mtu").into());
        }

        let mut head_arrived = false;
        {
            let mut inner = shared.inner.write().await;
            let start = inner.receive_window_start_seq;
            let is_fresh = seq.circular_cmp(start) != Ordering::Less
                && !inner.receive_window_data.contains(seq);

            if is_fresh {
                let len = data.len() as u64;
                if inner.receive_window_used + len > shared.config.session_window_size as u64 {
                    // no room, no ack - the peer retransmits after its timeout
                    return Err(SessionError::ReceiveWindowFull.into());
                }
                if inner.receive_window_data.insert(seq, data).is_err() {
                    return Err(SessionError::ReceiveWindowFull.into());
                }
                inner.receive_window_used += len;
                head_arrived = seq == start;
            }
            // stale or duplicate packets fall through: re-acked below in case the ack was lost
        }
        if head_arrived {
            shared.recv_wakeup.raise();
        }

        let conn = shared.inner.read().await
            .connections.get(&(local_id.to_string(), remote_id.to_string())).cloned();
        match conn {
            Some(conn) => conn.send_ack(seq).await,
            None => debug!("data packet on unknown path ({}, {})", local_id, remote_id),
        }
        Ok(())
    }

    /// Graceful close. Never fails: with a non-zero linger it flushes and waits (up to linger)
    ///  for in-flight data to be acked, then sends one best-effort, time-bounded close packet
    ///  and unwinds.
    pub async fn close(&self) {
        let shared = &self.shared;
        let linger = {
            let mut inner = shared.inner.write().await;
            if inner.is_closed {
                return;
            }
            inner.read_ctx.cancel();
            inner.write_ctx.cancel();
            inner.linger
        };

        if !linger.is_zero() {
            {
                shared.inner.write().await.try_flush();
            }
            shared.send_queue_wakeup.raise();

            let deadline = Instant::now() + linger;
            loop {
                {
                    let inner = shared.inner.read().await;
                    if inner.send_window_start_seq == inner.send_window_end_seq
                        && inner.send_buffer.is_empty()
                    {
                        break;
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    debug!("session {} -> {}: linger elapsed with data still in flight",
                        shared.local_addr, shared.remote_addr);
                    break;
                }
                time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
            }
        }

        let _ = time::timeout(CLOSE_SEND_TIMEOUT, self.send_close_packet()).await;

        shared.inner.write().await.is_closed = true;
        shared.ctx.cancel();
        self.raise_all();
        debug!("session {} -> {} closed", shared.local_addr, shared.remote_addr);
    }

    /// Peer-initiated close: no linger, no close packet of our own. Idempotent.
    async fn handle_close(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.write().await;
            if inner.is_closed {
                return;
            }
            inner.is_closed = true;
            inner.read_ctx.cancel();
            inner.write_ctx.cancel();
        }
        shared.ctx.cancel();
        self.raise_all();
        debug!("session {} -> {} closed by peer", shared.local_addr, shared.remote_addr);
    }

    /// wake all blocked callers so they observe the closed state
    fn raise_all(&self) {
        self.shared.accept_wakeup.raise();
        self.shared.send_window_wakeup.raise();
        self.shared.recv_wakeup.raise();
        self.shared.send_queue_wakeup.raise();
    }

    async fn send_close_packet(&self) {
        let shared = &self.shared;
        let packet = Packet {
            is_close: true,
            ..Packet::default()
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        let pairs: Vec<(String, String)> = {
            let inner = shared.inner.read().await;
            if inner.connections.is_empty() {
                // never established - fall back to the configured pairing
                let num_paths = shared.local_client_ids.len().min(inner.remote_client_ids.len());
                (0..num_paths)
                    .map(|i| (shared.local_client_ids[i].clone(), inner.remote_client_ids[i].clone()))
                    .collect()
            }
            else {
                inner.connections.keys().cloned().collect()
            }
        };

        for (local, remote) in pairs {
            if shared.sender.send_data(&local, &remote, &buf).await.is_ok() {
                return;
            }
        }
    }

    /// Session-wide loop turning the pending write buffer into packets every FlushInterval.
    async fn flush_loop(shared: Arc<SessionShared>) {
        let mut ticker = interval(shared.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.ctx.done() => return,
            }

            {
                let mut inner = shared.inner.write().await;
                if inner.send_buffer.is_empty() || !inner.try_flush() {
                    continue;
                }
            }
            shared.send_queue_wakeup.raise();
        }
    }

    /// Session-wide loop pushing the cumulative read count to the peer when it has grown and no
    ///  ack has carried it for SendBytesReadThreshold.
    async fn bytes_read_loop(shared: Arc<SessionShared>) {
        let config = shared.config.clone();
        let mut ticker = interval(config.check_bytes_read_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.ctx.done() => return,
            }

            let bytes_read = {
                let inner = shared.inner.read().await;
                if inner.bytes_read_update_time <= inner.bytes_read_sent_time
                    || inner.bytes_read_sent_time.elapsed() < config.send_bytes_read_threshold
                {
                    continue;
                }
                inner.total_bytes_read
            };

            let packet = Packet {
                bytes_read,
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);

            let connections: Vec<Arc<Connection>> = shared.inner.read().await
                .connections.values().cloned().collect();
            for conn in connections {
                if shared.sender.send_data(&conn.local_client_id, &conn.remote_client_id, &buf).await.is_ok() {
                    shared.inner.write().await.bytes_read_sent_time = Instant::now();
                    break;
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPacketSender;
    use async_trait::async_trait;
    use rstest::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    /// Lossless in-memory overlay with optional one-shot loss injection per sequence id.
    struct LoopbackSender {
        tx: mpsc::UnboundedSender<(String, String, Vec<u8>)>,
        /// transmission count per data sequence id
        transmissions: Mutex<FxHashMap<u32, u32>>,
        /// sequence ids to swallow once (handed off 'successfully' but never delivered)
        drop_once: Mutex<HashSet<u32>>,
        close_packets: Mutex<u32>,
    }

    impl LoopbackSender {
        fn new(tx: mpsc::UnboundedSender<(String, String, Vec<u8>)>) -> LoopbackSender {
            LoopbackSender {
                tx,
                transmissions: Mutex::new(FxHashMap::default()),
                drop_once: Mutex::new(HashSet::new()),
                close_packets: Mutex::new(0),
            }
        }

        fn drop_once(&self, raw_seq: u32) {
            self.drop_once.lock().unwrap().insert(raw_seq);
        }

        fn transmissions(&self, raw_seq: u32) -> u32 {
            self.transmissions.lock().unwrap().get(&raw_seq).copied().unwrap_or(0)
        }

        fn close_packets(&self) -> u32 {
            *self.close_packets.lock().unwrap()
        }
    }

    #[async_trait]
    impl PacketSender for LoopbackSender {
        async fn send_data(&self, local_id: &str, remote_id: &str, data: &[u8]) -> anyhow::Result<()> {
            if let Ok(packet) = Packet::deser(&mut &data[..]) {
                if packet.is_close {
                    *self.close_packets.lock().unwrap() += 1;
                }
                if packet.sequence_id != 0 {
                    *self.transmissions.lock().unwrap().entry(packet.sequence_id).or_insert(0) += 1;
                    if self.drop_once.lock().unwrap().remove(&packet.sequence_id) {
                        // lost in the overlay: handoff succeeded, delivery did not happen
                        return Ok(());
                    }
                }
            }
            self.tx.send((local_id.to_string(), remote_id.to_string(), data.to_vec())).ok();
            Ok(())
        }
    }

    /// delivers each packet to the peer; the sender's local id is the receiver's remote id
    fn spawn_pump(mut rx: mpsc::UnboundedReceiver<(String, String, Vec<u8>)>, target: Arc<Session>) {
        tokio::spawn(async move {
            while let Some((local, remote, data)) = rx.recv().await {
                let _ = target.receive_with_client(&remote, &local, &data).await;
            }
        });
    }

    fn session_pair(
        config_a: SessionConfig,
        config_b: SessionConfig,
        num_paths: usize,
    ) -> (Arc<Session>, Arc<Session>, Arc<LoopbackSender>, Arc<LoopbackSender>) {
        let ids_a: Vec<String> = (0..num_paths).map(|i| format!("a{}", i)).collect();
        let ids_b: Vec<String> = (0..num_paths).map(|i| format!("b{}", i)).collect();

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let sender_a = Arc::new(LoopbackSender::new(tx_a));
        let sender_b = Arc::new(LoopbackSender::new(tx_b));

        let a = Arc::new(Session::new(
            config_a, "alice", "bob", ids_a.clone(), ids_b.clone(), sender_a.clone()).unwrap());
        // the acceptor learns the remote ids from the handshake
        let b = Arc::new(Session::new(
            config_b, "bob", "alice", ids_b, Vec::new(), sender_b.clone()).unwrap());

        spawn_pump(rx_a, b.clone());
        spawn_pump(rx_b, a.clone());
        (a, b, sender_a, sender_b)
    }

    async fn establish(a: &Arc<Session>, b: &Arc<Session>) {
        let accept = tokio::spawn({
            let b = b.clone();
            async move { b.accept().await }
        });
        a.dial(Duration::from_secs(5)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    fn assert_err(result: anyhow::Result<impl std::fmt::Debug>, expected: SessionError) {
        let err = result.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&expected));
    }

    #[rstest]
    fn test_establish_and_transfer_in_order() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 2);
            establish(&a, &b).await;
            assert!(a.is_established().await);
            assert!(b.is_established().await);
            assert_eq!(a.shared.inner.read().await.connections.len(), 2);
            assert_eq!(b.shared.inner.read().await.connections.len(), 2);

            let chunks: Vec<Vec<u8>> = (0u8..5).map(|i| vec![3 * i, 3 * i + 1, 3 * i + 2]).collect();
            for chunk in &chunks {
                assert_eq!(a.write(chunk).await.unwrap(), 3);
            }

            for expected in &chunks {
                let mut buf = [0u8; 3];
                let n = b.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], &expected[..n]);
                // a flush boundary may split a chunk - drain the rest
                let mut got = buf[..n].to_vec();
                while got.len() < 3 {
                    let mut rest = [0u8; 3];
                    let n = b.read(&mut rest[..3 - got.len()]).await.unwrap();
                    got.extend_from_slice(&rest[..n]);
                }
                assert_eq!(&got, expected);
            }
        });
    }

    #[rstest]
    fn test_handshake_clamps_to_peer_advertisement() {
        paused_rt().block_on(async {
            let config_a = SessionConfig::default();
            let config_b = SessionConfig {
                session_window_size: 2 << 20,
                mtu: 512,
                ..SessionConfig::default()
            };
            let (a, b, _, _) = session_pair(config_a, config_b, 1);
            establish(&a, &b).await;

            let inner_a = a.shared.inner.read().await;
            assert_eq!(inner_a.send_window_size, 2 << 20);
            assert_eq!(inner_a.send_mtu, 512);

            let inner_b = b.shared.inner.read().await;
            assert_eq!(inner_b.send_window_size, 2 << 20);
            assert_eq!(inner_b.send_mtu, 512);
        });
    }

    #[rstest]
    fn test_lost_packet_is_retransmitted_once_and_window_halved() {
        paused_rt().block_on(async {
            let (a, b, sender_a, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 2);
            establish(&a, &b).await;

            sender_a.drop_once(1);
            a.write(&[9, 9, 9]).await.unwrap();

            // blocks until the retransmission timer fires (~5s virtual time) and redelivers
            let mut buf = [0u8; 3];
            assert_eq!(b.read(&mut buf).await.unwrap(), 3);
            assert_eq!(buf, [9, 9, 9]);
            assert_eq!(sender_a.transmissions(1), 2);

            // let the ack settle
            time::sleep(Duration::from_millis(200)).await;
            assert_eq!(sender_a.transmissions(1), 2);

            let mut windows = Vec::new();
            for conn in a.shared.inner.read().await.connections.values() {
                windows.push(conn.window_size().await);
            }
            windows.sort_by(|x, y| x.partial_cmp(y).unwrap());
            // the path that lost the packet was halved (plus at most one ack of growth),
            // the other path was not
            assert!(windows[0] <= 9.0, "windows: {:?}", windows);
            assert!(windows[1] >= 16.0, "windows: {:?}", windows);
        });
    }

    #[rstest]
    fn test_close_with_zero_linger_still_sends_close_packet() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                linger: Duration::ZERO,
                ..SessionConfig::default()
            };
            let (a, b, sender_a, _) = session_pair(config.clone(), config, 1);
            establish(&a, &b).await;

            a.close().await;
            assert!(a.is_closed().await);
            assert_eq!(sender_a.close_packets(), 1);

            // the peer observes the close
            time::sleep(Duration::from_millis(100)).await;
            assert!(b.is_closed().await);
            assert_err(a.write(&[1]).await, SessionError::SessionClosed);
        });
    }

    #[rstest]
    fn test_close_lingers_until_data_is_acked() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;

            let reader = tokio::spawn({
                let b = b.clone();
                async move {
                    let mut buf = [0u8; 16];
                    b.read(&mut buf).await.map(|n| buf[..n].to_vec())
                }
            });

            a.write(&[1, 2, 3, 4]).await.unwrap();
            a.close().await;

            assert_eq!(reader.await.unwrap().unwrap(), vec![1, 2, 3, 4]);
            // the drain completed: everything was acked before the close packet went out
            let inner = a.shared.inner.read().await;
            assert_eq!(inner.send_window_start_seq, inner.send_window_end_seq);
        });
    }

    #[rstest]
    fn test_message_mode_preserves_boundaries() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                non_stream: true,
                ..SessionConfig::default()
            };
            let (a, b, _, _) = session_pair(config.clone(), config, 1);
            establish(&a, &b).await;

            a.write(&[1, 2, 3]).await.unwrap();
            a.write(&[4, 5]).await.unwrap();

            let mut buf = [0u8; 16];
            assert_eq!(b.read(&mut buf).await.unwrap(), 3);
            assert_eq!(&buf[..3], &[1, 2, 3]);
            assert_eq!(b.read(&mut buf).await.unwrap(), 2);
            assert_eq!(&buf[..2], &[4, 5]);
        });
    }

    #[rstest]
    fn test_message_mode_rejects_oversized_write_and_undersized_read() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                non_stream: true,
                ..SessionConfig::default()
            };
            let (a, b, _, _) = session_pair(config.clone(), config, 1);
            establish(&a, &b).await;

            let oversized = vec![0u8; 1025];
            assert_err(a.write(&oversized).await, SessionError::DataSizeTooLarge);

            a.write(&[1, 2, 3]).await.unwrap();
            time::sleep(Duration::from_millis(100)).await;
            let mut too_small = [0u8; 2];
            assert_err(b.read(&mut too_small).await, SessionError::BufferSizeTooSmall);

            // the message is still there for a properly sized buffer
            let mut buf = [0u8; 3];
            assert_eq!(b.read(&mut buf).await.unwrap(), 3);
        });
    }

    #[rstest]
    fn test_byte_budget_is_never_exceeded() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                session_window_size: 2048,
                mtu: 512,
                ..SessionConfig::default()
            };
            let (a, b, _, _) = session_pair(config.clone(), config, 1);
            establish(&a, &b).await;

            let writer = tokio::spawn({
                let a = a.clone();
                async move {
                    for _ in 0..10 {
                        a.write(&[7u8; 400]).await.unwrap();
                    }
                }
            });

            let mut received = 0usize;
            let mut buf = [0u8; 128];
            while received < 4000 {
                {
                    let inner = a.shared.inner.read().await;
                    assert!(inner.total_bytes_written - inner.remote_bytes_read
                        <= inner.send_window_size as u64);
                }
                received += b.read(&mut buf).await.unwrap();
            }
            writer.await.unwrap();
        });
    }

    #[rstest]
    fn test_receive_window_full_rejects_packet() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                session_window_size: 2048,
                mtu: 1024,
                ..SessionConfig::default()
            };
            let (_a, b, _, _) = session_pair(config.clone(), config, 1);
            establish(&_a, &b).await;

            for raw in 1..=2u32 {
                let packet = Packet {
                    sequence_id: raw,
                    data: vec![0u8; 1024],
                    ..Packet::default()
                };
                let mut buf = BytesMut::new();
                packet.ser(&mut buf);
                b.receive_with_client("b0", "a0", &buf).await.unwrap();
            }

            let packet = Packet {
                sequence_id: 3,
                data: vec![0u8; 1024],
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);
            assert_err(b.receive_with_client("b0", "a0", &buf).await, SessionError::ReceiveWindowFull);
        });
    }

    #[rstest]
    fn test_stale_packet_is_reacked_but_not_buffered() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;

            a.write(&[1, 2, 3]).await.unwrap();
            let mut buf = [0u8; 3];
            assert_eq!(b.read(&mut buf).await.unwrap(), 3);

            // replay of seq 1: window start has moved past it
            let packet = Packet {
                sequence_id: 1,
                data: vec![1, 2, 3],
                ..Packet::default()
            };
            let mut raw = BytesMut::new();
            packet.ser(&mut raw);
            b.receive_with_client("b0", "a0", &raw).await.unwrap();

            let inner = b.shared.inner.read().await;
            assert_eq!(inner.receive_window_used, 0);
            assert_eq!(inner.receive_window_start_seq, Seq::from_raw(2).unwrap());
        });
    }

    #[rstest]
    fn test_handshake_with_zero_window_is_rejected() {
        paused_rt().block_on(async {
            let (_a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);

            let packet = Packet {
                is_handshake: true,
                client_ids: vec!["a0".into()],
                window_size: 0,
                mtu: 1024,
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);
            assert_err(
                b.receive_with_client("b0", "a0", &buf).await,
                SessionError::InvalidPacket("handshake without window, mtu or client ids"),
            );
            assert!(!b.is_established().await);
        });
    }

    #[rstest]
    fn test_data_before_handshake_is_rejected() {
        paused_rt().block_on(async {
            let (_a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);

            let packet = Packet {
                sequence_id: 1,
                data: vec![1],
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);
            assert_err(b.receive_with_client("b0", "a0", &buf).await, SessionError::SessionNotEstablished);
        });
    }

    #[rstest]
    fn test_duplicate_handshake_after_establishment_is_rejected() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;

            let packet = Packet {
                is_handshake: true,
                client_ids: vec!["a0".into()],
                window_size: 1 << 20,
                mtu: 1024,
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);
            assert_err(b.receive_with_client("b0", "a0", &buf).await, SessionError::SessionEstablished);
            // the session itself is unaffected
            assert!(b.is_established().await);
            assert!(!b.is_closed().await);
        });
    }

    #[rstest]
    fn test_mismatched_ack_counts_are_rejected() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;

            let packet = Packet {
                ack_start_seqs: vec![1, 5],
                ack_seq_counts: vec![2],
                ..Packet::default()
            };
            assert_err(
                a.handle_acks(&packet, "a0", "b0").await,
                SessionError::InvalidPacket("ack starts and counts disagree"),
            );
        });
    }

    #[rstest]
    fn test_dial_times_out_without_peer() {
        paused_rt().block_on(async {
            let mut mock = MockPacketSender::new();
            mock.expect_send_data()
                .returning(|_, _, _| Ok(()));

            let session = Session::new(
                SessionConfig::default(),
                "alice", "bob",
                vec!["a0".into()], vec!["b0".into()],
                Arc::new(mock),
            ).unwrap();

            assert_err(session.dial(Duration::from_millis(500)).await, SessionError::DialTimeout);
        });
    }

    #[rstest]
    fn test_dial_on_established_session_is_rejected() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;
            assert_err(a.dial(Duration::from_secs(1)).await, SessionError::SessionEstablished);
        });
    }

    #[rstest]
    fn test_accept_fails_when_session_closes_first() {
        paused_rt().block_on(async {
            let (_a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);

            let accept = tokio::spawn({
                let b = b.clone();
                async move { b.accept().await }
            });
            time::sleep(Duration::from_millis(50)).await;
            b.close().await;

            assert_err(accept.await.unwrap(), SessionError::MissingHandshake);
        });
    }

    #[rstest]
    fn test_write_before_establishment_is_rejected() {
        paused_rt().block_on(async {
            let (a, _b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            assert_err(a.write(&[1]).await, SessionError::SessionNotEstablished);
            let mut buf = [0u8; 1];
            assert_err(a.read(&mut buf).await, SessionError::SessionNotEstablished);
        });
    }

    #[rstest]
    fn test_read_deadline() {
        paused_rt().block_on(async {
            let (a, b, _, _) = session_pair(SessionConfig::default(), SessionConfig::default(), 1);
            establish(&a, &b).await;

            b.set_read_deadline(Duration::from_millis(100)).await;
            let mut buf = [0u8; 4];
            assert_err(b.read(&mut buf).await, SessionError::ReadDeadlineExceeded);
        });
    }

    #[rstest]
    fn test_write_deadline_when_window_is_exhausted() {
        paused_rt().block_on(async {
            let config = SessionConfig {
                session_window_size: 2048,
                mtu: 1024,
                ..SessionConfig::default()
            };
            let (a, b, _, _) = session_pair(config.clone(), config, 1);
            establish(&a, &b).await;

            // fills the byte budget; the peer buffers but never reads
            a.write(&[0u8; 2048]).await.unwrap();

            a.set_write_deadline(Duration::from_millis(100)).await;
            assert_err(a.write(&[1]).await, SessionError::WriteDeadlineExceeded);
        });
    }
}
