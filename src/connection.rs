use crate::config::SessionConfig;
use crate::packet::Packet;
use crate::seq::Seq;
use crate::session::SessionShared;
use crate::wakeup::{bounded_wait, Wakeup};
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{self, interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// backoff after a failed handoff to the overlay before the next send attempt
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// One logical path of a session, identified by a (local, remote) client id pair. Each connection
///  runs its own congestion window and retransmission timer; the sequence space and byte budget
///  are owned by the session and shared across all of its connections.
pub struct Connection {
    config: Arc<SessionConfig>,
    pub(crate) local_client_id: String,
    pub(crate) remote_client_id: String,
    inner: RwLock<ConnectionInner>,
    /// raised when acks free congestion window capacity
    window_wakeup: Wakeup,
}

#[derive(Clone, Copy)]
struct SentTimes {
    /// first transmission - the basis of RTT samples
    first: Instant,
    /// latest transmission - the basis of the timeout scan
    last: Instant,
}

struct ConnectionInner {
    /// congestion window in packets, kept within [min, max]ConnectionWindowSize
    window_size: f64,
    retransmission_timeout: Duration,
    /// transmission times per in-flight sequence id; len() is the in-flight count
    sent: FxHashMap<Seq, SentTimes>,
    /// sequence ids already counted as lost. The flag is cleared when the retransmission goes
    ///  out (or the seq is acked), so a *renewed* timeout of the retransmission counts as a new
    ///  loss event - but one loss event never halves the window twice.
    resent: FxHashSet<Seq>,
    /// inbound sequence ids awaiting acknowledgement, ordered for run-length encoding
    pending_acks: BTreeSet<u32>,
}

impl ConnectionInner {
    /// Scans for in-flight sequences whose latest transmission is older than the retransmission
    ///  timeout and that are not already flagged. Each hit flags the seq as resent and halves the
    ///  window - exactly once per loss event, at this single site.
    fn take_timed_out(&mut self, config: &SessionConfig) -> Vec<Seq> {
        let rto = self.retransmission_timeout;
        let timed_out: Vec<Seq> = self.sent.iter()
            .filter(|(seq, times)| times.last.elapsed() >= rto && !self.resent.contains(*seq))
            .map(|(&seq, _)| seq)
            .collect();

        for &seq in &timed_out {
            self.resent.insert(seq);
            self.window_size = (self.window_size / 2.0).max(config.min_connection_window_size as f64);
        }
        timed_out
    }
}

impl Connection {
    pub fn new(config: Arc<SessionConfig>, local_client_id: String, remote_client_id: String) -> Connection {
        let inner = ConnectionInner {
            window_size: config.initial_connection_window_size as f64,
            retransmission_timeout: config.initial_retransmission_timeout,
            sent: FxHashMap::default(),
            resent: FxHashSet::default(),
            pending_acks: BTreeSet::default(),
        };

        Connection {
            config,
            local_client_id,
            remote_client_id,
            inner: RwLock::new(inner),
            window_wakeup: Wakeup::new(),
        }
    }

    pub async fn window_size(&self) -> f64 {
        self.inner.read().await.window_size
    }

    pub async fn retransmission_timeout(&self) -> Duration {
        self.inner.read().await.retransmission_timeout
    }

    /// Queues an inbound sequence id for acknowledgement. Idempotent.
    pub async fn send_ack(&self, seq: Seq) {
        self.inner.write().await
            .pending_acks.insert(seq.to_raw());
    }

    /// Processes an acknowledgement for an outbound sequence id. No-op if the seq is not in
    ///  flight on this connection. `is_sent_by_me` is true only on the connection the ack
    ///  physically arrived on - only that path takes an RTT sample.
    pub async fn receive_ack(&self, seq: Seq, is_sent_by_me: bool) {
        {
            let mut inner = self.inner.write().await;
            let times = match inner.sent.get(&seq) {
                Some(&times) => times,
                None => return,
            };

            if !inner.resent.contains(&seq) {
                inner.window_size = (inner.window_size + 1.0)
                    .min(self.config.max_connection_window_size as f64);
            }

            if is_sent_by_me {
                let sample_rtt = times.first.elapsed();
                inner.retransmission_timeout = self.next_rto(inner.retransmission_timeout, sample_rtt);
            }

            inner.sent.remove(&seq);
            inner.resent.remove(&seq);
        }
        self.window_wakeup.raise();
    }

    /// Nonstandard smoothing: grow the timeout when the RTT is large relative to it, shrink it
    ///  when small, with a step bounded to +-100ms.
    fn next_rto(&self, rto: Duration, sample_rtt: Duration) -> Duration {
        let rto_ms = rto.as_secs_f64() * 1000.0;
        let rtt_ms = sample_rtt.as_secs_f64() * 1000.0;
        let step_ms = ((3.0 * rtt_ms - rto_ms) / 1000.0).tanh() * 100.0;

        let max_ms = self.config.max_retransmission_timeout.as_secs_f64() * 1000.0;
        Duration::from_secs_f64((rto_ms + step_ms).clamp(0.0, max_ms) / 1000.0)
    }

    /// Transmit loop of one path: picks the next sequence id (preferring retransmissions),
    ///  respects the congestion window, and hands the stored packet to the overlay. Terminates
    ///  when the session context resolves.
    pub(crate) async fn send_loop(shared: Arc<SessionShared>, conn: Arc<Connection>) {
        let config = shared.config.clone();

        loop {
            // pick a sequence id, retransmissions first
            let seq = loop {
                {
                    let mut inner = shared.inner.write().await;
                    if let Some(seq) = inner.resend_queue.pop_front().or_else(|| inner.send_queue.pop_front()) {
                        break seq;
                    }
                }
                if bounded_wait(&shared.ctx, &shared.send_queue_wakeup, config.flush_interval).await.is_err() {
                    return;
                }
            };

            // respect this path's congestion window
            loop {
                let (in_flight, window_size) = {
                    let inner = conn.inner.read().await;
                    (inner.sent.len(), inner.window_size)
                };
                if (in_flight as f64) < window_size {
                    break;
                }
                if bounded_wait(&shared.ctx, &conn.window_wakeup, config.check_timeout_interval).await.is_err() {
                    return;
                }
            }

            let buf = shared.inner.read().await
                .send_window_data.get(seq).cloned();
            let buf = match buf {
                Some(buf) => buf,
                None => {
                    // already acked while queued
                    let mut inner = conn.inner.write().await;
                    inner.sent.remove(&seq);
                    inner.resent.remove(&seq);
                    continue;
                }
            };

            match shared.sender.send_data(&conn.local_client_id, &conn.remote_client_id, &buf).await {
                Ok(()) => {
                    let now = Instant::now();
                    let mut inner = conn.inner.write().await;
                    inner.sent.entry(seq)
                        .and_modify(|times| times.last = now)
                        .or_insert(SentTimes { first: now, last: now });
                    inner.resent.remove(&seq);
                }
                Err(e) => {
                    if shared.inner.read().await.is_closed {
                        return;
                    }
                    debug!("handing packet #{} to the overlay on ({}, {}) failed: {} - re-queueing",
                        seq, conn.local_client_id, conn.remote_client_id, e);
                    {
                        shared.inner.write().await
                            .resend_queue.push_back(seq);
                    }
                    shared.send_queue_wakeup.raise();
                    tokio::select! {
                        _ = time::sleep(SEND_RETRY_BACKOFF) => {}
                        _ = shared.ctx.done() => return,
                    }
                }
            }
        }
    }

    /// Ack aggregation loop of one path: every SendAckInterval, drains up to MaxAckSeqListSize
    ///  run-length-encoded runs from the pending set and transmits them, piggy-backing the
    ///  session's cumulative read count.
    pub(crate) async fn ack_loop(shared: Arc<SessionShared>, conn: Arc<Connection>) {
        let config = shared.config.clone();
        let mut ticker = interval(config.send_ack_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.ctx.done() => return,
            }

            let runs = {
                let mut inner = conn.inner.write().await;
                if inner.pending_acks.is_empty() {
                    continue;
                }
                take_ack_runs(&mut inner.pending_acks, config.max_ack_seq_list_size)
            };

            let bytes_read = shared.inner.read().await.total_bytes_read;

            let all_single = runs.counts.iter().all(|&count| count == 1);
            let packet = Packet {
                ack_start_seqs: runs.starts.clone(),
                ack_seq_counts: if all_single { Vec::new() } else { runs.counts.clone() },
                bytes_read,
                ..Packet::default()
            };
            let mut buf = BytesMut::new();
            packet.ser(&mut buf);

            match shared.sender.send_data(&conn.local_client_id, &conn.remote_client_id, &buf).await {
                Ok(()) => {
                    trace!("acked {} run(s) on ({}, {})", runs.starts.len(), conn.local_client_id, conn.remote_client_id);
                    shared.inner.write().await.bytes_read_sent_time = Instant::now();
                }
                Err(e) => {
                    // transient: restore the drained ids and retry next tick
                    debug!("sending acks on ({}, {}) failed: {}", conn.local_client_id, conn.remote_client_id, e);
                    let mut inner = conn.inner.write().await;
                    inner.pending_acks.extend(runs.drained);
                }
            }
        }
    }

    /// Retransmission scan of one path: every CheckTimeoutInterval, pushes timed-out sequences
    ///  to the shared resend queue. Window halving happens inside the scan, once per loss event.
    pub(crate) async fn timeout_loop(shared: Arc<SessionShared>, conn: Arc<Connection>) {
        let config = shared.config.clone();
        let mut ticker = interval(config.check_timeout_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.ctx.done() => return,
            }

            let timed_out = conn.inner.write().await
                .take_timed_out(&config);
            if timed_out.is_empty() {
                continue;
            }

            debug!("{} packet(s) timed out on ({}, {}) - scheduling retransmission",
                timed_out.len(), conn.local_client_id, conn.remote_client_id);
            {
                let mut inner = shared.inner.write().await;
                for seq in timed_out {
                    inner.resend_queue.push_back(seq);
                }
            }
            shared.send_queue_wakeup.raise();
        }
    }
}

pub(crate) struct AckRuns {
    pub starts: Vec<u32>,
    pub counts: Vec<u32>,
    /// the raw ids removed from the pending set, for restoring on send failure
    pub drained: Vec<u32>,
}

/// Removes up to `max_runs` runs of consecutive sequence ids from `pending`, run-length encoding
///  them into (start, count) pairs. Runs never continue across the numeric wrap, which keeps
///  decoding a run a simple forward walk.
pub(crate) fn take_ack_runs(pending: &mut BTreeSet<u32>, max_runs: usize) -> AckRuns {
    let mut starts: Vec<u32> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    let mut drained: Vec<u32> = Vec::new();

    for &raw in pending.iter() {
        match (starts.last(), counts.last_mut()) {
            (Some(&last_start), Some(count)) if raw != 0 && last_start.wrapping_add(*count) == raw => {
                *count += 1;
            }
            _ => {
                if starts.len() == max_runs {
                    break;
                }
                starts.push(raw);
                counts.push(1);
            }
        }
        drained.push(raw);
    }

    for raw in &drained {
        pending.remove(raw);
    }
    AckRuns { starts, counts, drained }
}
