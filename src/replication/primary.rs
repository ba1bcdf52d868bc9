//! Primary-side replication worker.
//!
//! The engine wires [`PrimarySender::enqueue`] into the WAL commit
//! listener; this module owns everything from there: the queue, the single
//! persistent connection to the backup, pipelined sends, FIFO ack
//! matching, fixed-interval reconnects, and metrics.
//!
//! The send path and the ack path run on separate threads sharing one
//! socket (writes on the worker, reads on a cloned handle). A read error or
//! unexpected frame marks the connection lost; the worker tears it down,
//! clears the unacked backlog (those records are never retried), and
//! schedules the next connect attempt.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::now_millis;
use crate::wal::LogRecord;

use super::{Frame, ReplicationError, encode_replicate_frame, read_frame};

/// Worker poll granularity while idle; bounds how late a reconnect fires.
const IDLE_TICK: Duration = Duration::from_millis(50);

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

struct PrimaryMetrics {
    records_replicated: AtomicU64,
    bytes_replicated: AtomicU64,
    failed_attempts: AtomicU64,
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    /// `(sequence, record timestamp)` of sent-but-unacked records, FIFO.
    pending: Mutex<VecDeque<(u64, u64)>>,
}

impl PrimaryMetrics {
    fn new() -> Self {
        Self {
            records_replicated: AtomicU64::new(0),
            bytes_replicated: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn push_pending(&self, sequence: u64, timestamp_ms: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back((sequence, timestamp_ms));
        }
    }

    fn clear_pending(&self) -> usize {
        self.pending.lock().map(|mut p| p.drain(..).count()).unwrap_or(0)
    }

    /// Matches one ack against the FIFO backlog.
    fn record_ack(&self, ok: bool, sequence: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            match pending.pop_front() {
                Some((expected, _)) if expected == sequence => {}
                Some((expected, _)) => {
                    warn!(expected, got = sequence, "out-of-order replication ack");
                }
                None => {
                    warn!(sequence, "ack with no pending record");
                }
            }
        }
        if ok {
            self.records_replicated.fetch_add(1, Ordering::Relaxed);
            self.last_success_ms.store(now_millis(), Ordering::Relaxed);
        } else {
            self.mark_failure();
        }
    }

    fn mark_failure(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
    }
}

/// Point-in-time view of the primary's replication counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryMetricsSnapshot {
    /// Records acknowledged by the backup.
    pub records_replicated: u64,

    /// Frame bytes written to the wire.
    pub bytes_replicated: u64,

    /// Dropped records, failed connects, and rejected applies.
    pub failed_attempts: u64,

    /// Wall-clock of the last OK ack, if any.
    pub last_success_ms: Option<u64>,

    /// Wall-clock of the last failure, if any.
    pub last_failure_ms: Option<u64>,

    /// Age of the oldest sent-but-unacked record: the primary's observed
    /// replication lag. `None` when nothing is in flight.
    pub oldest_pending_age_ms: Option<u64>,
}

// ------------------------------------------------------------------------------------------------
// Worker plumbing
// ------------------------------------------------------------------------------------------------

enum Command {
    Record(LogRecord),
    Shutdown,
}

/// Cheap handle for the WAL commit listener.
#[derive(Clone)]
pub(crate) struct PrimarySender {
    tx: Sender<Command>,
}

impl PrimarySender {
    /// Queues one committed record; never blocks the commit path.
    pub(crate) fn enqueue(&self, record: LogRecord) {
        let _ = self.tx.send(Command::Record(record));
    }
}

/// One live connection: the write half plus its ack-reader thread.
struct Connection {
    stream: TcpStream,
    lost: Arc<AtomicBool>,
    ack_reader: JoinHandle<()>,
}

impl Connection {
    fn open(
        addr: &str,
        timeout: Duration,
        metrics: &Arc<PrimaryMetrics>,
    ) -> Result<Self, ReplicationError> {
        let sock_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ReplicationError::Connect(format!("no address for {addr}")))?;
        let stream = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(|e| ReplicationError::Connect(e.to_string()))?;
        stream.set_nodelay(true)?;

        let lost = Arc::new(AtomicBool::new(false));
        let mut reader_stream = stream.try_clone()?;
        let reader_lost = Arc::clone(&lost);
        let reader_metrics = Arc::clone(metrics);
        let ack_reader = std::thread::Builder::new()
            .name("coraldb-repl-ack".into())
            .spawn(move || {
                loop {
                    match read_frame(&mut reader_stream) {
                        Ok(Frame::Ack { ok, sequence }) => reader_metrics.record_ack(ok, sequence),
                        Ok(_) => {
                            warn!("unexpected frame from backup");
                            break;
                        }
                        Err(_) => break,
                    }
                }
                reader_lost.store(true, Ordering::Release);
            })?;

        Ok(Self {
            stream,
            lost,
            ack_reader,
        })
    }

    fn teardown(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = self.ack_reader.join();
    }
}

// ------------------------------------------------------------------------------------------------
// ReplicationPrimary
// ------------------------------------------------------------------------------------------------

/// Handle to the primary's replication worker thread.
pub struct ReplicationPrimary {
    cmd_tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<PrimaryMetrics>,
}

impl ReplicationPrimary {
    /// Spawns the worker; the first connect attempt happens immediately.
    pub fn spawn(
        backup_addr: String,
        connect_timeout: Duration,
        reconnect_interval: Duration,
    ) -> Result<Self, ReplicationError> {
        let metrics = Arc::new(PrimaryMetrics::new());
        let (cmd_tx, cmd_rx) = channel::unbounded();

        let worker_metrics = Arc::clone(&metrics);
        let worker = std::thread::Builder::new()
            .name("coraldb-repl-primary".into())
            .spawn(move || {
                let mut conn: Option<Connection> = None;
                let mut next_attempt = Instant::now();

                loop {
                    if conn.as_ref().is_some_and(|c| c.lost.load(Ordering::Acquire)) {
                        Self::drop_connection(
                            &mut conn,
                            &worker_metrics,
                            reconnect_interval,
                            &mut next_attempt,
                        );
                    }
                    if conn.is_none() && Instant::now() >= next_attempt {
                        match Connection::open(&backup_addr, connect_timeout, &worker_metrics) {
                            Ok(fresh) => {
                                info!(backup = %backup_addr, "replication connected");
                                conn = Some(fresh);
                            }
                            Err(e) => {
                                debug!(backup = %backup_addr, error = %e, "replication connect failed");
                                worker_metrics.mark_failure();
                                next_attempt = Instant::now() + reconnect_interval;
                            }
                        }
                    }

                    match cmd_rx.recv_timeout(IDLE_TICK) {
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(Command::Record(record)) => {
                            let sent = match conn.as_mut() {
                                Some(live) => {
                                    let frame = match encode_replicate_frame(&record) {
                                        Ok(frame) => frame,
                                        Err(e) => {
                                            warn!(error = %e, "undeliverable record");
                                            worker_metrics.mark_failure();
                                            continue;
                                        }
                                    };
                                    worker_metrics
                                        .push_pending(record.sequence, record.timestamp_ms);
                                    match live.stream.write_all(&frame) {
                                        Ok(()) => {
                                            worker_metrics
                                                .bytes_replicated
                                                .fetch_add(frame.len() as u64, Ordering::Relaxed);
                                            true
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "replication send failed");
                                            false
                                        }
                                    }
                                }
                                // Best-effort: while disconnected, records
                                // are dropped, not queued for retry.
                                None => {
                                    worker_metrics.mark_failure();
                                    continue;
                                }
                            };
                            if !sent {
                                Self::drop_connection(
                                    &mut conn,
                                    &worker_metrics,
                                    reconnect_interval,
                                    &mut next_attempt,
                                );
                            }
                        }
                    }
                }

                if let Some(live) = conn.take() {
                    live.teardown();
                }
            })?;

        Ok(Self {
            cmd_tx,
            worker: Some(worker),
            metrics,
        })
    }

    /// The handle the WAL commit listener holds.
    pub(crate) fn sender(&self) -> PrimarySender {
        PrimarySender {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Snapshot of the replication counters.
    pub fn metrics(&self) -> PrimaryMetricsSnapshot {
        let oldest_pending_age_ms = self
            .metrics
            .pending
            .lock()
            .ok()
            .and_then(|p| p.front().map(|(_, ts)| now_millis().saturating_sub(*ts)));
        let nonzero = |v: u64| if v == 0 { None } else { Some(v) };
        PrimaryMetricsSnapshot {
            records_replicated: self.metrics.records_replicated.load(Ordering::Relaxed),
            bytes_replicated: self.metrics.bytes_replicated.load(Ordering::Relaxed),
            failed_attempts: self.metrics.failed_attempts.load(Ordering::Relaxed),
            last_success_ms: nonzero(self.metrics.last_success_ms.load(Ordering::Relaxed)),
            last_failure_ms: nonzero(self.metrics.last_failure_ms.load(Ordering::Relaxed)),
            oldest_pending_age_ms,
        }
    }

    /// Stops the worker and closes the connection.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn drop_connection(
        conn: &mut Option<Connection>,
        metrics: &Arc<PrimaryMetrics>,
        reconnect_interval: Duration,
        next_attempt: &mut Instant,
    ) {
        if let Some(live) = conn.take() {
            live.teardown();
            let abandoned = metrics.clear_pending();
            if abandoned > 0 {
                debug!(abandoned, "abandoning unacked records");
            }
            metrics.mark_failure();
            *next_attempt = Instant::now() + reconnect_interval;
            info!("replication connection lost, reconnect scheduled");
        }
    }
}

impl Drop for ReplicationPrimary {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
