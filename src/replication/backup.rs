//! Backup-side replication listener.
//!
//! Accepts at most one primary at a time (extra connections are refused by
//! closing them immediately), applies each incoming record through the
//! engine-provided callback, and answers one ack per record in receive
//! order.
//!
//! The accept loop runs non-blocking with a short sleep so shutdown never
//! hangs on `accept`; the per-connection handler uses a read timeout for
//! the same reason, with frame reads that survive timeout boundaries
//! mid-frame.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::now_millis;
use crate::wal::LogRecord;

use super::{FRAME_HEADER_SIZE, Frame, ReplicationError, decode_frame, encode_ack_frame};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Applies one replicated record locally; returns whether it succeeded.
pub type ApplyFn = Box<dyn Fn(&LogRecord) -> bool + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

struct BackupMetrics {
    records_applied: AtomicU64,
    last_apply_ms: AtomicU64,
}

/// Point-in-time view of the backup's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetricsSnapshot {
    /// Records applied successfully.
    pub records_applied: u64,

    /// Milliseconds since the last successful apply: the backup's observed
    /// replication lag. `None` before the first apply.
    pub time_since_last_apply_ms: Option<u64>,
}

// ------------------------------------------------------------------------------------------------
// ReplicationBackup
// ------------------------------------------------------------------------------------------------

/// Handle to the backup's accept loop.
pub struct ReplicationBackup {
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    metrics: Arc<BackupMetrics>,
    local_addr: SocketAddr,
}

impl ReplicationBackup {
    /// Binds `listen_addr` and starts accepting. Port 0 binds an ephemeral
    /// port, readable via [`ReplicationBackup::local_addr`].
    pub fn spawn(listen_addr: &str, apply: ApplyFn) -> Result<Self, ReplicationError> {
        let listener = TcpListener::bind(listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(BackupMetrics {
            records_applied: AtomicU64::new(0),
            last_apply_ms: AtomicU64::new(0),
        });

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_metrics = Arc::clone(&metrics);
        let apply = Arc::new(apply);
        let acceptor = std::thread::Builder::new()
            .name("coraldb-repl-backup".into())
            .spawn(move || {
                let active = Arc::new(AtomicBool::new(false));
                let mut handlers: Vec<JoinHandle<()>> = Vec::new();

                while !loop_shutdown.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            if active.load(Ordering::Acquire) {
                                warn!(%peer, "refusing second primary connection");
                                drop(stream);
                                continue;
                            }
                            info!(%peer, "primary connected");
                            active.store(true, Ordering::Release);
                            let conn_active = Arc::clone(&active);
                            let conn_shutdown = Arc::clone(&loop_shutdown);
                            let conn_metrics = Arc::clone(&loop_metrics);
                            let conn_apply = Arc::clone(&apply);
                            match std::thread::Builder::new()
                                .name("coraldb-repl-apply".into())
                                .spawn(move || {
                                    handle_connection(
                                        stream,
                                        conn_apply,
                                        conn_metrics,
                                        conn_shutdown,
                                    );
                                    conn_active.store(false, Ordering::Release);
                                }) {
                                Ok(handle) => handlers.push(handle),
                                Err(e) => {
                                    warn!(error = %e, "failed to spawn apply thread");
                                    active.store(false, Ordering::Release);
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            std::thread::sleep(ACCEPT_POLL);
                        }
                    }
                }

                for handle in handlers {
                    let _ = handle.join();
                }
            })?;

        info!(addr = %local_addr, "replication backup listening");
        Ok(Self {
            shutdown,
            acceptor: Some(acceptor),
            metrics,
            local_addr,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the backup's counters.
    pub fn metrics(&self) -> BackupMetricsSnapshot {
        let last = self.metrics.last_apply_ms.load(Ordering::Relaxed);
        BackupMetricsSnapshot {
            records_applied: self.metrics.records_applied.load(Ordering::Relaxed),
            time_since_last_apply_ms: if last == 0 {
                None
            } else {
                Some(now_millis().saturating_sub(last))
            },
        }
    }

    /// Stops accepting, waits for the current connection to wind down.
    pub fn shutdown(mut self) {
        self.stop_acceptor();
    }

    fn stop_acceptor(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for ReplicationBackup {
    fn drop(&mut self) {
        self.stop_acceptor();
    }
}

// ------------------------------------------------------------------------------------------------
// Connection handling
// ------------------------------------------------------------------------------------------------

fn handle_connection(
    mut stream: TcpStream,
    apply: Arc<ApplyFn>,
    metrics: Arc<BackupMetrics>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!(error = %e, "failed to set read timeout");
        return;
    }

    loop {
        let frame = match read_frame_interruptible(&mut stream, &shutdown) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "dropping primary connection");
                break;
            }
        };

        match frame {
            Frame::Replicate(record) => {
                let sequence = record.sequence;
                let ok = apply(&record);
                if ok {
                    metrics.records_applied.fetch_add(1, Ordering::Relaxed);
                    metrics.last_apply_ms.store(now_millis(), Ordering::Relaxed);
                } else {
                    warn!(sequence, "failed to apply replicated record");
                }
                if let Err(e) = stream.write_all(&encode_ack_frame(ok, sequence)) {
                    warn!(error = %e, "failed to send ack");
                    break;
                }
            }
            Frame::Ack { .. } => {
                warn!("unexpected ack from primary");
                break;
            }
        }
    }
    debug!("primary connection closed");
}

/// Reads one frame, tolerating read timeouts (used to poll `shutdown`)
/// even when they land mid-frame. Returns `Ok(None)` on clean EOF or
/// shutdown.
fn read_frame_interruptible(
    stream: &mut TcpStream,
    shutdown: &AtomicBool,
) -> Result<Option<Frame>, ReplicationError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if !read_full(stream, &mut header, shutdown)? {
        return Ok(None);
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&header[0..4]);
    let payload_len = u32::from_be_bytes(word) as usize;
    let opcode = header[4];
    if payload_len == 0 {
        return Err(ReplicationError::TruncatedFrame);
    }

    let mut body = vec![0u8; payload_len - 1];
    if !read_full(stream, &mut body, shutdown)? {
        return Err(ReplicationError::TruncatedFrame);
    }
    decode_frame(opcode, &body).map(Some)
}

/// Fills `buf`, retrying across read timeouts. Returns `false` on clean
/// EOF before the first byte or on shutdown.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shutdown: &AtomicBool,
) -> Result<bool, ReplicationError> {
    let mut filled = 0;
    while filled < buf.len() {
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(ReplicationError::TruncatedFrame);
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(ReplicationError::Io(e)),
        }
    }
    Ok(true)
}
