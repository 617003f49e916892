//! The `/var/log/events` history log.
//!
//! A background collector subscribes to every partition's history
//! stream, rewrites event paths into the unified path space, and
//! appends JSON-lines records to the reserved log file. Records are
//! flushed when enough have buffered, on a periodic timer, on demand,
//! and once more at shutdown; every flush ends with a
//! `{"type":"flush","timestamp":..}` record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cfs::Cfs;

/// Reserved path of the event log.
pub const EVENT_LOG_PATH: &str = "/var/log/events";

/// Default interval between periodic flushes.
pub const EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Buffered records beyond this count trigger an early flush.
pub const EVENT_FLUSH_THRESHOLD: usize = 10;

/// One line of the event log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

impl EventRecord {
    fn now(kind: &str, path: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            path,
            timestamp: Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// Handle to the running collector; owned by the filesystem and taken
/// out on close.
pub struct EventLog {
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown_tx: watch::Sender<bool>,
    collector: JoinHandle<()>,
    forwarders: Vec<JoinHandle<()>>,
}

impl EventLog {
    /// Spawns the collector and one forwarder per partition.
    pub fn spawn(cfs: Arc<Cfs>, interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<(&'static str, String)>(256);
        let (flush_tx, flush_rx) = mpsc::channel::<oneshot::Sender<()>>(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut forwarders = Vec::new();
        let mut partitions = vec![cfs.partitions().root().clone()];
        partitions.extend(cfs.partitions().mounted());
        for partition in partitions {
            let mut history = partition.drive().history();
            let tx = event_tx.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match history.recv().await {
                        Ok(event) => {
                            let absolute = partition.unresolve(&event.path);
                            // Writes to the log itself must not loop back
                            // into the log.
                            if absolute == EVENT_LOG_PATH {
                                continue;
                            }
                            if tx.send((event.kind.as_str(), absolute)).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event history lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        drop(event_tx);

        let collector = tokio::spawn(collect(cfs, interval, event_rx, flush_rx, shutdown_rx));

        Self {
            flush_tx,
            shutdown_tx,
            collector,
            forwarders,
        }
    }

    /// Flushes buffered records and waits for the write to complete.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Performs a final flush and stops all tasks.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.collector).await;
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

async fn collect(
    cfs: Arc<Cfs>,
    interval: Duration,
    mut event_rx: mpsc::Receiver<(&'static str, String)>,
    mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Seed from whatever the log already holds so replicas appending to
    // an existing filesystem do not clobber earlier history.
    let mut lines: Vec<String> = match cfs.read_file(EVENT_LOG_PATH).await {
        Ok(existing) => String::from_utf8_lossy(&existing)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    let mut pending = 0usize;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some((kind, path)) => {
                    let record = EventRecord::now(kind, Some(path));
                    match serde_json::to_string(&record) {
                        Ok(line) => {
                            lines.push(line);
                            pending += 1;
                            if pending > EVENT_FLUSH_THRESHOLD {
                                flush_lines(&cfs, &mut lines, &mut pending).await;
                            }
                        }
                        Err(err) => warn!(%err, "failed to encode event record"),
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                flush_lines(&cfs, &mut lines, &mut pending).await;
            }
            request = flush_rx.recv() => match request {
                Some(ack) => {
                    flush_lines(&cfs, &mut lines, &mut pending).await;
                    let _ = ack.send(());
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                flush_lines(&cfs, &mut lines, &mut pending).await;
                break;
            }
        }
    }
}

async fn flush_lines(cfs: &Cfs, lines: &mut Vec<String>, pending: &mut usize) {
    if *pending == 0 {
        return;
    }
    match serde_json::to_string(&EventRecord::now("flush", None)) {
        Ok(line) => lines.push(line),
        Err(err) => warn!(%err, "failed to encode flush record"),
    }
    let body = lines.join("\n");
    debug!(records = lines.len(), "flushing event log");
    if let Err(err) = cfs.write_file(EVENT_LOG_PATH, body).await {
        warn!(%err, "event log flush failed");
    }
    *pending = 0;
}
