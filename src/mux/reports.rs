//! Single-slot error mailbox.
//!
//! Producers never block: a report submitted while the slot is occupied is
//! dropped and counted. The serving loop must never stall on a slow or
//! absent consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::mux::handler::ErrorReport;
use crate::observability::metrics;

/// Bounded mailbox of capacity one with drop-on-full semantics.
#[derive(Debug)]
pub struct ErrorMailbox {
    tx: mpsc::Sender<ErrorReport>,
    reports: ErrorReports,
    dropped: AtomicU64,
}

impl ErrorMailbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            reports: ErrorReports {
                rx: Arc::new(Mutex::new(rx)),
            },
            dropped: AtomicU64::new(0),
        }
    }

    /// Try to deliver `report`. Returns false if it was dropped.
    pub fn submit(&self, report: ErrorReport) -> bool {
        let kind = report.error.kind();
        match self.tx.try_send(report) {
            Ok(()) => {
                metrics::record_error_report(kind);
                true
            }
            Err(mpsc::error::TrySendError::Full(report)) | Err(mpsc::error::TrySendError::Closed(report)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_error_report_dropped();
                tracing::debug!(
                    connection_id = %report.conn.id(),
                    error = %report.error,
                    "Error report dropped, mailbox full"
                );
                false
            }
        }
    }

    /// Receiver view shared by all consumers.
    pub fn reports(&self) -> ErrorReports {
        self.reports.clone()
    }

    /// Number of reports dropped because the slot was occupied.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ErrorMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only, cloneable view of an error mailbox.
#[derive(Debug, Clone)]
pub struct ErrorReports {
    rx: Arc<Mutex<mpsc::Receiver<ErrorReport>>>,
}

impl ErrorReports {
    /// Wait for the next report.
    pub async fn recv(&self) -> Option<ErrorReport> {
        self.rx.lock().await.recv().await
    }

    /// Take a pending report without waiting.
    ///
    /// Clones share one receiver. While another clone is parked in `recv`
    /// this returns `None` even if a report is pending; that report goes to
    /// the parked consumer.
    pub fn try_recv(&self) -> Option<ErrorReport> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::endpoint::tests::test_conn;
    use crate::protocol::ProtocolError;
    use std::time::Duration;

    #[tokio::test]
    async fn parked_consumer_takes_pending_report() {
        let mailbox = ErrorMailbox::new();
        let reports = mailbox.reports();
        let parked = reports.clone();
        let waiter = tokio::spawn(async move { parked.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (conn, _peer) = test_conn();
        assert!(mailbox.submit(ErrorReport {
            conn,
            message: None,
            error: ProtocolError::UnhandledMessage,
        }));
        assert!(reports.try_recv().is_none());

        let report = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .expect("parked consumer receives the report");
        assert!(matches!(report.error, ProtocolError::UnhandledMessage));
        assert_eq!(mailbox.dropped(), 0);
    }
}
