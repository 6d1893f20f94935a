//! Sent-message result reporting
//!
//! Every transmission attempt goes through [`Reporter::transmit`], which
//! produces exactly one [`SentMessageReport`]. The report is logged, handed
//! to each registered observer and returned to the caller. It never resolves
//! a pending request: only a response, a timeout or a connection close does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ocpp::{MessageKind, OcppMessage, RequestId};
use crate::routing::NodeId;
use crate::transport::{Connection, Delivery, TransportError};

/// Outcome of one transmission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessageResult {
    /// Written to the next hop
    Sent,
    /// Accepted by the transport, buffered for later delivery
    Queued,
    /// Could not be encoded or written
    TransmissionFailed(String),
    /// The transport did not accept the frame in time
    TimedOut,
    /// The next hop went away
    ConnectionClosed,
}

impl SentMessageResult {
    /// Whether the frame left (or will leave) this node
    pub fn is_delivered(&self) -> bool {
        matches!(self, SentMessageResult::Sent | SentMessageResult::Queued)
    }
}

impl fmt::Display for SentMessageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentMessageResult::Sent => f.write_str("Sent"),
            SentMessageResult::Queued => f.write_str("Queued"),
            SentMessageResult::TransmissionFailed(reason) => {
                write!(f, "TransmissionFailed({})", reason)
            }
            SentMessageResult::TimedOut => f.write_str("TimedOut"),
            SentMessageResult::ConnectionClosed => f.write_str("ConnectionClosed"),
        }
    }
}

/// What happened to one outgoing message
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessageReport {
    pub request_id: RequestId,
    pub kind: MessageKind,
    pub action: Option<String>,
    pub next_hop: NodeId,
    pub result: SentMessageResult,
    pub elapsed: Duration,
}

/// Receives a report for every transmission attempt
pub trait SentMessageObserver: Send + Sync {
    fn on_sent(&self, report: &SentMessageReport);
}

impl<F> SentMessageObserver for F
where
    F: Fn(&SentMessageReport) + Send + Sync,
{
    fn on_sent(&self, report: &SentMessageReport) {
        self(report)
    }
}

/// Wraps transmissions and fans their results out to observers
pub struct Reporter {
    transmit_timeout: Duration,
    observers: RwLock<Vec<Arc<dyn SentMessageObserver>>>,
}

impl Reporter {
    pub fn new(transmit_timeout: Duration) -> Self {
        Self {
            transmit_timeout,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn SentMessageObserver>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Encode `message` and hand it to `connection`, bounded by the transmit timeout
    pub async fn transmit(
        &self,
        connection: &Arc<dyn Connection>,
        message: &OcppMessage,
    ) -> SentMessageReport {
        let started = Instant::now();

        let result = match message.to_frame() {
            Ok(frame) => {
                match tokio::time::timeout(self.transmit_timeout, connection.send(frame)).await {
                    Ok(Ok(Delivery::Sent)) => SentMessageResult::Sent,
                    Ok(Ok(Delivery::Queued)) => SentMessageResult::Queued,
                    Ok(Err(TransportError::Closed(_))) => SentMessageResult::ConnectionClosed,
                    Ok(Err(e)) => SentMessageResult::TransmissionFailed(e.to_string()),
                    Err(_) => SentMessageResult::TimedOut,
                }
            }
            Err(e) => SentMessageResult::TransmissionFailed(e.to_string()),
        };

        let report = SentMessageReport {
            request_id: message.request_id().clone(),
            kind: message.kind(),
            action: message.action().map(str::to_string),
            next_hop: connection.peer_id().to_string(),
            result,
            elapsed: started.elapsed(),
        };
        self.report(&report);
        report
    }

    /// Log a report and notify every observer
    pub fn report(&self, report: &SentMessageReport) {
        if report.result.is_delivered() {
            debug!(
                "{} {} -> {}: {} in {:?}",
                report.kind, report.request_id, report.next_hop, report.result, report.elapsed
            );
        } else {
            warn!(
                "{} {} -> {} not delivered: {}",
                report.kind, report.request_id, report.next_hop, report.result
            );
        }

        // Snapshot so observers may subscribe others without deadlocking
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.on_sent(report);
        }
    }
}
