//! FIFO buffer for client-originated upstream commands.
//!
//! Every translated client message goes through [`OutboundQueue::submit`]:
//! it is appended to the queue and the queue is drained immediately when the
//! sink is ready.  Because a new message always lands behind anything still
//! pending, messages reach the upstream in exactly the order the client sent
//! them, whether or not the link was ready at submission time.

use std::collections::VecDeque;

use async_trait::async_trait;
use realtime_core::UpstreamCommand;
use thiserror::Error;

use super::link_state::LinkError;

/// Destination of drained commands.  Implemented by the upstream link.
#[async_trait]
pub trait UpstreamSink: Send {
    /// Whether content may be sent right now.
    fn is_ready(&self) -> bool;

    /// Sends one command.  An error means the command was not delivered.
    async fn send(&mut self, command: &UpstreamCommand) -> Result<(), LinkError>;
}

/// Errors returned when enqueueing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity; the new command was rejected.
    #[error("outbound queue is full ({capacity} messages pending)")]
    Full { capacity: usize },
}

/// Result of one drain pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Number of commands delivered.
    pub sent: usize,
    /// The send failure that stopped the pass, if any.  The failed command
    /// is back at the head of the queue.
    pub stalled: Option<LinkError>,
}

/// Bounded FIFO of commands waiting for a ready link.
#[derive(Debug)]
pub struct OutboundQueue {
    pending: VecDeque<UpstreamCommand>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a command, rejecting it when the queue is full.
    pub fn enqueue(&mut self, command: UpstreamCommand) -> Result<(), QueueError> {
        if self.pending.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        self.pending.push_back(command);
        Ok(())
    }

    /// Enqueues `command` and drains if the sink is ready.
    pub async fn submit<S>(
        &mut self,
        command: UpstreamCommand,
        sink: &mut S,
    ) -> Result<DrainReport, QueueError>
    where
        S: UpstreamSink + ?Sized,
    {
        self.enqueue(command)?;
        Ok(self.drain(sink).await)
    }

    /// Sends queued commands in FIFO order while the sink stays ready.
    ///
    /// A command whose send fails is put back at the head and the pass stops;
    /// it is retried on the next drain.
    pub async fn drain<S>(&mut self, sink: &mut S) -> DrainReport
    where
        S: UpstreamSink + ?Sized,
    {
        let mut report = DrainReport::default();
        while sink.is_ready() {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            match sink.send(&command).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    self.pending.push_front(command);
                    report.stalled = Some(e);
                    break;
                }
            }
        }
        report
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
