//! Run progress events.
//!
//! The scheduler and step runners publish progress over an unbounded flume
//! channel. Subscribers (CLIs, dashboards, tests) drain the receiver at
//! their own pace; when nobody subscribes the sends are dropped silently.

use chrono::{DateTime, Utc};

use crate::flowgraph::NodeId;

/// One progress notification from a running job.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    JobStarted {
        design: String,
        job: String,
        at: DateTime<Utc>,
    },
    NodeStarted {
        node: NodeId,
    },
    NodeDone {
        node: NodeId,
    },
    NodeHalted {
        node: NodeId,
        reason: String,
    },
    JobFinished {
        failed_steps: Vec<String>,
        at: DateTime<Utc>,
    },
}

/// Cloneable publish handle. A bus with no subscriber drops events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: Option<flume::Sender<RunEvent>>,
}

impl EventBus {
    /// A bus that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// A connected bus plus the subscriber end.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<RunEvent>) {
        let (sender, receiver) = flume::unbounded();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.sender
            && sender.send(event).is_err()
        {
            tracing::trace!("event subscriber disconnected");
        }
    }
}
