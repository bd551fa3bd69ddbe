//! Broadcast bus carrying [`WorkflowEvent`]s from the controller to any
//! number of watchers.
//!
//! Events are published only after the status they describe has been
//! persisted. Publishing with no watcher drops the event.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use weft_types::event::WorkflowEvent;
use weft_types::workflow::WorkflowKey;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Events of one workflow only.
    pub fn watch(&self, workflow: WorkflowKey) -> WorkflowWatch {
        WorkflowWatch {
            workflow,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Subscription filtered to a single workflow.
pub struct WorkflowWatch {
    workflow: WorkflowKey,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl WorkflowWatch {
    /// Next event for the watched workflow. Skips over lag; `None` once the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event)
                    if event.namespace == self.workflow.namespace
                        && event.workflow == self.workflow.name =>
                {
                    return Some(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(workflow = %self.workflow, missed, "event watch lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
