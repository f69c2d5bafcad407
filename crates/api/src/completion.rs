//! Completion signal: fired exactly once per onboarding request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub project: String,
    pub service: String,
    pub succeeded: bool,
}

/// Receives the completion of every request. Called from a destructor, so it
/// must not block.
pub trait CompletionSink: Send + Sync {
    fn done(&self, completion: Completion);
}

/// Forwards completions to an unbounded channel.
pub struct ChannelCompletionSink {
    tx: mpsc::UnboundedSender<Completion>,
}

impl ChannelCompletionSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompletionSink for ChannelCompletionSink {
    fn done(&self, completion: Completion) {
        if self.tx.send(completion).is_err() {
            warn!("completion receiver dropped");
        }
    }
}

/// Logs completions.
pub struct LogCompletionSink;

impl CompletionSink for LogCompletionSink {
    fn done(&self, c: Completion) {
        info!(project = %c.project, service = %c.service, succeeded = c.succeeded, "onboarding finished");
    }
}

/// Emits the completion when dropped, whatever path left the request.
pub(crate) struct CompletionGuard {
    sink: Arc<dyn CompletionSink>,
    completion: Completion,
}

impl CompletionGuard {
    pub(crate) fn new(sink: Arc<dyn CompletionSink>, project: &str, service: &str) -> Self {
        Self { sink, completion: Completion { project: project.to_string(), service: service.to_string(), succeeded: false } }
    }

    pub(crate) fn set_service(&mut self, service: &str) { self.completion.service = service.to_string(); }

    pub(crate) fn succeed(&mut self) { self.completion.succeeded = true; }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) { self.sink.done(self.completion.clone()); }
}
