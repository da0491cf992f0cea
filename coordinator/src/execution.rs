use model::query::{QueryError, QueryId, QuerySubmission};

/// The distributed execution collaborator, reduced to the two calls
/// the kernel makes. Completions come back asynchronously as
/// [`ExecutionEvent`]s on the channel handed to the dispatcher.
pub trait ExecutionEngine: Send + Sync {
    fn start(&self, submission: &QuerySubmission);
    fn cancel(&self, id: &QueryId);
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Finished(QueryId),
    Failed { id: QueryId, error: QueryError },
    /// Usage telemetry; keeps the optimistic memory accounting honest.
    MemoryUsage { id: QueryId, bytes: u64 },
}

/// Channel pair wiring an engine implementation to the dispatcher.
pub fn event_channel() -> (flume::Sender<ExecutionEvent>, flume::Receiver<ExecutionEvent>) {
    flume::unbounded()
}
