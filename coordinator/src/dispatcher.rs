//! Query lifecycle bridge between a dispatcher front-end, the
//! admission kernel, and the execution engine.
//!
//! Submission is bounded work (classify + enqueue); callers observe
//! admission through `get_state`/`subscribe`, never by blocking. Every
//! terminal transition releases kernel capacity *before* the new state
//! becomes visible, so a caller that reads FINISHED/FAILED never sees
//! stale occupancy afterwards.

use crate::execution::{ExecutionEngine, ExecutionEvent};
use controller::group::tree::ResourceGroupInfo;
use controller::scheduler::{Admitted, Scheduler};
use model::group::ResourceGroupId;
use model::query::query_state::QueryState;
use model::query::{ErrorCode, QueryError, QueryId, QueryStatus, QuerySubmission};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span};

struct QueryEntry {
    submission: QuerySubmission,
    state: QueryState,
    state_tx: watch::Sender<QueryState>,
    resource_group: Option<ResourceGroupId>,
    error: Option<QueryError>,
    submitted_at: Instant,
    started_at: Option<Instant>,
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    engine: Arc<dyn ExecutionEngine>,
    queries: Mutex<HashMap<QueryId, QueryEntry>>,
}

impl Dispatcher {
    /// Wire the bridge up and spawn its event pump: execution events
    /// and scheduler wake-ups (completions, reconciliations) both
    /// funnel into scheduling ticks here.
    pub fn start(
        scheduler: Arc<Scheduler>,
        engine: Arc<dyn ExecutionEngine>,
        events: flume::Receiver<ExecutionEvent>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            scheduler,
            engine,
            queries: Mutex::new(HashMap::new()),
        });
        tokio::spawn(
            dispatcher
                .clone()
                .pump(events)
                .instrument(info_span!("dispatcher")),
        );
        dispatcher
    }

    async fn pump(self: Arc<Self>, events: flume::Receiver<ExecutionEvent>) {
        let mut wakeup = self.scheduler.subscribe();
        info!("Starting");
        loop {
            tokio::select! {
                event = events.recv_async() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => {
                        info!("Execution engine dropped its event channel");
                        return;
                    }
                },
                Ok(()) = wakeup.changed() => self.run_tick(),
            }
        }
    }

    /// Register, classify, and enqueue. Always returns the query id;
    /// classification failures surface on the FAILED state, not here.
    pub fn submit(self: &Arc<Self>, submission: QuerySubmission) -> QueryId {
        let id = submission.id.clone();
        let (state_tx, _) = watch::channel(QueryState::Queued);
        self.queries.lock().insert(
            id.clone(),
            QueryEntry {
                submission: submission.clone(),
                state: QueryState::Queued,
                state_tx,
                resource_group: None,
                error: None,
                submitted_at: Instant::now(),
                started_at: None,
            },
        );

        match self.scheduler.submit(&submission) {
            Ok(group) => {
                if let Some(entry) = self.queries.lock().get_mut(&id) {
                    entry.resource_group = Some(group);
                }
                self.run_tick();
            }
            Err(error) => self.fail(&id, error),
        }
        id
    }

    pub fn get_state(&self, id: &QueryId) -> Option<QueryStatus> {
        let queries = self.queries.lock();
        queries.get(id).map(|entry| QueryStatus {
            id: id.clone(),
            state: entry.state,
            resource_group: entry.resource_group.clone(),
            error: entry.error.clone(),
        })
    }

    /// State transition feed for one query; callers poll or subscribe
    /// instead of blocking on admission.
    pub fn subscribe(&self, id: &QueryId) -> Option<watch::Receiver<QueryState>> {
        self.queries
            .lock()
            .get(id)
            .map(|entry| entry.state_tx.subscribe())
    }

    pub fn get_resource_group_info(&self, path: &ResourceGroupId) -> Option<ResourceGroupInfo> {
        self.scheduler.group_info(path)
    }

    /// Administrative cancellation. Queued queries are dropped without
    /// counter side effects; running queries release capacity before
    /// the engine is told to stop.
    pub fn cancel(self: &Arc<Self>, id: &QueryId) {
        let observed = self.queries.lock().get(id).map(|entry| entry.state);
        match observed {
            Some(QueryState::Queued) => {
                if self.scheduler.cancel_queued(id) {
                    self.fail(id, cancelled_error());
                } else {
                    // Admission won the race; cancel as running.
                    self.cancel_running(id);
                }
            }
            Some(QueryState::Running) => self.cancel_running(id),
            Some(_) | None => return,
        }
        self.run_tick();
    }

    fn cancel_running(self: &Arc<Self>, id: &QueryId) {
        if self.scheduler.complete(id) {
            self.engine.cancel(id);
            self.fail(id, cancelled_error());
        }
    }

    fn handle_event(self: &Arc<Self>, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Finished(id) => {
                // Release capacity first: a FINISHED read must never be
                // followed by stale occupancy.
                let released = self.scheduler.complete(&id);
                self.finish(&id);
                if released {
                    self.run_tick();
                }
            }
            ExecutionEvent::Failed { id, error } => {
                let released = self.scheduler.complete(&id);
                self.fail(&id, error);
                if released {
                    self.run_tick();
                }
            }
            ExecutionEvent::MemoryUsage { id, bytes } => {
                if self.scheduler.update_memory(&id, bytes) {
                    self.run_tick();
                }
            }
        }
    }

    /// Move freshly admitted queries to RUNNING and hand them to the
    /// execution engine.
    fn run_tick(self: &Arc<Self>) {
        let admitted = self.scheduler.tick();
        if admitted.is_empty() {
            return;
        }
        let mut to_start = Vec::new();
        {
            let mut queries = self.queries.lock();
            for Admitted { id, group } in admitted {
                let Some(entry) = queries.get_mut(&id) else {
                    self.scheduler.complete(&id);
                    continue;
                };
                if entry.state != QueryState::Queued {
                    // Cancelled while the admission was in flight: give
                    // the slot straight back.
                    self.scheduler.complete(&id);
                    continue;
                }
                entry.state = QueryState::Running;
                entry.started_at = Some(Instant::now());
                entry.resource_group = Some(group);
                let _ = entry.state_tx.send(QueryState::Running);
                debug!(
                    query = %id,
                    queued_for = ?entry.submitted_at.elapsed(),
                    "Running"
                );
                to_start.push(entry.submission.clone());
            }
        }
        for submission in to_start {
            if let Some(limit) = submission.max_execution_time {
                self.spawn_watchdog(submission.id.clone(), limit);
            }
            self.engine.start(&submission);
        }
    }

    /// Execution-time enforcement measured from RUNNING start only; a
    /// query stuck in the queue past its limit is left alone.
    fn spawn_watchdog(self: &Arc<Self>, id: QueryId, limit: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            dispatcher.enforce_time_limit(&id, limit);
        });
    }

    fn enforce_time_limit(self: &Arc<Self>, id: &QueryId, limit: Duration) {
        let still_running = self
            .queries
            .lock()
            .get(id)
            .is_some_and(|entry| entry.state == QueryState::Running);
        if !still_running {
            return;
        }
        // Losing this race to a completion event means nothing to enforce.
        if !self.scheduler.complete(id) {
            return;
        }
        self.engine.cancel(id);
        self.fail(
            id,
            QueryError::new(
                ErrorCode::ExceededTimeLimit,
                format!(
                    "Query exceeded the maximum execution time limit of {}",
                    format_duration(limit)
                ),
            ),
        );
        self.run_tick();
    }

    fn finish(&self, id: &QueryId) {
        let mut queries = self.queries.lock();
        let Some(entry) = queries.get_mut(id) else {
            return;
        };
        if entry.state != QueryState::Running {
            return;
        }
        entry.state = QueryState::Finished;
        let _ = entry.state_tx.send(QueryState::Finished);
        debug!(
            query = %id,
            ran_for = ?entry.started_at.map(|at| at.elapsed()),
            "Finished"
        );
    }

    fn fail(&self, id: &QueryId, error: QueryError) {
        let mut queries = self.queries.lock();
        let Some(entry) = queries.get_mut(id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        entry.state = QueryState::Failed;
        entry.error = Some(error);
        let _ = entry.state_tx.send(QueryState::Failed);
        debug!(query = %id, error = ?entry.error, "Failed");
    }
}

fn cancelled_error() -> QueryError {
    QueryError::new(ErrorCode::Cancelled, "Query was canceled by user")
}

/// Renders with the largest unit keeping the value at or above one,
/// with two decimals ("1.00ms", "1.50s").
fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, f64); 7] = [
        ("d", 86_400.0),
        ("h", 3_600.0),
        ("m", 60.0),
        ("s", 1.0),
        ("ms", 1e-3),
        ("us", 1e-6),
        ("ns", 1e-9),
    ];
    let seconds = duration.as_secs_f64();
    for (unit, factor) in UNITS {
        if seconds >= factor {
            return format!("{:.2}{}", seconds / factor, unit);
        }
    }
    "0.00ns".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_render_in_the_largest_fitting_unit() {
        assert_eq!(format_duration(Duration::from_millis(1)), "1.00ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.50m");
        assert_eq!(format_duration(Duration::from_micros(250)), "250.00us");
        assert_eq!(format_duration(Duration::ZERO), "0.00ns");
    }
}
