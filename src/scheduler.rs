//! The scheduler: at most one agent task per session, a global cap on
//! concurrent tasks, FIFO wakeup of waiting sessions by earliest pending
//! message, and cancellation fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{self, AgentDeps};
use crate::memory::queue;

/// A running agent task's handle.
struct RunningTask {
    cancel_tx: watch::Sender<bool>,
}

/// Shared scheduler state.
pub struct Scheduler {
    deps: AgentDeps,
    max_concurrent: usize,
    running: Arc<Mutex<HashMap<i64, RunningTask>>>,
}

impl Scheduler {
    pub fn new(deps: AgentDeps, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            deps,
            max_concurrent: max_concurrent.max(1),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Session ids with a live agent task.
    pub fn active_sessions(self: &Arc<Self>) -> Vec<i64> {
        self.running
            .lock()
            .expect("scheduler lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn active_count(self: &Arc<Self>) -> usize {
        self.running.lock().expect("scheduler lock").len()
    }

    /// Called after every enqueue: start tasks for waiting sessions until
    /// the global cap is reached, FIFO by earliest pending message.
    pub async fn kick(self: &Arc<Self>) {
        let waiting = match agent::with_db(&self.deps, |conn| queue::sessions_with_pending_work(conn)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "scheduler could not scan queue");
                return;
            }
        };

        for session_id in waiting {
            if !self.try_start(session_id) {
                continue;
            }
        }
    }

    /// Start an agent task for a session if none is running and a slot is
    /// free. Returns whether a task was started.
    fn try_start(self: &Arc<Self>, session_id: i64) -> bool {
        let mut running = self.running.lock().expect("scheduler lock");
        if running.contains_key(&session_id) {
            return false;
        }
        if running.len() >= self.max_concurrent {
            debug!(session_id, "global cap reached, session waits");
            return false;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        running.insert(session_id, RunningTask { cancel_tx });
        drop(running);

        let scheduler = Arc::clone(self);
        let deps = self.deps.clone();
        tokio::spawn(async move {
            info!(session_id, "agent task starting");
            match agent::run_session(deps, session_id, cancel_rx).await {
                Ok(outcome) => {
                    debug!(
                        session_id,
                        processed = outcome.messages_processed,
                        "agent task finished"
                    );
                }
                Err(e) => warn!(session_id, error = %e, "agent task failed"),
            }

            scheduler
                .running
                .lock()
                .expect("scheduler lock")
                .remove(&session_id);

            // The freed slot may unblock a waiting session.
            scheduler.kick().await;
        });

        true
    }

    /// Cancel the running task for a session, if any. The agent stops at its
    /// next suspension point without committing the in-flight turn.
    pub fn cancel_session(self: &Arc<Self>, session_id: i64) -> bool {
        let running = self.running.lock().expect("scheduler lock");
        match running.get(&session_id) {
            Some(task) => {
                let _ = task.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Worker shutdown: signal every running task.
    pub fn cancel_all(self: &Arc<Self>) {
        let running = self.running.lock().expect("scheduler lock");
        for (session_id, task) in running.iter() {
            debug!(session_id, "cancelling agent task for shutdown");
            let _ = task.cancel_tx.send(true);
        }
    }
}
