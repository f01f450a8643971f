use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::connection::tx::ConnectionTx;

/// Hierarchical progress reporter for one workflow.
///
/// The root task owns a fixed number of units; `begin` carves one unit
/// out as a child task with its own unit count, recursively. Finishing a
/// unit anywhere advances the root fraction by that unit's share, and
/// every advance is surfaced to the page as a `progress` event correlated
/// with the originating request id. The first activity emits `started`;
/// `complete` emits `completed`.
#[derive(Clone)]
pub struct ProgressTask {
    shared: Arc<ProgressShared>,
    /// This task's share of the whole workflow (root = 1.0).
    weight: f64,
    state: Arc<Mutex<TaskState>>,
}

struct ProgressShared {
    tx: ConnectionTx,
    event_id: String,
    /// Accumulated root fraction in [0, 1] and the started latch.
    root: Mutex<RootState>,
}

struct RootState {
    fraction: f64,
    started: bool,
}

struct TaskState {
    max: u32,
    done: u32,
}

impl ProgressTask {
    /// Root task for the workflow correlated with `event_id`.
    pub fn root(tx: ConnectionTx, event_id: &str, max: u32) -> ProgressTask {
        ProgressTask {
            shared: Arc::new(ProgressShared {
                tx,
                event_id: event_id.to_string(),
                root: Mutex::new(RootState {
                    fraction: 0.0,
                    started: false,
                }),
            }),
            weight: 1.0,
            state: Arc::new(Mutex::new(TaskState { max: max.max(1), done: 0 })),
        }
    }

    /// Detached root that reports nowhere (tests, fire-and-forget work).
    #[allow(dead_code)]
    pub fn discard() -> ProgressTask {
        let (tx, _rx) = ConnectionTx::channel();
        tx.close();
        ProgressTask::root(tx, "", 1)
    }

    /// Carve one unit of this task out as a named subtask.
    pub fn begin(&self, name: &str, max: u32) -> ProgressTask {
        self.announce(name);
        let weight = {
            let state = self.state.lock().unwrap();
            self.weight / state.max as f64
        };
        ProgressTask {
            shared: self.shared.clone(),
            weight,
            state: Arc::new(Mutex::new(TaskState { max: max.max(1), done: 0 })),
        }
    }

    /// Report activity without advancing.
    pub fn doing(&self, message: &str) {
        self.announce(message);
    }

    /// Finish one unit of this task.
    pub fn done(&self, message: &str) {
        let increment = {
            let mut state = self.state.lock().unwrap();
            if state.done >= state.max {
                0.0
            } else {
                state.done += 1;
                self.weight / state.max as f64
            }
        };
        self.advance(increment, message);
    }

    /// Finish the whole workflow and emit `completed`.
    pub fn complete(&self, message: &str) {
        {
            let mut root = self.shared.root.lock().unwrap();
            root.fraction = 1.0;
        }
        self.shared
            .tx
            .event("completed", vec![json!(message)], Some(&self.shared.event_id));
    }

    fn announce(&self, message: &str) {
        let (emit_started, percent) = {
            let mut root = self.shared.root.lock().unwrap();
            let emit_started = !root.started;
            root.started = true;
            (emit_started, (root.fraction * 100.0).round() as u32)
        };
        if emit_started {
            self.shared
                .tx
                .event("started", vec![json!(message)], Some(&self.shared.event_id));
        }
        self.emit_progress(message, percent);
    }

    fn advance(&self, increment: f64, message: &str) {
        let percent = {
            let mut root = self.shared.root.lock().unwrap();
            root.fraction = (root.fraction + increment).min(1.0);
            (root.fraction * 100.0).round() as u32
        };
        self.emit_progress(message, percent);
    }

    fn emit_progress(&self, message: &str, percent: u32) {
        self.shared.tx.event(
            "progress",
            vec![json!(message), json!(percent)],
            Some(&self.shared.event_id),
        );
    }
}
