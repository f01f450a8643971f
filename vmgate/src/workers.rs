use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Non-exclusive slot held by a running worker.
pub type DrainSlot = OwnedRwLockReadGuard<()>;
/// Exclusive pass held by the draining teardown.
pub type DrainHold = OwnedRwLockWriteGuard<()>;

/// Barrier that admits many concurrent holders but lets teardown wait
/// for all of them to leave.
///
/// `use_slot` acquires a non-exclusive slot and blocks while a `drain`
/// is pending or held (the underlying lock is write-preferring, which is
/// exactly the stop-admitting behavior teardown needs). `drain` waits
/// for every outstanding slot to release and then passes exclusively.
#[derive(Clone, Default)]
pub struct DrainGate {
    lock: Arc<RwLock<()>>,
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn use_slot(&self) -> DrainSlot {
        self.lock.clone().read_owned().await
    }

    pub async fn drain(&self) -> DrainHold {
        self.lock.clone().write_owned().await
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of background workers spawned by one connection, keyed by
/// stable ids so cancel and join never chase raw task handles.
pub struct WorkerPool {
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Worker>>,
}

impl WorkerPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn a worker. The closure receives the worker's cancellation
    /// token; the worker is expected to observe it at suspension points.
    pub fn spawn<F, Fut>(&self, make: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let handle = tokio::spawn(make(token.clone()));
        self.workers
            .lock()
            .unwrap()
            .insert(id, Worker { token, handle });
        id
    }

    /// Request cooperative cancellation of every worker.
    pub fn cancel_all(&self) {
        for worker in self.workers.lock().unwrap().values() {
            worker.token.cancel();
        }
    }

    /// Wait for all workers to finish, force-aborting stragglers after
    /// `grace`. The pool is empty when this returns.
    pub async fn join_all(&self, grace: Duration) {
        let workers: Vec<(u64, Worker)> = self.workers.lock().unwrap().drain().collect();
        for (id, mut worker) in workers {
            match tokio::time::timeout(grace, &mut worker.handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(worker = id, "worker exceeded drain grace period, aborting");
                    worker.handle.abort();
                }
            }
        }
    }

    /// Drop entries for workers that already finished.
    fn reap(&self) {
        self.workers
            .lock()
            .unwrap()
            .retain(|_, worker| !worker.handle.is_finished());
    }

    #[allow(dead_code)] // inspected by teardown tests
    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
