pub mod controller;
pub mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vmgate_protocol::failure_flags;

use crate::config::MonitorConfig;
use crate::connection::tx::ConnectionTx;
use crate::hypervisor::{DriverEvent, HvSession, HypervisorDriver};

/// Daemon bookkeeping around one hypervisor session: numeric wire id,
/// owning connection, monitor and relay tasks.
///
/// The record outlives its owner connection (the VM keeps running); a
/// later connection that opens the same VM rebinds the record to itself.
pub struct SessionRecord {
    pub id: u32,
    pub uuid: String,
    session: Arc<dyn HvSession>,
    driver: Arc<dyn HypervisorDriver>,
    monitor_cfg: MonitorConfig,
    accept_periodic: AtomicBool,
    aborting: AtomicBool,
    /// Last probe verdict for the in-guest API, shared between the
    /// monitor loop and the stateChanged relay.
    pub(crate) api_online: AtomicBool,
    binding: Mutex<Binding>,
}

#[derive(Default)]
struct Binding {
    owner: Option<u64>,
    tx: Option<ConnectionTx>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionRecord {
    pub fn new(
        id: u32,
        session: Arc<dyn HvSession>,
        driver: Arc<dyn HypervisorDriver>,
        monitor_cfg: MonitorConfig,
    ) -> Arc<SessionRecord> {
        Arc::new(SessionRecord {
            id,
            uuid: session.uuid(),
            session,
            driver,
            monitor_cfg,
            accept_periodic: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            api_online: AtomicBool::new(false),
            binding: Mutex::new(Binding::default()),
        })
    }

    /// Attach the record to a connection and start its relay and monitor
    /// tasks. A previous binding, if any, is torn down first.
    pub fn bind(self: &Arc<Self>, owner: u64, tx: ConnectionTx) {
        self.release();

        self.aborting.store(false, Ordering::Release);
        self.accept_periodic.store(false, Ordering::Release);
        self.api_online.store(false, Ordering::Release);

        let cancel = CancellationToken::new();
        let relay = tokio::spawn(relay_loop(self.clone(), cancel.clone()));
        let mon = tokio::spawn(monitor::monitor_loop(self.clone(), cancel.clone()));

        let mut binding = self.binding.lock().unwrap();
        binding.owner = Some(owner);
        binding.tx = Some(tx);
        binding.cancel = Some(cancel);
        binding.tasks = vec![relay, mon];
        info!(session = self.id, uuid = %self.uuid, owner, "session bound");
    }

    /// Detach the record from its connection: stop periodic work, cancel
    /// the relay and monitor, and forget the owner. The VM itself is not
    /// touched.
    pub fn release(&self) {
        self.aborting.store(true, Ordering::Release);
        self.accept_periodic.store(false, Ordering::Release);

        let mut binding = self.binding.lock().unwrap();
        if let Some(cancel) = binding.cancel.take() {
            cancel.cancel();
        }
        for task in binding.tasks.drain(..) {
            task.abort();
        }
        if binding.owner.take().is_some() {
            debug!(session = self.id, uuid = %self.uuid, "session released");
        }
        binding.tx = None;
    }

    pub fn owner(&self) -> Option<u64> {
        self.binding.lock().unwrap().owner
    }

    pub fn tx(&self) -> Option<ConnectionTx> {
        self.binding.lock().unwrap().tx.clone()
    }

    pub fn session(&self) -> &Arc<dyn HvSession> {
        &self.session
    }

    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    pub fn monitor_cfg(&self) -> &MonitorConfig {
        &self.monitor_cfg
    }

    pub fn aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    pub fn accepts_periodic(&self) -> bool {
        self.accept_periodic.load(Ordering::Acquire)
    }

    /// Enable or disable monitor ticks. The monitor is enabled only
    /// after the initial `stateVariables` → `stateChanged` push so
    /// `apiStateChanged` can never precede `stateChanged`.
    pub fn enable_periodic(&self, enabled: bool) {
        if self.aborting() {
            return;
        }
        self.accept_periodic.store(enabled, Ordering::Release);
    }

    /// URL of the in-guest API endpoint.
    pub fn api_url(&self) -> String {
        let local = self.session.local();
        format!(
            "http://{}:{}/",
            local.get_or("apiHost", "127.0.0.1"),
            local.get_or("apiPort", "80")
        )
    }

    /// Push the full VM state blob to the owning page.
    pub fn send_state_variables(&self) {
        if self.aborting() {
            return;
        }
        if let Some(tx) = self.tx() {
            tx.event(
                "stateVariables",
                vec![self.session.state_info()],
                Some(&self.uuid),
            );
        }
    }
}

/// Forward driver callbacks for one session to its owning page.
async fn relay_loop(record: Arc<SessionRecord>, cancel: CancellationToken) {
    let mut events = record.session().subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            e = events.recv() => e,
        };
        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                debug!(session = record.id, skipped = n, "driver event relay lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if record.aborting() {
            break;
        }

        let tx = match record.tx() {
            Some(tx) => tx,
            None => break,
        };

        match event {
            DriverEvent::StateChanged { state } => {
                // State variables first, so the page never sees a state
                // code it has no variables for.
                record.send_state_variables();
                tx.event("stateChanged", vec![json!(state)], Some(&record.uuid));

                let running = state == vmgate_protocol::SessionState::Running.code();
                if !running && record.api_online.swap(false, Ordering::AcqRel) {
                    tx.event(
                        "apiStateChanged",
                        vec![json!(false), json!(record.api_url())],
                        Some(&record.uuid),
                    );
                }
            }
            DriverEvent::Failure { flags } => {
                tx.event("failure", vec![json!(flags)], Some(&record.uuid));
                if (flags & failure_flags::NO_VIRTUALIZATION) != 0 {
                    let _ = record.session().stop().await;
                }
            }
            DriverEvent::ResolutionChanged { width, height, bpp } => {
                tx.event(
                    "resolutionChanged",
                    vec![json!(width), json!(height), json!(bpp)],
                    Some(&record.uuid),
                );
            }
        }
    }
}
