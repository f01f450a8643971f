use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::tx::ConnectionTx;
use crate::download::Downloader;
use crate::hypervisor::{HvSession, HypervisorDriver, HypervisorPlatform};
use crate::keystore::Keystore;
use crate::session::SessionRecord;

/// Process-wide registry: the hypervisor handle, the session map, the
/// trust store and download provider, and the global flags every
/// connection consults.
///
/// Passed explicitly to each connection at construction time; all
/// mutators are atomics or short async-lock sections.
pub struct Core {
    config: Config,
    platform: Arc<dyn HypervisorPlatform>,
    keystore: Arc<dyn Keystore>,
    downloader: Arc<dyn Downloader>,
    hypervisor: RwLock<Option<Arc<dyn HypervisorDriver>>>,
    sessions: RwLock<HashMap<u32, Arc<SessionRecord>>>,
    next_session_id: AtomicU32,
    running: AtomicBool,
    install_in_progress: AtomicBool,
    shutdown: Notify,
    host_key: String,
}

impl Core {
    pub fn new(
        config: Config,
        platform: Arc<dyn HypervisorPlatform>,
        keystore: Arc<dyn Keystore>,
        downloader: Arc<dyn Downloader>,
        host_key: String,
    ) -> Arc<Core> {
        Arc::new(Core {
            config,
            platform,
            keystore,
            downloader,
            hypervisor: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU32::new(1),
            running: AtomicBool::new(true),
            install_in_progress: AtomicBool::new(false),
            shutdown: Notify::new(),
            host_key,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keystore(&self) -> Arc<dyn Keystore> {
        self.keystore.clone()
    }

    pub fn downloader(&self) -> Arc<dyn Downloader> {
        self.downloader.clone()
    }

    pub async fn hypervisor(&self) -> Option<Arc<dyn HypervisorDriver>> {
        self.hypervisor.read().await.clone()
    }

    /// Re-probe the host when no hypervisor handle is held (it may have
    /// been installed since the daemon started).
    pub async fn sync_hypervisor_reflection(&self) {
        if self.hypervisor.read().await.is_some() {
            return;
        }
        if let Some(driver) = self.platform.detect().await {
            info!(version = %driver.version(), "hypervisor detected");
            *self.hypervisor.write().await = Some(driver);
        }
    }

    /// Force a fresh probe (after an install attempt).
    pub async fn redetect_hypervisor(&self) -> Option<Arc<dyn HypervisorDriver>> {
        let detected = self.platform.detect().await;
        *self.hypervisor.write().await = detected.clone();
        detected
    }

    pub fn platform(&self) -> Arc<dyn HypervisorPlatform> {
        self.platform.clone()
    }

    /// Opaque per-domain identifier bound into VMCP request URLs, stable
    /// for this install but unlinkable across domains.
    pub fn host_id(&self, domain: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.host_key.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Register a freshly opened driver session for `owner`, or rebind
    /// the existing record when the driver returned a session we already
    /// track.
    pub async fn store_session(
        &self,
        owner: u64,
        tx: ConnectionTx,
        session: Arc<dyn HvSession>,
        driver: Arc<dyn HypervisorDriver>,
    ) -> Arc<SessionRecord> {
        let uuid = session.uuid();
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.values().find(|r| r.uuid == uuid).cloned() {
            debug!(session = existing.id, uuid = %uuid, owner, "rebinding existing session record");
            existing.bind(owner, tx);
            return existing;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let record = SessionRecord::new(id, session, driver, self.config.monitor);
        record.bind(owner, tx);
        sessions.insert(id, record.clone());
        info!(session = id, uuid = %uuid, owner, "session registered");
        record
    }

    pub async fn find_session(&self, id: u32) -> Option<Arc<SessionRecord>> {
        self.sessions.read().await.get(&id).cloned()
    }

    #[allow(dead_code)] // inspected by workflow tests
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Detach every record owned by a closing connection. The records
    /// (and their VMs) persist; only the owner pointer and the per-record
    /// tasks go away.
    pub async fn release_connection_sessions(&self, owner: u64) {
        let sessions = self.sessions.read().await;
        for record in sessions.values() {
            if record.owner() == Some(owner) {
                record.release();
            }
        }
    }

    // ---- global install gate -------------------------------------------

    #[allow(dead_code)] // inspected by installer-gate tests
    pub fn install_in_progress(&self) -> bool {
        self.install_in_progress.load(Ordering::Acquire)
    }

    /// Claim the process-wide installer slot. Returns false when another
    /// connection already holds it.
    pub fn begin_install(&self) -> bool {
        self.install_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_install(&self) {
        self.install_in_progress.store(false, Ordering::Release);
    }

    // ---- daemon lifetime ------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the daemon: clear the running flag and wake the main loop.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        loop {
            // Register before checking the flag so a shutdown that lands
            // in between is not missed.
            let notified = self.shutdown.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}
