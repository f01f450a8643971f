pub mod params;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::download::Downloader;
use crate::interact::UserInteraction;
use crate::keystore::Keystore;
use crate::progress::ProgressTask;

pub use params::ParameterMap;

/// Outcome of a lifecycle operation the driver accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Completed synchronously.
    Ok,
    /// Queued; the driver will apply it promptly.
    Scheduled,
}

/// Lifecycle operations resolve to an accepted outcome or a negative wire
/// error code supplied by the driver.
pub type DriverResult = Result<ControlOutcome, i32>;

/// Result of matching a VMCP manifest against existing driver sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateOutcome {
    /// No session with this name exists yet; user consent is required.
    New,
    /// An existing session matches name and secret; it will be resumed.
    Reuse,
    /// A session with this name exists but the secret does not match.
    PasswordMismatch,
}

/// Which in-guest endpoint an API probe should hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Http,
}

/// Asynchronous callbacks a driver session pushes to its subscribers.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Something went wrong inside the hypervisor; `flags` carries the
    /// `failure_flags` bits.
    Failure { flags: i32 },
    /// The session moved to a new state code.
    StateChanged { state: i32 },
    /// The guest display resolution changed.
    ResolutionChanged { width: i32, height: i32, bpp: i32 },
}

/// One hypervisor-managed VM session.
///
/// `parameters()` is the persistent configuration the page can read and
/// write (`get`/`set` actions); `local()` is driver-maintained runtime
/// state (`state`, `apiHost`, `apiPort`).
#[async_trait]
pub trait HvSession: Send + Sync {
    fn uuid(&self) -> String;

    async fn start(&self, params: &ParameterMap) -> DriverResult;
    async fn stop(&self) -> DriverResult;
    async fn pause(&self) -> DriverResult;
    async fn resume(&self) -> DriverResult;
    async fn hibernate(&self) -> DriverResult;
    async fn reset(&self) -> DriverResult;
    async fn close(&self) -> DriverResult;

    /// Block until the session FSM has settled after an open/resume.
    async fn wait(&self);

    /// Probe the in-guest API endpoint. Returns false on timeout.
    async fn is_api_alive(&self, kind: ProbeKind, timeout_secs: u64) -> bool;

    fn rdp_address(&self) -> String;

    /// Current guest video mode as `<width>x<height>x<bpp>`.
    fn video_mode(&self) -> String;

    async fn set_execution_cap(&self, cap: i64);
    async fn set_property(&self, key: &str, value: &str);

    fn parameters(&self) -> &ParameterMap;
    fn local(&self) -> &ParameterMap;

    /// Subscribe to driver callbacks for this session.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    /// Full state blob pushed to pages as `stateVariables` and returned
    /// by `enumSessions`.
    fn state_info(&self) -> Value;
}

/// An installed hypervisor.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Dotted version string of the installed hypervisor.
    fn version(&self) -> String;

    /// Wait for any delayed hypervisor initialization. May prompt the
    /// user through `interact` (e.g. extension-pack license).
    async fn wait_till_ready(
        &self,
        keystore: Arc<dyn Keystore>,
        progress: ProgressTask,
        interact: Arc<UserInteraction>,
    ) -> Result<(), i32>;

    /// Refresh driver-side session state. `force` bypasses debouncing.
    async fn update(&self, force: bool);

    /// Match a VMCP manifest against existing sessions.
    async fn session_validate(&self, vmcp: &ParameterMap) -> ValidateOutcome;

    /// Open a new session or resume the matching one. `None` means the
    /// driver refused.
    async fn session_open(
        &self,
        vmcp: &ParameterMap,
        progress: ProgressTask,
    ) -> Option<Arc<dyn HvSession>>;

    /// Give the driver a chance to (de)register its helper daemon after
    /// session changes.
    async fn check_daemon_need(&self);

    /// Re-read persisted sessions from the hypervisor's own store.
    async fn load_sessions(&self);

    /// All sessions currently known to the driver.
    fn sessions(&self) -> Vec<Arc<dyn HvSession>>;
}

/// Detection and installation of hypervisors on this host. The daemon
/// core only gates and sequences installs; the actual work lives behind
/// this seam.
#[async_trait]
pub trait HypervisorPlatform: Send + Sync {
    /// Probe the host for a supported hypervisor.
    async fn detect(&self) -> Option<Arc<dyn HypervisorDriver>>;

    /// Download and run the hypervisor installer. Returns a negative wire
    /// code on failure (`NOT_VALIDATED`/`NOT_TRUSTED` for integrity
    /// failures).
    async fn install(
        &self,
        downloader: Arc<dyn Downloader>,
        keystore: Arc<dyn Keystore>,
        interact: Arc<UserInteraction>,
        progress: ProgressTask,
    ) -> Result<(), i32>;
}

/// Platform with no driver backends compiled in. Driver crates replace
/// this in `main` when they are linked.
pub struct NoDriversPlatform;

#[async_trait]
impl HypervisorPlatform for NoDriversPlatform {
    async fn detect(&self) -> Option<Arc<dyn HypervisorDriver>> {
        None
    }

    async fn install(
        &self,
        _downloader: Arc<dyn Downloader>,
        _keystore: Arc<dyn Keystore>,
        _interact: Arc<UserInteraction>,
        _progress: ProgressTask,
    ) -> Result<(), i32> {
        Err(vmgate_protocol::codes::USAGE_ERROR)
    }
}

/// Compare two dotted version strings numerically, component by
/// component. Missing components count as zero, so `4.3` == `4.3.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let (ca, cb) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        match ca.cmp(&cb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
