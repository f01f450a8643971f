//! Shared mock implementations of the driver, platform, and downloader
//! seams, plus a builder that wires a full `Core` + `Connection` pair
//! for router and workflow tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vmgate_protocol::{codes, ActionFrame, OutboundFrame, SessionState};

use crate::config::Config;
use crate::connection::tx::ConnectionTx;
use crate::connection::Connection;
use crate::core::Core;
use crate::download::Downloader;
use crate::hypervisor::{
    ControlOutcome, DriverEvent, DriverResult, HvSession, HypervisorDriver, HypervisorPlatform,
    ParameterMap, ProbeKind, ValidateOutcome,
};
use crate::interact::UserInteraction;
use crate::keystore::{sign_manifest, Keystore, TrustStore};
use crate::progress::ProgressTask;

pub const TEST_AUTH_KEY: &str = "local-test-auth-key";
pub const TEST_DOMAIN: &str = "example.test";
pub const TEST_DOMAIN_KEY: &str = "0badc0de";

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

pub struct MockSession {
    uuid: String,
    parameters: ParameterMap,
    local: ParameterMap,
    events: broadcast::Sender<DriverEvent>,
    api_alive: AtomicBool,
    calls: Mutex<HashMap<String, u32>>,
    results: Mutex<HashMap<String, DriverResult>>,
}

impl MockSession {
    pub fn new(uuid: &str) -> Arc<MockSession> {
        let (events, _) = broadcast::channel(64);
        let local = ParameterMap::new();
        local.set("state", &SessionState::PowerOff.code().to_string());
        local.set("apiHost", "127.0.0.1");
        local.set("apiPort", "80");
        Arc::new(MockSession {
            uuid: uuid.to_string(),
            parameters: ParameterMap::new(),
            local,
            events,
            api_alive: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_state(self: Arc<Self>, state: SessionState) -> Arc<Self> {
        self.set_state(state);
        self
    }

    pub fn set_state(&self, state: SessionState) {
        self.local.set("state", &state.code().to_string());
    }

    pub fn set_api_alive(&self, alive: bool) {
        self.api_alive.store(alive, Ordering::Release);
    }

    pub fn set_result(&self, op: &str, result: DriverResult) {
        self.results.lock().unwrap().insert(op.to_string(), result);
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn record(&self, op: &str) -> DriverResult {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(op.to_string())
            .or_insert(0) += 1;
        self.results
            .lock()
            .unwrap()
            .get(op)
            .copied()
            .unwrap_or(Ok(ControlOutcome::Ok))
    }
}

#[async_trait]
impl HvSession for MockSession {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn start(&self, _params: &ParameterMap) -> DriverResult {
        self.record("start")
    }
    async fn stop(&self) -> DriverResult {
        self.record("stop")
    }
    async fn pause(&self) -> DriverResult {
        self.record("pause")
    }
    async fn resume(&self) -> DriverResult {
        self.record("resume")
    }
    async fn hibernate(&self) -> DriverResult {
        self.record("hibernate")
    }
    async fn reset(&self) -> DriverResult {
        self.record("reset")
    }
    async fn close(&self) -> DriverResult {
        self.record("close")
    }

    async fn wait(&self) {}

    async fn is_api_alive(&self, _kind: ProbeKind, _timeout_secs: u64) -> bool {
        let _ = self.record("is_api_alive");
        self.api_alive.load(Ordering::Acquire)
    }

    fn rdp_address(&self) -> String {
        "127.0.0.1:3389".into()
    }

    fn video_mode(&self) -> String {
        "800x600x24".into()
    }

    async fn set_execution_cap(&self, _cap: i64) {
        let _ = self.record("set_execution_cap");
    }

    async fn set_property(&self, key: &str, value: &str) {
        let _ = self.record("set_property");
        self.parameters.set(&format!("properties/{}", key), value);
    }

    fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    fn local(&self) -> &ParameterMap {
        &self.local
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    fn state_info(&self) -> Value {
        json!({
            "uuid": self.uuid,
            "state": self.local.get_num("state", 0),
            "parameters": self.parameters.to_json(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

pub struct MockDriver {
    version: String,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    validate: Mutex<Option<ValidateOutcome>>,
    refuse_open: AtomicBool,
    pub updates: AtomicU32,
}

impl MockDriver {
    pub fn new() -> Arc<MockDriver> {
        Arc::new(MockDriver {
            version: "5.0.0".into(),
            sessions: Mutex::new(Vec::new()),
            validate: Mutex::new(None),
            refuse_open: AtomicBool::new(false),
            updates: AtomicU32::new(0),
        })
    }

    pub fn with_session(self: Arc<Self>, session: Arc<MockSession>) -> Arc<Self> {
        self.sessions.lock().unwrap().push(session);
        self
    }

    pub fn set_validate(&self, outcome: ValidateOutcome) {
        *self.validate.lock().unwrap() = Some(outcome);
    }

    pub fn refuse_open(&self) {
        self.refuse_open.store(true, Ordering::Release);
    }
}

#[async_trait]
impl HypervisorDriver for MockDriver {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn wait_till_ready(
        &self,
        _keystore: Arc<dyn Keystore>,
        _progress: ProgressTask,
        _interact: Arc<UserInteraction>,
    ) -> Result<(), i32> {
        Ok(())
    }

    async fn update(&self, _force: bool) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    async fn session_validate(&self, vmcp: &ParameterMap) -> ValidateOutcome {
        if let Some(outcome) = *self.validate.lock().unwrap() {
            return outcome;
        }
        let name = vmcp.get_or("name", "");
        let exists = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.parameters.get_or("name", "") == name);
        if exists {
            ValidateOutcome::Reuse
        } else {
            ValidateOutcome::New
        }
    }

    async fn session_open(
        &self,
        vmcp: &ParameterMap,
        _progress: ProgressTask,
    ) -> Option<Arc<dyn HvSession>> {
        if self.refuse_open.load(Ordering::Acquire) {
            return None;
        }
        let name = vmcp.get_or("name", "");
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions
            .iter()
            .find(|s| s.parameters.get_or("name", "") == name)
        {
            return Some(existing.clone());
        }
        let session = MockSession::new(&format!("uuid-{}", name));
        session.parameters.set("name", &name);
        sessions.push(session.clone());
        Some(session)
    }

    async fn check_daemon_need(&self) {}

    async fn load_sessions(&self) {}

    fn sessions(&self) -> Vec<Arc<dyn HvSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn HvSession>)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockDownloader
// ---------------------------------------------------------------------------

type DownloadHandler = Box<dyn Fn(&str) -> Result<String, i32> + Send + Sync>;

pub struct MockDownloader {
    handler: DownloadHandler,
    pub requests: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn new(handler: impl Fn(&str) -> Result<String, i32> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockDownloader {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(code: i32) -> Arc<Self> {
        Self::new(move |_| Err(code))
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download_text(
        &self,
        url: &str,
        _progress: Option<&ProgressTask>,
        cancel: &CancellationToken,
    ) -> Result<String, i32> {
        if cancel.is_cancelled() {
            return Err(codes::EXTERNAL_ERROR);
        }
        self.requests.lock().unwrap().push(url.to_string());
        (self.handler)(url)
    }
}

// ---------------------------------------------------------------------------
// MockPlatform
// ---------------------------------------------------------------------------

pub struct MockPlatform {
    driver: Mutex<Option<Arc<MockDriver>>>,
    install_result: Mutex<Result<(), i32>>,
    install_provides: Mutex<Option<Arc<MockDriver>>>,
    pub installs: AtomicU32,
}

impl MockPlatform {
    pub fn new(driver: Option<Arc<MockDriver>>) -> Arc<MockPlatform> {
        Arc::new(MockPlatform {
            driver: Mutex::new(driver),
            install_result: Mutex::new(Err(codes::USAGE_ERROR)),
            install_provides: Mutex::new(None),
            installs: AtomicU32::new(0),
        })
    }

    pub fn set_install_result(&self, result: Result<(), i32>) {
        *self.install_result.lock().unwrap() = result;
    }

    pub fn set_install_provides(&self, driver: Arc<MockDriver>) {
        *self.install_provides.lock().unwrap() = Some(driver);
    }
}

#[async_trait]
impl HypervisorPlatform for MockPlatform {
    async fn detect(&self) -> Option<Arc<dyn HypervisorDriver>> {
        self.driver
            .lock()
            .unwrap()
            .clone()
            .map(|d| d as Arc<dyn HypervisorDriver>)
    }

    async fn install(
        &self,
        _downloader: Arc<dyn Downloader>,
        _keystore: Arc<dyn Keystore>,
        _interact: Arc<UserInteraction>,
        _progress: ProgressTask,
    ) -> Result<(), i32> {
        self.installs.fetch_add(1, Ordering::Relaxed);
        let result = *self.install_result.lock().unwrap();
        if result.is_ok() {
            if let Some(provided) = self.install_provides.lock().unwrap().clone() {
                *self.driver.lock().unwrap() = Some(provided);
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

pub fn collect_frames(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

pub fn interaction_callback(result: i32) -> ActionFrame {
    ActionFrame {
        frame_type: "action".into(),
        name: "interactionCallback".into(),
        id: "cb".into(),
        data: json!({"result": result}).as_object().cloned().unwrap(),
    }
}

// ---------------------------------------------------------------------------
// TestEnv
// ---------------------------------------------------------------------------

enum VmcpMode {
    Fail(i32),
    Raw(String),
    Signed { tamper: bool, extra: Map<String, Value> },
}

pub struct TestEnvBuilder {
    domain: String,
    driver: Option<Arc<MockDriver>>,
    vmcp: VmcpMode,
    validate: Option<ValidateOutcome>,
    install_result: Result<(), i32>,
    install_provides: bool,
}

impl TestEnvBuilder {
    fn new() -> TestEnvBuilder {
        TestEnvBuilder {
            domain: TEST_DOMAIN.to_string(),
            driver: Some(MockDriver::new()),
            vmcp: VmcpMode::Fail(codes::QUERY_ERROR),
            validate: None,
            install_result: Err(codes::USAGE_ERROR),
            install_provides: false,
        }
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn no_hypervisor(mut self) -> Self {
        self.driver = None;
        self
    }

    pub fn driver(mut self, driver: Arc<MockDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Serve a correctly signed manifest for `example.test`.
    pub fn with_vmcp(mut self) -> Self {
        self.vmcp = VmcpMode::Signed { tamper: false, extra: Map::new() };
        self
    }

    /// Serve a manifest whose body was modified after signing.
    pub fn with_tampered_vmcp(mut self) -> Self {
        self.vmcp = VmcpMode::Signed { tamper: true, extra: Map::new() };
        self
    }

    /// Serve a signed manifest with extra fields merged in before signing.
    pub fn with_vmcp_extra(mut self, extra: Value) -> Self {
        self.vmcp = VmcpMode::Signed {
            tamper: false,
            extra: extra.as_object().cloned().unwrap_or_default(),
        };
        self
    }

    pub fn vmcp_body(mut self, body: &str) -> Self {
        self.vmcp = VmcpMode::Raw(body.to_string());
        self
    }

    pub fn vmcp_fails(mut self, code: i32) -> Self {
        self.vmcp = VmcpMode::Fail(code);
        self
    }

    pub fn validate_outcome(self, outcome: ValidateOutcome) -> Self {
        if let Some(driver) = &self.driver {
            driver.set_validate(outcome);
        }
        self
    }

    pub fn installable(mut self, result: Result<(), i32>) -> Self {
        self.install_result = result;
        self
    }

    pub fn install_provides_driver(mut self) -> Self {
        self.install_provides = true;
        self
    }

    pub async fn build(self) -> TestEnv {
        let downloader = match self.vmcp {
            VmcpMode::Fail(code) => MockDownloader::failing(code),
            VmcpMode::Raw(body) => MockDownloader::new(move |_| Ok(body.clone())),
            VmcpMode::Signed { tamper, extra } => MockDownloader::new(move |url| {
                let salt = url
                    .split("cvm_salt=")
                    .nth(1)
                    .and_then(|rest| rest.split('&').next())
                    .unwrap_or_default()
                    .to_string();
                let mut manifest = Map::new();
                manifest.insert("name".into(), json!("vm1"));
                manifest.insert("secret".into(), json!("swordfish"));
                for (k, v) in &extra {
                    manifest.insert(k.clone(), v.clone());
                }
                let params = ParameterMap::from_json(&manifest);
                let sig = sign_manifest(TEST_DOMAIN, &salt, TEST_DOMAIN_KEY, &params);
                manifest.insert("signature".into(), json!(sig));
                if tamper {
                    manifest.insert("name".into(), json!("vm1-tampered"));
                }
                Ok(Value::Object(manifest).to_string())
            }),
        };

        let keystore = Arc::new(
            TrustStore::new("https://keys.test/authorized.txt", TEST_AUTH_KEY).with_domains([(
                TEST_DOMAIN.to_string(),
                TEST_DOMAIN_KEY.to_string(),
            )]),
        );

        let platform = MockPlatform::new(self.driver.clone());
        platform.set_install_result(self.install_result);
        if self.install_provides {
            platform.set_install_provides(MockDriver::new());
        }

        let core = Core::new(
            Config::default(),
            platform.clone(),
            keystore,
            downloader.clone(),
            "test-host-key".into(),
        );

        let (tx, rx) = ConnectionTx::channel();
        let conn = Connection::new(core.clone(), self.domain, tx);

        TestEnv {
            core,
            conn,
            rx: tokio::sync::Mutex::new(rx),
            downloader,
            platform,
            driver: self.driver,
        }
    }
}

pub struct TestEnv {
    pub core: Arc<Core>,
    pub conn: Connection,
    pub rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>>,
    pub downloader: Arc<MockDownloader>,
    pub platform: Arc<MockPlatform>,
    driver: Option<Arc<MockDriver>>,
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    pub async fn new() -> TestEnv {
        TestEnv::builder().build().await
    }

    pub async fn with_driver(driver: Arc<MockDriver>) -> TestEnv {
        TestEnv::builder().driver(driver).build().await
    }

    pub async fn with_vmcp_server() -> TestEnv {
        TestEnv::builder().with_vmcp().build().await
    }

    /// A second connection (own socket, own tx) on the same core.
    pub fn second_connection(&self, domain: &str) -> SecondConnection {
        let (tx, rx) = ConnectionTx::channel();
        SecondConnection {
            conn: Connection::new(self.core.clone(), domain.to_string(), tx),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn last_download_url(&self) -> Option<String> {
        self.downloader.requests.lock().unwrap().last().cloned()
    }

    /// The mock driver this env was built with. Panics for
    /// `no_hypervisor` environments.
    pub fn driver(&self) -> &Arc<MockDriver> {
        self.driver.as_ref().expect("env has no driver")
    }
}

pub struct SecondConnection {
    pub conn: Connection,
    pub rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>>,
}

/// Core with no hypervisor, a seeded trust store, and a failing
/// downloader. Enough for registry-level tests.
pub async fn test_core() -> Arc<Core> {
    let keystore = Arc::new(
        TrustStore::new("https://keys.test/authorized.txt", TEST_AUTH_KEY).with_domains([(
            TEST_DOMAIN.to_string(),
            TEST_DOMAIN_KEY.to_string(),
        )]),
    );
    Core::new(
        Config::default(),
        MockPlatform::new(None),
        keystore,
        MockDownloader::failing(codes::QUERY_ERROR),
        "test-host-key".into(),
    )
}
